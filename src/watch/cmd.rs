//! Shell command execution.
//!
//! Commands run under a fresh process group with the configured shell
//! reading the command text on stdin. A timeout terminates the whole group,
//! going through a privileged kill helper when the command itself was run
//! with sudo.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use super::data::{run_data_watch, DataCore};
use super::{Outcome, Watch, WatchCore, WatchError};
use crate::registry::{LoadResult, Node};
use crate::runtime::Runtime;
use crate::value::{render_plain, Value};

const WAIT_POLL: Duration = Duration::from_millis(25);

pub struct CmdWatch {
    core: WatchCore,
    data: DataCore,
    cmd: String,
    shell: String,
    sudo: bool,
    env: IndexMap<String, Value>,
    cwd: String,
    timeout: i64,
    return_code: Option<i64>,
    output: String,
}

pub fn build_cmd(mut node: Node) -> LoadResult<Box<dyn Watch>> {
    Ok(Box::new(CmdWatch {
        cmd: node.take_req_str("cmd")?,
        shell: node.take_str("shell"),
        sudo: node.take_bool("sudo"),
        env: node.take_map("env"),
        cwd: node.take_str("cwd"),
        timeout: node.take_int("timeout"),
        return_code: node.take_opt_int("return_code"),
        output: node.take_str("output"),
        data: DataCore::from_node(&mut node),
        core: WatchCore::from_node(&mut node),
    }))
}

impl CmdWatch {
    fn fetch(&self, rt: &mut Runtime) -> Result<Vec<Vec<u8>>, WatchError> {
        let ex_cmd = rt.ctx.expand_str(&self.cmd)?;
        let ex_cwd = rt.ctx.expand_str(&self.cwd)?;
        let ex_env = match rt.ctx.expand(&Value::Map(self.env.clone()))? {
            Value::Map(map) => map,
            _ => IndexMap::new(),
        };

        tracing::debug!("cmd watch: executing: {}", ex_cmd);

        let mut command = if self.sudo {
            let mut command = Command::new("sudo");
            command.arg(&self.shell);
            command
        } else {
            Command::new(&self.shell)
        };
        command
            .current_dir(&ex_cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (name, value) in &ex_env {
            command.env(name, render_plain(value));
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .map_err(|e| WatchError::Fetch(format!("cannot spawn '{}': {}", self.shell, e)))?;
        let pid = child.id();

        let mut stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| WatchError::Fetch("stdout pipe missing".to_string()))?;
        let mut stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| WatchError::Fetch("stderr pipe missing".to_string()))?;
        let stdout_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf);
            buf
        });
        let stderr_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf);
            buf
        });

        if let Some(mut stdin) = child.stdin.take() {
            // A command that never reads stdin closes the pipe early; that
            // is not an error.
            let _ = stdin.write_all(ex_cmd.as_bytes());
        }

        let deadline = Instant::now() + Duration::from_secs(self.timeout.max(0) as u64);
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        self.kill_group(pid);
                        let _ = child.wait();
                        return Err(WatchError::Fetch(format!(
                            "command timeout after {} seconds",
                            self.timeout
                        )));
                    }
                    std::thread::sleep(WAIT_POLL);
                }
                Err(e) => return Err(WatchError::Fetch(e.to_string())),
            }
        };

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();
        let code = status.code().unwrap_or(-1) as i64;
        tracing::debug!("cmd watch: return code: {}", code);

        if let Some(expected) = self.return_code {
            if code != expected {
                return Err(WatchError::Fetch(format!(
                    "return code {} != {}\nstdout:{}\nstderr:{}",
                    code,
                    expected,
                    indent_output(&stdout),
                    indent_output(&stderr),
                )));
            }
        }

        Ok(match self.output.as_str() {
            "stderr" => vec![stderr],
            "both" => vec![stdout, stderr],
            _ => vec![stdout],
        })
    }

    /// Terminate the whole process group; privileged commands need the kill
    /// to go through sudo as well.
    fn kill_group(&self, pid: u32) {
        #[cfg(unix)]
        {
            if self.sudo {
                let _ = Command::new("sudo")
                    .args(["/bin/kill", "--", &format!("-{pid}")])
                    .status();
            } else {
                let _ = nix::sys::signal::killpg(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGTERM,
                );
            }
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
        }
    }
}

fn indent_output(output: &[u8]) -> String {
    if output.is_empty() {
        return String::new();
    }
    let text = String::from_utf8_lossy(output);
    let mut out = String::new();
    for line in text.lines() {
        out.push_str("\n\t");
        out.push_str(line);
    }
    out
}

impl Watch for CmdWatch {
    fn core(&self) -> &WatchCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut WatchCore {
        &mut self.core
    }

    fn run(&mut self, rt: &mut Runtime) -> Result<Outcome, WatchError> {
        let fetched = self.fetch(rt)?;
        run_data_watch(&self.core, &self.data, rt, fetched, &[])
    }
}
