//! Append-only file logging under the configured data path.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use super::{Action, ActionResult, ErrorPayload, ReportPayload};
use crate::registry::{LoadResult, Node};
use crate::runtime::Runtime;

/// One open handle per distinct log file for the process lifetime, shared by
/// every file action targeting the same path.
static HANDLES: Lazy<Mutex<HashMap<PathBuf, File>>> = Lazy::new(|| Mutex::new(HashMap::new()));

pub struct FileAction {
    file: String,
}

pub fn build_file(mut node: Node) -> LoadResult<Box<dyn Action>> {
    Ok(Box::new(FileAction {
        file: node.take_req_str("file")?,
    }))
}

impl FileAction {
    fn append(&self, rt: &Runtime, text: &str) -> ActionResult<()> {
        let path = rt.config.data_path.join(&self.file);
        let mut handles = HANDLES.lock().expect("file-log registry poisoned");
        if !handles.contains_key(&path) {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let handle = OpenOptions::new().create(true).append(true).open(&path)?;
            handles.insert(path.clone(), handle);
        }
        let handle = handles.get_mut(&path).expect("inserted above");
        for line in text.lines() {
            writeln!(handle, "{line}")?;
        }
        handle.flush()?;
        Ok(())
    }
}

impl Action for FileAction {
    fn report(&self, rt: &mut Runtime, payload: &ReportPayload) -> ActionResult<()> {
        self.append(rt, &payload.comment)
    }

    fn error(&self, rt: &mut Runtime, payload: &ErrorPayload) -> ActionResult<()> {
        self.append(rt, &payload.error)
    }
}
