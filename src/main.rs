use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use vigil::cache::Cache;
use vigil::config::EngineConfig;
use vigil::driver;

/// Declarative change detection: run watch files against a persistent
/// cache and dispatch actions for anything that changed.
#[derive(Debug, Parser)]
#[command(name = "vigil", version, about)]
struct Cli {
    /// Path to the persistent cache archive.
    #[arg(long, default_value = "cache.tar.gz")]
    cache: PathBuf,

    /// Top-level configuration file.
    #[arg(long, default_value = "watches/conf.yml")]
    config: PathBuf,

    /// Print the file and JSON of the watch node with this content hash,
    /// without executing anything.
    #[arg(long, value_name = "HASH")]
    find: Option<String>,

    /// Run with an ephemeral cache; nothing is persisted.
    #[arg(long, short = 't')]
    test: bool,

    /// Verbose logging (per-watch detail, stack traces on failure).
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Trace-level logging.
    #[arg(long)]
    debug: bool,

    /// Watch files or directories (searched recursively for *.yml/*.yaml).
    /// Defaults to the directory containing the configuration file.
    watches: Vec<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.debug {
        "vigil=trace"
    } else if cli.verbose {
        "vigil=debug"
    } else {
        "vigil=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .init();

    let mut config = if cli.config.is_file() {
        match EngineConfig::from_file(&cli.config) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(file = %cli.config.display(), error = %e, "cannot load configuration");
                return ExitCode::FAILURE;
            }
        }
    } else {
        EngineConfig::default()
    };
    if cli.verbose || cli.debug {
        config.verbose = true;
    }

    let search_paths = if cli.watches.is_empty() {
        vec![cli
            .config
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))]
    } else {
        cli.watches.clone()
    };
    let files = driver::discover(&search_paths);
    if files.is_empty() {
        tracing::warn!("no watch files found");
    }

    if let Some(needle) = &cli.find {
        return match driver::find_hash(&files, needle) {
            Some((path, node)) => {
                match serde_json::to_string_pretty(&node.to_json()) {
                    Ok(rendered) => {
                        println!("{}", path.display());
                        println!("{rendered}");
                        ExitCode::SUCCESS
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "cannot render node");
                        ExitCode::FAILURE
                    }
                }
            }
            None => {
                tracing::error!("no watch with hash {needle}");
                ExitCode::FAILURE
            }
        };
    }

    let mut cache = match if cli.test {
        Cache::ephemeral()
    } else {
        Cache::open(Some(&cli.cache), config.encryption_key.as_deref())
    } {
        Ok(cache) => cache,
        Err(e) => {
            tracing::error!(error = %e, "cannot open cache");
            return ExitCode::FAILURE;
        }
    };

    let mut fatal = false;
    for path in &files {
        let documents = match driver::parse_watch_file(path) {
            Ok(documents) => documents,
            Err(e) => {
                tracing::error!(file = %path.display(), error = %e, "cannot load watch file, skipping");
                continue;
            }
        };
        for document in &documents {
            if let Err(e) = driver::run_document(document, &mut cache, &config, path) {
                tracing::error!(file = %path.display(), error = %e, "fatal cache error");
                fatal = true;
                break;
            }
        }
        if fatal {
            break;
        }
    }

    if let Err(e) = cache.close() {
        tracing::error!(error = %e, "cannot close cache");
        return ExitCode::FAILURE;
    }
    if fatal {
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
