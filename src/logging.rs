use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

const LOG_DIR: &str = "logs";

/// logs/<name>_YYYYmmdd_HHMMSS.log
pub fn log_file_path(name: &str, now: chrono::DateTime<chrono::Local>) -> PathBuf {
    PathBuf::from(LOG_DIR).join(format!("{}_{}.log", name, now.format("%Y%m%d_%H%M%S")))
}

/// stderr とログファイルの両方に出力する。`RUST_LOG` で絞り込める
pub fn init(name: &str) -> Result<PathBuf> {
    fs::create_dir_all(LOG_DIR).with_context(|| format!("failed to create {}", LOG_DIR))?;
    let path = log_file_path(name, chrono::Local::now());
    let file = File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("handsfree_gesture=info,gesture_server=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_thread_names(true)
        .with_writer(std::io::stderr.and(Mutex::new(file)))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install logger: {}", e))?;

    Ok(path)
}
