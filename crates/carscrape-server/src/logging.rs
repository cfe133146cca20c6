use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Log file for today inside `log_dir`: `carscrape-<YYYYMMDD>.log`.
pub fn log_file_path(log_dir: &Path) -> PathBuf {
    log_dir.join(format!("carscrape-{}.log", Utc::now().format("%Y%m%d")))
}

/// Install the global subscriber: console output plus an appending file
/// layer in `log_dir`.
///
/// The file is chosen once at startup; the retention sweeper purges old ones.
pub fn init(log_dir: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(log_dir)?;
    let path = log_file_path(log_dir);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("carscrape=info".parse()?))
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_is_dated() {
        let path = log_file_path(Path::new("logs"));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("carscrape-"));
        assert!(name.ends_with(".log"));
        assert_eq!(name.len(), "carscrape-20240101.log".len());
    }
}
