//! Data directory layout for Stepwise.
//!
//! Everything the engine persists lives under one directory:
//!
//! ```text
//! {data_dir}/
//!   config.toml     engine configuration (optional)
//!   stepwise.db     SQLite database (+ WAL files)
//! ```

use std::path::{Path, PathBuf};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "STEPWISE_DATA_DIR";

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `STEPWISE_DATA_DIR` environment variable
/// 2. `~/.stepwise`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".stepwise");
    }

    // Last resort: current directory
    PathBuf::from(".stepwise")
}

/// Path of the engine config file inside `data_dir`.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}

/// Create the data directory if it does not exist yet.
pub async fn ensure_data_dir(data_dir: &Path) -> Result<(), std::io::Error> {
    tokio::fs::create_dir_all(data_dir).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn ensure_data_dir_creates_nested_dirs() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("stepwise");

        ensure_data_dir(&nested).await.unwrap();
        assert!(tokio::fs::try_exists(&nested).await.unwrap());

        // Idempotent.
        ensure_data_dir(&nested).await.unwrap();
    }

    #[test]
    fn config_path_is_inside_data_dir() {
        assert_eq!(
            config_path(Path::new("/home/user/.stepwise")),
            PathBuf::from("/home/user/.stepwise/config.toml")
        );
    }

    #[test]
    fn test_resolve_data_dir_from_env() {
        // SAFETY: This test is single-threaded and restores the env var immediately.
        unsafe {
            std::env::set_var(DATA_DIR_ENV, "/tmp/test-stepwise");
        }
        let dir = resolve_data_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-stepwise"));
        unsafe {
            std::env::remove_var(DATA_DIR_ENV);
        }
    }
}
