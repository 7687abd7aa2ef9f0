//! Client configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the SQLite file; `None` keeps everything in memory
    pub database_path: Option<PathBuf>,
}

impl Config {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            database_path: Some(data_dir.join("idbridge.db")),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            database_path: None,
        }
    }

    /// `IDBRIDGE_DATA_DIR` if set, otherwise an `idbridge` folder in the
    /// platform's local data directory
    pub fn data_dir() -> PathBuf {
        if let Some(dir) = std::env::var_os("IDBRIDGE_DATA_DIR") {
            return PathBuf::from(dir);
        }
        platform_data_dir()
            .map(|d| d.join("idbridge"))
            .unwrap_or_else(|| PathBuf::from(".idbridge"))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::data_dir())
    }
}

fn platform_data_dir() -> Option<PathBuf> {
    let home = || std::env::var_os("HOME").map(PathBuf::from);

    if cfg!(target_os = "windows") {
        std::env::var_os("LOCALAPPDATA").map(PathBuf::from)
    } else if cfg!(target_os = "macos") {
        home().map(|h| h.join("Library/Application Support"))
    } else {
        // XDG requires an absolute path; relative values are ignored
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .filter(|p| p.is_absolute())
            .or_else(|| home().map(|h| h.join(".local/share")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_places_file_in_data_dir() {
        let config = Config::new(PathBuf::from("/tmp/data"));
        assert_eq!(
            config.database_path,
            Some(PathBuf::from("/tmp/data/idbridge.db"))
        );
        assert!(Config::in_memory().database_path.is_none());
    }

    #[test]
    fn test_data_dir_override() {
        std::env::set_var("IDBRIDGE_DATA_DIR", "/tmp/idbridge-data");
        let dir = Config::data_dir();
        std::env::remove_var("IDBRIDGE_DATA_DIR");

        assert_eq!(dir, PathBuf::from("/tmp/idbridge-data"));
    }

    #[test]
    fn test_config_from_json() {
        let config: Config = serde_json::from_str(r#"{"database_path": null}"#).unwrap();
        assert!(config.database_path.is_none());
    }
}
