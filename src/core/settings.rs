use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Json struct for draw engine settings
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    /// Location of the SQLite database file
    pub database: PathBuf,
    pub max_connections: Option<u32>,
    /// How long a pick or removal waits for its session before giving up
    pub lock_timeout_ms: Option<u64>,
    /// How many times a busy pick or removal is retried before `Busy` is returned
    pub busy_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub sqlite_busy_timeout_ms: Option<u64>,
    pub invite_code_length: Option<usize>,
}

impl Settings {
    pub fn new(database: impl Into<PathBuf>) -> Self {
        Settings {
            database: database.into(),
            max_connections: None,
            lock_timeout_ms: None,
            busy_retries: None,
            retry_backoff_ms: None,
            sqlite_busy_timeout_ms: None,
            invite_code_length: None,
        }
    }

    pub fn load(file: &Path) -> Result<Self> {
        Ok(serde_json::from_str::<Settings>(&read_to_string(file)?)?)
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections.unwrap_or(8)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms.unwrap_or(2_000))
    }

    pub fn busy_retries(&self) -> u32 {
        self.busy_retries.unwrap_or(3)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.unwrap_or(50))
    }

    pub fn sqlite_busy_timeout(&self) -> Duration {
        Duration::from_millis(self.sqlite_busy_timeout_ms.unwrap_or(5_000))
    }

    pub fn invite_code_length(&self) -> usize {
        self.invite_code_length.unwrap_or(8)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Settings;
    use crate::error::Error;

    #[test]
    fn test_defaults() {
        let settings: Settings = serde_json::from_str(r#"{ "database": "draw.db" }"#).unwrap();

        assert_eq!(settings, Settings::new("draw.db"));
        assert_eq!(settings.lock_timeout(), Duration::from_secs(2));
        assert_eq!(settings.busy_retries(), 3);
        assert_eq!(settings.invite_code_length(), 8);
    }

    #[test]
    fn test_overrides() {
        let settings: Settings = serde_json::from_str(
            r#"{ "database": "draw.db", "lock_timeout_ms": 10, "busy_retries": 0, "max_connections": 2 }"#,
        )
        .unwrap();

        assert_eq!(settings.lock_timeout(), Duration::from_millis(10));
        assert_eq!(settings.busy_retries(), 0);
        assert_eq!(settings.max_connections(), 2);
    }

    #[test]
    fn test_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("santadraw.json");

        std::fs::write(&file, r#"{ "database": "draw.db", "busy_retries": 5 }"#).unwrap();
        assert_eq!(Settings::load(&file).unwrap().busy_retries(), 5);

        std::fs::write(&file, "{ database: ").unwrap();
        assert!(matches!(Settings::load(&file), Err(Error::Json(_))));

        assert!(matches!(
            Settings::load(&dir.path().join("missing.json")),
            Err(Error::Io(_))
        ));
    }
}
