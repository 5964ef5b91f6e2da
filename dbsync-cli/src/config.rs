use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigLoad {
    version: u8,

    /// Address the server binds, or the client connects to.
    pub host: Option<String>,
    pub port: Option<u16>,

    /// Log level for the rolling file log.
    pub log_level: Option<String>,

    /// Directory the rolling file log is written to.
    pub log_dir: Option<String>,
}

pub const DEFAULT_PROMPT: &str = "dbsync";

impl Default for ConfigLoad {
    fn default() -> Self {
        ConfigLoad {
            version: 0,
            host: Some("127.0.0.1".to_string()),
            port: Some(7000),
            log_level: Some("info".to_string()),
            log_dir: None,
        }
    }
}

impl ConfigLoad {
    /// Loads from the given path, falling back to defaults when the file
    /// is absent or unreadable.
    pub fn new(path: &str) -> anyhow::Result<Self> {
        Ok(confy::load_path(path)?)
    }

    pub fn get_host(&self) -> String {
        self.host.clone().unwrap_or_else(|| "127.0.0.1".to_string())
    }

    pub fn get_port(&self) -> u16 {
        self.port.unwrap_or(7000)
    }

    pub fn get_log_level(&self) -> String {
        self.log_level.clone().unwrap_or_else(|| "info".to_string())
    }
}
