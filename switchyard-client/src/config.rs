use serde::{Deserialize, Serialize};
use std::path::Path;
use switchyard_proto::Encoding;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    pub client: ClientSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientSettings {
    pub server_addr: String,
    pub server_port: u16,
    /// Must match the server's encoding
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default = "default_max_frame")]
    pub max_frame_bytes: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            write_timeout_secs: default_write_timeout(),
        }
    }
}

fn default_max_frame() -> u32 {
    switchyard_proto::DEFAULT_MAX_FRAME_SIZE
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_write_timeout() -> u64 {
    30
}

impl ClientConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self {
            client: ClientSettings {
                server_addr: "127.0.0.1".to_string(),
                server_port: 5000,
                encoding: Encoding::Text,
                max_frame_bytes: default_max_frame(),
            },
            timeouts: TimeoutSettings::default(),
        }
    }
}
