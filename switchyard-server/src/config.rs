use crate::chat;
use serde::{Deserialize, Serialize};
use std::path::Path;
use switchyard_proto::{Encoding, ProtocolConfig};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub server: ServerSettings,
    #[serde(default)]
    pub protocol: ProtocolSettings,
    pub limits: LimitsSettings,
    pub logging: LoggingSettings,
    /// Commands registered before any layer, `{namespace: {code: direction}}`
    #[serde(default = "chat::default_commands")]
    pub commands: ProtocolConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Length-prefixed frames over plain TCP
    #[default]
    Tcp,
    Websocket,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    pub listen_addr: String,
    pub listen_port: u16,
    #[serde(default)]
    pub transport: Transport,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProtocolSettings {
    /// Wire encoding: text (JSON) or compact (CBOR)
    #[serde(default)]
    pub encoding: Encoding,
    /// Close on every failure instead of answering with error messages
    #[serde(default)]
    pub strict: bool,
    /// Time a client has to join after connecting (0 disables)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            encoding: Encoding::default(),
            strict: false,
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsSettings {
    /// Maximum concurrent connections
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,
    /// Maximum frame size in bytes
    #[serde(default = "default_max_frame")]
    pub max_frame_bytes: u32,
    /// Idle read timeout in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Write timeout in seconds
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Output logs as JSON
    #[serde(default)]
    pub json_logs: bool,
}

fn default_handshake_timeout() -> u64 {
    60
}

fn default_max_conns() -> usize {
    100
}

fn default_max_frame() -> u32 {
    switchyard_proto::DEFAULT_MAX_FRAME_SIZE
}

fn default_read_timeout() -> u64 {
    300
}

fn default_write_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let config: ServerConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self {
            server: ServerSettings {
                listen_addr: "127.0.0.1".to_string(),
                listen_port: 5000,
                transport: Transport::Tcp,
            },
            protocol: ProtocolSettings::default(),
            limits: LimitsSettings {
                max_conns: default_max_conns(),
                max_frame_bytes: default_max_frame(),
                read_timeout_secs: default_read_timeout(),
                write_timeout_secs: default_write_timeout(),
            },
            logging: LoggingSettings {
                log_level: default_log_level(),
                json_logs: false,
            },
            commands: chat::default_commands(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_proto::{Direction, Translator};

    #[test]
    fn test_minimal_file_uses_defaults() {
        let config = ServerConfig::from_toml(
            r#"
            [server]
            listen_addr = "0.0.0.0"
            listen_port = 5000

            [limits]

            [logging]
            "#,
        )
        .unwrap();

        assert_eq!(config.server.transport, Transport::Tcp);
        assert_eq!(config.protocol.encoding, Encoding::Text);
        assert!(!config.protocol.strict);
        assert_eq!(config.limits.max_frame_bytes, switchyard_proto::DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.commands, chat::default_commands());
    }

    #[test]
    fn test_protocol_and_commands_sections() {
        let config = ServerConfig::from_toml(
            r#"
            [server]
            listen_addr = "127.0.0.1"
            listen_port = 9000
            transport = "websocket"

            [protocol]
            encoding = "compact"
            strict = true

            [limits]
            max_conns = 4

            [logging]
            json_logs = true

            [commands."chat:2"]
            "say:3" = "server"
            "said:4" = "client"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.transport, Transport::Websocket);
        assert_eq!(config.protocol.encoding, Encoding::Compact);
        assert!(config.protocol.strict);
        assert_eq!(config.protocol.handshake_timeout_secs, 60);
        assert_eq!(
            config.commands,
            ProtocolConfig::new()
                .command("chat:2", "say:3", Direction::ServerBound)
                .command("chat:2", "said:4", Direction::ClientBound)
        );

        let mut translator = Translator::new(Encoding::Compact);
        config.commands.apply(&mut translator).unwrap();
    }

    #[test]
    fn test_bad_encoding_rejected() {
        let result = ServerConfig::from_toml(
            r#"
            [server]
            listen_addr = "127.0.0.1"
            listen_port = 9000

            [protocol]
            encoding = "xml"

            [limits]

            [logging]
            "#,
        );
        assert!(result.is_err());
    }
}
