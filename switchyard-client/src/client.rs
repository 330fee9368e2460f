use anyhow::{anyhow, bail};
use serde_json::{Map, Value};
use switchyard_proto::{
    framing, join_compact, split_compact, split_text, CloseNotice, CommandToken, Encoding, RawEnvelope,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout, Duration};
use tracing::debug;

/// A frame received from the server
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Message(RawEnvelope),
    Closed(CloseNotice),
}

#[derive(Debug, Clone)]
pub struct SwitchyardClient {
    encoding: Encoding,
    max_frame_size: u32,
    write_timeout: Duration,
}

fn parse_number(part: &str) -> Option<u32> {
    match part.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => part.parse().ok(),
    }
}

/// Arguments are JSON when they parse as JSON, plain strings otherwise.
fn parse_arg(arg: &str) -> Value {
    serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.to_string()))
}

impl SwitchyardClient {
    pub fn new(encoding: Encoding, max_frame_size: u32, write_timeout_secs: u64) -> Self {
        Self {
            encoding,
            max_frame_size,
            write_timeout: Duration::from_secs(write_timeout_secs),
        }
    }

    /// Parses `<namespace>.<code> [arg ...]`. Under the compact encoding
    /// both parts of the command must be numbers.
    pub fn parse_line(&self, line: &str) -> anyhow::Result<RawEnvelope> {
        let mut parts = line.split_whitespace();
        let command = parts.next().ok_or_else(|| anyhow!("empty command"))?;
        let (namespace, code) =
            split_text(command).ok_or_else(|| anyhow!("expected <namespace>.<code>, got {}", command))?;

        let token = match self.encoding {
            Encoding::Text => CommandToken::from(command),
            Encoding::Compact => match (parse_number(namespace), parse_number(code)) {
                (Some(namespace), Some(code)) => CommandToken::Compact(join_compact(namespace, code)),
                _ => bail!("compact commands are numeric, like 2.3"),
            },
        };

        let mut envelope = RawEnvelope::new(token);
        envelope.args = parts.map(parse_arg).collect();
        Ok(envelope)
    }

    pub async fn send<S>(&self, stream: &mut S, envelope: &RawEnvelope) -> anyhow::Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let payload = self.encoding.encode(envelope)?;
        debug!("Sending {}", envelope.code);

        timeout(self.write_timeout, framing::write_frame(stream, &payload))
            .await
            .map_err(|_| anyhow!("write timeout"))??;
        Ok(())
    }

    /// Waits for the next frame. Close notices are told apart from messages
    /// by their shape.
    pub async fn receive<S>(&self, stream: &mut S) -> anyhow::Result<Incoming>
    where
        S: AsyncRead + Unpin,
    {
        let data = framing::read_frame(stream, self.max_frame_size).await?;

        match self.encoding.decode(&data) {
            Ok(envelope) => Ok(Incoming::Message(envelope)),
            Err(message_error) => match self.encoding.decode_close(&data) {
                Ok(notice) => Ok(Incoming::Closed(notice)),
                Err(_) => Err(message_error.into()),
            },
        }
    }

    /// Renders a received message for the terminal.
    pub fn describe(&self, envelope: &RawEnvelope) -> String {
        let mut text = match &envelope.code {
            CommandToken::Compact(token) => {
                let (namespace, code) = split_compact(*token);
                format!("{}.{}", namespace, code)
            }
            CommandToken::Text(token) => token.clone(),
        };

        if !envelope.args.is_empty() {
            text.push(' ');
            text.push_str(&Value::Array(envelope.args.clone()).to_string());
        }
        if !envelope.kwargs.is_empty() {
            text.push(' ');
            text.push_str(&Value::Object(Map::clone(&envelope.kwargs)).to_string());
        }
        text
    }
}
