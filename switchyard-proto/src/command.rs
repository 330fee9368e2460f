use crate::AddressingError;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Identifies one namespace or one command code.
///
/// A spec carries a readable name, used by the text encoding, and an
/// optional 32-bit code, used by the compact encoding. Two specs are equal
/// only when both components match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandSpec {
    name: Cow<'static, str>,
    code: Option<u32>,
}

impl CommandSpec {
    /// Matches any command in any namespace. Only meaningful as a handler
    /// key; it can never be registered in a translator.
    pub const ANY: CommandSpec = CommandSpec {
        name: Cow::Borrowed("__any__"),
        code: Some(u32::MAX),
    };

    pub const fn new(name: &'static str, code: u32) -> Self {
        Self {
            name: Cow::Borrowed(name),
            code: Some(code),
        }
    }

    /// A spec usable only under the text encoding.
    pub const fn named(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            code: None,
        }
    }

    pub fn owned(name: impl Into<String>, code: Option<u32>) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            code,
        }
    }

    /// Parses a configuration token: `name` or `name:code`, where the code
    /// is decimal or `0x`-prefixed hexadecimal.
    pub fn parse_token(token: &str) -> Result<Self, AddressingError> {
        let invalid = || AddressingError::InvalidToken(token.to_string());

        let (name, code) = match token.split_once(':') {
            Some((name, code)) => (name.trim(), Some(parse_code(code.trim()).ok_or_else(invalid)?)),
            None => (token.trim(), None),
        };

        if name.is_empty() {
            return Err(invalid());
        }

        Ok(Self::owned(name, code))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> Option<u32> {
        self.code
    }

    pub fn is_any(&self) -> bool {
        *self == Self::ANY
    }

    /// Whether both specs can name the same command: the names match and
    /// the codes match wherever both are given.
    pub fn agrees_with(&self, other: &CommandSpec) -> bool {
        self.name == other.name
            && match (self.code, other.code) {
                (Some(ours), Some(theirs)) => ours == theirs,
                _ => true,
            }
    }
}

fn parse_code(code: &str) -> Option<u32> {
    match code.strip_prefix("0x").or_else(|| code.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => code.parse().ok(),
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{}:{:#x}", self.name, code),
            None => f.write_str(&self.name),
        }
    }
}

/// Which way a command may travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "server")]
    ServerBound,
    #[serde(rename = "client")]
    ClientBound,
    #[serde(rename = "both")]
    Both,
}

impl Direction {
    pub fn to_client(self) -> bool {
        matches!(self, Direction::ClientBound | Direction::Both)
    }

    pub fn to_server(self) -> bool {
        matches!(self, Direction::ServerBound | Direction::Both)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::ServerBound => "server",
            Direction::ClientBound => "client",
            Direction::Both => "both",
        })
    }
}

/// A full command as it appears in the `code` member of a wire message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandToken {
    /// `"<namespace>.<code>"`
    Text(String),
    /// Namespace in the high 32 bits, code in the low 32 bits.
    Compact(u64),
}

impl From<&str> for CommandToken {
    fn from(token: &str) -> Self {
        CommandToken::Text(token.to_string())
    }
}

impl From<String> for CommandToken {
    fn from(token: String) -> Self {
        CommandToken::Text(token)
    }
}

impl From<u64> for CommandToken {
    fn from(token: u64) -> Self {
        CommandToken::Compact(token)
    }
}

impl fmt::Display for CommandToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandToken::Text(token) => f.write_str(token),
            CommandToken::Compact(token) => write!(f, "{:#018x}", token),
        }
    }
}

impl Serialize for CommandToken {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CommandToken::Text(token) => serializer.serialize_str(token),
            CommandToken::Compact(token) => serializer.serialize_u64(*token),
        }
    }
}
