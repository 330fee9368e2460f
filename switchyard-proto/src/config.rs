use crate::{AddressingError, CommandSpec, Direction, Translator};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declarative protocol configuration: `{namespace: {code: direction}}`.
///
/// Keys are configuration tokens, `name` or `name:code`, parsed with
/// [`CommandSpec::parse_token`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ProtocolConfig {
    namespaces: BTreeMap<String, BTreeMap<String, Direction>>,
}

impl ProtocolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command(mut self, namespace: impl Into<String>, code: impl Into<String>, direction: Direction) -> Self {
        self.namespaces
            .entry(namespace.into())
            .or_default()
            .insert(code.into(), direction);
        self
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.values().all(BTreeMap::is_empty)
    }

    /// Registers every command into the translator. Duplicate codes are an
    /// error, as is any token that does not fit the translator's encoding.
    pub fn apply(&self, translator: &mut Translator) -> Result<(), AddressingError> {
        for (namespace, commands) in &self.namespaces {
            let entry = translator.namespace(CommandSpec::parse_token(namespace)?)?;
            for (code, direction) in commands {
                entry.register_command(CommandSpec::parse_token(code)?, *direction)?;
            }
        }
        Ok(())
    }
}
