//! Wire encodings: how command tokens split into namespace and code, and
//! how whole envelopes are decoded from and encoded to payload bytes.

use crate::{AddressingError, CommandSpec, CommandToken, TranslateError};
use serde::{Deserialize, Serialize};
use serde_cbor::Value as CborValue;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const LOW_32_BITS: u64 = (1 << 32) - 1;

/// The envelope members defined by the wire format.
const ENVELOPE_FIELDS: [&str; 3] = ["code", "args", "kwargs"];

/// How payloads are framed by a transport that distinguishes the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Framing {
    Text,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// JSON payloads with dotted string tokens.
    #[default]
    Text,
    /// CBOR payloads with 64-bit integer tokens.
    Compact,
}

/// A registry key for one half of a command token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WireKey {
    Name(String),
    Code(u32),
}

/// A decoded envelope whose code has not been translated yet.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEnvelope {
    pub code: CommandToken,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl RawEnvelope {
    pub fn new(code: impl Into<CommandToken>) -> Self {
        Self {
            code: code.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }
}

/// Sent by stream transports before they drop the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloseNotice {
    pub code: u16,
    pub reason: String,
}

#[derive(Serialize)]
struct WireEnvelope<'a> {
    code: &'a CommandToken,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<&'a [Value]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kwargs: Option<&'a Map<String, Value>>,
}

/// Joins a namespace and a code into one compact token.
pub fn join_compact(namespace: u32, code: u32) -> u64 {
    (u64::from(namespace) << 32) | u64::from(code)
}

/// Splits a compact token into its namespace and code.
pub fn split_compact(token: u64) -> (u32, u32) {
    ((token >> 32) as u32, (token & LOW_32_BITS) as u32)
}

/// Splits a dotted token at its last dot, so namespaces may contain dots.
pub fn split_text(token: &str) -> Option<(&str, &str)> {
    token.rsplit_once('.')
}

pub fn join_text(namespace: &str, code: &str) -> String {
    format!("{}.{}", namespace, code)
}

impl Encoding {
    /// The framing payloads of this encoding naturally travel in.
    pub fn framing(self) -> Framing {
        match self {
            Encoding::Text => Framing::Text,
            Encoding::Compact => Framing::Binary,
        }
    }

    /// The registry key of a spec under this encoding.
    pub fn key(self, spec: &CommandSpec) -> Result<WireKey, AddressingError> {
        match self {
            Encoding::Text => Ok(WireKey::Name(spec.name().to_string())),
            Encoding::Compact => spec
                .code()
                .map(WireKey::Code)
                .ok_or_else(|| AddressingError::MissingCode(spec.to_string())),
        }
    }

    pub fn split(self, token: &CommandToken) -> Result<(WireKey, WireKey), TranslateError> {
        match (self, token) {
            (Encoding::Text, CommandToken::Text(token)) => split_text(token)
                .map(|(namespace, code)| {
                    (WireKey::Name(namespace.to_string()), WireKey::Name(code.to_string()))
                })
                .ok_or_else(|| TranslateError::MalformedCommand(token.clone())),
            (Encoding::Compact, CommandToken::Compact(token)) => {
                let (namespace, code) = split_compact(*token);
                Ok((WireKey::Code(namespace), WireKey::Code(code)))
            }
            (Encoding::Text, CommandToken::Compact(_)) => {
                Err(TranslateError::InvalidCode("expected a string".to_string()))
            }
            (Encoding::Compact, CommandToken::Text(_)) => {
                Err(TranslateError::InvalidCode("expected an unsigned integer".to_string()))
            }
        }
    }

    pub fn join(self, namespace: &CommandSpec, code: &CommandSpec) -> Result<CommandToken, AddressingError> {
        match (self.key(namespace)?, self.key(code)?) {
            (WireKey::Code(namespace), WireKey::Code(code)) => {
                Ok(CommandToken::Compact(join_compact(namespace, code)))
            }
            _ => Ok(CommandToken::Text(join_text(namespace.name(), code.name()))),
        }
    }

    /// Decodes a payload and validates the envelope shape. The code is left
    /// untranslated.
    pub fn decode(self, data: &[u8]) -> Result<RawEnvelope, TranslateError> {
        match self {
            Encoding::Text => decode_json(data),
            Encoding::Compact => decode_cbor(data),
        }
    }

    /// Encodes an envelope, omitting empty `args` and `kwargs`.
    pub fn encode(self, envelope: &RawEnvelope) -> Result<Vec<u8>, TranslateError> {
        let wire = WireEnvelope {
            code: &envelope.code,
            args: (!envelope.args.is_empty()).then_some(envelope.args.as_slice()),
            kwargs: (!envelope.kwargs.is_empty()).then_some(&envelope.kwargs),
        };
        self.to_bytes(&wire)
    }

    pub fn encode_close(self, notice: &CloseNotice) -> Result<Vec<u8>, TranslateError> {
        self.to_bytes(notice)
    }

    pub fn decode_close(self, data: &[u8]) -> Result<CloseNotice, TranslateError> {
        match self {
            Encoding::Text => serde_json::from_slice(data).map_err(decode_error),
            Encoding::Compact => serde_cbor::from_slice(data).map_err(decode_error),
        }
    }

    fn to_bytes<T: Serialize>(self, value: &T) -> Result<Vec<u8>, TranslateError> {
        match self {
            Encoding::Text => serde_json::to_vec(value).map_err(encode_error),
            Encoding::Compact => serde_cbor::to_vec(value).map_err(encode_error),
        }
    }
}

fn decode_error(error: impl std::fmt::Display) -> TranslateError {
    TranslateError::Decode(error.to_string())
}

fn encode_error(error: impl std::fmt::Display) -> TranslateError {
    TranslateError::Encode(error.to_string())
}

fn reject_unknown_fields<'a>(mut keys: impl Iterator<Item = &'a str>) -> Result<(), TranslateError> {
    match keys.find(|key| !ENVELOPE_FIELDS.contains(key)) {
        Some(key) => Err(TranslateError::UnexpectedField(key.to_string())),
        None => Ok(()),
    }
}

fn decode_json(data: &[u8]) -> Result<RawEnvelope, TranslateError> {
    let value: Value = serde_json::from_slice(data).map_err(decode_error)?;
    let Value::Object(mut fields) = value else {
        return Err(TranslateError::ExpectedMap);
    };

    let code = fields.remove("code").ok_or(TranslateError::MissingCode)?;
    reject_unknown_fields(fields.keys().map(String::as_str))?;

    let code = match code {
        Value::String(token) => CommandToken::Text(token),
        other => return Err(TranslateError::InvalidCode(format!("expected a string, got {}", other))),
    };

    let args = match fields.remove("args") {
        None => Vec::new(),
        Some(Value::Array(args)) => args,
        Some(_) => return Err(TranslateError::ArgsNotList),
    };

    let kwargs = match fields.remove("kwargs") {
        None => Map::new(),
        Some(Value::Object(kwargs)) => kwargs,
        Some(_) => return Err(TranslateError::KwargsNotMap),
    };

    Ok(RawEnvelope { code, args, kwargs })
}

fn decode_cbor(data: &[u8]) -> Result<RawEnvelope, TranslateError> {
    let value: CborValue = serde_cbor::from_slice(data).map_err(decode_error)?;
    let CborValue::Map(entries) = value else {
        return Err(TranslateError::ExpectedMap);
    };

    let mut fields = BTreeMap::new();
    for (key, value) in entries {
        match key {
            CborValue::Text(key) => {
                fields.insert(key, value);
            }
            other => return Err(TranslateError::UnexpectedField(format!("{:?}", other))),
        }
    }

    let code = fields.remove("code").ok_or(TranslateError::MissingCode)?;
    reject_unknown_fields(fields.keys().map(String::as_str))?;

    let code = match code {
        CborValue::Integer(token) => u64::try_from(token)
            .map(CommandToken::Compact)
            .map_err(|_| TranslateError::InvalidCode(format!("{} is not a 64-bit token", token)))?,
        other => {
            return Err(TranslateError::InvalidCode(format!(
                "expected an unsigned integer, got {:?}",
                other
            )))
        }
    };

    let args = match fields.remove("args") {
        None => Vec::new(),
        Some(CborValue::Array(items)) => items
            .into_iter()
            .map(cbor_to_json)
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(TranslateError::ArgsNotList),
    };

    let kwargs = match fields.remove("kwargs") {
        None => Map::new(),
        Some(CborValue::Map(entries)) => {
            let mut kwargs = Map::new();
            for (key, value) in entries {
                let CborValue::Text(key) = key else {
                    return Err(TranslateError::KwargsKeysNotStrings);
                };
                kwargs.insert(key, cbor_to_json(value)?);
            }
            kwargs
        }
        Some(_) => return Err(TranslateError::KwargsNotMap),
    };

    Ok(RawEnvelope { code, args, kwargs })
}

fn cbor_to_json(value: CborValue) -> Result<Value, TranslateError> {
    serde_cbor::value::from_value(value).map_err(decode_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_compact_split_join() {
        let samples = [0u32, 1, 0x7fff_ffff, 0x8000_0001, u32::MAX];
        for namespace in samples {
            for code in samples {
                assert_eq!(split_compact(join_compact(namespace, code)), (namespace, code));
            }
        }
        assert_eq!(join_compact(1, 2), 0x0000_0001_0000_0002);
    }

    #[test]
    fn test_text_split_uses_last_dot() {
        assert_eq!(split_text("game.lobby.join"), Some(("game.lobby", "join")));
        assert_eq!(split_text("chat.say"), Some(("chat", "say")));
        assert_eq!(split_text("chat"), None);
    }

    #[test]
    fn test_split_rejects_mismatched_token() {
        assert!(matches!(
            Encoding::Text.split(&CommandToken::Compact(7)),
            Err(TranslateError::InvalidCode(_))
        ));
        assert!(matches!(
            Encoding::Compact.split(&CommandToken::from("chat.say")),
            Err(TranslateError::InvalidCode(_))
        ));
        assert!(matches!(
            Encoding::Text.split(&CommandToken::from("nodots")),
            Err(TranslateError::MalformedCommand(_))
        ));
    }

    #[test]
    fn test_compact_key_requires_code() {
        let named = CommandSpec::named("chat");
        assert_eq!(Encoding::Text.key(&named).unwrap(), WireKey::Name("chat".to_string()));
        assert!(matches!(Encoding::Compact.key(&named), Err(AddressingError::MissingCode(_))));
    }

    #[test]
    fn test_json_envelope_validation() {
        let decode = |value: Value| Encoding::Text.decode(value.to_string().as_bytes());

        let envelope = decode(json!({"code": "chat.say", "args": ["hi"]})).unwrap();
        assert_eq!(envelope.code, CommandToken::from("chat.say"));
        assert_eq!(envelope.args, vec![json!("hi")]);
        assert!(envelope.kwargs.is_empty());

        assert_eq!(decode(json!(["chat.say"])), Err(TranslateError::ExpectedMap));
        assert_eq!(decode(json!({"args": []})), Err(TranslateError::MissingCode));
        assert_eq!(
            decode(json!({"code": "chat.say", "extra": 1})),
            Err(TranslateError::UnexpectedField("extra".to_string()))
        );
        assert_eq!(decode(json!({"code": "chat.say", "args": {}})), Err(TranslateError::ArgsNotList));
        assert_eq!(decode(json!({"code": "chat.say", "kwargs": []})), Err(TranslateError::KwargsNotMap));
        assert!(matches!(decode(json!({"code": 12})), Err(TranslateError::InvalidCode(_))));
        assert!(matches!(
            Encoding::Text.decode(b"{not json"),
            Err(TranslateError::Decode(_))
        ));
    }

    #[test]
    fn test_cbor_envelope_validation() {
        let mut entries = BTreeMap::new();
        entries.insert(CborValue::Text("code".to_string()), CborValue::Integer(join_compact(2, 3) as i128));
        let mut kwargs = BTreeMap::new();
        kwargs.insert(CborValue::Integer(1), CborValue::Bool(true));
        entries.insert(CborValue::Text("kwargs".to_string()), CborValue::Map(kwargs));
        let data = serde_cbor::to_vec(&CborValue::Map(entries)).unwrap();

        assert_eq!(Encoding::Compact.decode(&data), Err(TranslateError::KwargsKeysNotStrings));

        let negative = serde_cbor::to_vec(&json!({"code": -1})).unwrap();
        assert!(matches!(Encoding::Compact.decode(&negative), Err(TranslateError::InvalidCode(_))));

        let list = serde_cbor::to_vec(&json!([1, 2])).unwrap();
        assert_eq!(Encoding::Compact.decode(&list), Err(TranslateError::ExpectedMap));
    }

    #[test]
    fn test_encode_omits_empty_members() {
        let envelope = RawEnvelope::new("chat.said");
        let data = Encoding::Text.encode(&envelope).unwrap();
        assert_eq!(String::from_utf8(data).unwrap(), r#"{"code":"chat.said"}"#);

        let mut envelope = RawEnvelope::new(join_compact(2, 4));
        envelope.args.push(json!("ann"));
        envelope.kwargs.insert("at".to_string(), json!(5));
        let data = Encoding::Compact.encode(&envelope).unwrap();
        assert_eq!(Encoding::Compact.decode(&data).unwrap(), envelope);
    }

    #[test]
    fn test_close_notice_is_not_an_envelope() {
        let notice = CloseNotice {
            code: 1002,
            reason: "Unexistent or unavailable message".to_string(),
        };
        let data = Encoding::Text.encode_close(&notice).unwrap();
        assert_eq!(
            Encoding::Text.decode(&data),
            Err(TranslateError::UnexpectedField("reason".to_string()))
        );
        assert_eq!(Encoding::Text.decode_close(&data).unwrap(), notice);
    }
}
