use crate::{CommandSpec, Direction};
use serde_json::{Map, Value};
use std::fmt;

/// A typed, directional message.
///
/// Messages are only built by a [`crate::Translator`], either by parsing a
/// payload or by looking up a registered command, so every message refers to
/// a command its translator knows about.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    namespace: CommandSpec,
    code: CommandSpec,
    direction: Direction,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
}

impl Message {
    pub(crate) fn new(namespace: CommandSpec, code: CommandSpec, direction: Direction) -> Self {
        Self {
            namespace,
            code,
            direction,
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn namespace(&self) -> &CommandSpec {
        &self.namespace
    }

    pub fn code(&self) -> &CommandSpec {
        &self.code
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }

    /// Whether this message carries the given command. A spec without a
    /// numeric code matches by name alone.
    pub fn is(&self, namespace: &CommandSpec, code: &CommandSpec) -> bool {
        self.namespace.agrees_with(namespace) && self.code.agrees_with(code)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace.name(), self.code.name())?;
        if !self.args.is_empty() || !self.kwargs.is_empty() {
            write!(
                f,
                "({}, {})",
                Value::Array(self.args.clone()),
                Value::Object(self.kwargs.clone())
            )?;
        }
        Ok(())
    }
}
