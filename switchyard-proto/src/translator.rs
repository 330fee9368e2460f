use crate::{
    AddressingError, CommandSpec, CommandToken, Direction, Encoding, Framing, Message,
    ProtocolConfig, RawEnvelope, TranslateError, WireKey,
};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Returned by lookups of namespaces nobody registered. It holds no
/// commands, so unknown namespaces and unknown codes fail the same way.
static UNKNOWN_NAMESPACE: NamespaceEntry = NamespaceEntry {
    encoding: Encoding::Text,
    spec: None,
    commands: BTreeMap::new(),
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredCommand {
    spec: CommandSpec,
    direction: Direction,
}

impl RegisteredCommand {
    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

/// The commands registered under one namespace, keyed by wire code.
#[derive(Debug, Clone)]
pub struct NamespaceEntry {
    encoding: Encoding,
    spec: Option<CommandSpec>,
    commands: BTreeMap<WireKey, RegisteredCommand>,
}

impl NamespaceEntry {
    fn new(encoding: Encoding, spec: CommandSpec) -> Self {
        Self {
            encoding,
            spec: Some(spec),
            commands: BTreeMap::new(),
        }
    }

    /// `None` for the unknown-namespace sentinel.
    pub fn spec(&self) -> Option<&CommandSpec> {
        self.spec.as_ref()
    }

    pub fn is_unknown(&self) -> bool {
        self.spec.is_none()
    }

    /// Registers a command, failing if its wire code is already taken.
    pub fn register_command(
        &mut self,
        spec: CommandSpec,
        direction: Direction,
    ) -> Result<&RegisteredCommand, AddressingError> {
        self.insert(spec, direction, false)
    }

    /// Registers a command unless the very same spec is already present, in
    /// which case the existing registration (and its direction) is kept.
    pub fn ensure_command(
        &mut self,
        spec: CommandSpec,
        direction: Direction,
    ) -> Result<&RegisteredCommand, AddressingError> {
        self.insert(spec, direction, true)
    }

    fn insert(
        &mut self,
        spec: CommandSpec,
        direction: Direction,
        silent: bool,
    ) -> Result<&RegisteredCommand, AddressingError> {
        if spec.is_any() {
            return Err(AddressingError::WildcardRegistration);
        }
        if self.spec.is_none() {
            return Err(AddressingError::UnknownNamespace(spec.to_string()));
        }
        // Text tokens split at the last dot, so a dotted code would never
        // translate back.
        if self.encoding == Encoding::Text && (spec.name().is_empty() || spec.name().contains('.')) {
            return Err(AddressingError::InvalidToken(spec.to_string()));
        }

        let key = self.encoding.key(&spec)?;
        match self.commands.entry(key) {
            Entry::Vacant(entry) => Ok(entry.insert(RegisteredCommand { spec, direction })),
            Entry::Occupied(entry) => {
                let existing = entry.into_mut();
                if !silent {
                    Err(AddressingError::DuplicateCommand(spec.to_string()))
                } else if existing.spec.agrees_with(&spec) {
                    Ok(existing)
                } else {
                    Err(AddressingError::CodeConflict {
                        existing: existing.spec.to_string(),
                        requested: spec.to_string(),
                    })
                }
            }
        }
    }

    pub fn lookup(&self, key: &WireKey) -> Option<&RegisteredCommand> {
        self.commands.get(key)
    }

    pub fn commands(&self) -> impl Iterator<Item = &RegisteredCommand> {
        self.commands.values()
    }
}

/// Maps wire tokens to command specs and back, and turns payloads into
/// messages.
///
/// Mutated only while a protocol is being assembled; afterwards it is
/// shared read-only by every connection.
#[derive(Debug, Clone)]
pub struct Translator {
    encoding: Encoding,
    namespaces: HashMap<WireKey, NamespaceEntry>,
}

impl Translator {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            namespaces: HashMap::new(),
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Registers a namespace, or returns the one already holding its wire
    /// key when the two specs agree.
    pub fn namespace(&mut self, spec: CommandSpec) -> Result<&mut NamespaceEntry, AddressingError> {
        if spec.is_any() {
            return Err(AddressingError::WildcardRegistration);
        }
        if self.encoding == Encoding::Text && spec.name().is_empty() {
            return Err(AddressingError::InvalidToken(spec.to_string()));
        }

        let key = self.encoding.key(&spec)?;
        let encoding = self.encoding;
        let entry = self
            .namespaces
            .entry(key)
            .or_insert_with(|| NamespaceEntry::new(encoding, spec.clone()));

        match &entry.spec {
            Some(existing) if !existing.agrees_with(&spec) => Err(AddressingError::CodeConflict {
                existing: existing.to_string(),
                requested: spec.to_string(),
            }),
            _ => Ok(entry),
        }
    }

    /// Registers every command of a declarative protocol configuration.
    pub fn load(&mut self, config: &ProtocolConfig) -> Result<(), AddressingError> {
        config.apply(self)
    }

    /// The entry for a namespace key, or the unknown-namespace sentinel.
    pub fn lookup_namespace(&self, key: &WireKey) -> &NamespaceEntry {
        self.namespaces.get(key).unwrap_or(&UNKNOWN_NAMESPACE)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &NamespaceEntry> {
        self.namespaces.values()
    }

    fn resolve(&self, token: &CommandToken) -> Result<(&CommandSpec, &RegisteredCommand), TranslateError> {
        let (namespace_key, code_key) = self.encoding.split(token)?;
        let namespace = self.lookup_namespace(&namespace_key);

        match (namespace.spec(), namespace.lookup(&code_key)) {
            (Some(namespace), Some(command)) => Ok((namespace, command)),
            _ => Err(TranslateError::UnknownCommand(token.to_string())),
        }
    }

    /// Splits a full token into its registered namespace and code specs.
    pub fn translate(&self, token: &CommandToken) -> Result<(&CommandSpec, &CommandSpec), TranslateError> {
        self.resolve(token)
            .map(|(namespace, command)| (namespace, command.spec()))
    }

    /// The inverse of [`Translator::translate`].
    pub fn untranslate(&self, namespace: &CommandSpec, code: &CommandSpec) -> Result<CommandToken, AddressingError> {
        self.encoding.join(namespace, code)
    }

    /// Builds an empty message for a registered command. The message carries
    /// the registered specs, which may hold more detail than the ones asked
    /// for.
    pub fn message(&self, namespace: &CommandSpec, code: &CommandSpec) -> Result<Message, TranslateError> {
        let token = self.untranslate(namespace, code)?;
        let (registered_namespace, command) = self.resolve(&token)?;

        if !registered_namespace.agrees_with(namespace) || !command.spec().agrees_with(code) {
            return Err(TranslateError::UnknownCommand(token.to_string()));
        }

        Ok(Message::new(
            registered_namespace.clone(),
            command.spec().clone(),
            command.direction(),
        ))
    }

    /// Builds an empty message for a registered wire token.
    pub fn message_for(&self, token: &CommandToken) -> Result<Message, TranslateError> {
        let (namespace, command) = self.resolve(token)?;
        Ok(Message::new(namespace.clone(), command.spec().clone(), command.direction()))
    }

    /// Parses a payload received from a client.
    ///
    /// `expected` is the framing the transport observed, if it can tell; a
    /// mismatch with this translator's encoding is rejected before decoding.
    pub fn parse(&self, data: &[u8], expected: Option<Framing>) -> Result<Message, TranslateError> {
        match (expected, self.encoding.framing()) {
            (Some(Framing::Binary), Framing::Text) => return Err(TranslateError::UnexpectedBinary),
            (Some(Framing::Text), Framing::Binary) => return Err(TranslateError::UnexpectedText),
            _ => {}
        }

        let envelope = self.encoding.decode(data)?;
        let message = self
            .message_for(&envelope.code)?
            .with_args(envelope.args)
            .with_kwargs(envelope.kwargs);

        if !message.direction().to_server() {
            return Err(TranslateError::WrongDirection(envelope.code.to_string()));
        }

        debug!("Parsed message {}", message);
        Ok(message)
    }

    /// Encodes a message for the wire. Direction is the caller's concern.
    pub fn serialize(&self, message: &Message) -> Result<Vec<u8>, TranslateError> {
        let envelope = RawEnvelope {
            code: self.untranslate(message.namespace(), message.code())?,
            args: message.args().to_vec(),
            kwargs: message.kwargs().clone(),
        };
        self.encoding.encode(&envelope)
    }
}
