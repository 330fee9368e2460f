use crate::{AddressingError, CommandSpec, Context, Direction, Encoding, Message, Translator, WireKey};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// What a layer did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Fully handled; no further layers are consulted.
    Handled,
    /// This layer cannot handle it; try the next one.
    TryNext,
    /// Nobody may handle it; stop and treat it as unhandled.
    Reject,
    /// Handled, and the connection should now close gracefully.
    Close,
}

/// Failures raised by handlers and hooks.
pub type HandlerError = anyhow::Error;
pub type HandlerResult = Result<Outcome, HandlerError>;

/// A message handler. `S` is the per-connection session state.
pub type Handler<S> =
    Arc<dyn Fn(&mut S, &mut Context<'_>, &Message) -> HandlerResult + Send + Sync>;

/// Where a handler applies, most specific first. Keys are wire keys, so a
/// handler matches whatever spec the translator registered for them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandlerKey {
    Exact(WireKey, WireKey),
    Namespace(WireKey),
    Global,
}

impl HandlerKey {
    pub fn from_specs(encoding: Encoding, namespace: &CommandSpec, code: &CommandSpec) -> Result<Self, AddressingError> {
        match (namespace.is_any(), code.is_any()) {
            (true, true) => Ok(HandlerKey::Global),
            (true, false) => Err(AddressingError::WildcardNamespace(code.to_string())),
            (false, true) => Ok(HandlerKey::Namespace(encoding.key(namespace)?)),
            (false, false) => Ok(HandlerKey::Exact(encoding.key(namespace)?, encoding.key(code)?)),
        }
    }
}

/// An independently built handler table, one link of a protocol's chain.
pub struct ProtocolLayer<S> {
    name: String,
    handlers: HashMap<HandlerKey, Handler<S>>,
}

impl<S> ProtocolLayer<S> {
    /// Starts a layer whose handlers register their commands in `translator`.
    pub fn builder<'t>(name: impl Into<String>, translator: &'t mut Translator) -> LayerBuilder<'t, S> {
        LayerBuilder {
            translator,
            layer: ProtocolLayer {
                name: name.into(),
                handlers: HashMap::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs the most specific handler for the message. Without one the
    /// layer declines with [`Outcome::TryNext`].
    pub fn process(&self, session: &mut S, ctx: &mut Context<'_>, message: &Message) -> HandlerResult {
        let encoding = ctx.translator().encoding();
        let specific = match (encoding.key(message.namespace()), encoding.key(message.code())) {
            (Ok(namespace), Ok(code)) => self
                .handlers
                .get(&HandlerKey::Exact(namespace.clone(), code))
                .or_else(|| self.handlers.get(&HandlerKey::Namespace(namespace))),
            _ => None,
        };
        let handler = specific.or_else(|| self.handlers.get(&HandlerKey::Global));

        match handler {
            Some(handler) => handler(session, ctx, message),
            None => Ok(Outcome::TryNext),
        }
    }
}

impl<S> fmt::Debug for ProtocolLayer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolLayer")
            .field("name", &self.name)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub struct LayerBuilder<'t, S> {
    translator: &'t mut Translator,
    layer: ProtocolLayer<S>,
}

impl<'t, S> LayerBuilder<'t, S> {
    /// Registers a handler. Concrete namespaces and codes are added to the
    /// translator as server-bound unless already known.
    pub fn on<F>(mut self, namespace: CommandSpec, code: CommandSpec, handler: F) -> Result<Self, AddressingError>
    where
        F: Fn(&mut S, &mut Context<'_>, &Message) -> HandlerResult + Send + Sync + 'static,
    {
        let key = HandlerKey::from_specs(self.translator.encoding(), &namespace, &code)?;

        if !namespace.is_any() {
            let entry = self.translator.namespace(namespace)?;
            if !code.is_any() {
                entry.ensure_command(code, Direction::ServerBound)?;
            }
        }

        self.layer.handlers.insert(key, Arc::new(handler));
        Ok(self)
    }

    pub fn on_namespace<F>(self, namespace: CommandSpec, handler: F) -> Result<Self, AddressingError>
    where
        F: Fn(&mut S, &mut Context<'_>, &Message) -> HandlerResult + Send + Sync + 'static,
    {
        self.on(namespace, CommandSpec::ANY, handler)
    }

    pub fn on_any<F>(self, handler: F) -> Result<Self, AddressingError>
    where
        F: Fn(&mut S, &mut Context<'_>, &Message) -> HandlerResult + Send + Sync + 'static,
    {
        self.on(CommandSpec::ANY, CommandSpec::ANY, handler)
    }

    pub fn build(self) -> ProtocolLayer<S> {
        self.layer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommandToken, Connection, ConnectionError, Encoding, Framing};

    const GAME: CommandSpec = CommandSpec::new("game", 1);
    const MOVE: CommandSpec = CommandSpec::new("move", 1);
    const JUMP: CommandSpec = CommandSpec::new("jump", 2);
    const CHAT: CommandSpec = CommandSpec::new("chat", 2);
    const SAY: CommandSpec = CommandSpec::new("say", 1);

    struct Sink;

    impl Connection for Sink {
        fn send(&mut self, _: Vec<u8>, _: Framing) -> Result<(), ConnectionError> {
            Ok(())
        }
        fn close(&mut self, _: crate::CloseCode, _: &str) {}
    }

    fn tag(label: &'static str) -> impl Fn(&mut Vec<&'static str>, &mut Context<'_>, &Message) -> HandlerResult {
        move |seen, _, _| {
            seen.push(label);
            Ok(Outcome::Handled)
        }
    }

    #[test]
    fn test_wildcard_namespace_needs_wildcard_code() {
        let mut translator = Translator::new(Encoding::Compact);
        let result = ProtocolLayer::<()>::builder("bad", &mut translator).on(CommandSpec::ANY, MOVE, |_, _, _| {
            Ok(Outcome::Handled)
        });
        assert!(matches!(result, Err(AddressingError::WildcardNamespace(_))));
    }

    #[test]
    fn test_handlers_register_server_bound_commands() {
        let mut translator = Translator::new(Encoding::Compact);
        translator
            .namespace(GAME)
            .unwrap()
            .register_command(JUMP, Direction::Both)
            .unwrap();

        ProtocolLayer::<()>::builder("game", &mut translator)
            .on(GAME, MOVE, |_, _, _| Ok(Outcome::Handled))
            .unwrap()
            .on(GAME, JUMP, |_, _, _| Ok(Outcome::Handled))
            .unwrap();

        let moves = translator.message(&GAME, &MOVE).unwrap();
        assert_eq!(moves.direction(), Direction::ServerBound);
        let jumps = translator.message(&GAME, &JUMP).unwrap();
        assert_eq!(jumps.direction(), Direction::Both);
    }

    #[test]
    fn test_dispatch_precedence() {
        let mut translator = Translator::new(Encoding::Compact);
        let layer = ProtocolLayer::<Vec<&'static str>>::builder("all", &mut translator)
            .on(GAME, MOVE, tag("exact"))
            .unwrap()
            .on_namespace(GAME, tag("namespace"))
            .unwrap()
            .on_any(tag("global"))
            .unwrap()
            .build();

        let game = translator.namespace(GAME).unwrap();
        game.register_command(JUMP, Direction::ServerBound).unwrap();
        translator
            .namespace(CHAT)
            .unwrap()
            .register_command(SAY, Direction::ServerBound)
            .unwrap();

        let mut seen = Vec::new();
        let mut connection = Sink;
        let mut ctx = Context::new(&translator, &mut connection, None);
        for (namespace, code) in [(GAME, MOVE), (GAME, JUMP), (CHAT, SAY)] {
            let message = translator.message(&namespace, &code).unwrap();
            layer.process(&mut seen, &mut ctx, &message).unwrap();
        }

        assert_eq!(seen, vec!["exact", "namespace", "global"]);
    }

    #[test]
    fn test_no_match_declines() {
        let mut translator = Translator::new(Encoding::Text);
        let layer = ProtocolLayer::<Vec<&'static str>>::builder("game", &mut translator)
            .on(GAME, MOVE, tag("exact"))
            .unwrap()
            .build();
        translator
            .namespace(CHAT)
            .unwrap()
            .register_command(SAY, Direction::ServerBound)
            .unwrap();

        let message = translator.message_for(&CommandToken::from("chat.say")).unwrap();
        let mut seen = Vec::new();
        let mut connection = Sink;
        let mut ctx = Context::new(&translator, &mut connection, None);

        assert_eq!(layer.process(&mut seen, &mut ctx, &message).unwrap(), Outcome::TryNext);
        assert!(seen.is_empty());
    }

    #[test]
    fn test_coded_handlers_match_name_only_registrations() {
        let mut translator = Translator::new(Encoding::Text);
        translator
            .namespace(CommandSpec::named("chat"))
            .unwrap()
            .register_command(CommandSpec::named("say"), Direction::ServerBound)
            .unwrap();

        let layer = ProtocolLayer::<Vec<&'static str>>::builder("chat", &mut translator)
            .on(CHAT, SAY, tag("exact"))
            .unwrap()
            .build();

        let message = translator.message_for(&CommandToken::from("chat.say")).unwrap();
        assert_eq!(message.code(), &CommandSpec::named("say"));

        let mut seen = Vec::new();
        let mut connection = Sink;
        let mut ctx = Context::new(&translator, &mut connection, None);
        assert_eq!(layer.process(&mut seen, &mut ctx, &message).unwrap(), Outcome::Handled);
        assert_eq!(seen, vec!["exact"]);
    }
}
