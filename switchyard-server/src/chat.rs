//! Demo chat protocol served by this binary.
//!
//! Clients join with a nickname, then chat; a guard layer keeps everything
//! but `chat.join` out until they do. The `system` namespace carries
//! housekeeping commands.

use crate::handler::ConnectionEvent;
use anyhow::{anyhow, Context as _};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchyard_proto::{
    AddressingError, CloseCode, CommandSpec, Context, Control, Direction, Encoding, HandlerError,
    HandlerResult, HookResult, Hooks, Message, Outcome, Protocol, ProtocolConfig, ProtocolLayer,
    Stage, Timeout, TranslateError, Translator,
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

pub const SYSTEM: CommandSpec = CommandSpec::new("system", 1);
pub const WELCOME: CommandSpec = CommandSpec::new("welcome", 1);
pub const PING: CommandSpec = CommandSpec::new("ping", 2);
pub const PONG: CommandSpec = CommandSpec::new("pong", 3);
pub const STATUS: CommandSpec = CommandSpec::new("status", 4);
pub const REPORT: CommandSpec = CommandSpec::new("report", 5);
pub const BYE: CommandSpec = CommandSpec::new("bye", 6);
pub const GOODBYE: CommandSpec = CommandSpec::new("goodbye", 7);
pub const ERROR: CommandSpec = CommandSpec::new("error", 8);

pub const CHAT: CommandSpec = CommandSpec::new("chat", 2);
pub const JOIN: CommandSpec = CommandSpec::new("join", 1);
pub const JOINED: CommandSpec = CommandSpec::new("joined", 2);
pub const SAY: CommandSpec = CommandSpec::new("say", 3);
pub const SAID: CommandSpec = CommandSpec::new("said", 4);

/// Server state that every connection can read
pub struct ServerInfo {
    pub started: Instant,
    pub version: String,
}

impl ServerInfo {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            started: Instant::now(),
            version: version.into(),
        }
    }
}

/// Per-connection chat state
pub struct ChatSession {
    info: Arc<ServerInfo>,
    events: UnboundedSender<ConnectionEvent>,
    handshake_timeout: Duration,
    handshake: Option<Timeout>,
    nickname: Option<String>,
}

impl ChatSession {
    pub fn new(info: Arc<ServerInfo>, events: UnboundedSender<ConnectionEvent>, handshake_timeout: Duration) -> Self {
        Self {
            info,
            events,
            handshake_timeout,
            handshake: None,
            nickname: None,
        }
    }

    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }

    fn report(&self, ctx: &mut Context<'_>, text: String) -> HookResult {
        let error = ctx.message(&SYSTEM, &ERROR)?.with_arg(text);
        ctx.send(&error)?;
        Ok(Control::Continue)
    }
}

impl Hooks for ChatSession {
    fn on_hello(&mut self, ctx: &mut Context<'_>) -> HookResult {
        let welcome = ctx.message(&SYSTEM, &WELCOME)?.with_arg(self.info.version.clone());
        ctx.send(&welcome)?;

        if self.handshake_timeout.is_zero() {
            return Ok(Control::Continue);
        }

        let events = self.events.clone();
        let handshake = ctx.timeout(self.handshake_timeout, move |expiry| {
            if !expiry.is_forced() {
                let _ = events.send(ConnectionEvent::HandshakeExpired);
            }
        })?;
        handshake.start()?;
        self.handshake = Some(handshake);

        Ok(Control::Continue)
    }

    fn on_goodbye(&mut self, ctx: &mut Context<'_>) -> Result<(), HandlerError> {
        let mut goodbye = ctx.message(&SYSTEM, &GOODBYE)?;
        if let Some(nickname) = &self.nickname {
            goodbye = goodbye.with_arg(nickname.clone());
        }
        ctx.send(&goodbye)?;
        Ok(())
    }

    fn on_unknown_message(&mut self, ctx: &mut Context<'_>, message: &Message) -> HookResult {
        self.report(ctx, format!("Unexistent or unavailable message: {}", message))
    }

    fn on_serializer_exception(&mut self, ctx: &mut Context<'_>, error: &TranslateError) -> HookResult {
        self.report(ctx, format!("Message format error: {}", error))
    }

    fn on_unknown_exception(&mut self, ctx: &mut Context<'_>, error: &HandlerError, stage: Stage) -> HookResult {
        match stage {
            // Nothing sensible to say to a client we never greeted.
            Stage::Hello => Ok(Control::Close),
            _ => self.report(ctx, format!("Cannot fulfill request: {:#}", error)),
        }
    }

    fn on_forceful_close(&mut self, code: CloseCode, reason: &str) {
        info!("Closing {} with {}: {}", self.nickname().unwrap_or("<anonymous>"), code, reason);
    }
}

fn text_arg<'m>(message: &'m Message, index: usize, what: &str) -> Result<&'m str, HandlerError> {
    message
        .arg(index)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("{} requires a {} argument", message.code().name(), what))
}

fn join(session: &mut ChatSession, ctx: &mut Context<'_>, message: &Message) -> HandlerResult {
    let nickname = text_arg(message, 0, "nickname")?.trim();
    if nickname.is_empty() {
        return Err(anyhow!("nickname cannot be empty"));
    }

    if let Some(handshake) = &session.handshake {
        if handshake.is_running() {
            handshake.force_stop().context("stopping handshake timeout")?;
        }
    }

    debug!("{} joined", nickname);
    session.nickname = Some(nickname.to_string());

    let joined = ctx.message(&CHAT, &JOINED)?.with_arg(nickname);
    ctx.send(&joined)?;
    Ok(Outcome::Handled)
}

fn say(session: &mut ChatSession, ctx: &mut Context<'_>, message: &Message) -> HandlerResult {
    let text = text_arg(message, 0, "text")?;
    let nickname = session
        .nickname
        .clone()
        .ok_or_else(|| anyhow!("chat.say before chat.join"))?;

    let said = ctx
        .message(&CHAT, &SAID)?
        .with_arg(nickname)
        .with_arg(text)
        .with_kwarg("at", chrono::Utc::now().to_rfc3339());
    ctx.send(&said)?;
    Ok(Outcome::Handled)
}

fn ping(_: &mut ChatSession, ctx: &mut Context<'_>, message: &Message) -> HandlerResult {
    let pong = ctx
        .message(&SYSTEM, &PONG)?
        .with_args(message.args().to_vec())
        .with_kwargs(message.kwargs().clone());
    ctx.send(&pong)?;
    Ok(Outcome::Handled)
}

fn status(session: &mut ChatSession, ctx: &mut Context<'_>, _: &Message) -> HandlerResult {
    let report = ctx
        .message(&SYSTEM, &REPORT)?
        .with_kwarg("version", session.info.version.clone())
        .with_kwarg("uptime_secs", session.info.started.elapsed().as_secs())
        .with_kwarg("status", "running")
        .with_kwarg("joined", json!(session.nickname));
    ctx.send(&report)?;
    Ok(Outcome::Handled)
}

/// Keeps the `chat` namespace closed until the client has joined.
pub fn guard_layer(translator: &mut Translator) -> Result<ProtocolLayer<ChatSession>, AddressingError> {
    Ok(ProtocolLayer::<ChatSession>::builder("guard", translator)
        .on(CHAT, JOIN, |_, _, _| Ok(Outcome::TryNext))?
        .on_namespace(CHAT, |session, _, _| {
            Ok(match session.nickname {
                Some(_) => Outcome::TryNext,
                None => Outcome::Reject,
            })
        })?
        .build())
}

pub fn chat_layer(translator: &mut Translator) -> Result<ProtocolLayer<ChatSession>, AddressingError> {
    Ok(ProtocolLayer::<ChatSession>::builder("chat", translator)
        .on(CHAT, JOIN, join)?
        .on(CHAT, SAY, say)?
        .build())
}

pub fn system_layer(translator: &mut Translator) -> Result<ProtocolLayer<ChatSession>, AddressingError> {
    Ok(ProtocolLayer::<ChatSession>::builder("system", translator)
        .on(SYSTEM, PING, ping)?
        .on(SYSTEM, STATUS, status)?
        .on(SYSTEM, BYE, |_, _, _| Ok(Outcome::Close))?
        .build())
}

/// Every command of the demo protocol with its direction.
pub fn default_commands() -> ProtocolConfig {
    let commands = [
        (&SYSTEM, &WELCOME, Direction::ClientBound),
        (&SYSTEM, &PING, Direction::ServerBound),
        (&SYSTEM, &PONG, Direction::ClientBound),
        (&SYSTEM, &STATUS, Direction::ServerBound),
        (&SYSTEM, &REPORT, Direction::ClientBound),
        (&SYSTEM, &BYE, Direction::ServerBound),
        (&SYSTEM, &GOODBYE, Direction::ClientBound),
        (&SYSTEM, &ERROR, Direction::ClientBound),
        (&CHAT, &JOIN, Direction::ServerBound),
        (&CHAT, &JOINED, Direction::ClientBound),
        (&CHAT, &SAY, Direction::ServerBound),
        (&CHAT, &SAID, Direction::ClientBound),
    ];

    commands
        .into_iter()
        .fold(ProtocolConfig::new(), |config, (namespace, code, direction)| {
            config.command(namespace.to_string(), code.to_string(), direction)
        })
}

pub fn build_protocol(
    encoding: Encoding,
    commands: &ProtocolConfig,
) -> Result<Arc<Protocol<ChatSession>>, AddressingError> {
    Ok(Protocol::builder(encoding)
        .commands(commands)?
        .layer(guard_layer)?
        .layer(chat_layer)?
        .layer(system_layer)?
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timers::TokioTimers;
    use switchyard_proto::{
        CommandToken, Connection, ConnectionError, ErrorPolicy, Framing, MessageProcessor, TimerBackend,
    };
    use tokio::runtime::Handle;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recording {
        sent: Vec<Value>,
        closes: Vec<(CloseCode, String)>,
    }

    impl Connection for Recording {
        fn send(&mut self, data: Vec<u8>, _: Framing) -> Result<(), ConnectionError> {
            self.sent.push(serde_json::from_slice(&data).unwrap());
            Ok(())
        }

        fn close(&mut self, code: CloseCode, reason: &str) {
            self.closes.push((code, reason.to_string()));
        }
    }

    type Processor = MessageProcessor<ChatSession, Recording>;

    fn open(policy: ErrorPolicy) -> (Processor, mpsc::UnboundedReceiver<ConnectionEvent>, Arc<TokioTimers>) {
        open_with(&default_commands(), policy)
    }

    fn open_with(
        commands: &ProtocolConfig,
        policy: ErrorPolicy,
    ) -> (Processor, mpsc::UnboundedReceiver<ConnectionEvent>, Arc<TokioTimers>) {
        let protocol = build_protocol(Encoding::Text, commands).unwrap();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let info = Arc::new(ServerInfo::new("9.9.9"));
        let session = ChatSession::new(info, events_tx, Duration::from_secs(60));
        let timers = Arc::new(TokioTimers::new(Handle::current()));

        let backend: Arc<dyn TimerBackend> = timers.clone();
        let mut processor = MessageProcessor::new(protocol, session, Recording::default(), policy).with_timers(backend);
        processor.connection_established().unwrap();
        (processor, events_rx, timers)
    }

    fn send(processor: &mut Processor, value: Value) {
        processor
            .connection_message(value.to_string().as_bytes(), Some(Framing::Text))
            .unwrap();
    }

    fn last_sent(processor: &Processor) -> &Value {
        processor.connection().sent.last().unwrap()
    }

    #[test]
    fn test_default_commands_cover_both_encodings() {
        for encoding in [Encoding::Text, Encoding::Compact] {
            let protocol = build_protocol(encoding, &default_commands()).unwrap();
            let token = protocol.translator().untranslate(&CHAT, &SAID).unwrap();
            assert_eq!(protocol.translator().translate(&token).unwrap(), (&CHAT, &SAID));
        }

        let protocol = build_protocol(Encoding::Compact, &default_commands()).unwrap();
        assert_eq!(
            protocol.translator().untranslate(&SYSTEM, &PING).unwrap(),
            CommandToken::Compact(0x0000_0001_0000_0002)
        );
    }

    #[test]
    fn test_name_only_text_config_builds() {
        let commands = ProtocolConfig::from_json(r#"{"chat": {"say": "server", "said": "client"}}"#).unwrap();
        let protocol = build_protocol(Encoding::Text, &commands).unwrap();

        let said = protocol.translator().message(&CHAT, &SAID).unwrap();
        assert_eq!(said.direction(), Direction::ClientBound);
        let join = protocol.translator().message(&CHAT, &JOIN).unwrap();
        assert_eq!(join.direction(), Direction::ServerBound);
    }

    #[tokio::test]
    async fn test_name_only_config_serves_chat() {
        let commands = ProtocolConfig::from_json(
            r#"{
                "system": {"welcome": "client", "goodbye": "client", "error": "client"},
                "chat": {"joined": "client", "say": "server", "said": "client"}
            }"#,
        )
        .unwrap();
        let (mut processor, _events, _timers) = open_with(&commands, ErrorPolicy::Strict);
        assert_eq!(*last_sent(&processor), json!({"code": "system.welcome", "args": ["9.9.9"]}));

        send(&mut processor, json!({"code": "chat.join", "args": ["bo"]}));
        assert_eq!(*last_sent(&processor), json!({"code": "chat.joined", "args": ["bo"]}));

        send(&mut processor, json!({"code": "chat.say", "args": ["hey"]}));
        assert_eq!(last_sent(&processor)["args"], json!(["bo", "hey"]));
        assert!(processor.connection().closes.is_empty());
    }

    #[tokio::test]
    async fn test_hello_welcomes_and_arms_handshake() {
        let (processor, _events, timers) = open(ErrorPolicy::Strict);

        assert_eq!(*last_sent(&processor), json!({"code": "system.welcome", "args": ["9.9.9"]}));
        assert_eq!(timers.armed(), 1);
    }

    #[tokio::test]
    async fn test_join_then_say() {
        let (mut processor, mut events, timers) = open(ErrorPolicy::Strict);

        send(&mut processor, json!({"code": "chat.join", "args": ["ann"]}));
        assert_eq!(*last_sent(&processor), json!({"code": "chat.joined", "args": ["ann"]}));
        assert_eq!(processor.session().nickname(), Some("ann"));
        assert_eq!(timers.armed(), 0);
        assert!(events.try_recv().is_err());

        send(&mut processor, json!({"code": "chat.say", "args": ["hello"]}));
        let said = last_sent(&processor);
        assert_eq!(said["code"], "chat.said");
        assert_eq!(said["args"], json!(["ann", "hello"]));
        assert!(said["kwargs"]["at"].is_string());
        assert!(processor.connection().closes.is_empty());
    }

    #[tokio::test]
    async fn test_strict_guard_rejects_before_join() {
        let (mut processor, _events, _timers) = open(ErrorPolicy::Strict);

        send(&mut processor, json!({"code": "chat.say", "args": ["too early"]}));
        assert_eq!(
            processor.connection().closes,
            vec![(CloseCode::PROTOCOL_ERROR, "Unexistent or unavailable message".to_string())]
        );
    }

    #[tokio::test]
    async fn test_lenient_errors_become_messages() {
        let (mut processor, _events, _timers) = open(ErrorPolicy::Lenient);

        send(&mut processor, json!({"code": "chat.say", "args": ["too early"]}));
        assert_eq!(last_sent(&processor)["code"], "system.error");

        send(&mut processor, json!({"code": "chat.join"}));
        let error = last_sent(&processor);
        assert_eq!(error["code"], "system.error");
        assert!(error["args"][0].as_str().unwrap().contains("nickname"));

        send(&mut processor, json!({"code": "system.welcome"}));
        assert!(last_sent(&processor)["args"][0]
            .as_str()
            .unwrap()
            .starts_with("Message format error"));

        assert!(processor.connection().closes.is_empty());
    }

    #[tokio::test]
    async fn test_system_commands() {
        let (mut processor, _events, _timers) = open(ErrorPolicy::Strict);

        send(&mut processor, json!({"code": "system.ping", "args": [7]}));
        assert_eq!(*last_sent(&processor), json!({"code": "system.pong", "args": [7]}));

        send(&mut processor, json!({"code": "system.status"}));
        let report = last_sent(&processor);
        assert_eq!(report["code"], "system.report");
        assert_eq!(report["kwargs"]["version"], "9.9.9");
        assert_eq!(report["kwargs"]["joined"], Value::Null);

        send(&mut processor, json!({"code": "system.bye"}));
        assert_eq!(*last_sent(&processor), json!({"code": "system.goodbye"}));
        assert_eq!(processor.connection().closes, vec![(CloseCode::NORMAL, String::new())]);
    }

    #[tokio::test]
    async fn test_handshake_expiry_is_reported() {
        let protocol = build_protocol(Encoding::Text, &default_commands()).unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let session = ChatSession::new(Arc::new(ServerInfo::new("1.0")), events_tx, Duration::from_millis(20));
        let timers: Arc<dyn TimerBackend> = Arc::new(TokioTimers::new(Handle::current()));

        let mut processor =
            MessageProcessor::new(protocol, session, Recording::default(), ErrorPolicy::Strict).with_timers(timers);
        processor.connection_established().unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv()).await.unwrap();
        assert!(matches!(event, Some(ConnectionEvent::HandshakeExpired)));
    }
}
