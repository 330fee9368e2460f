use crate::chat::{ChatSession, ServerInfo};
use crate::config::ServerConfig;
use crate::transport;
use bytes::Bytes;
use futures_util::StreamExt;
use rand::Rng;
use std::sync::Arc;
use switchyard_proto::{
    CloseCode, Connection, ConnectionError, Encoding, ErrorPolicy, Framing, MessageProcessor, Protocol,
    TimerBackend,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, info_span, warn, Instrument};

/// Everything the connection driver reacts to, in arrival order.
#[derive(Debug)]
pub enum ConnectionEvent {
    Payload(Vec<u8>, Option<Framing>),
    /// The peer went away, or the socket failed.
    Eof,
    /// Nothing was read within the read timeout.
    Idle,
    /// The transport received something it cannot frame.
    Malformed(String),
    HandshakeExpired,
}

/// Work for the transport writer.
#[derive(Debug)]
pub enum Outbound {
    Payload(Vec<u8>, Framing),
    Pong(Bytes),
    Close(CloseCode, String),
}

/// The processor's view of a socket: a queue to the writer task.
pub struct ChannelConnection {
    outbound: UnboundedSender<Outbound>,
}

impl ChannelConnection {
    pub fn new(outbound: UnboundedSender<Outbound>) -> Self {
        Self { outbound }
    }
}

impl Connection for ChannelConnection {
    fn send(&mut self, data: Vec<u8>, framing: Framing) -> Result<(), ConnectionError> {
        self.outbound
            .send(Outbound::Payload(data, framing))
            .map_err(|_| ConnectionError::Closed)
    }

    fn close(&mut self, code: CloseCode, reason: &str) {
        if self.outbound.send(Outbound::Close(code, reason.to_string())).is_err() {
            debug!("Writer already gone, close {} not sent", code);
        }
    }
}

fn connection_id() -> String {
    let mut rng = rand::thread_rng();
    let id: [u8; 8] = rng.gen();
    hex::encode(id)
}

pub struct ConnectionHandler {
    protocol: Arc<Protocol<ChatSession>>,
    server_info: Arc<ServerInfo>,
    timers: Arc<dyn TimerBackend>,
    policy: ErrorPolicy,
    encoding: Encoding,
    max_frame_size: u32,
    read_timeout: Duration,
    write_timeout: Duration,
    handshake_timeout: Duration,
}

impl ConnectionHandler {
    pub fn new(
        protocol: Arc<Protocol<ChatSession>>,
        server_info: Arc<ServerInfo>,
        timers: Arc<dyn TimerBackend>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            encoding: protocol.translator().encoding(),
            protocol,
            server_info,
            timers,
            policy: ErrorPolicy::from_strict(config.protocol.strict),
            max_frame_size: config.limits.max_frame_bytes,
            read_timeout: Duration::from_secs(config.limits.read_timeout_secs),
            write_timeout: Duration::from_secs(config.limits.write_timeout_secs),
            handshake_timeout: Duration::from_secs(config.protocol.handshake_timeout_secs),
        }
    }

    /// Handles a client speaking length-prefixed frames over a byte stream
    pub async fn handle_stream<S>(&self, stream: S, remote_addr: String)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn_id = connection_id();
        let span = info_span!("conn", id = %conn_id);

        async move {
            info!("Connection from {}", remote_addr);
            let (reader, writer) = tokio::io::split(stream);
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

            let reader = tokio::spawn(
                transport::read_frames(reader, events_tx.clone(), self.max_frame_size, self.read_timeout)
                    .in_current_span(),
            );
            let writer = tokio::spawn(
                transport::write_frames(writer, outbound_rx, events_tx.clone(), self.encoding, self.write_timeout)
                    .in_current_span(),
            );

            self.drive(events_tx, events_rx, outbound_tx).await;
            finish(reader, writer).await;
            info!("Connection closed");
        }
        .instrument(span)
        .await
    }

    /// Handles a websocket client. Text and binary frames keep their
    /// distinction all the way to the translator.
    pub async fn handle_websocket<S>(&self, stream: S, remote_addr: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let conn_id = connection_id();
        let span = info_span!("conn", id = %conn_id);

        async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws_stream) => ws_stream,
                Err(e) => {
                    warn!("WebSocket handshake failed for {}: {}", remote_addr, e);
                    return;
                }
            };
            info!("WebSocket connection from {}", remote_addr);

            let (sink, source) = ws_stream.split();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

            let reader = tokio::spawn(
                transport::read_websocket(source, events_tx.clone(), outbound_tx.clone(), self.read_timeout)
                    .in_current_span(),
            );
            let writer = tokio::spawn(
                transport::write_websocket(sink, outbound_rx, events_tx.clone(), self.write_timeout).in_current_span(),
            );

            self.drive(events_tx, events_rx, outbound_tx).await;
            finish(reader, writer).await;
            info!("Connection closed");
        }
        .instrument(span)
        .await
    }

    /// Feeds events to a fresh processor, one at a time, until it closes.
    async fn drive(
        &self,
        events_tx: UnboundedSender<ConnectionEvent>,
        mut events_rx: UnboundedReceiver<ConnectionEvent>,
        outbound_tx: UnboundedSender<Outbound>,
    ) {
        let session = ChatSession::new(self.server_info.clone(), events_tx, self.handshake_timeout);
        let mut processor = MessageProcessor::new(
            self.protocol.clone(),
            session,
            ChannelConnection::new(outbound_tx),
            self.policy,
        )
        .with_timers(self.timers.clone());

        if let Err(e) = processor.connection_established() {
            warn!("Could not open connection: {}", e);
            return;
        }

        while !processor.is_closed() {
            let Some(event) = events_rx.recv().await else {
                break;
            };

            match event {
                ConnectionEvent::Payload(data, framing) => {
                    if let Err(e) = processor.connection_message(&data, framing) {
                        debug!("Dropped payload: {}", e);
                    }
                }
                ConnectionEvent::Eof => processor.connection_lost(),
                ConnectionEvent::Idle => {
                    info!("Idle timeout");
                    if let Err(e) = processor.terminate() {
                        debug!("Idle close skipped: {}", e);
                    }
                }
                ConnectionEvent::Malformed(reason) => {
                    warn!("Malformed input: {}", reason);
                    processor.force_close(CloseCode::UNSUPPORTED_DATA, &reason);
                }
                ConnectionEvent::HandshakeExpired => {
                    info!("Client did not join in time");
                    if let Err(e) = processor.terminate() {
                        debug!("Handshake close skipped: {}", e);
                    }
                }
            }
        }
    }
}

/// Stops reading and lets the writer flush whatever the processor queued.
async fn finish(reader: JoinHandle<()>, writer: JoinHandle<()>) {
    reader.abort();
    let _ = reader.await;
    if let Err(e) = writer.await {
        warn!("Writer task failed: {}", e);
    }
}
