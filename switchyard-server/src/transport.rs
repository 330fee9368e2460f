//! Socket pumps. Readers turn inbound traffic into [`ConnectionEvent`]s for
//! the connection driver; writers drain [`Outbound`] items onto the wire.

use crate::handler::{ConnectionEvent, Outbound};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use switchyard_proto::{CloseNotice, Encoding, FrameCodec, FrameError, Framing};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, warn};

/// Reads length-prefixed frames until the stream ends, fails or idles.
pub async fn read_frames<R>(
    reader: R,
    events: UnboundedSender<ConnectionEvent>,
    max_frame_size: u32,
    read_timeout: Duration,
) where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, FrameCodec::new(max_frame_size));

    loop {
        let event = match timeout(read_timeout, frames.next()).await {
            Ok(Some(Ok(frame))) => ConnectionEvent::Payload(frame.to_vec(), None),
            Ok(Some(Err(FrameError::FrameTooLarge(length, max)))) => {
                ConnectionEvent::Malformed(format!("Frame too large: {} bytes (max: {})", length, max))
            }
            Ok(Some(Err(FrameError::Io(e)))) => {
                debug!("Read failed: {}", e);
                ConnectionEvent::Eof
            }
            Ok(None) => ConnectionEvent::Eof,
            Err(_) => ConnectionEvent::Idle,
        };

        if !forward(&events, event) {
            break;
        }
    }
}

/// Writes payloads as frames. A close becomes a final close-notice frame
/// followed by shutdown.
pub async fn write_frames<W>(
    writer: W,
    mut outbound: UnboundedReceiver<Outbound>,
    events: UnboundedSender<ConnectionEvent>,
    encoding: Encoding,
    write_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    let mut frames = FramedWrite::new(writer, FrameCodec::default());

    while let Some(item) = outbound.recv().await {
        let (payload, last) = match item {
            Outbound::Payload(data, _) => (data, false),
            // Stream transports have no control frames.
            Outbound::Pong(_) => continue,
            Outbound::Close(code, reason) => {
                let notice = CloseNotice { code: code.0, reason };
                match encoding.encode_close(&notice) {
                    Ok(data) => (data, true),
                    Err(e) => {
                        error!("Failed to encode close notice: {}", e);
                        break;
                    }
                }
            }
        };

        match timeout(write_timeout, frames.send(payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Write failed: {}", e);
                let _ = events.send(ConnectionEvent::Eof);
                return;
            }
            Err(_) => {
                warn!("Write timeout");
                let _ = events.send(ConnectionEvent::Eof);
                return;
            }
        }

        if last {
            break;
        }
    }

    let _ = frames.close().await;
}

/// Reads websocket messages, keeping the text/binary distinction as the
/// framing hint. Pings are answered through the writer.
pub async fn read_websocket<S>(
    mut source: S,
    events: UnboundedSender<ConnectionEvent>,
    outbound: UnboundedSender<Outbound>,
    read_timeout: Duration,
) where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    loop {
        let event = match timeout(read_timeout, source.next()).await {
            Ok(Some(Ok(WsMessage::Text(text)))) => {
                ConnectionEvent::Payload(text.as_bytes().to_vec(), Some(Framing::Text))
            }
            Ok(Some(Ok(WsMessage::Binary(data)))) => ConnectionEvent::Payload(data.to_vec(), Some(Framing::Binary)),
            Ok(Some(Ok(WsMessage::Ping(data)))) => {
                let _ = outbound.send(Outbound::Pong(data));
                continue;
            }
            Ok(Some(Ok(WsMessage::Close(frame)))) => {
                debug!("Client requested close: {:?}", frame);
                ConnectionEvent::Eof
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(WsError::Capacity(e)))) => ConnectionEvent::Malformed(e.to_string()),
            Ok(Some(Err(e))) => {
                debug!("WebSocket error: {}", e);
                ConnectionEvent::Eof
            }
            Ok(None) => ConnectionEvent::Eof,
            Err(_) => ConnectionEvent::Idle,
        };

        if !forward(&events, event) {
            break;
        }
    }
}

/// Sends outbound items as websocket messages, in the framing the
/// encoding asked for.
pub async fn write_websocket<S>(
    mut sink: S,
    mut outbound: UnboundedReceiver<Outbound>,
    events: UnboundedSender<ConnectionEvent>,
    write_timeout: Duration,
) where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    while let Some(item) = outbound.recv().await {
        let (message, last) = match item {
            Outbound::Payload(data, Framing::Text) => match String::from_utf8(data) {
                Ok(text) => (WsMessage::text(text), false),
                Err(e) => {
                    error!("Dropping text payload that is not UTF-8: {}", e);
                    continue;
                }
            },
            Outbound::Payload(data, Framing::Binary) => (WsMessage::binary(data), false),
            Outbound::Pong(data) => (WsMessage::Pong(data), false),
            Outbound::Close(code, reason) => {
                let frame = CloseFrame {
                    code: WsCloseCode::from(code.0),
                    reason: reason.into(),
                };
                (WsMessage::Close(Some(frame)), true)
            }
        };

        match timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("WebSocket write failed: {}", e);
                let _ = events.send(ConnectionEvent::Eof);
                return;
            }
            Err(_) => {
                warn!("WebSocket write timeout");
                let _ = events.send(ConnectionEvent::Eof);
                return;
            }
        }

        if last {
            break;
        }
    }

    let _ = sink.close().await;
}

/// Hands an event to the driver. Returns whether reading should go on.
fn forward(events: &UnboundedSender<ConnectionEvent>, event: ConnectionEvent) -> bool {
    let more = matches!(event, ConnectionEvent::Payload(..));
    events.send(event).is_ok() && more
}
