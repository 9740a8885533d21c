//! TCP protocol between the gesture server and an action dispatcher.
//!
//! Every message is bincode, framed with a length prefix. The server pushes
//! gesture, pointer and presence events; the dispatcher may toggle pointer mode,
//! request a restart or ask for the current pointer position.

use anyhow::Result;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::service::ServiceController;
use crate::sink::{GestureEvent, HandPresence, PointerUpdate, SinkEvent};
use crate::tracker::PointerQuery;

// --- Message types ---

/// Dispatcher → server
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ClientMessage {
    SetPointerMode { active: bool },
    Restart,
    QueryPointer,
}

/// Server → dispatcher
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Gesture(GestureEvent),
    Pointer(PointerUpdate),
    Presence(HandPresence),
    Status { message: String },
    PointerPosition { position: Option<(f32, f32)> },
}

impl From<SinkEvent> for ServerMessage {
    fn from(event: SinkEvent) -> Self {
        match event {
            SinkEvent::Gesture(g) => Self::Gesture(g),
            SinkEvent::Pointer(p) => Self::Pointer(p),
            SinkEvent::Presence(h) => Self::Presence(h),
        }
    }
}

// --- Codec helpers ---

pub type MessageStream<T = TcpStream> = Framed<T, LengthDelimitedCodec>;

/// Create a framed message stream with length-delimited framing.
pub fn message_stream<T: AsyncRead + AsyncWrite>(stream: T) -> MessageStream<T> {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(64 * 1024)
        .new_codec();
    Framed::new(stream, codec)
}

/// Send a serializable message (bincode + length prefix).
pub async fn send_message<T, M>(stream: &mut MessageStream<T>, msg: &M) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: Serialize,
{
    let data = bincode::serialize(msg)?;
    stream.send(Bytes::from(data)).await?;
    Ok(())
}

/// Receive and deserialize a message. `Ok(None)` once the peer has closed.
pub async fn recv_message<T, M>(stream: &mut MessageStream<T>) -> Result<Option<M>>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: DeserializeOwned,
{
    match stream.next().await {
        Some(Ok(bytes)) => Ok(Some(bincode::deserialize(&bytes)?)),
        Some(Err(e)) => Err(e.into()),
        None => Ok(None),
    }
}

/// 1クライアント分の送受信。切断されたら戻る
pub async fn serve_client<T>(
    mut stream: MessageStream<T>,
    mut events: broadcast::Receiver<ServerMessage>,
    controller: ServiceController,
    pointer: PointerQuery,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(msg) => send_message(&mut stream, &msg).await?,
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "client too slow, events skipped"),
                Err(RecvError::Closed) => return Ok(()),
            },
            msg = recv_message::<_, ClientMessage>(&mut stream) => {
                let Some(msg) = msg? else {
                    debug!("client disconnected");
                    return Ok(());
                };
                match msg {
                    ClientMessage::SetPointerMode { active } => {
                        controller.set_pointer_mode(active);
                    }
                    ClientMessage::Restart => {
                        controller.restart();
                    }
                    ClientMessage::QueryPointer => {
                        let reply = ServerMessage::PointerPosition { position: pointer.get() };
                        send_message(&mut stream, &reply).await?;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gesture::GestureLabel;
    use crate::sink::PresenceStatus;

    #[tokio::test]
    async fn test_message_exchange() {
        let (a, b) = tokio::io::duplex(4096);
        let mut server = message_stream(a);
        let mut client = message_stream(b);

        let event = ServerMessage::Gesture(GestureEvent {
            label: GestureLabel::SwipeLeft,
            timestamp_us: 42,
        });
        send_message(&mut server, &event).await.unwrap();
        let got: Option<ServerMessage> = recv_message(&mut client).await.unwrap();
        assert_eq!(got, Some(event));

        send_message(&mut client, &ClientMessage::SetPointerMode { active: true })
            .await
            .unwrap();
        let got: Option<ClientMessage> = recv_message(&mut server).await.unwrap();
        assert_eq!(got, Some(ClientMessage::SetPointerMode { active: true }));
    }

    #[tokio::test]
    async fn test_closed_peer() {
        let (a, b) = tokio::io::duplex(4096);
        let mut server = message_stream(a);
        drop(b);
        let got: Option<ClientMessage> = recv_message(&mut server).await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_serve_client() {
        use crate::camera::CameraDevice;
        use crate::config::Config;
        use crate::pose::InferenceEngine;
        use crate::service::GestureService;
        use crate::sink::ChannelSink;

        let (sink, _rx) = ChannelSink::new();
        let service = GestureService::new(
            Config::default(),
            Box::new(|| -> Result<Box<dyn CameraDevice>> { anyhow::bail!("unused") }),
            Box::new(|| -> Result<Box<dyn InferenceEngine>> { anyhow::bail!("unused") }),
            sink,
        );
        let (events_tx, events_rx) = broadcast::channel(16);
        let (a, b) = tokio::io::duplex(4096);
        let task = tokio::spawn(serve_client(
            message_stream(a),
            events_rx,
            service.controller(),
            service.pointer_query(),
        ));
        let mut client = message_stream(b);

        send_message(&mut client, &ClientMessage::QueryPointer).await.unwrap();
        let reply: Option<ServerMessage> = recv_message(&mut client).await.unwrap();
        assert_eq!(reply, Some(ServerMessage::PointerPosition { position: None }));

        let status = ServerMessage::Status {
            message: "Gesture Detection Active".into(),
        };
        events_tx.send(status.clone()).unwrap();
        let got: Option<ServerMessage> = recv_message(&mut client).await.unwrap();
        assert_eq!(got, Some(status));

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_sink_event_conversion() {
        let msg = ServerMessage::from(SinkEvent::Presence(HandPresence::no_hands()));
        match msg {
            ServerMessage::Presence(p) => assert_eq!(p.status, PresenceStatus::NoHands),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            ServerMessage::from(SinkEvent::Pointer(PointerUpdate::HIDE)),
            ServerMessage::Pointer(PointerUpdate::HIDE)
        );
    }
}
