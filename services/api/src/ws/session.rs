//! Manages the WebSocket connection lifecycle for one assistant session.

use super::protocol::{ClientMessage, ServerMessage};
use crate::state::AppState;
use anyhow::Result;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use parley_core::assistant::{AssistantSession, TurnEvent, UserInput};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{Instrument, debug, error, info, instrument, warn};
use uuid::Uuid;

type SocketSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Capacity of the per-turn event channel between the pipeline and the socket.
const TURN_EVENT_BUFFER: usize = 64;

/// Inputs that may wait behind the turn being answered.
const PENDING_TURNS: usize = 8;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

impl ClientMessage {
    /// The assistant input carried by this message, if any.
    fn into_input(self) -> Option<UserInput> {
        match self {
            ClientMessage::AudioData { data } => Some(UserInput::Audio(data)),
            ClientMessage::TextData { text } => Some(UserInput::Text(text)),
            ClientMessage::ImageData { image, description } => {
                Some(UserInput::Image { image, description })
            }
            ClientMessage::StopSpeaking => None,
        }
    }
}

/// What the session loop does with one incoming frame.
#[derive(Debug, PartialEq)]
enum Frame {
    Turn(UserInput),
    Stop,
    /// Answer the client directly without starting a turn.
    Reply(ServerMessage),
    Close,
    Ignore,
}

impl Frame {
    fn decode(message: Message) -> Self {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::StopSpeaking) => Frame::Stop,
                Ok(msg) => msg.into_input().map_or(Frame::Ignore, Frame::Turn),
                Err(e) => {
                    warn!(error = %e, "Rejecting malformed client message.");
                    Frame::Reply(ServerMessage::Error {
                        message: format!("invalid message: {e}"),
                    })
                }
            },
            Message::Binary(data) => Frame::Turn(UserInput::Audio(STANDARD.encode(&data))),
            Message::Close(_) => Frame::Close,
            Message::Ping(_) | Message::Pong(_) => Frame::Ignore,
        }
    }
}

/// Main handler for an individual WebSocket connection.
///
/// Each socket gets its own [`AssistantSession`], owned by a single turn
/// runner that drains a queue of inputs, so turns run one at a time in
/// arrival order while the socket keeps reading. `stop_speaking` goes
/// straight to the speaking flag.
#[instrument(name = "ws_session", skip_all, fields(session_id = %Uuid::new_v4()))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("New WebSocket connection.");

    let (socket_tx, mut socket_rx) = socket.split();
    let socket_tx: SocketSink = Arc::new(Mutex::new(socket_tx));

    let mut session = AssistantSession::new(
        state.classifier.clone(),
        state.router.clone(),
        state.config.history_pairs,
    );
    let speaking = session.speaking_flag();
    let (turn_tx, mut turn_rx) = mpsc::channel::<UserInput>(PENDING_TURNS);
    let runner = {
        let socket_tx = socket_tx.clone();
        tokio::spawn(
            async move {
                while let Some(input) = turn_rx.recv().await {
                    run_turn(&mut session, &socket_tx, input).await;
                }
            }
            .in_current_span(),
        )
    };

    while let Some(msg_result) = socket_rx.next().await {
        let ws_msg = match msg_result {
            Ok(ws_msg) => ws_msg,
            Err(e) => {
                error!("Error receiving from client WebSocket: {:?}", e);
                break;
            }
        };
        match Frame::decode(ws_msg) {
            Frame::Turn(input) => {
                if let Err(e) = turn_tx.try_send(input) {
                    warn!(error = %e, "Turn queue full; dropping input.");
                    let reply = ServerMessage::Error {
                        message: "too many pending requests".to_string(),
                    };
                    if send_msg(&mut *socket_tx.lock().await, reply).await.is_err() {
                        break;
                    }
                }
            }
            Frame::Stop => {
                info!("Received stop speaking request");
                speaking.stop();
            }
            Frame::Reply(reply) => {
                if send_msg(&mut *socket_tx.lock().await, reply).await.is_err() {
                    break;
                }
            }
            Frame::Close => {
                info!("Client sent close frame. Shutting down session.");
                break;
            }
            Frame::Ignore => {}
        }
    }

    speaking.stop();
    drop(turn_tx);
    runner.abort();
    if let Err(e) = runner.await {
        if e.is_panic() {
            error!(error = ?e, "Turn runner panicked.");
        }
    }
    info!("WebSocket connection closed and assistant session terminated.");
}

/// Runs one turn and forwards its events to the client as they arrive.
async fn run_turn(session: &mut AssistantSession, socket_tx: &SocketSink, input: UserInput) {
    let input_type = input.kind();
    let (events_tx, mut events_rx) = mpsc::channel::<TurnEvent>(TURN_EVENT_BUFFER);

    let process = async move {
        let outcome = session.process_turn(input, &events_tx).await;
        drop(events_tx);
        outcome
    };
    let forward = async {
        while let Some(event) = events_rx.recv().await {
            let message = ServerMessage::from_turn_event(event, input_type, Utc::now());
            if let Err(e) = send_msg(&mut *socket_tx.lock().await, message).await {
                warn!(error = ?e, "Client went away mid-turn.");
                break;
            }
        }
    };

    let (outcome, ()) = tokio::join!(process, forward);
    debug!(?outcome, "Turn finished.");
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_map_to_inputs() {
        assert_eq!(
            ClientMessage::TextData {
                text: "你好".to_string()
            }
            .into_input(),
            Some(UserInput::Text("你好".to_string()))
        );
        assert_eq!(
            ClientMessage::ImageData {
                image: "aGVsbG8=".to_string(),
                description: "请假".to_string()
            }
            .into_input(),
            Some(UserInput::Image {
                image: "aGVsbG8=".to_string(),
                description: "请假".to_string()
            })
        );
        assert_eq!(ClientMessage::StopSpeaking.into_input(), None);
    }

    #[test]
    fn malformed_text_frame_is_answered_with_error() {
        let frame = Frame::decode(Message::Text(r#"{"type":"init","topic":"rust"}"#.into()));

        match frame {
            Frame::Reply(ServerMessage::Error { message }) => {
                assert!(message.starts_with("invalid message:"), "{message}");
            }
            other => panic!("expected an error reply, got {other:?}"),
        }
        assert!(matches!(
            Frame::decode(Message::Text("not json".into())),
            Frame::Reply(ServerMessage::Error { .. })
        ));
    }

    #[test]
    fn frames_decode_to_session_actions() {
        assert_eq!(
            Frame::decode(Message::Text(r#"{"type":"text_data","text":"北京今天天气"}"#.into())),
            Frame::Turn(UserInput::Text("北京今天天气".to_string()))
        );
        assert_eq!(
            Frame::decode(Message::Text(r#"{"type":"stop_speaking"}"#.into())),
            Frame::Stop
        );
        assert_eq!(
            Frame::decode(Message::Binary(axum::body::Bytes::from_static(b"RIFF"))),
            Frame::Turn(UserInput::Audio("UklGRg==".to_string()))
        );
        assert_eq!(Frame::decode(Message::Close(None)), Frame::Close);
        assert_eq!(
            Frame::decode(Message::Ping(axum::body::Bytes::new())),
            Frame::Ignore
        );
    }
}
