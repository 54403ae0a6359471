// Websocket client for the messaging server's live feed.
//
// A supervisor task owns the socket. It connects, announces the local user,
// then pumps server events into the `LiveFeed` and client events out of an
// mpsc queue until the session ends, reconnecting with capped exponential
// backoff. `WsTransport` is the cheap, cloneable handle the reconciler uses.
// A chat message counts as sent only once its frame is written to the socket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, Stream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::TransportError;
use crate::live::LiveFeed;
use crate::message::MessageId;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::transport::Transport;

/// Capacity of the outgoing event queue.
const OUTGOING_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts before the supervisor gives up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based): doubles each time,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct WsSettings {
    pub url: String,
    pub access_token: Option<String>,
    pub name: String,
    pub email: String,
    pub role: String,
    pub reconnect: ReconnectPolicy,
}

impl WsSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: config.server.ws_url.clone(),
            access_token: config.credentials.access_token.clone(),
            name: config.user.name.clone(),
            email: config.user.email.clone(),
            role: config.user.role.clone(),
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(config.reconnect.initial_delay_ms),
                max_delay: Duration::from_millis(config.reconnect.max_delay_ms),
                max_attempts: config.reconnect.max_attempts,
            },
        }
    }

    fn announce(&self) -> ClientEvent {
        ClientEvent::UserOnline {
            name: self.name.clone(),
            email: self.email.clone(),
            role: self.role.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport handle
// ---------------------------------------------------------------------------

/// A queued client event. `written` fires once the frame is on the socket;
/// dropping it unfired means the event was discarded.
#[derive(Debug)]
pub struct Outgoing {
    pub event: ClientEvent,
    written: Option<oneshot::Sender<()>>,
}

impl Outgoing {
    fn new(event: ClientEvent) -> Self {
        Self {
            event,
            written: None,
        }
    }

    fn acked(event: ClientEvent) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                event,
                written: Some(tx),
            },
            rx,
        )
    }

    fn confirm(self) {
        if let Some(tx) = self.written {
            let _ = tx.send(());
        }
    }
}

/// Handle to the websocket supervisor. Connection state is read from the
/// live feed, which the supervisor keeps current.
#[derive(Debug, Clone)]
pub struct WsTransport {
    feed: Arc<LiveFeed>,
    outgoing: mpsc::Sender<Outgoing>,
}

impl WsTransport {
    /// Start the supervisor task. Dropping every clone of the returned
    /// transport shuts the session down cleanly.
    pub fn spawn(settings: WsSettings, feed: Arc<LiveFeed>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(OUTGOING_CAPACITY);
        let handle = tokio::spawn(supervise(settings, Arc::clone(&feed), rx));
        (Self { feed, outgoing: tx }, handle)
    }

    async fn emit(&self, event: ClientEvent) -> Result<(), TransportError> {
        self.enqueue(Outgoing::new(event)).await
    }

    async fn enqueue(&self, outgoing: Outgoing) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.outgoing
            .send(outgoing)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn is_connected(&self) -> bool {
        self.feed.snapshot().connected
    }

    async fn send(&self, recipient_id: &str, content: &str) -> Result<bool, TransportError> {
        if !self.is_connected() {
            return Ok(false);
        }
        let (outgoing, written) = Outgoing::acked(ClientEvent::SendMessage {
            recipient_id: recipient_id.to_string(),
            content: content.to_string(),
        });
        self.enqueue(outgoing).await?;
        match written.await {
            Ok(()) => Ok(true),
            Err(_) => {
                warn!("Message to {} was discarded before reaching the server", recipient_id);
                Ok(false)
            }
        }
    }

    async fn mark_read(&self, message_id: &MessageId) -> Result<(), TransportError> {
        self.emit(ClientEvent::MarkMessageRead {
            message_id: message_id.to_string(),
        })
        .await
    }

    async fn emit_typing(&self, recipient_id: &str) -> Result<(), TransportError> {
        self.emit(ClientEvent::UserTyping {
            recipient_id: recipient_id.to_string(),
        })
        .await
    }

    async fn emit_stop_typing(&self, recipient_id: &str) -> Result<(), TransportError> {
        self.emit(ClientEvent::UserStopTyping {
            recipient_id: recipient_id.to_string(),
        })
        .await
    }

    async fn broadcast_edit(
        &self,
        recipient_id: &str,
        message_id: &MessageId,
        content: &str,
    ) -> Result<(), TransportError> {
        self.emit(ClientEvent::MessageEdited {
            recipient_id: recipient_id.to_string(),
            message_id: message_id.to_string(),
            content: content.to_string(),
        })
        .await
    }

    async fn broadcast_delete(
        &self,
        recipient_id: &str,
        message_id: &MessageId,
    ) -> Result<(), TransportError> {
        self.emit(ClientEvent::MessageDeleted {
            recipient_id: recipient_id.to_string(),
            message_id: message_id.to_string(),
        })
        .await
    }

    async fn broadcast_clear(&self, recipient_id: &str) -> Result<(), TransportError> {
        self.emit(ClientEvent::ConversationCleared {
            recipient_id: recipient_id.to_string(),
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Every transport handle was dropped.
    Shutdown,
    /// The server closed the socket or an I/O error occurred.
    Dropped,
}

async fn supervise(
    settings: WsSettings,
    feed: Arc<LiveFeed>,
    mut outgoing: mpsc::Receiver<Outgoing>,
) {
    let policy = &settings.reconnect;
    let announce = settings.announce();
    let mut attempt: u32 = 0;

    loop {
        match connect(&settings).await {
            Ok(ws) => {
                info!("Connected to {}", settings.url);
                attempt = 0;
                feed.set_connected(true);
                let end = run_session(ws, &announce, &feed, &mut outgoing).await;
                feed.set_connected(false);
                if end == SessionEnd::Shutdown {
                    info!("Websocket session shut down");
                    return;
                }
                warn!("Websocket session to {} dropped", settings.url);
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", settings.url, e);
                feed.record_error(e.to_string());
            }
        }

        attempt += 1;
        if attempt > policy.max_attempts {
            error!(
                "Giving up on {} after {} reconnection attempts",
                settings.url, policy.max_attempts
            );
            feed.record_error("unable to reach the messaging server");
            return;
        }

        let delay = policy.delay_for(attempt);
        info!("Reconnecting in {:?} (attempt {})", delay, attempt);
        if !wait_discarding(delay, &mut outgoing).await {
            info!("Websocket supervisor stopped while reconnecting");
            return;
        }
    }
}

/// Sleep for `delay`, dropping client events queued while offline. Returns
/// `false` if every sender went away.
async fn wait_discarding(delay: Duration, outgoing: &mut mpsc::Receiver<Outgoing>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            event = outgoing.recv() => match event {
                Some(queued) => debug!("Dropping {:?} queued while disconnected", queued.event),
                None => return false,
            },
        }
    }
}

async fn connect(
    settings: &WsSettings,
) -> Result<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, TransportError> {
    let mut request = settings.url.as_str().into_client_request()?;
    if let Some(token) = &settings.access_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    let (ws, response) = tokio_tungstenite::connect_async(request).await?;
    debug!("Websocket handshake completed with status {}", response.status());
    Ok(ws)
}

/// Drive one connected session until the socket drops or the outgoing
/// queue closes. The first frame sent is `announce`.
pub async fn run_session<S>(
    ws: WebSocketStream<S>,
    announce: &ClientEvent,
    feed: &LiveFeed,
    outgoing: &mut mpsc::Receiver<Outgoing>,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut write, read) = ws.split();

    if let Err(e) = send_event(&mut write, announce).await {
        warn!("Failed to announce presence: {}", e);
        return SessionEnd::Dropped;
    }

    let reader = process_message_stream(read, feed);
    tokio::pin!(reader);

    loop {
        tokio::select! {
            applied = &mut reader => {
                info!("Server ended the session after {} events", applied);
                return SessionEnd::Dropped;
            }
            queued = outgoing.recv() => match queued {
                Some(queued) => {
                    if let Err(e) = send_event(&mut write, &queued.event).await {
                        warn!("Failed to send {:?}: {}", queued.event, e);
                        return SessionEnd::Dropped;
                    }
                    queued.confirm();
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            },
        }
    }
}

async fn send_event<S>(
    write: &mut SplitSink<WebSocketStream<S>, Message>,
    event: &ClientEvent,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = serde_json::to_string(event)?;
    write.send(Message::Text(text.into())).await?;
    Ok(())
}

/// Apply every server event from `stream` to `feed` until a close frame,
/// an error, or end of stream. Returns the number of events applied.
///
/// Generic over the stream so it can be tested without a socket.
pub async fn process_message_stream<St>(mut stream: St, feed: &LiveFeed) -> usize
where
    St: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut applied = 0;
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(text.as_str()) {
                Ok(event) => {
                    feed.apply(event);
                    applied += 1;
                }
                Err(e) => warn!("Ignoring unrecognized server event: {}", e),
            },
            Ok(Message::Close(_)) => {
                info!("Server sent close frame");
                break;
            }
            Err(e) => {
                warn!("Websocket error: {}", e);
                break;
            }
            _ => {
                // Binary, Ping, Pong and raw frames carry no events.
            }
        }
    }
    applied
}
