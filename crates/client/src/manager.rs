//! Client reconnection manager
//!
//! [`LiveSyncClient`] owns exactly one logical connection to the broker. A
//! single driver task runs the connect / authenticate / read cycle; the public
//! handle talks to it over a command channel and observes its status through a
//! watch channel.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connecting -> ...
//!        ^______________________ disconnect() ______________________|
//! ```

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use livesync_shared::{ClientFrame, EventId, ServerFrame, ServerMessage, Topic};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::backoff::{Backoff, ReconnectPolicy};
use crate::credentials::{CredentialProvider, Credentials};
use crate::error::ClientError;

/// Broker close code for an expired access token
const CLOSE_TOKEN_EXPIRED: u16 = 4001;
/// Broker close code for a missing, invalid or mismatched token
const CLOSE_UNAUTHORIZED: u16 = 4003;

/// Event ids remembered per session for duplicate suppression
const SEEN_EVENT_CAPACITY: usize = 1024;

/// How long `disconnect` waits for the driver before aborting it
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a client-initiated close waits for the broker's answer
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketSink = SplitSink<Socket, Message>;

/// Callback receiving every decoded server message
pub type MessageCallback = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

/// Connection status, suitable for a live/offline indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// Not running; terminal after `disconnect`
    Disconnected,
    /// Opening a socket and waiting for `authenticated`
    Connecting,
    Connected,
    /// Waiting out the backoff delay
    Reconnecting,
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientStatus::Disconnected => "disconnected",
            ClientStatus::Connecting => "connecting",
            ClientStatus::Connected => "connected",
            ClientStatus::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
enum Command {
    Subscribe(Topic),
    Unsubscribe(Topic),
    Disconnect,
}

/// State shared between the handle and the driver task
struct Shared {
    callback: Mutex<Option<MessageCallback>>,
    subscriptions: Mutex<BTreeSet<Topic>>,
    status: watch::Sender<ClientStatus>,
}

impl Shared {
    fn set_status(&self, status: ClientStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            tracing::debug!(from = %previous, to = %status, "Live sync status changed");
        }
    }

    fn subscriptions(&self) -> Vec<Topic> {
        lock(&self.subscriptions).iter().cloned().collect()
    }

    fn dispatch(&self, message: &ServerMessage) {
        let Some(callback) = lock(&self.callback).clone() else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
            tracing::error!(message_type = message.type_name(), "Live sync message callback panicked");
        }
    }
}

struct Driver {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// Handle to a reconnecting live sync connection
pub struct LiveSyncClient {
    shared: Arc<Shared>,
    policy: ReconnectPolicy,
    driver: Option<Driver>,
}

impl Default for LiveSyncClient {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

impl LiveSyncClient {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let (status, _) = watch::channel(ClientStatus::Disconnected);
        Self {
            shared: Arc::new(Shared {
                callback: Mutex::new(None),
                subscriptions: Mutex::new(BTreeSet::new()),
                status,
            }),
            policy,
            driver: None,
        }
    }

    /// Register the message callback, replacing any previous one.
    ///
    /// Unknown server message types never reach it. A panic inside the
    /// callback is logged and the connection carries on.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        *lock(&self.shared.callback) = Some(Arc::new(callback));
    }

    /// Start the driver task for `url` (`ws://` or `wss://`).
    ///
    /// Must be called inside a tokio runtime. Returns immediately; progress is
    /// reported through [`LiveSyncClient::status_changes`].
    pub fn connect<P>(&mut self, url: &str, credentials: P) -> Result<(), ClientError>
    where
        P: CredentialProvider + 'static,
    {
        if self.driver.as_ref().is_some_and(|driver| !driver.task.is_finished()) {
            return Err(ClientError::AlreadyConnected);
        }

        let url = Url::parse(url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ClientError::UnsupportedScheme(url.scheme().to_string()));
        }

        let (commands, receiver) = mpsc::unbounded_channel();
        let task = DriverTask {
            url,
            credentials,
            read_timeout: self.policy.read_timeout,
            shared: self.shared.clone(),
            backoff: Backoff::new(self.policy.clone()),
            commands: receiver,
        };

        self.shared.set_status(ClientStatus::Connecting);
        self.driver = Some(Driver {
            commands,
            task: tokio::spawn(task.run()),
        });
        Ok(())
    }

    /// Close the connection and cancel any scheduled reconnect.
    pub async fn disconnect(&mut self) {
        let Some(mut driver) = self.driver.take() else {
            return;
        };

        let _ = driver.commands.send(Command::Disconnect);
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut driver.task).await.is_err() {
            tracing::warn!("Live sync driver did not stop in time, aborting");
            driver.task.abort();
        }
        self.shared.set_status(ClientStatus::Disconnected);
    }

    /// Add a topic to the subscription set.
    ///
    /// The set survives reconnects; every new session subscribes to all of it.
    /// Returns false if the topic was already subscribed.
    pub fn subscribe(&self, topic: Topic) -> bool {
        if !lock(&self.shared.subscriptions).insert(topic.clone()) {
            return false;
        }
        self.send(Command::Subscribe(topic));
        true
    }

    pub fn unsubscribe(&self, topic: &Topic) -> bool {
        if !lock(&self.shared.subscriptions).remove(topic) {
            return false;
        }
        self.send(Command::Unsubscribe(topic.clone()));
        true
    }

    pub fn subscriptions(&self) -> Vec<Topic> {
        self.shared.subscriptions()
    }

    pub fn status(&self) -> ClientStatus {
        *self.shared.status.borrow()
    }

    pub fn status_changes(&self) -> watch::Receiver<ClientStatus> {
        self.shared.status.subscribe()
    }

    fn send(&self, command: Command) {
        if let Some(driver) = &self.driver {
            // A stopped driver has nothing to tell; the set is re-sent on connect
            let _ = driver.commands.send(command);
        }
    }
}

impl Drop for LiveSyncClient {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.task.abort();
        }
    }
}

impl fmt::Debug for LiveSyncClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveSyncClient")
            .field("status", &self.status())
            .field("subscriptions", &self.subscriptions())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// `disconnect()` was called or the handle was dropped
    Shutdown,
    /// The broker refused the credentials
    Rejected(u16),
    /// Any other close, error or failed connect
    Dropped,
}

/// Bounded memory of event ids delivered in the current session
struct SeenEvents {
    order: VecDeque<EventId>,
    ids: HashSet<EventId>,
    capacity: usize,
}

impl SeenEvents {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record an id; false if it was already seen
    fn insert(&mut self, id: EventId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

struct DriverTask<P> {
    url: Url,
    credentials: P,
    read_timeout: Duration,
    shared: Arc<Shared>,
    backoff: Backoff,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl<P: CredentialProvider> DriverTask<P> {
    async fn run(mut self) {
        let mut refresh = false;

        loop {
            self.shared.set_status(ClientStatus::Connecting);

            let credentials = if refresh {
                self.credentials.refresh().await
            } else {
                self.credentials.current().await
            };

            let end = match credentials {
                Ok(credentials) => self.session(&credentials).await,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to obtain live sync credentials");
                    SessionEnd::Dropped
                }
            };

            refresh = match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Rejected(code) => {
                    tracing::warn!(close_code = code, "Live sync handshake rejected, refreshing credentials");
                    true
                }
                SessionEnd::Dropped => false,
            };

            let delay = self.backoff.next_delay();
            self.shared.set_status(ClientStatus::Reconnecting);
            tracing::info!(
                attempt = self.backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "Live sync reconnect scheduled"
            );

            if !self.wait(delay).await {
                break;
            }
        }

        self.shared.set_status(ClientStatus::Disconnected);
        tracing::info!("Live sync client stopped");
    }

    /// Sleep for the backoff delay; false if told to stop meanwhile
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Disconnect) | None => return false,
                    // The set itself lives in Shared and is re-sent on connect
                    Some(Command::Subscribe(_) | Command::Unsubscribe(_)) => {}
                },
            }
        }
    }

    /// One connect / authenticate / read cycle
    async fn session(&mut self, credentials: &Credentials) -> SessionEnd {
        let url = handshake_url(&self.url, credentials);

        let open = open_socket(&url);
        let deadline = tokio::time::sleep(self.read_timeout);
        tokio::pin!(open, deadline);
        let socket = loop {
            tokio::select! {
                result = &mut open => match result {
                    Ok(socket) => break socket,
                    Err(e) => {
                        tracing::warn!(error = %e, "Live sync connect failed");
                        return SessionEnd::Dropped;
                    }
                },
                _ = &mut deadline => {
                    tracing::warn!("Live sync connect timed out");
                    return SessionEnd::Dropped;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Disconnect) | None => return SessionEnd::Shutdown,
                    Some(Command::Subscribe(_) | Command::Unsubscribe(_)) => {}
                },
            }
        };

        let (mut sink, mut stream) = socket.split();
        let mut seen = SeenEvents::new(SEEN_EVENT_CAPACITY);
        let mut authenticated = false;

        // Any inbound frame, broker pings included, pushes the deadline back
        deadline.as_mut().reset(Instant::now() + self.read_timeout);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    tracing::warn!(
                        authenticated,
                        timeout_ms = self.read_timeout.as_millis() as u64,
                        "Live sync connection silent, reconnecting"
                    );
                    return SessionEnd::Dropped;
                }
                message = stream.next() => {
                    deadline.as_mut().reset(Instant::now() + self.read_timeout);
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            let frame = match ServerFrame::decode(text.as_str()) {
                                Ok(Some(frame)) => frame,
                                Ok(None) => {
                                    tracing::debug!("Ignoring unknown live sync message type");
                                    continue;
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "Ignoring malformed live sync frame");
                                    continue;
                                }
                            };

                            if let Some(event_id) = frame.event_id {
                                if !seen.insert(event_id) {
                                    tracing::debug!(event_id, "Dropping duplicate live sync event");
                                    continue;
                                }
                            }

                            if let ServerMessage::Authenticated { user_id } = &frame.message {
                                authenticated = true;
                                self.backoff.reset();
                                self.shared.set_status(ClientStatus::Connected);
                                tracing::info!(user_id = %user_id, "Live sync connected");

                                for topic in self.shared.subscriptions() {
                                    if send_frame(&mut sink, &ClientFrame::Subscribe { topic }).await.is_err() {
                                        return SessionEnd::Dropped;
                                    }
                                }
                            }

                            self.shared.dispatch(&frame.message);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.map(|frame| u16::from(frame.code));
                            tracing::info!(close_code = ?code, "Live sync connection closed by broker");
                            return match code {
                                Some(code @ (CLOSE_TOKEN_EXPIRED | CLOSE_UNAUTHORIZED)) => SessionEnd::Rejected(code),
                                _ => SessionEnd::Dropped,
                            };
                        }
                        // Pings are answered by tungstenite
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Live sync connection failed");
                            return SessionEnd::Dropped;
                        }
                        None => return SessionEnd::Dropped,
                    }
                }
                command = self.commands.recv() => {
                    let frame = match command {
                        Some(Command::Subscribe(topic)) => ClientFrame::Subscribe { topic },
                        Some(Command::Unsubscribe(topic)) => ClientFrame::Unsubscribe { topic },
                        Some(Command::Disconnect) | None => {
                            close_gracefully(&mut sink, &mut stream).await;
                            return SessionEnd::Shutdown;
                        }
                    };
                    // Before `authenticated` the set is sent in full once the session opens
                    if authenticated && send_frame(&mut sink, &frame).await.is_err() {
                        return SessionEnd::Dropped;
                    }
                }
            }
        }
    }
}

/// Broker URL with the handshake query parameters appended
fn handshake_url(base: &Url, credentials: &Credentials) -> Url {
    let mut url = base.clone();
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("token", &credentials.access_token);
        if let Some(user_id) = &credentials.user_id {
            query.append_pair("userId", user_id.as_str());
        }
    }
    url
}

async fn open_socket(url: &Url) -> Result<Socket, ClientError> {
    let (socket, _) = connect_async(url.as_str()).await?;
    Ok(socket)
}

async fn send_frame(sink: &mut SocketSink, frame: &ClientFrame) -> Result<(), ClientError> {
    let text = match frame.encode() {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode client frame");
            return Ok(());
        }
    };
    sink.send(Message::text(text)).await.map_err(|e| {
        tracing::warn!(error = %e, "Failed to send live sync frame");
        ClientError::from(e)
    })
}

async fn close_gracefully(sink: &mut SocketSink, stream: &mut futures::stream::SplitStream<Socket>) {
    if sink.send(Message::Close(None)).await.is_err() {
        return;
    }
    let _ = tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, async {
        while let Some(Ok(message)) = stream.next().await {
            if message.is_close() {
                break;
            }
        }
    })
    .await;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
