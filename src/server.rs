//! WebSocket collaboration server with per-project routing.
//!
//! Architecture:
//! ```text
//! tab A ──┐
//!          ├── /ws/projects/{id}/collaborate ── ConnectionManager
//! tab B ──┘                                          │
//!                                              PresenceStore ── MemoryBus
//!                                                    │              │
//! watcher ── /ws/projects/{id}/views/{v}/users/{u}/subscribe        │
//!                 │                                                 │
//!           SubscriptionManager ◄── PrefStore ◄─────────────────────┘
//! ```
//!
//! Two socket routes share one event bus:
//! - `collaborate` carries presence, chat and row updates for a project
//! - `subscribe` follows one user's filter/sort state, optionally scoped
//!   to a single view (`all` for every view)
//!
//! Identity arrives in the query string (`user_id`, `username`); an
//! [`AccessControl`] hook decides whether that user may enter the project.
//! Rejections close with 1008, a duplicate watch registration with 4000,
//! internal faults with 1011.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::bus::{MemoryBus, DEFAULT_BUS_CAPACITY};
use crate::connection::ConnectionManager;
use crate::error::CollabError;
use crate::handlers::MessageHandler;
use crate::prefs::PrefStore;
use crate::presence::PresenceStore;
use crate::protocol::ServerEvent;
use crate::rows::RowStore;
use crate::subscription::SubscriptionManager;
use crate::UserId;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Event bus buffer capacity per channel
    pub bus_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            bus_capacity: DEFAULT_BUS_CAPACITY,
        }
    }
}

/// A user's standing on a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectAccess {
    pub is_owner: bool,
}

/// Decides whether a user may open sockets on a project.
pub trait AccessControl: Send + Sync {
    /// Returns the user's access, or `AccessDenied`/`NotFound` to reject.
    fn project_access(&self, project_id: Uuid, user_id: UserId)
        -> Result<ProjectAccess, CollabError>;
}

/// Permits everyone; the default when no hook is installed.
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn project_access(
        &self,
        _project_id: Uuid,
        _user_id: UserId,
    ) -> Result<ProjectAccess, CollabError> {
        Ok(ProjectAccess { is_owner: false })
    }
}

/// Parsed socket route.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Collaborate {
        project_id: Uuid,
    },
    Subscribe {
        project_id: Uuid,
        /// `None` means every view ("all" in the path).
        view_id: Option<Uuid>,
        watched_id: UserId,
    },
}

/// Caller identity from the query string.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Identity {
    user_id: UserId,
    username: String,
}

/// Shared state behind every connection task.
struct CollabState {
    bus: Arc<MemoryBus>,
    presence: Arc<PresenceStore>,
    prefs: Arc<PrefStore>,
    rows: Arc<RowStore>,
    connections: Arc<ConnectionManager>,
    subscriptions: Arc<SubscriptionManager>,
    handler: MessageHandler,
    access: Arc<dyn AccessControl>,
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    state: Arc<CollabState>,
}

impl CollabServer {
    /// Create a server with the given configuration and access hook.
    pub fn new(config: ServerConfig, access: Arc<dyn AccessControl>) -> Self {
        let bus = Arc::new(MemoryBus::new(config.bus_capacity));
        let presence = Arc::new(PresenceStore::new(bus.clone()));
        let prefs = Arc::new(PrefStore::new(bus.clone()));
        let rows = Arc::new(RowStore::new(bus.clone()));
        let connections = Arc::new(ConnectionManager::new(bus.clone(), presence.clone()));
        let subscriptions = Arc::new(SubscriptionManager::new(bus.clone(), prefs.clone()));
        let handler = MessageHandler::new(bus.clone(), presence.clone(), prefs.clone());
        Self {
            config,
            state: Arc::new(CollabState {
                bus,
                presence,
                prefs,
                rows,
                connections,
                subscriptions,
                handler,
                access,
            }),
        }
    }

    /// Create with default configuration and no access restrictions.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default(), Arc::new(AllowAll))
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the accept loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("collaboration server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, state).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The shared event bus.
    pub fn bus(&self) -> &Arc<MemoryBus> {
        &self.state.bus
    }

    /// The presence store.
    pub fn presence(&self) -> &Arc<PresenceStore> {
        &self.state.presence
    }

    /// The preference store.
    pub fn prefs(&self) -> &Arc<PrefStore> {
        &self.state.prefs
    }

    /// The row store; the application layer mutates cells through this and
    /// connected clients see the resulting `row_update` events.
    pub fn rows(&self) -> &Arc<RowStore> {
        &self.state.rows
    }

    /// The connection manager.
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.state.connections
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<CollabState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Capture the request URI during the handshake; routing and identity
    // both live there.
    let mut uri = String::new();
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        uri = req.uri().to_string();
        Ok(resp)
    })
    .await?;
    log::info!("WebSocket connection established from {addr} for {uri}");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (route, identity) = match parse_uri(&uri) {
        Some(parsed) => parsed,
        None => {
            log::warn!("rejecting {addr}: unroutable request {uri}");
            return close(&mut ws_sender, CloseCode::Policy, "invalid route or identity").await;
        }
    };

    let project_id = match route {
        Route::Collaborate { project_id } | Route::Subscribe { project_id, .. } => project_id,
    };
    if let Err(err) = state.access.project_access(project_id, identity.user_id) {
        log::warn!(
            "rejecting user {} on project {project_id}: {err}",
            identity.user_id
        );
        return close(&mut ws_sender, CloseCode::Policy, &err.to_string()).await;
    }

    match route {
        Route::Collaborate { project_id } => {
            run_collaborate(&mut ws_sender, &mut ws_receiver, state, project_id, identity).await
        }
        Route::Subscribe { project_id, view_id, watched_id } => {
            run_subscribe(
                &mut ws_sender,
                &mut ws_receiver,
                state,
                project_id,
                view_id,
                identity,
                watched_id,
            )
            .await
        }
    }
}

type WsSender = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<TcpStream>,
    Message,
>;
type WsReceiver = futures_util::stream::SplitStream<tokio_tungstenite::WebSocketStream<TcpStream>>;

/// Main loop for a `collaborate` socket.
async fn run_collaborate(
    ws_sender: &mut WsSender,
    ws_receiver: &mut WsReceiver,
    state: Arc<CollabState>,
    project_id: Uuid,
    identity: Identity,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let user_id = identity.user_id;
    let (connection_id, mut out_rx) = match state
        .connections
        .connect(project_id, user_id, &identity.username)
        .await
    {
        Ok(established) => established,
        Err(err) if err.is_rejection() => {
            log::warn!("rejecting user {user_id} on project {project_id}: {err}");
            return close(ws_sender, CloseCode::Policy, &err.to_string()).await;
        }
        Err(err) => {
            log::error!("connect failed for user {user_id} on project {project_id}: {err}");
            return close(ws_sender, CloseCode::Error, "internal error").await;
        }
    };

    // The loop result is captured, never propagated with `?`: once connect
    // has succeeded, disconnect must run no matter how the socket dies, or
    // the heartbeat task keeps a vanished user present forever.
    let result = collaborate_loop(
        ws_sender,
        ws_receiver,
        &state,
        project_id,
        &identity,
        &mut out_rx,
    )
    .await;

    state.connections.disconnect(project_id, user_id, connection_id).await;

    if let Err(err) = result {
        log::warn!("collaborate loop for user {user_id} on {project_id} failed: {err}");
        // Best effort; the socket is usually already dead at this point.
        let _ = close(ws_sender, CloseCode::Error, "internal error").await;
    }
    Ok(())
}

/// Message loop of a `collaborate` socket; `Err` means a fault (write
/// failure, handler failure), `Ok` a clean client departure.
async fn collaborate_loop(
    ws_sender: &mut WsSender,
    ws_receiver: &mut WsReceiver,
    state: &CollabState,
    project_id: Uuid,
    identity: &Identity,
    out_rx: &mut mpsc::Receiver<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let user_id = identity.user_id;

    // Current presence snapshot first, so the client renders everyone who
    // is already here before deltas start flowing.
    let users = state.presence.list(project_id).await;
    let init = (ServerEvent::Init { users }).encode()?;
    ws_sender.send(Message::Text(init.into())).await?;

    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(8);
    loop {
        tokio::select! {
            // Incoming WebSocket message
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        state
                            .handler
                            .handle(project_id, user_id, &identity.username, text.as_str(), &reply_tx)
                            .await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("user {user_id} closed collaborate socket on {project_id}");
                        return Ok(());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error for user {user_id}: {e}");
                        return Ok(());
                    }
                    _ => {}
                }
            }

            // Direct replies (heartbeat acks) for this connection only
            Some(reply) = reply_rx.recv() => {
                ws_sender.send(Message::Text(reply.into())).await?;
            }

            // Fan-out from the project listener
            relayed = out_rx.recv() => {
                match relayed {
                    Some(payload) => ws_sender.send(Message::Text(payload.into())).await?,
                    None => return Ok(()),
                }
            }
        }
    }
}

/// Main loop for a `subscribe` (watch) socket.
async fn run_subscribe(
    ws_sender: &mut WsSender,
    ws_receiver: &mut WsReceiver,
    state: Arc<CollabState>,
    project_id: Uuid,
    view_id: Option<Uuid>,
    identity: Identity,
    watched_id: UserId,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let watcher_id = identity.user_id;
    let (tx, mut out_rx) = mpsc::channel::<String>(crate::connection::OUTBOUND_QUEUE);
    match state
        .subscriptions
        .subscribe(project_id, view_id, watcher_id, watched_id, tx)
        .await
    {
        Ok(()) => {}
        Err(CollabError::AlreadySubscribed) => {
            log::warn!("duplicate watch by user {watcher_id} on user {watched_id}");
            return close(ws_sender, CloseCode::from(4000), "already subscribed").await;
        }
        Err(err) => {
            log::error!("subscribe failed for user {watcher_id}: {err}");
            return close(ws_sender, CloseCode::Error, "internal error").await;
        }
    }

    // As with collaborate sockets, the loop result is captured so the
    // unsubscribe teardown runs on write faults too.
    let result = subscribe_loop(ws_sender, ws_receiver, watcher_id, &mut out_rx).await;

    state
        .subscriptions
        .unsubscribe(project_id, view_id, watcher_id, watched_id)
        .await;

    if let Err(err) = result {
        log::warn!("subscribe loop for watcher {watcher_id} failed: {err}");
        let _ = close(ws_sender, CloseCode::Error, "internal error").await;
    }
    Ok(())
}

/// Message loop of a `subscribe` socket; `Err` means a write fault.
async fn subscribe_loop(
    ws_sender: &mut WsSender,
    ws_receiver: &mut WsReceiver,
    watcher_id: UserId,
    out_rx: &mut mpsc::Receiver<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error for watcher {watcher_id}: {e}");
                        return Ok(());
                    }
                    // Watch sockets are read-only; inbound text is ignored.
                    _ => {}
                }
            }

            relayed = out_rx.recv() => {
                match relayed {
                    Some(payload) => ws_sender.send(Message::Text(payload.into())).await?,
                    None => return Ok(()),
                }
            }
        }
    }
}

/// Send a close frame and finish the handshake politely.
async fn close(
    ws_sender: &mut WsSender,
    code: CloseCode,
    reason: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    ws_sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_owned().into(),
        })))
        .await?;
    Ok(())
}

/// Parse the request URI into a route plus the caller's identity.
fn parse_uri(uri: &str) -> Option<(Route, Identity)> {
    let (path, query) = match uri.split_once('?') {
        Some((path, query)) => (path, query),
        None => (uri, ""),
    };
    let route = parse_route(path)?;
    let identity = parse_identity(query)?;
    Some((route, identity))
}

fn parse_route(path: &str) -> Option<Route> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match segments.as_slice() {
        ["ws", "projects", project, "collaborate"] => Some(Route::Collaborate {
            project_id: project.parse().ok()?,
        }),
        ["ws", "projects", project, "views", view, "users", watched, "subscribe"] => {
            let view_id = match *view {
                "all" => None,
                id => Some(id.parse().ok()?),
            };
            Some(Route::Subscribe {
                project_id: project.parse().ok()?,
                view_id,
                watched_id: watched.parse().ok()?,
            })
        }
        _ => None,
    }
}

fn parse_identity(query: &str) -> Option<Identity> {
    let params: HashMap<&str, &str> = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .collect();
    let user_id = params.get("user_id")?.parse().ok()?;
    let username = params.get("username")?;
    if username.is_empty() {
        return None;
    }
    Some(Identity {
        user_id,
        username: (*username).to_string(),
    })
}
