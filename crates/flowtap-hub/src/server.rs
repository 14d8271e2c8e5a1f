use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::agent::{self, AgentLink};
use crate::config::Config;
use crate::identity::{self, LocalEndpoint, PeerEndpoint};
use crate::poll;
use crate::registry::{Observer, ObserverRegistry};

pub const OBSERVER_QUEUE_CAPACITY: usize = 64;

pub struct HubState {
    pub config: Config,
    pub local: LocalEndpoint,
    pub agent: AgentLink,
    pub registry: Arc<ObserverRegistry>,
    conn_counter: AtomicU64,
}

impl HubState {
    pub fn new(
        config: Config,
        local: LocalEndpoint,
        agent: AgentLink,
        registry: Arc<ObserverRegistry>,
    ) -> Self {
        Self {
            config,
            local,
            agent,
            registry,
            conn_counter: AtomicU64::new(0),
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }
}

/// A bound but not yet serving hub. Splitting bind from serve lets callers
/// learn the ephemeral port before any traffic starts.
pub struct HubServer {
    state: Arc<HubState>,
    listener: TcpListener,
}

impl HubServer {
    /// Binds the listener, fixes the local endpoint used in connection
    /// keys, and connects to the tracing agent. An unreachable agent
    /// socket is a startup failure.
    pub async fn bind(config: Config) -> io::Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        let local = resolve_local_endpoint(&config, &listener)?;
        let (agent, agent_reader) = AgentLink::connect(&config.trace_socket).await?;
        let registry = Arc::new(ObserverRegistry::new());
        tokio::spawn(agent::run_reader(agent_reader, registry.clone()));
        let state = Arc::new(HubState::new(config, local, agent, registry));
        Ok(Self { state, listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let app = Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(|| async { "ok" }))
            .with_state(self.state.clone());

        info!(
            event = "hub_start",
            addr = %self.listener.local_addr()?,
            local_endpoint = %self.state.local,
            trace_socket = %self.state.config.trace_socket.display(),
            poll_interval_ms = self.state.config.poll_interval.as_millis() as u64
        );

        let wait = async move {
            let _ = shutdown.changed().await;
        };
        axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(wait)
        .await?;

        info!(event = "hub_stop");
        Ok(())
    }
}

fn resolve_local_endpoint(config: &Config, listener: &TcpListener) -> io::Result<LocalEndpoint> {
    if config.local_addr.trim().is_empty() {
        return Ok(LocalEndpoint::from_socket(listener.local_addr()?));
    }
    let addr: SocketAddr = config.local_addr.parse().map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid local addr '{}': {err}", config.local_addr),
        )
    })?;
    Ok(LocalEndpoint::from_socket(addr))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<Arc<HubState>>,
) -> impl IntoResponse {
    let peer = identity::resolve_peer(remote, &headers);
    ws.on_upgrade(move |socket| handle_socket(state, socket, peer))
}

/// Per-observer connection loop. The first inbound frame claims the
/// observer's connection key and starts its poll loop; everything after
/// that is ignored until the observer goes away, at which point the claim
/// is released if this handle still holds it.
async fn handle_socket(state: Arc<HubState>, socket: WebSocket, peer: PeerEndpoint) {
    let conn_id = state.next_conn_id();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OBSERVER_QUEUE_CAPACITY);
    let write_timeout = state.config.write_timeout;
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let send = ws_sender.send(msg);
            match tokio::time::timeout(write_timeout, send).await {
                Ok(Ok(())) => {}
                // Stop draining so pending senders observe a closed queue.
                Ok(Err(_)) | Err(_) => return,
            }
        }
    });

    info!(event = "observer_connected", conn_id = %conn_id, peer = %peer);

    let mut claimed: Option<Arc<Observer>> = None;
    while let Some(inbound) = ws_receiver.next().await {
        let msg = match inbound {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "observer_read_error", conn_id = %conn_id, error = %err);
                break;
            }
        };
        match msg {
            Message::Text(_) | Message::Binary(_) => {
                if claimed.is_some() {
                    continue;
                }
                let key = identity::derive_key(&state.local, &peer);
                let observer = Arc::new(Observer::new(conn_id.clone(), key.clone(), tx.clone()));
                if state.registry.register(&key, observer.clone()).await {
                    poll::spawn_poll_loop(state.clone(), key);
                    claimed = Some(observer);
                } else {
                    debug!(event = "observer_key_held", conn_id = %conn_id, key = %key);
                }
            }
            Message::Close(_) => {
                info!(event = "observer_close", conn_id = %conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    if let Some(observer) = claimed {
        state.registry.release(&observer, "disconnect").await;
    }
    drop(tx);
    let _ = write_task.await;
}
