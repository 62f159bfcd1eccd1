use std::{future::Future, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{info, warn};

use crate::{protocol::notice, registry::AliasRegistry, session, store::FileStore};

/// Port of the message endpoint in the reference deployment.
pub const DEFAULT_MESSAGE_PORT: u16 = 5555;

/// State shared by every session on one server.
#[derive(Debug)]
pub struct ServerState {
    pub registry: AliasRegistry,
    pub store: FileStore,
}

impl ServerState {
    pub fn new(store: FileStore) -> Self {
        Self {
            registry: AliasRegistry::new(),
            store,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub message_port: u16,
    pub files_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            message_port: DEFAULT_MESSAGE_PORT,
            files_dir: PathBuf::from("server_files"),
        }
    }
}

/// Decides where a client's session runs.
///
/// The default spawns one Tokio task per client with no upper bound; a pool
/// with admission control can be dropped in without touching the protocol.
pub trait SessionSpawner: Send + Sync + 'static {
    fn spawn(&self, session: BoxFuture<'static, ()>);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

impl SessionSpawner for TokioSpawner {
    fn spawn(&self, session: BoxFuture<'static, ()>) {
        tokio::spawn(session);
    }
}

pub struct Server<S = TokioSpawner> {
    control: TcpListener,
    message: TcpListener,
    state: Arc<ServerState>,
    spawner: S,
}

impl Server {
    pub fn new(control: TcpListener, message: TcpListener, store: FileStore) -> Self {
        Self {
            control,
            message,
            state: Arc::new(ServerState::new(store)),
            spawner: TokioSpawner,
        }
    }

    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let control = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .with_context(|| format!("failed to bind control endpoint {}:{}", config.host, config.port))?;
        let message = TcpListener::bind((config.host.as_str(), config.message_port))
            .await
            .with_context(|| {
                format!("failed to bind message endpoint {}:{}", config.host, config.message_port)
            })?;
        Ok(Self::new(control, message, FileStore::new(&config.files_dir)))
    }
}

impl<S: SessionSpawner> Server<S> {
    pub fn with_spawner<T: SessionSpawner>(self, spawner: T) -> Server<T> {
        Server {
            control: self.control,
            message: self.message,
            state: self.state,
            spawner,
        }
    }

    pub fn control_addr(&self) -> std::io::Result<SocketAddr> {
        self.control.local_addr()
    }

    pub fn message_addr(&self) -> std::io::Result<SocketAddr> {
        self.message.local_addr()
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            control,
            message,
            state,
            spawner,
        } = self;
        state.store.ensure_dir().await.with_context(|| {
            format!("failed to create file directory {}", state.store.root().display())
        })?;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state).await;
                    break;
                }
                accept_result = accept_pair(&control, &message) => {
                    handle_accept_result(accept_result, &state, &spawner);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

struct AcceptedPair {
    control: TcpStream,
    message: TcpStream,
    peer: SocketAddr,
}

/// Accepts one control connection and then one message connection.
///
/// The two are assumed to come from the same client purely because of the
/// order they were accepted in. A client that connects its message channel
/// late, or a stray connection to the message port, pairs the wrong sockets.
async fn accept_pair(control: &TcpListener, message: &TcpListener) -> std::io::Result<AcceptedPair> {
    let (control_stream, peer) = control.accept().await?;
    let (message_stream, _) = message.accept().await?;
    Ok(AcceptedPair {
        control: control_stream,
        message: message_stream,
        peer,
    })
}

async fn handle_shutdown(state: &ServerState) {
    info!("server shutting down");
    state.registry.broadcast(None, notice::SHUTTING_DOWN).await;
}

fn handle_accept_result<S: SessionSpawner>(
    result: std::io::Result<AcceptedPair>,
    state: &Arc<ServerState>,
    spawner: &S,
) {
    match result {
        Ok(pair) => spawn_session(pair, state, spawner),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session<S: SessionSpawner>(pair: AcceptedPair, state: &Arc<ServerState>, spawner: &S) {
    let state = Arc::clone(state);
    let AcceptedPair {
        control,
        message,
        peer,
    } = pair;
    info!(%peer, "client connected");
    spawner.spawn(Box::pin(async move {
        if let Err(err) = session::serve_connection(control, message, state).await {
            warn!(%peer, error = %err, "client connection closed with error");
        }
    }));
}
