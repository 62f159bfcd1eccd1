//! Per-client protocol state machine.
//!
//! A session reads one command at a time from the control channel and fully
//! consumes it, payload included, before reading the next. Rejections such as
//! a taken handle or a missing file are ordinary replies. Only transport and
//! framing failures end the session, and they end it through the same cleanup
//! as an explicit `DISCONNECT`.

use std::{net::SocketAddr, sync::Arc};

use chrono::Local;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    codec::{self, FrameError},
    protocol::{Command, Reply, notice},
    registry::{Delivered, Outbox, RegisterError, UnicastError},
    server::ServerState,
    store::{FileStore, render_listing},
};

/// Name used in upload notices for clients that never registered.
const UNREGISTERED: &str = "(unregistered)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Registered(String),
    Closed,
}

enum Flow {
    Continue,
    Close,
}

pub struct Session<R, W> {
    peer: Option<SocketAddr>,
    reader: R,
    writer: W,
    outbox: Outbox,
    state: Arc<ServerState>,
    lifecycle: SessionState,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, outbox: Outbox, state: Arc<ServerState>) -> Self {
        Self {
            peer: None,
            reader,
            writer,
            outbox,
            state,
            lifecycle: SessionState::Connected,
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn lifecycle(&self) -> &SessionState {
        &self.lifecycle
    }

    /// Serves commands until the client disconnects, then releases its alias
    /// and closes the control channel.
    ///
    /// An error means the stream became unusable; cleanup has still run.
    pub async fn run(mut self) -> Result<(), FrameError> {
        let result = self.serve().await;
        self.close().await;
        result
    }

    async fn serve(&mut self) -> Result<(), FrameError> {
        loop {
            let command = match Command::read_from(&mut self.reader).await {
                Ok(command) => command,
                Err(FrameError::Closed) => {
                    debug!(peer = ?self.peer, "control channel closed");
                    return Ok(());
                }
                Err(err) if err.is_disconnect() => {
                    warn!(peer = ?self.peer, error = %err, "control channel dropped mid-command");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

            debug!(peer = ?self.peer, command = command.name(), "dispatching");
            if let Flow::Close = self.dispatch(command).await? {
                return Ok(());
            }
        }
    }

    async fn dispatch(&mut self, command: Command) -> Result<Flow, FrameError> {
        match command {
            Command::Register { handle } => self.handle_register(handle).await,
            Command::Dir => self.handle_dir().await,
            Command::Store { filename, length } => self.handle_store(filename, length).await,
            Command::Get { filename } => self.handle_get(filename).await,
            Command::Message {
                receiver,
                sender,
                text,
            } => self.handle_message(receiver, sender, text).await,
            Command::Broadcast { sender, text } => self.handle_broadcast(sender, text).await,
            Command::Disconnect => Ok(Flow::Close),
            Command::Unknown { name } => {
                warn!(peer = ?self.peer, %name, "ignoring unknown command");
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_register(&mut self, handle: String) -> Result<Flow, FrameError> {
        if let SessionState::Registered(alias) = &self.lifecycle {
            debug!(%alias, requested = %handle, "client already registered");
            Reply::AlreadyRegistered.write_to(&mut self.writer).await?;
            return Ok(Flow::Continue);
        }

        let reply = match self.state.registry.register(&handle, self.outbox.clone()).await {
            Ok(()) => {
                info!(peer = ?self.peer, alias = %handle, "alias registered");
                self.lifecycle = SessionState::Registered(handle);
                Reply::RegistrationDone
            }
            Err(RegisterError::AlreadyExists) => {
                debug!(alias = %handle, "alias already taken");
                Reply::HandleExists
            }
        };
        reply.write_to(&mut self.writer).await?;
        Ok(Flow::Continue)
    }

    async fn handle_dir(&mut self) -> Result<Flow, FrameError> {
        let files = match self.state.store.list().await {
            Ok(files) => files,
            Err(err) => {
                warn!(error = %err, root = %self.state.store.root().display(), "failed to list files");
                Vec::new()
            }
        };
        codec::write_string(&mut self.writer, &render_listing(&files)).await?;
        Ok(Flow::Continue)
    }

    async fn handle_store(&mut self, filename: String, length: u64) -> Result<Flow, FrameError> {
        let store = &self.state.store;
        let mut file = match store.open_for_write(&filename).await {
            Ok(file) => file,
            Err(err) => {
                codec::discard_bytes(&mut self.reader, length).await?;
                warn!(peer = ?self.peer, %filename, error = %err, "upload could not be opened");
                return Ok(Flow::Continue);
            }
        };

        let received = codec::receive_bytes(&mut self.reader, &mut file, length).await;
        drop(file);
        let saved = match received {
            Ok(saved) => saved,
            Err(err) => {
                remove_partial(store, &filename).await;
                return Err(err);
            }
        };
        if let Err(err) = saved {
            warn!(peer = ?self.peer, %filename, error = %err, "upload could not be saved");
            remove_partial(store, &filename).await;
            return Ok(Flow::Continue);
        }

        let uploader = self.alias().unwrap_or(UNREGISTERED);
        info!(alias = uploader, %filename, bytes = length, "file stored");
        let announcement = notice::uploaded(uploader, Local::now(), &filename);
        self.state.registry.broadcast(None, &announcement).await;
        Ok(Flow::Continue)
    }

    async fn handle_get(&mut self, filename: String) -> Result<Flow, FrameError> {
        let (mut file, len) = match self.state.store.open_for_read(&filename).await {
            Ok(opened) => opened,
            Err(err) => {
                debug!(%filename, error = %err, "requested file unavailable");
                Reply::FileNotInServer.write_to(&mut self.writer).await?;
                return Ok(Flow::Continue);
            }
        };

        Reply::FileExists.write_to(&mut self.writer).await?;
        codec::write_length(&mut self.writer, len).await?;
        codec::write_bytes(&mut self.writer, &mut file, len).await?;
        debug!(%filename, bytes = len, "file sent");
        Ok(Flow::Continue)
    }

    async fn handle_message(
        &mut self,
        receiver: String,
        sender: String,
        text: String,
    ) -> Result<Flow, FrameError> {
        let status = match self.state.registry.unicast(&sender, &receiver, &text).await {
            Ok(Delivered) => notice::MESSAGE_SENT,
            Err(UnicastError::SelfMessage) => notice::SELF_MESSAGE,
            Err(UnicastError::UnknownAlias) => notice::UNKNOWN_ALIAS,
        };
        if !self.outbox.deliver(status) {
            debug!(peer = ?self.peer, "message channel closed; status dropped");
        }
        Ok(Flow::Continue)
    }

    async fn handle_broadcast(&mut self, sender: String, text: String) -> Result<Flow, FrameError> {
        let delivered = self
            .state
            .registry
            .broadcast(None, &notice::broadcast(&sender, &text))
            .await;
        debug!(%sender, delivered, "broadcast sent");
        Ok(Flow::Continue)
    }

    async fn close(&mut self) {
        let previous = std::mem::replace(&mut self.lifecycle, SessionState::Closed);
        if let SessionState::Registered(alias) = previous {
            self.state.registry.unregister(&alias).await;
            info!(peer = ?self.peer, %alias, "alias released");
        }
        if let Err(err) = self.writer.shutdown().await {
            debug!(error = %err, "control channel shutdown failed");
        }
    }

    fn alias(&self) -> Option<&str> {
        match &self.lifecycle {
            SessionState::Registered(alias) => Some(alias),
            SessionState::Connected | SessionState::Closed => None,
        }
    }
}

async fn remove_partial(store: &FileStore, filename: &str) {
    if let Err(err) = store.remove(filename).await {
        debug!(error = %err, %filename, "could not remove partial upload");
    }
}

/// Runs one client over its accepted control and message connections.
///
/// The message channel is written only by [`pump_messages`], which runs on
/// this same task and stops once the session and the registry have both let
/// go of the client's outbox.
pub async fn serve_connection(
    control: TcpStream,
    message: TcpStream,
    state: Arc<ServerState>,
) -> Result<(), FrameError> {
    let peer = control.peer_addr().ok();
    let (reader, writer) = control.into_split();
    let (outbox, inbox) = Outbox::channel();

    let mut session = Session::new(reader, writer, outbox, state);
    if let Some(peer) = peer {
        session = session.with_peer(peer);
    }

    let (result, ()) = tokio::join!(session.run(), pump_messages(inbox, message));
    info!(?peer, "client disconnected");
    result
}

/// Writes every queued notice to the message channel, in order.
pub async fn pump_messages<W>(mut inbox: mpsc::UnboundedReceiver<String>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(text) = inbox.recv().await {
        match codec::write_string(&mut writer, &text).await {
            Ok(()) => {}
            Err(FrameError::TooLong(len)) => {
                warn!(len, "notice too long for a frame; dropped");
            }
            Err(err) => {
                debug!(error = %err, "message channel closed");
                break;
            }
        }
    }
    if let Err(err) = writer.shutdown().await {
        debug!(error = %err, "message channel shutdown failed");
    }
}
