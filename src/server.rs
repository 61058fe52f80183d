//! Chat Server
//!
//! Accept loop, per-connection handshake and dispatch.
//!
//! A connection moves through `Authenticating -> Active -> Closed`. The
//! first frame must decrypt under the shared key to a nickname; anything
//! else closes the socket without creating a session. Once active, a read
//! task dispatches decrypted payloads and a writer task drains the
//! session's queue.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::config::ServerConfig;
use crate::crypto::cipher::{Cipher, CipherError, SharedKey, SEALED_OVERHEAD};
use crate::protocol::{self, notice, ClientMessage, FrameError, ServerMessage};
use crate::registry::Registry;
use crate::session::{self, Frame, Session, SessionId};

/// Upper bound on the handshake frame; a nickname never needs more
const HANDSHAKE_MAX_FRAME: usize = 4096;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Reasons a handshake is refused
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Timed out waiting for nickname")]
    Timeout,
    #[error("Peer closed during handshake")]
    Closed,
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("Nickname is not valid UTF-8")]
    NotUtf8,
    #[error("Empty nickname")]
    EmptyNickname,
}

/// Why an active session ended
#[derive(Debug)]
enum CloseReason {
    PeerClosed,
    IdleTimeout,
    Shutdown,
    Evicted,
    Read(FrameError),
    Decrypt(CipherError),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::Shutdown => write!(f, "server shutdown"),
            CloseReason::Evicted => write!(f, "send failed"),
            CloseReason::Read(e) => write!(f, "read error: {}", e),
            CloseReason::Decrypt(e) => write!(f, "bad frame: {}", e),
        }
    }
}

/// Stops a running [`ChatServer`]
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.send(true);
    }
}

/// Server state shared with every connection task
struct ServerState {
    registry: Arc<Registry>,
    cipher: Cipher,
    handshake_timeout: Duration,
    idle_timeout: Option<Duration>,
    max_frame_len: usize,
    outbound_queue_len: usize,
}

impl ServerState {
    fn seal(&self, message: &ServerMessage) -> Option<Frame> {
        match self.cipher.encrypt(message.to_wire().as_bytes()) {
            Ok(frame) => Some(Arc::new(frame)),
            Err(e) => {
                error!("Failed to encrypt outgoing message: {}", e);
                None
            }
        }
    }

    /// Frames a newcomer receives before any live traffic.
    ///
    /// The replay holds the newest history entries whose sealed frame fits
    /// in `max_frame_len`.
    fn greeting(&self, nickname: &str, history: &VecDeque<String>) -> Vec<Frame> {
        let mut messages = vec![ServerMessage::Text(notice::welcome(nickname))];
        if !history.is_empty() {
            let budget = self.max_frame_len.saturating_sub(SEALED_OVERHEAD);
            let replay = protocol::history_tail(history.iter(), budget);
            if replay.len() < history.len() {
                warn!(
                    "Replaying {} of {} history entries to {}, the rest exceed the frame limit",
                    replay.len(),
                    history.len(),
                    nickname
                );
            }
            if !replay.is_empty() {
                messages.push(ServerMessage::History(replay));
            }
        }
        messages.iter().filter_map(|m| self.seal(m)).collect()
    }

    /// Record and broadcast a message, announcing any session the fan-out
    /// found dead.
    fn announce(&self, message: ServerMessage, except: Option<SessionId>) {
        let mut pending = vec![(message, except)];
        while let Some((message, except)) = pending.pop() {
            let Some(frame) = self.seal(&message) else {
                continue;
            };
            if frame.len() > self.max_frame_len {
                warn!(
                    "Dropping {} byte message, over the {} byte frame limit",
                    frame.len(),
                    self.max_frame_len
                );
                continue;
            }
            let line = message.to_wire();
            debug!("Broadcasting {} bytes to {} sessions", line.len(), self.registry.len());
            for gone in self.registry.publish(line, frame, except) {
                info!("Session {} ({}) dropped after failed send", gone.id, gone.nickname);
                pending.push((ServerMessage::Text(notice::left(&gone.nickname)), None));
            }
        }
    }

    /// Deregister a session and tell the others. Safe to call repeatedly.
    fn close_session(&self, id: &SessionId) {
        if let Some(session) = self.registry.remove(id) {
            self.announce(ServerMessage::Text(notice::left(&session.nickname)), None);
        }
    }

    async fn authenticate(&self, reader: &mut OwnedReadHalf) -> Result<String, HandshakeError> {
        let max = HANDSHAKE_MAX_FRAME.min(self.max_frame_len);
        let frame = tokio::time::timeout(self.handshake_timeout, protocol::read_frame(reader, max))
            .await
            .map_err(|_| HandshakeError::Timeout)??
            .ok_or(HandshakeError::Closed)?;

        let plain = self.cipher.decrypt(&frame)?;
        let nickname = String::from_utf8(plain).map_err(|_| HandshakeError::NotUtf8)?;
        let nickname = nickname.trim();
        if nickname.is_empty() {
            return Err(HandshakeError::EmptyNickname);
        }
        Ok(nickname.to_string())
    }

    /// Active state: read, decrypt and dispatch until the session ends
    async fn read_loop(
        &self,
        reader: &mut OwnedReadHalf,
        id: SessionId,
        nickname: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> CloseReason {
        loop {
            let read = protocol::read_frame(reader, self.max_frame_len);
            let outcome = tokio::select! {
                _ = shutdown.changed() => return CloseReason::Shutdown,
                outcome = with_idle_timeout(self.idle_timeout, read) => outcome,
            };

            let frame = match outcome {
                None => return CloseReason::IdleTimeout,
                Some(Ok(Some(frame))) => frame,
                Some(Ok(None)) => return CloseReason::PeerClosed,
                Some(Err(e)) => return CloseReason::Read(e),
            };

            if !self.registry.contains(&id) {
                return CloseReason::Evicted;
            }

            let plain = match self.cipher.decrypt(&frame) {
                Ok(plain) => plain,
                Err(e) => return CloseReason::Decrypt(e),
            };

            match ClientMessage::from_bytes(&plain) {
                Ok(ClientMessage::Text(text)) => {
                    debug!("{}: {}", nickname, text);
                    self.announce(ServerMessage::Text(notice::chat_line(nickname, &text)), None);
                }
                Ok(ClientMessage::File(envelope)) => {
                    info!("{} shared file {} ({} bytes encoded)", nickname, envelope.name, envelope.data.len());
                    self.announce(ServerMessage::File(envelope), None);
                }
                Err(e) => {
                    warn!("Ignoring payload from {}: {}", nickname, e);
                }
            }
        }
    }
}

/// Await `fut`, giving up after `limit` when one is set
async fn with_idle_timeout<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// TCP chat server bound to one shared key
pub struct ChatServer {
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ChatServer {
    /// Bind the listener described by `config`
    pub async fn bind(config: &ServerConfig, key: SharedKey) -> io::Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let state = ServerState {
            registry: Arc::new(Registry::new(config.history_capacity)),
            cipher: Cipher::new(&key),
            handshake_timeout: config.handshake_timeout(),
            idle_timeout: config.idle_timeout(),
            max_frame_len: config.max_frame_len,
            outbound_queue_len: config.outbound_queue_len.max(1),
        };

        Ok(Self {
            listener,
            state: Arc::new(state),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.state.registry.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Accept connections until shut down
    pub async fn run(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!("Chat server listening on {}", addr),
            Err(e) => warn!("Chat server listening (address unknown: {})", e),
        }

        let mut shutdown = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let state = self.state.clone();
                        let shutdown = self.shutdown_rx.clone();
                        tokio::spawn(handle_connection(stream, peer_addr, state, shutdown));
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        let sessions = self.state.registry.drain();
        info!("Server stopped, closed {} sessions", sessions.len());
    }
}

/// Handle one accepted connection through its whole lifetime
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("New connection from {}", peer_addr);
    let (mut reader, writer) = stream.into_split();

    let nickname = match state.authenticate(&mut reader).await {
        Ok(nickname) => nickname,
        Err(e) => {
            warn!("Rejected {}: {}", peer_addr, e);
            return;
        }
    };

    let (message_tx, message_rx) = mpsc::channel(state.outbound_queue_len);
    let writer_task = tokio::spawn(session::run_writer(writer, message_rx));

    let session = Session::new(nickname.clone(), message_tx);
    let id = session.id;
    if !state
        .registry
        .register(session, |history| state.greeting(&nickname, history))
    {
        warn!("{} ({}) went away during registration", nickname, peer_addr);
        writer_task.abort();
        return;
    }
    info!("{} joined from {}", nickname, peer_addr);
    state.announce(ServerMessage::Text(notice::joined(&nickname)), Some(id));

    let reason = state.read_loop(&mut reader, id, &nickname, &mut shutdown).await;
    info!("{} ({}) disconnected: {}", nickname, peer_addr, reason);
    state.close_session(&id);
    // A peer that stopped reading would otherwise pin its writer forever
    writer_task.abort();
}
