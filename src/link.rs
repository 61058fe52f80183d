//! Client Link
//!
//! Client side of the chat connection: connects, sends the encrypted
//! nickname, runs one receive task per connection and reports everything it
//! sees as [`LinkEvent`]s.
//!
//! There is no background keep-alive. A send on a dead connection triggers
//! reconnects according to the [`ReconnectPolicy`] (one attempt by default)
//! before failing with [`LinkError::SendFailed`].

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::crypto::cipher::{Cipher, CipherError, SharedKey};
use crate::protocol::{self, ClientMessage, FileEnvelope, FrameError, ServerMessage};

/// Link errors
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Connection timed out")]
    ConnectTimeout,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Message too large ({len} bytes sealed, limit {max})")]
    MessageTooLarge { len: usize, max: usize },
    #[error("Not connected")]
    NotConnected,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),
}

/// Connection state as seen by the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Handshaking,
    Connected,
    Reconnecting,
    /// The receive task saw the server go away
    Lost,
    /// Reconnecting gave up
    Failed,
}

/// Everything the link reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Message(ServerMessage),
    StatusChanged(LinkState),
    ConnectionLost,
}

/// How hard `send` tries to revive a dead connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl ReconnectPolicy {
    /// Whether attempt number `attempt` (0-based) may run
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before attempt number `attempt`, growing linearly
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

/// Tunables for a [`ClientLink`]
#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub max_frame_len: usize,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for LinkOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            reconnect: ReconnectPolicy {
                max_attempts: config.reconnect_attempts,
                backoff: Duration::from_millis(config.reconnect_backoff_ms),
            },
            max_frame_len: config.max_frame_len,
        }
    }
}

/// Client connection to one chat server
pub struct ClientLink {
    address: SocketAddr,
    nickname: String,
    cipher: Cipher,
    options: LinkOptions,
    state: LinkState,
    writer: Option<OwnedWriteHalf>,
    alive: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl ClientLink {
    /// Connect, authenticate with `nickname` and start receiving.
    ///
    /// The link counts as connected once the nickname is sent; a wrong key
    /// only shows up later as [`LinkEvent::ConnectionLost`].
    pub async fn connect(
        address: IpAddr,
        port: u16,
        key: &SharedKey,
        nickname: impl Into<String>,
        options: LinkOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent>), LinkError> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let mut link = Self {
            address: SocketAddr::new(address, port),
            nickname: nickname.into(),
            cipher: Cipher::new(key),
            options,
            state: LinkState::Disconnected,
            writer: None,
            alive: Arc::new(AtomicBool::new(false)),
            receiver: None,
            events,
        };

        if let Err(e) = link.open().await {
            link.set_state(LinkState::Disconnected);
            return Err(e);
        }
        Ok((link, events_rx))
    }

    pub fn state(&self) -> LinkState {
        if self.state == LinkState::Connected && !self.alive.load(Ordering::SeqCst) {
            LinkState::Lost
        } else {
            self.state
        }
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.address
    }

    /// Whether a send can go out without reconnecting first
    pub fn is_usable(&self) -> bool {
        self.writer.is_some() && self.alive.load(Ordering::SeqCst)
    }

    /// Send a chat line
    pub async fn send(&mut self, text: &str) -> Result<(), LinkError> {
        self.send_message(&ClientMessage::Text(text.to_string())).await
    }

    /// Send a file as a `FILE:` envelope
    pub async fn send_file(&mut self, name: &str, bytes: &[u8]) -> Result<(), LinkError> {
        self.send_message(&ClientMessage::File(FileEnvelope::new(name, bytes)))
            .await
    }

    /// Encrypt and send one message.
    ///
    /// A message whose sealed frame exceeds `max_frame_len` is refused
    /// before anything is written; the connection stays up.
    pub async fn send_message(&mut self, message: &ClientMessage) -> Result<(), LinkError> {
        let frame = self.cipher.encrypt(message.to_wire().as_bytes())?;
        if frame.len() > self.options.max_frame_len {
            return Err(LinkError::MessageTooLarge {
                len: frame.len(),
                max: self.options.max_frame_len,
            });
        }

        if self.is_usable() {
            match self.write(&frame).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("Send on live connection failed: {}", e);
                    self.drop_connection();
                }
            }
        }

        if let Err(e) = self.reconnect().await {
            return Err(LinkError::SendFailed(e.to_string()));
        }
        match self.write(&frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.drop_connection();
                self.set_state(LinkState::Failed);
                Err(LinkError::SendFailed(e.to_string()))
            }
        }
    }

    /// Close the connection. Safe to call on a closed link.
    pub async fn close(&mut self) {
        if let Some(task) = self.receiver.take() {
            task.abort();
        }
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Ignoring error while closing: {}", e);
            }
        }
        self.alive.store(false, Ordering::SeqCst);
        self.set_state(LinkState::Disconnected);
    }

    async fn write(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        let writer = self.writer.as_mut().ok_or(LinkError::NotConnected)?;
        protocol::write_frame(writer, frame).await?;
        Ok(())
    }

    /// Open a TCP connection, send the nickname and start the receive task
    async fn open(&mut self) -> Result<(), LinkError> {
        self.set_state(LinkState::Handshaking);

        let stream = match tokio::time::timeout(
            self.options.connect_timeout,
            TcpStream::connect(self.address),
        )
        .await
        {
            Err(_) => return Err(LinkError::ConnectTimeout),
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(LinkError::ConnectionRefused)
            }
            Ok(Err(e)) => return Err(LinkError::Io(e)),
            Ok(Ok(stream)) => stream,
        };

        let (reader, mut writer) = stream.into_split();
        let hello = self.cipher.encrypt(self.nickname.as_bytes())?;
        protocol::write_frame(&mut writer, &hello).await?;

        let alive = Arc::new(AtomicBool::new(true));
        self.receiver = Some(tokio::spawn(receive_loop(
            reader,
            self.cipher.clone(),
            self.options.max_frame_len,
            alive.clone(),
            self.events.clone(),
        )));
        self.alive = alive;
        self.writer = Some(writer);

        info!("Connected to {} as {}", self.address, self.nickname);
        self.set_state(LinkState::Connected);
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), LinkError> {
        self.drop_connection();

        let mut attempt = 0;
        let mut last_error = LinkError::NotConnected;
        while self.options.reconnect.allows(attempt) {
            self.set_state(LinkState::Reconnecting);
            let delay = self.options.reconnect.delay(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;

            match self.open().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("Reconnect attempt {} to {} failed: {}", attempt, self.address, e);
                    last_error = e;
                }
            }
        }

        self.set_state(LinkState::Failed);
        Err(last_error)
    }

    fn drop_connection(&mut self) {
        if let Some(task) = self.receiver.take() {
            task.abort();
        }
        self.writer = None;
        self.alive.store(false, Ordering::SeqCst);
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            self.state = state;
            let _ = self.events.send(LinkEvent::StatusChanged(state));
        }
    }
}

impl Drop for ClientLink {
    fn drop(&mut self) {
        if let Some(task) = self.receiver.take() {
            task.abort();
        }
    }
}

/// Receive frames until the connection ends.
///
/// A frame that fails to decrypt or decode is logged and skipped; only the
/// end of the stream or a read error stops the loop.
async fn receive_loop(
    mut reader: OwnedReadHalf,
    cipher: Cipher,
    max_frame_len: usize,
    alive: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    loop {
        let frame = match protocol::read_frame(&mut reader, max_frame_len).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("Server closed the connection");
                break;
            }
            Err(e) => {
                warn!("Receive failed: {}", e);
                break;
            }
        };

        let plain = match cipher.decrypt(&frame) {
            Ok(plain) => plain,
            Err(e) => {
                warn!("Skipping undecryptable frame: {}", e);
                continue;
            }
        };

        match ServerMessage::from_bytes(&plain) {
            Ok(message) => {
                if events.send(LinkEvent::Message(message)).is_err() {
                    debug!("Event receiver dropped, stopping receive loop");
                    break;
                }
            }
            Err(e) => warn!("Skipping malformed message: {}", e),
        }
    }

    alive.store(false, Ordering::SeqCst);
    let _ = events.send(LinkEvent::StatusChanged(LinkState::Lost));
    let _ = events.send(LinkEvent::ConnectionLost);
}
