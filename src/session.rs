//! Sessions
//!
//! Server-side handle for one authenticated client: its nickname and the
//! queue feeding its socket writer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol;

pub type SessionId = Uuid;

/// Default number of frames a session may have waiting for its socket
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// One encrypted payload, shared between every recipient queue
pub type Frame = Arc<Vec<u8>>;

/// Why a frame could not be queued. Either way the session is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The writer has stopped; the peer is gone
    #[error("Session closed")]
    Closed,
    /// The peer stopped reading and its queue filled up
    #[error("Session queue full")]
    Backlogged,
}

/// Represents a connected, authenticated client
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub nickname: String,
    pub joined_at: DateTime<Utc>,
    outbound: mpsc::Sender<Frame>,
}

impl Session {
    pub fn new(nickname: String, outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            id: Uuid::new_v4(),
            nickname,
            joined_at: Utc::now(),
            outbound,
        }
    }

    /// Queue a frame for this client without waiting.
    ///
    /// Fails once the writer has exited or when the queue is full.
    pub fn send(&self, frame: Frame) -> Result<(), SendError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Backlogged,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Drain a session's queue into its socket.
///
/// Runs until every sender is dropped or a write fails, then shuts the
/// write half down. Dropping the receiver on exit is what makes later
/// [`Session::send`] calls fail.
pub async fn run_writer<W>(mut writer: W, mut outbound: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = protocol::write_frame(&mut writer, &frame).await {
            log::debug!("Session writer stopped: {}", e);
            break;
        }
    }
    outbound.close();
    let _ = writer.shutdown().await;
}
