//! Chat Protocol
//!
//! Application messages and the length-prefixed frame format.
//!
//! After decryption every payload is UTF-8 text. A `HISTORY:` or `FILE:`
//! prefix marks the non-chat variants; anything else is a plain line. The
//! prefixes only exist on the wire: payloads are decoded into
//! [`ServerMessage`] / [`ClientMessage`] as soon as they are received.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HISTORY_PREFIX: &str = "HISTORY:";
pub const FILE_PREFIX: &str = "FILE:";

/// Default upper bound on a single frame (file payloads included)
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Protocol errors
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame too large ({len} bytes, limit {max})")]
    TooLarge { len: usize, max: usize },
    #[error("Payload is not UTF-8")]
    NotUtf8,
    #[error("Invalid {prefix} payload: {reason}")]
    InvalidPayload { prefix: &'static str, reason: String },
}

/// File transfer envelope carried after the `FILE:` prefix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEnvelope {
    pub name: String,
    /// Standard base64 of the file bytes
    pub data: String,
    /// Any further fields a sender attached; relayed untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl FileEnvelope {
    pub fn new(name: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            name: name.into(),
            data: STANDARD.encode(bytes),
            extra: serde_json::Map::new(),
        }
    }

    /// Decode the file contents
    pub fn bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.data)
    }

    fn parse(json: &str) -> Result<Self, FrameError> {
        serde_json::from_str(json).map_err(|e| FrameError::InvalidPayload {
            prefix: FILE_PREFIX,
            reason: e.to_string(),
        })
    }

    fn to_wire(&self) -> String {
        // Serializing a struct of strings and a JSON map cannot fail
        let json = serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"));
        format!("{}{}", FILE_PREFIX, json)
    }
}

/// Messages sent from the server to clients
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Replay of prior history, sent once right after joining
    History(Vec<String>),
    /// Relayed file transfer
    File(FileEnvelope),
    /// Chat line or system notice
    Text(String),
}

impl ServerMessage {
    pub fn to_wire(&self) -> String {
        match self {
            ServerMessage::History(lines) => {
                let json = serde_json::to_string(lines).unwrap_or_else(|_| String::from("[]"));
                format!("{}{}", HISTORY_PREFIX, json)
            }
            ServerMessage::File(envelope) => envelope.to_wire(),
            ServerMessage::Text(text) => text.clone(),
        }
    }

    pub fn from_wire(text: &str) -> Result<Self, FrameError> {
        if let Some(json) = text.strip_prefix(HISTORY_PREFIX) {
            let lines = serde_json::from_str(json).map_err(|e| FrameError::InvalidPayload {
                prefix: HISTORY_PREFIX,
                reason: e.to_string(),
            })?;
            Ok(ServerMessage::History(lines))
        } else if let Some(json) = text.strip_prefix(FILE_PREFIX) {
            Ok(ServerMessage::File(FileEnvelope::parse(json)?))
        } else {
            Ok(ServerMessage::Text(text.to_string()))
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        Self::from_wire(std::str::from_utf8(bytes).map_err(|_| FrameError::NotUtf8)?)
    }
}

/// Messages sent from a client to the server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    File(FileEnvelope),
    Text(String),
}

impl ClientMessage {
    pub fn to_wire(&self) -> String {
        match self {
            ClientMessage::File(envelope) => envelope.to_wire(),
            ClientMessage::Text(text) => text.clone(),
        }
    }

    pub fn from_wire(text: &str) -> Result<Self, FrameError> {
        match text.strip_prefix(FILE_PREFIX) {
            Some(json) => Ok(ClientMessage::File(FileEnvelope::parse(json)?)),
            None => Ok(ClientMessage::Text(text.to_string())),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        Self::from_wire(std::str::from_utf8(bytes).map_err(|_| FrameError::NotUtf8)?)
    }
}

/// Fixed notice templates
pub mod notice {
    pub fn welcome(nickname: &str) -> String {
        format!("Welcome, {}!", nickname)
    }

    pub fn joined(nickname: &str) -> String {
        format!("{} joined the chat", nickname)
    }

    pub fn left(nickname: &str) -> String {
        format!("{} left the chat", nickname)
    }

    pub fn chat_line(nickname: &str, text: &str) -> String {
        format!("{}: {}", nickname, text)
    }
}

/// The newest `lines` whose `HISTORY:` wire form stays within
/// `max_wire_len` bytes, oldest first.
///
/// Entries are dropped from the old end until the rest fits, so the replay
/// is always a contiguous tail of the history.
pub fn history_tail<'a, I>(lines: I, max_wire_len: usize) -> Vec<String>
where
    I: DoubleEndedIterator<Item = &'a String>,
{
    // `HISTORY:` plus the enclosing brackets
    let mut used = HISTORY_PREFIX.len() + 2;
    let mut kept = Vec::new();
    for line in lines.rev() {
        let encoded = match serde_json::to_string(line) {
            Ok(encoded) => encoded.len(),
            Err(_) => break,
        };
        let separator = usize::from(!kept.is_empty());
        if used + encoded + separator > max_wire_len {
            break;
        }
        used += encoded + separator;
        kept.push(line.clone());
    }
    kept.reverse();
    kept
}

fn length_prefix(len: usize) -> Result<[u8; 4], FrameError> {
    u32::try_from(len)
        .map(u32::to_be_bytes)
        .map_err(|_| FrameError::TooLarge { len, max: u32::MAX as usize })
}

/// Create a framed payload with length prefix (4 bytes, big-endian)
pub fn to_framed(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = length_prefix(payload.len())?;
    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&len);
    framed.extend_from_slice(payload);
    Ok(framed)
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&to_framed(payload)?).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer closed the stream on a frame boundary.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_discriminates_variants() {
        assert_eq!(
            ServerMessage::from_wire("alice: hi").unwrap(),
            ServerMessage::Text("alice: hi".to_string())
        );
        assert_eq!(
            ServerMessage::from_wire(r#"HISTORY:["a","b"]"#).unwrap(),
            ServerMessage::History(vec!["a".to_string(), "b".to_string()])
        );
        match ServerMessage::from_wire(r#"FILE:{"name":"a.txt","data":"aGk="}"#).unwrap() {
            ServerMessage::File(envelope) => {
                assert_eq!(envelope.name, "a.txt");
                assert_eq!(envelope.bytes().unwrap(), b"hi");
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_history_wire_format() {
        let msg = ServerMessage::History(vec!["alice joined the chat".to_string()]);
        assert_eq!(msg.to_wire(), r#"HISTORY:["alice joined the chat"]"#);
    }

    #[test]
    fn test_file_envelope_keeps_extra_fields() {
        let wire = r#"FILE:{"name":"n.bin","data":"AAE=","size":2,"sender":"bob"}"#;
        let msg = ClientMessage::from_wire(wire).unwrap();
        let ClientMessage::File(envelope) = &msg else {
            panic!("Wrong message type");
        };
        assert_eq!(envelope.extra["size"], serde_json::json!(2));

        let relayed = ServerMessage::from_wire(&msg.to_wire()).unwrap();
        assert_eq!(relayed, ServerMessage::File(envelope.clone()));
    }

    #[test]
    fn test_invalid_file_payload() {
        assert!(matches!(
            ClientMessage::from_wire("FILE:{oops"),
            Err(FrameError::InvalidPayload { prefix: FILE_PREFIX, .. })
        ));
        assert!(matches!(
            ClientMessage::from_wire(r#"FILE:{"name":"x"}"#),
            Err(FrameError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_not_utf8() {
        assert!(matches!(
            ClientMessage::from_bytes(&[0xff, 0xfe]),
            Err(FrameError::NotUtf8)
        ));
    }

    #[test]
    fn test_framed_message() {
        let framed = to_framed(b"payload").unwrap();
        let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]);
        assert_eq!(len as usize, framed.len() - 4);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_length_prefix_refuses_to_truncate() {
        let len = u32::MAX as usize + 1;
        assert!(matches!(
            length_prefix(len),
            Err(FrameError::TooLarge { len: l, max }) if l == len && max == u32::MAX as usize
        ));
        assert_eq!(length_prefix(u32::MAX as usize).unwrap(), [0xff; 4]);
    }

    #[test]
    fn test_history_tail_keeps_newest_entries() {
        let lines: Vec<String> = ["one", "two", "three"].iter().map(|s| s.to_string()).collect();

        let all = ServerMessage::History(lines.clone()).to_wire();
        assert_eq!(history_tail(lines.iter(), all.len()), lines);

        let tail = history_tail(lines.iter(), all.len() - 1);
        assert_eq!(tail, vec!["two", "three"]);
        assert!(ServerMessage::History(tail).to_wire().len() <= all.len() - 1);

        // Exact fit for the newest entry alone
        let last = ServerMessage::History(vec!["three".to_string()]).to_wire();
        assert_eq!(history_tail(lines.iter(), last.len()), vec!["three"]);
        assert!(history_tail(lines.iter(), last.len() - 1).is_empty());
    }

    #[test]
    fn test_history_tail_counts_escapes() {
        let lines = vec!["say \"hi\"".to_string()];
        let wire = ServerMessage::History(lines.clone()).to_wire();
        assert_eq!(history_tail(lines.iter(), wire.len()), lines);
        assert!(history_tail(lines.iter(), wire.len() - 1).is_empty());
    }

    #[tokio::test]
    async fn test_frames_survive_split_reads() {
        let (mut client, mut server) = tokio::io::duplex(8);

        let writer = tokio::spawn(async move {
            write_frame(&mut client, b"first").await.unwrap();
            write_frame(&mut client, &[9u8; 100]).await.unwrap();
        });

        let first = read_frame(&mut server, 1024).await.unwrap().unwrap();
        let second = read_frame(&mut server, 1024).await.unwrap().unwrap();
        writer.await.unwrap();

        assert_eq!(first, b"first");
        assert_eq!(second, vec![9u8; 100]);
        assert!(read_frame(&mut server, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&(2048u32).to_be_bytes()).await.unwrap();

        assert!(matches!(
            read_frame(&mut server, 1024).await,
            Err(FrameError::TooLarge { len: 2048, max: 1024 })
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0]).await.unwrap();
        drop(client);

        assert!(matches!(read_frame(&mut server, 1024).await, Err(FrameError::Io(_))));
    }
}
