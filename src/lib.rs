//! Keychat - Shared-Key Group Chat Library
//!
//! One server relays encrypted chat lines and file transfers between every
//! client holding the same key file, and replays recent history to
//! newcomers.

pub mod config;
pub mod crypto;
pub mod link;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use config::{ClientConfig, ServerConfig};
pub use crypto::cipher::{Cipher, CipherError, SharedKey};
pub use crypto::keystore::{KeyFile, KeyStoreError};
pub use link::{ClientLink, LinkError, LinkEvent, LinkOptions, LinkState, ReconnectPolicy};
pub use protocol::{ClientMessage, FileEnvelope, ServerMessage};
pub use registry::Registry;
pub use server::{ChatServer, ShutdownHandle};
pub use session::Session;
