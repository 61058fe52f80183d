//! Key File Store
//!
//! Creates, persists and loads the key file (`key.2pk` by default) that binds
//! a group of clients to one server. The file carries the shared key and the
//! server's address encrypted under that key.

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::cipher::{Cipher, SharedKey};

/// Default key file name
pub const DEFAULT_KEY_FILE: &str = "key.2pk";

/// Public address used only to let the OS pick an outbound source address.
/// Nothing is ever sent to it.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

/// Key store errors
#[derive(Error, Debug)]
pub enum KeyStoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// The key file is corrupt: bad JSON, missing fields, or key material
    /// that does not decrypt the embedded address.
    #[error("Malformed key file: {0}")]
    MalformedKey(String),
}

/// On-disk key file record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub key: String,
    #[serde(alias = "encrypted_ip")]
    pub encrypted_address: String,
}

impl KeyFile {
    /// Build a key file for `address` under `key`
    pub fn seal(key: &SharedKey, address: &IpAddr) -> Result<Self, KeyStoreError> {
        let frame = Cipher::new(key)
            .encrypt(address.to_string().as_bytes())
            .map_err(|e| KeyStoreError::MalformedKey(e.to_string()))?;
        Ok(Self {
            key: key.encoded(),
            encrypted_address: STANDARD.encode(frame),
        })
    }

    /// Recover the key and the decrypted server address
    pub fn open(&self) -> Result<(SharedKey, IpAddr), KeyStoreError> {
        let key = SharedKey::from_encoded(&self.key)
            .map_err(|e| KeyStoreError::MalformedKey(e.to_string()))?;
        let frame = STANDARD
            .decode(self.encrypted_address.trim())
            .map_err(|e| KeyStoreError::MalformedKey(format!("encrypted address: {}", e)))?;
        let plain = Cipher::new(&key)
            .decrypt(&frame)
            .map_err(|e| KeyStoreError::MalformedKey(e.to_string()))?;
        let text = String::from_utf8(plain)
            .map_err(|_| KeyStoreError::MalformedKey("address is not UTF-8".to_string()))?;
        let address = text
            .trim()
            .parse::<IpAddr>()
            .map_err(|e| KeyStoreError::MalformedKey(format!("address {:?}: {}", text, e)))?;
        Ok((key, address))
    }

    pub fn from_json(json: &str) -> Result<Self, KeyStoreError> {
        serde_json::from_str(json).map_err(|e| KeyStoreError::MalformedKey(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, KeyStoreError> {
        serde_json::to_string(self).map_err(|e| KeyStoreError::MalformedKey(e.to_string()))
    }
}

/// Load the key from `path`, or generate and persist a new key file when the
/// file is missing or unusable.
pub fn load_or_create(path: impl AsRef<Path>) -> Result<SharedKey, KeyStoreError> {
    let path = path.as_ref();
    if path.exists() {
        match load(path) {
            Ok((key, address)) => {
                log::info!("Loaded key file {} (address {})", path.display(), address);
                return Ok(key);
            }
            Err(e) => {
                log::warn!("Key file {} unusable ({}), creating a new one", path.display(), e);
            }
        }
    } else {
        log::info!("No key file at {}, creating a new one", path.display());
    }

    let key = SharedKey::generate();
    let address = local_address();
    let record = KeyFile::seal(&key, &address)?;
    fs::write(path, record.to_json()?)?;
    log::info!("Wrote key file {} for address {}", path.display(), address);
    Ok(key)
}

/// Load a key file on the client side: the key and the server address
pub fn load(path: impl AsRef<Path>) -> Result<(SharedKey, IpAddr), KeyStoreError> {
    let json = fs::read_to_string(path)?;
    KeyFile::from_json(&json)?.open()
}

/// The host's outbound-routable local address, falling back to loopback.
///
/// A UDP `connect` only selects a route; no datagram leaves the host.
pub fn local_address() -> IpAddr {
    let probe = || -> io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(ROUTE_PROBE_ADDR)?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            log::debug!("Route probe failed ({}), using loopback", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_create_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_KEY_FILE);

        let key = load_or_create(&path).unwrap();
        assert!(path.exists());

        let (loaded, address) = load(&path).unwrap();
        assert_eq!(loaded, key);
        assert!(address.is_ipv4() || address.is_ipv6());
    }

    #[test]
    fn test_existing_file_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.2pk");

        let first = load_or_create(&path).unwrap();
        let second = load_or_create(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_corrupt_file_is_replaced_on_server_boot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.2pk");
        fs::write(&path, "{ not json").unwrap();

        let key = load_or_create(&path).unwrap();
        let (loaded, _) = load(&path).unwrap();
        assert_eq!(loaded, key);
    }

    #[test]
    fn test_file_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.2pk");
        let key = load_or_create(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["key"].as_str().unwrap(), key.encoded());
        assert!(value["encrypted_address"].is_string());
    }

    #[test]
    fn test_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.2pk");

        fs::write(&path, "[]").unwrap();
        assert!(matches!(load(&path), Err(KeyStoreError::MalformedKey(_))));

        fs::write(&path, r#"{"key": "abc"}"#).unwrap();
        assert!(matches!(load(&path), Err(KeyStoreError::MalformedKey(_))));

        // Address sealed under a different key
        let other = KeyFile::seal(&SharedKey::generate(), &IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        let swapped = KeyFile {
            key: SharedKey::generate().encoded(),
            encrypted_address: other.encrypted_address,
        };
        fs::write(&path, swapped.to_json().unwrap()).unwrap();
        assert!(matches!(load(&path), Err(KeyStoreError::MalformedKey(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load(dir.path().join("absent.2pk")),
            Err(KeyStoreError::Io(_))
        ));
    }

    #[test]
    fn test_legacy_field_name() {
        let key = SharedKey::generate();
        let address = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let record = KeyFile::seal(&key, &address).unwrap();
        let legacy = format!(
            r#"{{"key": "{}", "encrypted_ip": "{}"}}"#,
            record.key, record.encrypted_address
        );

        let (loaded, opened) = KeyFile::from_json(&legacy).unwrap().open().unwrap();
        assert_eq!(loaded, key);
        assert_eq!(opened, address);
    }
}
