//! Cryptography Module
//!
//! Shared-key encryption and the key file that distributes the key.

pub mod cipher;
pub mod keystore;
