//! loopbridge Crypto -- game payload cipher and node identity.

pub mod cipher;
pub mod identity;

pub use cipher::{GameCipher, BLOCK_SIZE};
pub use identity::NodeIdentity;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid cipher key: {0}")]
    InvalidKey(String),
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("identity error: {0}")]
    IdentityError(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
