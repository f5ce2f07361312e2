//! Ed25519 node identity, persisted as PKCS#8 and presented to libp2p.

use std::path::Path;

use libp2p::identity::Keypair;
use libp2p::PeerId;
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};

use crate::CryptoError;

/// `OCTET STRING (34) { OCTET STRING (32) { seed } }` inside ring's PKCS#8.
const SEED_PREFIX: [u8; 4] = [0x04, 0x22, 0x04, 0x20];
const SEED_LEN: usize = 32;

pub struct NodeIdentity {
    keypair: Keypair,
    peer_id: PeerId,
    public_key: Vec<u8>,
    pkcs8_doc: Vec<u8>,
}

impl NodeIdentity {
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|e| CryptoError::IdentityError(e.to_string()))?;
        Self::from_pkcs8(pkcs8.as_ref().to_vec())
    }

    pub fn from_file(path: &Path) -> Result<Self, CryptoError> {
        Self::from_pkcs8(std::fs::read(path)?)
    }

    /// Load the key at `path`, creating it (owner-only on unix) if absent.
    pub fn load_or_create(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            return Self::from_file(path);
        }

        let identity = Self::generate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &identity.pkcs8_doc)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::info!(path = %path.display(), peer_id = %identity.peer_id, "generated node identity");
        Ok(identity)
    }

    fn from_pkcs8(pkcs8_doc: Vec<u8>) -> Result<Self, CryptoError> {
        let ring_keypair = Ed25519KeyPair::from_pkcs8(&pkcs8_doc)
            .map_err(|e| CryptoError::IdentityError(e.to_string()))?;

        let seed = ed25519_seed(&pkcs8_doc).ok_or_else(|| {
            CryptoError::IdentityError("no Ed25519 seed in PKCS#8 document".into())
        })?;
        let keypair = Keypair::ed25519_from_bytes(seed.to_vec())
            .map_err(|e| CryptoError::IdentityError(format!("libp2p keypair: {e}")))?;

        Ok(Self {
            peer_id: keypair.public().to_peer_id(),
            keypair,
            public_key: ring_keypair.public_key().as_ref().to_vec(),
            pkcs8_doc,
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Keypair for the libp2p swarm.
    pub fn keypair(&self) -> Keypair {
        self.keypair.clone()
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8_doc
    }
}

fn ed25519_seed(der: &[u8]) -> Option<&[u8]> {
    let start = der
        .windows(SEED_PREFIX.len())
        .position(|w| w == SEED_PREFIX)?
        + SEED_PREFIX.len();
    der.get(start..start + SEED_LEN)
}
