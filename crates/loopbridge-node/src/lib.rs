//! loopbridge node -- tunnels ENet game traffic between loopback UDP
//! sockets and peer-to-peer streams.
//!
//! Re-exports all internal modules so integration tests and the binary can
//! wire networks, transports, schedulers and proxies together.

pub mod clock;
pub mod config;
pub mod filter;
pub mod leg;
pub mod net;
pub mod proxy;
pub mod routes;
pub mod scheduler;
pub mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use loopbridge_crypto::GameCipher;

use crate::config::NodeConfig;
use crate::filter::FirewallLegs;
use crate::leg::{EnetLegs, LegFactory};

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Parse listen_addr from config (supports both "host:port" and Multiaddr format).
pub fn parse_listen_addr(addr: &str) -> anyhow::Result<libp2p::Multiaddr> {
    if let Ok(ma) = addr.parse::<libp2p::Multiaddr>() {
        return Ok(ma);
    }

    // Fall back to host:port -> /ip4|ip6/HOST/tcp/PORT
    let socket_addr: std::net::SocketAddr = addr.parse()?;
    let family = if socket_addr.is_ipv4() { "ip4" } else { "ip6" };
    let multiaddr: libp2p::Multiaddr =
        format!("/{family}/{}/tcp/{}", socket_addr.ip(), socket_addr.port()).parse()?;
    Ok(multiaddr)
}

/// The leg factory `cfg` asks for: plain ENet legs, wrapped in the firewall
/// when it is enabled.
pub fn leg_factory(cfg: &NodeConfig) -> anyhow::Result<Arc<dyn LegFactory>> {
    let legs: Arc<dyn LegFactory> = Arc::new(EnetLegs::new(cfg.protocol_version()));
    if !cfg.firewall.enabled {
        return Ok(legs);
    }
    let key = cfg
        .firewall
        .cipher_key
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("firewall.enabled needs firewall.cipher_key"))?;
    let cipher = GameCipher::from_base64(key)?;
    tracing::info!("firewall: enabled");
    Ok(Arc::new(FirewallLegs::new(legs, cipher)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_addr_forms() {
        let from_socket = parse_listen_addr("0.0.0.0:5119").unwrap();
        assert_eq!(from_socket.to_string(), "/ip4/0.0.0.0/tcp/5119");
        let from_v6 = parse_listen_addr("[::1]:5119").unwrap();
        assert_eq!(from_v6.to_string(), "/ip6/::1/tcp/5119");
        let multi = parse_listen_addr("/ip4/127.0.0.1/tcp/0").unwrap();
        assert_eq!(multi.to_string(), "/ip4/127.0.0.1/tcp/0");
        assert!(parse_listen_addr("not an address").is_err());
    }

    #[test]
    fn test_expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde("/etc/loopbridge.toml"), PathBuf::from("/etc/loopbridge.toml"));
    }

    #[test]
    fn test_leg_factory_requires_key_when_enabled() {
        let mut cfg = NodeConfig::default();
        assert!(leg_factory(&cfg).is_ok());
        cfg.firewall.enabled = true;
        assert!(leg_factory(&cfg).is_err());
        cfg.firewall.cipher_key = Some("17BLOhi6KZsTtldTsizvHg==".into());
        assert!(leg_factory(&cfg).is_ok());
    }
}
