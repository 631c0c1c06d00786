//! Cryptographic utilities shared across the project

use std::net::SocketAddr;

use aws_lc_rs::digest::{SHA256, digest};
use aws_lc_rs::{hmac, rand};
use marathon_protocol::ids::{ClientId, NodeId};
use marathon_protocol::messages::AuthTag;

/// Heartbeat timestamps more than this far from the receiver's clock are
/// rejected even when the HMAC itself verifies.
pub const MAX_HEARTBEAT_SKEW_MS: u64 = 5 * 60 * 1000;

/// Generate cryptographically secure random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut val = [0u8; N];
    rand::fill(&mut val).expect("should be infallible");
    val
}

/// Derive the ClientId for a remote address: `SHA256(tag || ip_octets)[0:16]`
/// where tag is `0x04` for IPv4 and `0x06` for IPv6.
///
/// The port is excluded so reconnects from the same host map to the same
/// client; the tag byte keeps the IPv4 and IPv6 forms of one numeric host
/// distinct.
pub fn client_id_for_addr(addr: &SocketAddr) -> ClientId {
    let mut canonical = Vec::with_capacity(17);

    match addr {
        SocketAddr::V4(v4) => {
            canonical.push(0x04);
            canonical.extend_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            canonical.push(0x06);
            canonical.extend_from_slice(&v6.ip().octets());
        }
    }

    let digest = digest(&SHA256, &canonical);
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest.as_ref()[..16]);
    ClientId::new(id)
}

fn heartbeat_message(node_id: &NodeId, timestamp_ms: u64) -> [u8; 24] {
    let mut message = [0u8; 24];
    message[..16].copy_from_slice(node_id.as_bytes());
    message[16..].copy_from_slice(&timestamp_ms.to_be_bytes());
    message
}

/// HMAC-SHA256 over `node_id || timestamp_ms` with the shared key.
pub fn heartbeat_mac(key: &[u8], node_id: &NodeId, timestamp_ms: u64) -> AuthTag {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let tag = hmac::sign(&key, &heartbeat_message(node_id, timestamp_ms));

    let mut out = [0u8; 32];
    out.copy_from_slice(tag.as_ref());
    AuthTag(out)
}

/// Verify a heartbeat tag and its timestamp. The tag comparison is constant
/// time; the timestamp must be within `MAX_HEARTBEAT_SKEW_MS` of `now_ms` in
/// either direction.
pub fn verify_heartbeat(
    key: &[u8],
    node_id: &NodeId,
    timestamp_ms: u64,
    tag: &AuthTag,
    now_ms: u64,
) -> bool {
    if now_ms.abs_diff(timestamp_ms) > MAX_HEARTBEAT_SKEW_MS {
        return false;
    }

    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::verify(&key, &heartbeat_message(node_id, timestamp_ms), &tag.0).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(addr: &str) -> SocketAddr {
        addr.parse().unwrap()
    }

    #[test]
    fn client_id_is_pure() {
        let a = client_id_for_addr(&v4("203.0.113.9:55001"));
        let b = client_id_for_addr(&v4("203.0.113.9:55001"));
        assert_eq!(a, b);
    }

    #[test]
    fn client_id_ignores_port() {
        let a = client_id_for_addr(&v4("203.0.113.9:55001"));
        let b = client_id_for_addr(&v4("203.0.113.9:40404"));
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_hosts_distinct_ids() {
        let a = client_id_for_addr(&v4("203.0.113.9:55001"));
        let b = client_id_for_addr(&v4("203.0.113.10:55001"));
        assert_ne!(a, b);
    }

    #[test]
    fn ipv4_and_ipv6_forms_differ() {
        let four = client_id_for_addr(&v4("127.0.0.1:1000"));
        let six = client_id_for_addr(&"[::ffff:127.0.0.1]:1000".parse().unwrap());
        assert_ne!(four, six);

        let loopback6 = client_id_for_addr(&"[::1]:1000".parse().unwrap());
        assert_ne!(four, loopback6);
    }

    #[test]
    fn random_bytes_are_random() {
        let bytes1 = random_bytes::<32>();
        let bytes2 = random_bytes::<32>();

        // Should be different (extremely high probability)
        assert_ne!(bytes1, bytes2);
    }

    #[test]
    fn heartbeat_mac_verifies() {
        let key = b"a shared key";
        let node_id = NodeId::new([3u8; 16]);
        let ts = 1_700_000_000_000u64;

        let tag = heartbeat_mac(key, &node_id, ts);
        assert!(verify_heartbeat(key, &node_id, ts, &tag, ts + 1_000));
    }

    #[test]
    fn wrong_key_rejected() {
        let node_id = NodeId::new([3u8; 16]);
        let ts = 1_700_000_000_000u64;

        let tag = heartbeat_mac(b"key one", &node_id, ts);
        assert!(!verify_heartbeat(b"key two", &node_id, ts, &tag, ts));
    }

    #[test]
    fn tampered_node_id_rejected() {
        let key = b"a shared key";
        let ts = 1_700_000_000_000u64;

        let tag = heartbeat_mac(key, &NodeId::new([3u8; 16]), ts);
        assert!(!verify_heartbeat(key, &NodeId::new([4u8; 16]), ts, &tag, ts));
    }

    #[test]
    fn stale_timestamp_rejected() {
        let key = b"a shared key";
        let node_id = NodeId::new([3u8; 16]);
        let ts = 1_700_000_000_000u64;
        let tag = heartbeat_mac(key, &node_id, ts);

        // Within the window, both directions
        assert!(verify_heartbeat(key, &node_id, ts, &tag, ts + MAX_HEARTBEAT_SKEW_MS));
        assert!(verify_heartbeat(key, &node_id, ts, &tag, ts - MAX_HEARTBEAT_SKEW_MS));

        // One millisecond past it, both directions
        assert!(!verify_heartbeat(key, &node_id, ts, &tag, ts + MAX_HEARTBEAT_SKEW_MS + 1));
        assert!(!verify_heartbeat(key, &node_id, ts, &tag, ts - MAX_HEARTBEAT_SKEW_MS - 1));
    }
}
