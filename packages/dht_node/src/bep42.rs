//! Secure node ID derivation from [BEP-0042].
//!
//! The first 21 bits of a node's ID are a CRC32C digest of its masked IPv4
//! address and an 8 bit salt, which makes IDs verifiable and limits how
//! freely an attacker can position nodes in the key space.
//!
//! [BEP-0042]: http://www.bittorrent.org/beps/bep_0042.html

use crc::{Crc, CRC_32_ISCSI};
use krpc_encoding::NodeID;
use rand::Rng;
use std::net::Ipv4Addr;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const IP_MASK: u32 = 0x030f_3fff;

fn crc_for(ip: Ipv4Addr, r: u8) -> u32 {
    let ip32 = u32::from_be_bytes(ip.octets()) & IP_MASK | (u32::from(r) << 29);
    CASTAGNOLI.checksum(&ip32.to_be_bytes())
}

/// Derives a node ID valid for `ip`. `r` is the 8 bit salt stored in the
/// last byte of the ID; a random one is drawn when unspecified.
pub fn node_id_for_ip(ip: Ipv4Addr, r: Option<u8>) -> NodeID {
    let mut rng = rand::thread_rng();
    let r = r.unwrap_or_else(|| rng.gen());
    let crc = crc_for(ip, r);

    let mut id = [0u8; 20];
    rng.fill(&mut id[3..19]);
    id[0] = (crc >> 24) as u8;
    id[1] = (crc >> 16) as u8;
    id[2] = ((crc >> 8) as u8 & 0xf8) | (rng.gen::<u8>() & 0x07);
    id[19] = r;

    NodeID::new(id)
}

/// Checks whether `id` is valid for `ip` under the BEP-42 prefix rule.
pub fn is_secure(id: &NodeID, ip: Ipv4Addr) -> bool {
    let bytes = id.as_bytes();
    let crc = crc_for(ip, bytes[19]);

    bytes[0] == (crc >> 24) as u8
        && bytes[1] == (crc >> 16) as u8
        && bytes[2] & 0xf8 == (crc >> 8) as u8 & 0xf8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_vector(ip: [u8; 4], r: u8, prefix: [u8; 2], third_high_nibble: u8) {
        let ip = Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]);
        let id = node_id_for_ip(ip, Some(r));
        let bytes = id.as_bytes();

        assert_eq!(bytes[0], prefix[0], "first byte of {}", id);
        assert_eq!(bytes[1], prefix[1], "second byte of {}", id);
        assert_eq!(bytes[2] & 0xf0, third_high_nibble, "third byte of {}", id);
        assert_eq!(bytes[19], r, "salt byte of {}", id);
        assert!(is_secure(&id, ip));
    }

    #[test]
    fn known_vectors() {
        check_vector([124, 31, 75, 21], 1, [0x5f, 0xbf], 0xb0);
        check_vector([21, 75, 31, 124], 86, [0x5a, 0x3c], 0xe0);
        check_vector([65, 23, 51, 170], 22, [0xa5, 0xd4], 0x30);
        check_vector([84, 124, 73, 14], 65, [0x1b, 0x03], 0x20);
        check_vector([43, 213, 53, 83], 90, [0xe5, 0x6f], 0x60);
    }

    #[test]
    fn derived_ids_differ_in_their_random_bits() {
        let ip = Ipv4Addr::new(124, 31, 75, 21);
        let a = node_id_for_ip(ip, Some(1));
        let b = node_id_for_ip(ip, Some(1));

        assert_eq!(a.as_bytes()[..2], b.as_bytes()[..2]);
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_ip_is_not_secure() {
        let id = node_id_for_ip(Ipv4Addr::new(124, 31, 75, 21), Some(1));

        assert!(!is_secure(&id, Ipv4Addr::new(124, 31, 75, 22)));
    }

    #[test]
    fn random_ids_are_rarely_secure() {
        let ip = Ipv4Addr::new(84, 124, 73, 14);
        let insecure = (0..64)
            .filter(|_| !is_secure(&NodeID::random(), ip))
            .count();

        assert!(insecure > 60);
    }
}
