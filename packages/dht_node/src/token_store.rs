//! Write tokens and the bounded value cache.
//!
//! A token binds a (target, requester IP) pair to a rotating 10 byte
//! secret. Rotation keeps one previous secret and accepts tokens minted
//! under either, so a token stays usable for the full rotation window.
//! Values sit in a 500 entry cache and expire after two hours, whichever
//! comes first.

use crate::storage::{sha1, MutableItem, StorageItem};
use chrono::{DateTime, Duration, Utc};
use krpc_encoding::{Addr, NodeID};
use log::debug;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

const SECRET_LEN: usize = 10;

/// Tokens minted more than one rotation ago stop verifying.
pub const ROTATE_SECRET_AFTER_MINUTES: i64 = 10;

/// Upper bound on cached targets.
const MAX_ENTRIES: usize = 500;

/// Values older than this are expired on access or insert.
const EXPIRE_AFTER_HOURS: i64 = 2;

/// What the cache holds for one target.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    /// Deduplicated peer announcements for an infohash.
    Peers(HashSet<Addr>),

    /// One storage-extension item.
    Item(StorageItem),
}

struct Entry {
    value: StoredValue,
    stored_at: DateTime<Utc>,
    last_access: DateTime<Utc>,
}

pub struct TokenStore {
    secret: [u8; SECRET_LEN],
    previous_secret: [u8; SECRET_LEN],
    entries: HashMap<NodeID, Entry>,
}

impl TokenStore {
    pub fn new() -> TokenStore {
        TokenStore {
            secret: random_secret(),
            previous_secret: random_secret(),
            entries: HashMap::new(),
        }
    }

    /// Issues a token binding `target` to the requester's IP under the
    /// current secret.
    pub fn issue(&self, target: &NodeID, requester: Ipv4Addr) -> Vec<u8> {
        make_token(target, requester, &self.secret)
    }

    /// Accepts tokens minted under the current or the previous secret.
    pub fn verify(&self, token: &[u8], target: &NodeID, requester: Ipv4Addr) -> bool {
        token == &make_token(target, requester, &self.secret)[..]
            || token == &make_token(target, requester, &self.previous_secret)[..]
    }

    /// Replaces the secret, demoting the current one to `previous`. Called
    /// by the host every 10 minutes.
    pub fn rotate(&mut self) {
        self.previous_secret = self.secret;
        self.secret = random_secret();
        debug!("rotated the token secret");
    }

    /// Records an announcement after checking the token. Returns `false`
    /// without side effects on a bad token.
    pub fn announce(
        &mut self,
        target: &NodeID,
        peer: Addr,
        requester: Ipv4Addr,
        token: &[u8],
    ) -> bool {
        if !self.verify(token, target, requester) {
            return false;
        }

        let live_peer_set = matches!(self.lookup(target), Some(StoredValue::Peers(..)));

        if live_peer_set {
            if let Some(entry) = self.entries.get_mut(target) {
                entry.stored_at = Utc::now();
                if let StoredValue::Peers(peers) = &mut entry.value {
                    peers.insert(peer);
                }
            }
        } else {
            let mut peers = HashSet::new();
            peers.insert(peer);
            self.insert(*target, StoredValue::Peers(peers));
        }

        true
    }

    /// Stores a storage-extension item after checking the token. Sequence
    /// and signature policy belong to the caller; this only guards the
    /// token binding.
    pub fn store_item(
        &mut self,
        target: &NodeID,
        item: StorageItem,
        requester: Ipv4Addr,
        token: &[u8],
    ) -> bool {
        if !self.verify(token, target, requester) {
            return false;
        }

        self.insert(*target, StoredValue::Item(item));
        true
    }

    /// Announced peers for `target`, if any survive expiry.
    pub fn peers(&mut self, target: &NodeID) -> Option<Vec<Addr>> {
        match self.lookup(target) {
            Some(StoredValue::Peers(peers)) if !peers.is_empty() => {
                Some(peers.iter().copied().collect())
            }
            _ => None,
        }
    }

    /// The storage-extension item under `target`, if it survives expiry.
    pub fn item(&mut self, target: &NodeID) -> Option<StorageItem> {
        match self.lookup(target) {
            Some(StoredValue::Item(item)) => Some(item.clone()),
            _ => None,
        }
    }

    /// The stored mutable item under `target`, used for sequence checks.
    pub fn mutable_item(&mut self, target: &NodeID) -> Option<MutableItem> {
        match self.item(target) {
            Some(StorageItem::Mutable(item)) => Some(item),
            _ => None,
        }
    }

    fn lookup(&mut self, target: &NodeID) -> Option<&StoredValue> {
        let expired = match self.entries.get(target) {
            None => return None,
            Some(entry) => Utc::now() - entry.stored_at > expiry(),
        };

        if expired {
            self.entries.remove(target);
            return None;
        }

        let entry = self.entries.get_mut(target)?;
        entry.last_access = Utc::now();
        Some(&entry.value)
    }

    fn insert(&mut self, target: NodeID, value: StoredValue) {
        let now = Utc::now();
        self.entries
            .retain(|_, entry| now - entry.stored_at <= expiry());

        while self.entries.len() >= MAX_ENTRIES && !self.entries.contains_key(&target) {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(id, _)| *id);

            match oldest {
                Some(oldest) => {
                    debug!("value cache full, evicting {}", oldest);
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }

        self.entries.insert(
            target,
            Entry {
                value,
                stored_at: now,
                last_access: now,
            },
        );
    }

    #[cfg(test)]
    fn age_entry(&mut self, target: &NodeID, hours: i64) {
        if let Some(entry) = self.entries.get_mut(target) {
            entry.stored_at = entry.stored_at - Duration::hours(hours);
        }
    }

    #[cfg(test)]
    fn age_access(&mut self, target: &NodeID, minutes: i64) {
        if let Some(entry) = self.entries.get_mut(target) {
            entry.last_access = entry.last_access - Duration::minutes(minutes);
        }
    }
}

impl Default for TokenStore {
    fn default() -> TokenStore {
        TokenStore::new()
    }
}

fn expiry() -> Duration {
    Duration::hours(EXPIRE_AFTER_HOURS)
}

fn random_secret() -> [u8; SECRET_LEN] {
    let mut secret = [0u8; SECRET_LEN];
    rand::thread_rng().fill(&mut secret[..]);
    secret
}

/// token = SHA-1(target ‖ requester octets ‖ secret)
fn make_token(target: &NodeID, requester: Ipv4Addr, secret: &[u8; SECRET_LEN]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(20 + 4 + SECRET_LEN);
    bytes.extend_from_slice(target.as_bytes());
    bytes.extend_from_slice(&requester.octets());
    bytes.extend_from_slice(secret);
    sha1(&bytes).as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requester() -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, 1)
    }

    fn peer(port: u16) -> Addr {
        Addr::new(Ipv4Addr::new(10, 0, 0, 9), port)
    }

    #[test]
    fn issued_tokens_verify() {
        let store = TokenStore::new();
        let target = NodeID::random();
        let token = store.issue(&target, requester());

        assert!(store.verify(&token, &target, requester()));
    }

    #[test]
    fn tokens_bind_the_requester_ip() {
        let store = TokenStore::new();
        let target = NodeID::random();
        let token = store.issue(&target, requester());

        assert!(!store.verify(&token, &target, Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn tokens_bind_the_target() {
        let store = TokenStore::new();
        let token = store.issue(&NodeID::random(), requester());

        assert!(!store.verify(&token, &NodeID::random(), requester()));
    }

    #[test]
    fn tokens_survive_one_rotation_but_not_two() {
        let mut store = TokenStore::new();
        let target = NodeID::random();
        let token = store.issue(&target, requester());

        store.rotate();
        assert!(store.verify(&token, &target, requester()));

        store.rotate();
        assert!(!store.verify(&token, &target, requester()));
    }

    #[test]
    fn announce_requires_a_valid_token() {
        let mut store = TokenStore::new();
        let target = NodeID::random();

        assert!(!store.announce(&target, peer(1234), requester(), b"forged"));
        assert_eq!(store.peers(&target), None);
    }

    #[test]
    fn announcements_deduplicate() {
        let mut store = TokenStore::new();
        let target = NodeID::random();
        let token = store.issue(&target, requester());

        assert!(store.announce(&target, peer(1234), requester(), &token));
        assert!(store.announce(&target, peer(1234), requester(), &token));
        assert!(store.announce(&target, peer(5678), requester(), &token));

        let mut ports: Vec<u16> = store
            .peers(&target)
            .unwrap()
            .iter()
            .map(Addr::port)
            .collect();
        ports.sort_unstable();

        assert_eq!(ports, vec![1234, 5678]);
    }

    #[test]
    fn entries_expire_after_two_hours() {
        let mut store = TokenStore::new();
        let target = NodeID::random();
        let token = store.issue(&target, requester());
        store.announce(&target, peer(1234), requester(), &token);

        store.age_entry(&target, 3);

        assert_eq!(store.peers(&target), None);
    }

    #[test]
    fn cache_evicts_least_recently_used_at_capacity() {
        let mut store = TokenStore::new();
        let cold = NodeID::random();
        let token = store.issue(&cold, requester());
        store.announce(&cold, peer(1), requester(), &token);
        store.age_access(&cold, 30);

        for _ in 0..MAX_ENTRIES {
            let target = NodeID::random();
            let token = store.issue(&target, requester());
            store.announce(&target, peer(2), requester(), &token);
        }

        assert!(store.entries.len() <= MAX_ENTRIES);
        assert_eq!(store.peers(&cold), None);
    }

    #[test]
    fn store_item_requires_a_valid_token() {
        let mut store = TokenStore::new();
        let target = NodeID::random();
        let item = StorageItem::Immutable {
            value: b"value".to_vec(),
        };

        assert!(!store.store_item(&target, item.clone(), requester(), b"forged"));
        assert_eq!(store.item(&target), None);

        let token = store.issue(&target, requester());
        assert!(store.store_item(&target, item.clone(), requester(), &token));
        assert_eq!(store.item(&target), Some(item));
    }
}
