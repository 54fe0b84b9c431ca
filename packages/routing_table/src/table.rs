use crate::bucket::Bucket;
use crate::errors::Result;
use crate::node::{Node, NodeSnapshot, NodeState};
use crate::prober::PingProber;
use chrono::{Duration as Age, Utc};
use krpc_encoding::{NodeID, NodeInfo};
use log::debug;
use std::cmp;
use std::time::Duration;
use tokio::time;

/// Bucket capacity unless configured otherwise.
pub const DEFAULT_K: usize = 8;

/// How many contacts [`RoutingTable::closest`] returns unless asked
/// otherwise.
pub const DEFAULT_CLOSEST: usize = 10;

/// Deadline imposed on each eviction probe, independent of the prober.
const PING_DEADLINE: Duration = Duration::from_secs(5);

/// Buckets unchanged for this long want a refresh lookup.
const REFRESH_AFTER_MINUTES: i64 = 15;

/// How a contact interaction reached us, deciding which liveness timestamp
/// it updates.
enum Interaction {
    Response,
    Query,
}

pub struct RoutingTable {
    /// Node identifier of the node which the table is based around. There
    /// will be more buckets closer to this identifier.
    id: NodeID,

    /// Ordered list of buckets covering the key space. The first bucket
    /// starts at key 0 and the last bucket ends at key 2^160.
    buckets: Vec<Bucket>,

    k: usize,
}

impl RoutingTable {
    pub fn new(id: NodeID) -> RoutingTable {
        RoutingTable::with_k(id, DEFAULT_K)
    }

    pub fn with_k(id: NodeID, k: usize) -> RoutingTable {
        RoutingTable {
            id,
            buckets: vec![Bucket::initial_bucket(k)],
            k,
        }
    }

    pub fn id(&self) -> &NodeID {
        &self.id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Records a response received from `contact`, inserting it if it is
    /// new. A full bucket may trigger eviction probes through `prober`.
    pub async fn record_response(&mut self, contact: NodeInfo, prober: &dyn PingProber) {
        self.insert(contact, Interaction::Response, prober).await;
    }

    /// Records a query received from `contact`, inserting it if it is new.
    pub async fn record_query(&mut self, contact: NodeInfo, prober: &dyn PingProber) {
        self.insert(contact, Interaction::Query, prober).await;
    }

    /// Counts a query `id` failed to answer. Unknown contacts are ignored.
    pub fn record_no_response(&mut self, id: &NodeID) {
        let idx = self.get_bucket_idx(id);
        if let Some(node) = self.buckets[idx].get_mut(id) {
            node.mark_failed();
        }
    }

    /// Remembers the write token `id` last issued us.
    pub fn update_token(&mut self, id: &NodeID, token: Vec<u8>) {
        let idx = self.get_bucket_idx(id);
        if let Some(node) = self.buckets[idx].get_mut(id) {
            node.set_token(token);
        }
    }

    async fn insert(&mut self, contact: NodeInfo, interaction: Interaction, prober: &dyn PingProber) {
        if contact.id == self.id {
            return;
        }

        loop {
            let idx = self.get_bucket_idx(&contact.id);

            if let Some(existing) = self.buckets[idx].get_mut(&contact.id) {
                match interaction {
                    Interaction::Response => existing.mark_response(),
                    Interaction::Query => existing.mark_query(),
                }
                self.buckets[idx].touch();
                return;
            }

            if !self.buckets[idx].is_full() {
                let node = self.new_node(&contact, &interaction);
                self.buckets[idx].add_node(node);
                return;
            }

            if self.buckets[idx].could_hold_node(&self.id) && self.split_bucket(idx) {
                continue;
            }

            let node = self.new_node(&contact, &interaction);
            self.evict_and_insert(idx, node, prober).await;
            return;
        }
    }

    fn new_node(&self, contact: &NodeInfo, interaction: &Interaction) -> Node {
        let mut node = Node::new(contact.id, contact.address);
        match interaction {
            Interaction::Response => node.mark_response(),
            Interaction::Query => node.mark_query(),
        }
        node
    }

    /// Applies the eviction policy to a full bucket: a bad contact is
    /// replaced outright; otherwise questionable contacts are probed
    /// stalest-first and the first to miss the deadline is replaced; a
    /// bucket of good contacts discards the newcomer.
    async fn evict_and_insert(&mut self, idx: usize, node: Node, prober: &dyn PingProber) {
        let bad_id = self.buckets[idx]
            .nodes()
            .iter()
            .find(|existing| existing.state() == NodeState::Bad)
            .map(|existing| *existing.id());

        if let Some(bad_id) = bad_id {
            debug!("replacing bad contact {} with {}", bad_id, node.id());
            self.buckets[idx].replace_node(&bad_id, node);
            return;
        }

        let mut candidates: Vec<_> = self.buckets[idx]
            .nodes()
            .iter()
            .filter(|existing| existing.state() == NodeState::Questionable)
            .map(|existing| (existing.last_response(), *existing.id()))
            .collect();

        if candidates.is_empty() {
            debug!("discarding {}: bucket is full of good contacts", node.id());
            return;
        }

        candidates.sort();

        for (_, candidate_id) in candidates {
            let target = match self.buckets[idx].get(&candidate_id) {
                Some(candidate) => candidate.info(),
                None => continue,
            };

            let alive = matches!(
                time::timeout(PING_DEADLINE, prober.ping(&target)).await,
                Ok(true)
            );

            if alive {
                if let Some(candidate) = self.buckets[idx].get_mut(&candidate_id) {
                    candidate.mark_response();
                }
            } else {
                debug!(
                    "replacing unresponsive contact {} with {}",
                    candidate_id,
                    node.id()
                );
                self.buckets[idx].replace_node(&candidate_id, node);
                return;
            }
        }

        debug!(
            "discarding {}: every questionable contact answered its probe",
            node.id()
        );
    }

    /// Finds the `n` contacts closest to `target` by XOR distance.
    pub fn closest(&self, target: &NodeID, n: usize) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.nodes().iter().map(Node::info))
            .collect();

        nodes.sort_by_key(|node| target.distance_to(&node.id));
        nodes.truncate(n);
        nodes
    }

    /// One refresh target per bucket which has gone stale: a random ID
    /// inside the bucket's range, for the host to `find_node`.
    pub fn refresh_targets(&self) -> Vec<NodeID> {
        let cutoff = Utc::now() - Age::minutes(REFRESH_AFTER_MINUTES);

        self.buckets
            .iter()
            .filter(|bucket| bucket.last_changed() < cutoff)
            .map(Bucket::random_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.nodes().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Drops every contact and collapses the trie back to a single bucket,
    /// as part of node teardown.
    pub fn clear(&mut self) {
        self.buckets = vec![Bucket::initial_bucket(self.k)];
    }

    /// All contacts, in bucket order.
    pub fn nodes(&self) -> Vec<Node> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.nodes().iter().cloned())
            .collect()
    }

    /// Flat persisted form of every contact.
    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.nodes().iter().map(Node::snapshot))
            .collect()
    }

    /// Reinserts persisted contacts through the normal insert path,
    /// preserving their liveness metadata. Restoring never probes: a full
    /// bucket only gives up a bad contact.
    pub fn restore(&mut self, snapshots: &[NodeSnapshot]) -> Result<usize> {
        let mut restored = 0;

        for snapshot in snapshots {
            let node = Node::from_snapshot(snapshot)?;
            if self.insert_restored(node) {
                restored += 1;
            }
        }

        Ok(restored)
    }

    fn insert_restored(&mut self, node: Node) -> bool {
        if *node.id() == self.id {
            return false;
        }

        loop {
            let idx = self.get_bucket_idx(node.id());

            if self.buckets[idx].get(node.id()).is_some() {
                return false;
            }

            if !self.buckets[idx].is_full() {
                self.buckets[idx].add_node(node);
                return true;
            }

            if self.buckets[idx].could_hold_node(&self.id) && self.split_bucket(idx) {
                continue;
            }

            let bad_id = self.buckets[idx]
                .nodes()
                .iter()
                .find(|existing| existing.state() == NodeState::Bad)
                .map(|existing| *existing.id());

            return match bad_id {
                Some(bad_id) => {
                    self.buckets[idx].replace_node(&bad_id, node);
                    true
                }
                None => false,
            };
        }
    }

    /// Gets the index of the bucket which can hold `id`.
    fn get_bucket_idx(&self, id: &NodeID) -> usize {
        let value = id.to_biguint();

        self.buckets
            .binary_search_by(|bucket| {
                if bucket.could_hold_node(id) {
                    cmp::Ordering::Equal
                } else {
                    bucket.start.cmp(&value)
                }
            })
            .expect("bucket ranges partition the ID space")
    }

    /// Splits the bucket at `idx` into two buckets. Returns `false` when
    /// the range is too narrow to split.
    fn split_bucket(&mut self, idx: usize) -> bool {
        match self.buckets[idx].split() {
            Some(upper) => {
                self.buckets.insert(idx + 1, upper);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn age_buckets(&mut self, minutes: i64) {
        for bucket in &mut self.buckets {
            bucket.age(minutes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::{self, BoxFuture, FutureExt};
    use krpc_encoding::Addr;
    use num_bigint::BigUint;
    use std::net::Ipv4Addr;

    struct ScriptedProber {
        alive: bool,
    }

    impl PingProber for ScriptedProber {
        fn ping(&self, _target: &NodeInfo) -> BoxFuture<'static, bool> {
            future::ready(self.alive).boxed()
        }
    }

    struct PanicProber;

    impl PingProber for PanicProber {
        fn ping(&self, target: &NodeInfo) -> BoxFuture<'static, bool> {
            panic!("unexpected probe of {:?}", target);
        }
    }

    fn contact(prefix: u8, low: u8) -> NodeInfo {
        let mut bytes = [0u8; 20];
        bytes[0] = prefix;
        bytes[19] = low;
        NodeInfo::new(
            NodeID::new(bytes),
            Addr::new(Ipv4Addr::new(10, 0, prefix, low), 6881),
        )
    }

    fn own_id() -> NodeID {
        NodeID::new([0u8; 20])
    }

    #[tokio::test]
    async fn buckets_partition_the_id_space() {
        let mut table = RoutingTable::with_k(own_id(), 2);

        for prefix in 0..32u8 {
            table
                .record_response(contact(prefix.wrapping_mul(8), prefix), &PanicProber)
                .await;
        }

        assert_eq!(table.buckets[0].start, BigUint::from(0u8));
        assert_eq!(
            table.buckets.last().unwrap().end,
            BigUint::from(1u8) << 160
        );
        for pair in table.buckets.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }

        for bucket in &table.buckets {
            for node in bucket.nodes() {
                assert!(bucket.could_hold_node(node.id()));
            }
        }
    }

    #[tokio::test]
    async fn table_splits_around_the_local_id() {
        let mut table = RoutingTable::with_k(own_id(), 2);

        for low in 0..8u8 {
            table.record_response(contact(0, low + 1), &PanicProber).await;
        }

        assert!(table.bucket_count() > 1);
        assert!(table.len() > 2);
    }

    #[tokio::test]
    async fn own_id_is_never_inserted() {
        let mut table = RoutingTable::new(own_id());
        let own = NodeInfo::new(own_id(), Addr::new(Ipv4Addr::new(127, 0, 0, 1), 6881));

        table.record_response(own, &PanicProber).await;

        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn bad_contact_is_replaced_without_probing() {
        let mut table = RoutingTable::with_k(own_id(), 1);
        let stale = contact(0x80, 1);
        let fresh = contact(0x81, 2);

        table.record_response(stale, &PanicProber).await;
        table.record_no_response(&stale.id);
        table.record_no_response(&stale.id);
        table.record_no_response(&stale.id);

        table.record_response(fresh, &PanicProber).await;

        let closest = table.closest(&fresh.id, 8);
        assert!(closest.contains(&fresh));
        assert!(!closest.contains(&stale));
    }

    #[tokio::test]
    async fn questionable_contact_survives_a_successful_probe() {
        let mut table = RoutingTable::with_k(own_id(), 1);
        let sitting = contact(0x80, 6);
        let newcomer = contact(0x81, 3);

        table.record_query(sitting, &PanicProber).await;
        table
            .record_response(newcomer, &ScriptedProber { alive: true })
            .await;

        let closest = table.closest(&sitting.id, 8);
        assert!(closest.contains(&sitting));
        assert!(!closest.contains(&newcomer));
    }

    #[tokio::test]
    async fn questionable_contact_is_evicted_after_a_failed_probe() {
        let mut table = RoutingTable::with_k(own_id(), 1);
        let sitting = contact(0x80, 6);
        let newcomer = contact(0x81, 3);

        table.record_query(sitting, &PanicProber).await;
        table
            .record_response(newcomer, &ScriptedProber { alive: false })
            .await;

        let closest = table.closest(&sitting.id, 8);
        assert!(closest.contains(&newcomer));
        assert!(!closest.contains(&sitting));
    }

    #[tokio::test]
    async fn full_bucket_of_good_contacts_discards_newcomers() {
        let mut table = RoutingTable::with_k(own_id(), 1);
        let sitting = contact(0x80, 6);
        let newcomer = contact(0x81, 3);

        table.record_response(sitting, &PanicProber).await;
        table
            .record_response(newcomer, &ScriptedProber { alive: true })
            .await;

        let closest = table.closest(&newcomer.id, 8);
        assert!(closest.contains(&sitting));
        assert!(!closest.contains(&newcomer));
    }

    #[tokio::test]
    async fn closest_orders_by_distance() {
        let mut table = RoutingTable::new(own_id());
        for prefix in 1..16u8 {
            table.record_response(contact(prefix, prefix), &PanicProber).await;
        }

        let target = contact(3, 3).id;
        let closest = table.closest(&target, 4);

        assert_eq!(closest.len(), 4);
        for pair in closest.windows(2) {
            assert!(target.distance_to(&pair[0].id) <= target.distance_to(&pair[1].id));
        }
        assert_eq!(closest[0].id, target);
    }

    #[tokio::test]
    async fn stale_buckets_produce_refresh_targets() {
        let mut table = RoutingTable::new(own_id());
        table.record_response(contact(0x40, 1), &PanicProber).await;

        assert!(table.refresh_targets().is_empty());

        table.age_buckets(16);
        let targets = table.refresh_targets();

        assert_eq!(targets.len(), table.bucket_count());
    }

    #[tokio::test]
    async fn snapshot_restores_through_the_insert_path() {
        let mut table = RoutingTable::with_k(own_id(), 4);
        for prefix in 1..10u8 {
            table.record_response(contact(prefix * 16, prefix), &PanicProber).await;
        }
        table.update_token(&contact(16, 1).id, vec![9, 9, 9]);

        let snapshot = table.snapshot();
        let mut restored = RoutingTable::with_k(own_id(), 4);
        let count = restored.restore(&snapshot).unwrap();

        assert_eq!(count, table.len());
        assert_eq!(restored.len(), table.len());

        let with_token = restored
            .nodes()
            .into_iter()
            .find(|node| *node.id() == contact(16, 1).id)
            .unwrap();
        assert_eq!(with_token.token(), Some(&vec![9, 9, 9]));
    }
}
