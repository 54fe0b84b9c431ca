use crate::node::Node;
use chrono::{DateTime, Utc};
use krpc_encoding::{NodeID, NODE_ID_LEN};
use num_bigint::{BigUint, RandBigInt};

/// A contiguous slice `[start, end)` of the ID space holding up to `k`
/// contacts.
pub struct Bucket {
    /// Inclusive lower bound of the covered range.
    pub(crate) start: BigUint,

    /// Exclusive upper bound of the covered range. The last bucket ends at
    /// 2^160.
    pub(crate) end: BigUint,

    nodes: Vec<Node>,
    last_changed: DateTime<Utc>,
    k: usize,
}

impl Bucket {
    /// The single bucket covering the entire ID space.
    pub fn initial_bucket(k: usize) -> Bucket {
        Bucket {
            start: BigUint::from(0u8),
            end: BigUint::from(1u8) << (NODE_ID_LEN * 8),
            nodes: Vec::with_capacity(k),
            last_changed: Utc::now(),
            k,
        }
    }

    pub fn could_hold_node(&self, id: &NodeID) -> bool {
        let value = id.to_biguint();
        self.start <= value && value < self.end
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.k
    }

    pub fn get(&self, id: &NodeID) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id() == id)
    }

    pub fn get_mut(&mut self, id: &NodeID) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|node| node.id() == id)
    }

    /// Adds a node. The caller has already checked capacity.
    pub fn add_node(&mut self, node: Node) {
        debug_assert!(!self.is_full());
        debug_assert!(self.could_hold_node(node.id()));

        self.nodes.push(node);
        self.touch();
    }

    /// Swaps out the contact with `id` for `node`.
    pub fn replace_node(&mut self, id: &NodeID, node: Node) {
        if let Some(position) = self.nodes.iter().position(|existing| existing.id() == id) {
            self.nodes[position] = node;
            self.touch();
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn touch(&mut self) {
        self.last_changed = Utc::now();
    }

    pub fn last_changed(&self) -> DateTime<Utc> {
        self.last_changed
    }

    /// Splits off the upper half of this bucket's range, keeping the lower
    /// half here and redistributing contacts by ID. Fails when the range is
    /// a single ID wide.
    pub fn split(&mut self) -> Option<Bucket> {
        let midpoint = (&self.start + &self.end) >> 1u32;
        if midpoint == self.start || midpoint == self.end {
            return None;
        }

        let mut upper = Bucket {
            start: midpoint.clone(),
            end: std::mem::replace(&mut self.end, midpoint),
            nodes: Vec::with_capacity(self.k),
            last_changed: self.last_changed,
            k: self.k,
        };

        let (keep, moved) = std::mem::take(&mut self.nodes)
            .into_iter()
            .partition(|node| self.could_hold_node(node.id()));
        self.nodes = keep;
        upper.nodes = moved;

        Some(upper)
    }

    /// A node ID drawn uniformly from this bucket's range, used as a
    /// refresh target.
    pub fn random_id(&self) -> NodeID {
        let value = rand::thread_rng().gen_biguint_range(&self.start, &self.end);
        NodeID::from_biguint(&value).expect("bucket ranges stay within the ID space")
    }

    #[cfg(test)]
    pub(crate) fn age(&mut self, minutes: i64) {
        self.last_changed = self.last_changed - chrono::Duration::minutes(minutes);
    }
}
