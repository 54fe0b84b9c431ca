//! The iterative closest-node walk feeding every operation that reaches
//! beyond the local routing table.
//!
//! The walk keeps a K-slot set of the closest nodes seen so far and a
//! selector of in-flight sub-queries. Every response may narrow the search
//! radius and every advertised node closer than the current radius is
//! dispatched immediately; errors and timeouts only contribute their
//! absence. An optional predicate can end the walk early with a value.

use futures::stream::{FuturesUnordered, StreamExt};
use krpc_encoding::{Addr, NodeID, NodeInfo, Query, Response};
use log::debug;
use num_bigint::BigUint;
use routing_table::{PingProber, RoutingTable};
use std::collections::HashSet;
use std::future::Future;
use tokio::sync::Mutex;
use tokio_krpc::SendTransport;

/// Which query the walk fans out with.
pub(crate) enum LookupMethod {
    FindNode,
    GetPeers,
    Get,
}

impl LookupMethod {
    fn query(&self, id: NodeID, target: NodeID) -> Query {
        match self {
            LookupMethod::FindNode => Query::FindNode { id, target },
            LookupMethod::GetPeers => Query::GetPeers {
                id,
                info_hash: target,
            },
            LookupMethod::Get => Query::Get { id, target },
        }
    }
}

/// A node the walk has seen, with the write token it handed us, if any.
pub(crate) struct LookupNode {
    pub info: NodeInfo,
    pub token: Option<Vec<u8>>,
}

pub(crate) struct LookupOutcome<T> {
    /// First non-null value the predicate produced, if the walk ended
    /// early.
    pub found: Option<T>,

    /// The closest-K set at the end of the walk, nearest first.
    pub closest: Vec<LookupNode>,
}

/// Fixed-capacity set of the closest nodes, kept as a small sorted vector.
pub(crate) struct ClosestSet {
    target: NodeID,
    capacity: usize,
    entries: Vec<(BigUint, LookupNode)>,
}

impl ClosestSet {
    pub(crate) fn new(target: NodeID, capacity: usize) -> ClosestSet {
        ClosestSet {
            target,
            capacity,
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Whether a node at `distance` would make the set. While the set is
    /// not full the radius is unbounded.
    pub(crate) fn admits(&self, distance: &BigUint) -> bool {
        if self.entries.len() < self.capacity {
            return true;
        }

        match self.entries.last() {
            Some((max, _)) => distance < max,
            None => true,
        }
    }

    pub(crate) fn insert(&mut self, info: NodeInfo, token: Option<Vec<u8>>) {
        if let Some((_, existing)) = self
            .entries
            .iter_mut()
            .find(|(_, existing)| existing.info.id == info.id)
        {
            if token.is_some() {
                existing.token = token;
            }
            return;
        }

        let distance = self.target.distance_to(&info.id);
        if !self.admits(&distance) {
            return;
        }

        let position = self
            .entries
            .iter()
            .position(|(entry_distance, _)| *entry_distance > distance)
            .unwrap_or(self.entries.len());
        self.entries
            .insert(position, (distance, LookupNode { info, token }));
        self.entries.truncate(self.capacity);
    }

    pub(crate) fn into_nodes(self) -> Vec<LookupNode> {
        self.entries.into_iter().map(|(_, node)| node).collect()
    }
}

/// Borrowed view of the node internals a walk needs.
pub(crate) struct LookupEngine<'a> {
    pub id: NodeID,
    pub k: usize,
    pub transport: &'a SendTransport,
    pub table: &'a Mutex<RoutingTable>,
    pub prober: &'a dyn PingProber,
}

impl<'a> LookupEngine<'a> {
    /// Walks toward `target`, calling `on_response` for every real
    /// response. A non-null return cancels outstanding work and ends the
    /// walk immediately.
    pub(crate) async fn run<T, F>(
        &self,
        target: NodeID,
        method: LookupMethod,
        mut on_response: F,
    ) -> LookupOutcome<T>
    where
        F: FnMut(&Response, &NodeInfo) -> Option<T>,
    {
        let mut closest = ClosestSet::new(target, self.k);
        let mut seen: HashSet<(NodeID, Addr)> = HashSet::new();
        let mut pending = FuturesUnordered::new();

        let seeds = { self.table.lock().await.closest(&target, self.k) };
        for info in seeds {
            seen.insert((info.id, info.address));
            closest.insert(info, None);
            pending.push(query_one(self.transport, &method, self.id, target, info));
        }

        while let Some((info, result)) = pending.next().await {
            let response = match result {
                Ok(response) => response,
                Err(error) => {
                    debug!("lookup sub-query to {} failed: {}", info.address, error);
                    // Only silence and remote-signalled errors count against
                    // the contact; local failures say nothing about it.
                    if error.is_non_response() {
                        self.table.lock().await.record_no_response(&info.id);
                    }
                    continue;
                }
            };

            {
                let mut table = self.table.lock().await;
                table.record_response(info, self.prober).await;
                if let Some(token) = &response.token {
                    table.update_token(&info.id, token.to_vec());
                }
            }

            if let Some(found) = on_response(&response, &info) {
                return LookupOutcome {
                    found: Some(found),
                    closest: closest.into_nodes(),
                };
            }

            closest.insert(info, response.token.as_ref().map(|token| token.to_vec()));

            if let Some(nodes) = &response.nodes {
                for candidate in nodes {
                    let key = (candidate.id, candidate.address);
                    if seen.contains(&key) {
                        continue;
                    }
                    if !closest.admits(&target.distance_to(&candidate.id)) {
                        continue;
                    }

                    seen.insert(key);
                    pending.push(query_one(
                        self.transport,
                        &method,
                        self.id,
                        target,
                        *candidate,
                    ));
                }
            }
        }

        LookupOutcome {
            found: None,
            closest: closest.into_nodes(),
        }
    }
}

fn query_one<'a>(
    transport: &'a SendTransport,
    method: &LookupMethod,
    id: NodeID,
    target: NodeID,
    info: NodeInfo,
) -> impl Future<Output = (NodeInfo, tokio_krpc::errors::Result<Response>)> + 'a {
    let query = method.query(id, target);

    async move {
        let result = transport.request(info.address.into(), query).await;
        (info, result)
    }
}
