use crate::errors::{ErrorKind, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use krpc_encoding::{Addr, NodeID, NodeInfo};
use serde_derive::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// A contact stops counting as good 15 minutes after it was last heard
/// from.
const GOOD_WINDOW_MINUTES: i64 = 15;

/// Three consecutive unanswered queries make a contact bad.
const MAX_FAILED_RESPONSES: u32 = 3;

/// Liveness classification of a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Responded recently, or responded at some point and queried us
    /// recently.
    Good,

    /// Not heard from recently, but not written off either.
    Questionable,

    /// Failed to answer three queries in a row. First in line for
    /// replacement.
    Bad,
}

/// A contact in the routing table: identity, transport address, and the
/// liveness metadata eviction decisions are based on.
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeID,
    address: Addr,

    /// Write token this contact last issued us, if any.
    token: Option<Vec<u8>>,

    last_response: Option<DateTime<Utc>>,
    last_received_query: Option<DateTime<Utc>>,
    failed_responses: u32,
}

impl Node {
    pub fn new(id: NodeID, address: Addr) -> Node {
        Node {
            id,
            address,
            token: None,
            last_response: None,
            last_received_query: None,
            failed_responses: 0,
        }
    }

    pub fn id(&self) -> &NodeID {
        &self.id
    }

    pub fn address(&self) -> &Addr {
        &self.address
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo::new(self.id, self.address)
    }

    pub fn token(&self) -> Option<&Vec<u8>> {
        self.token.as_ref()
    }

    pub fn set_token(&mut self, token: Vec<u8>) {
        self.token = Some(token);
    }

    pub fn last_response(&self) -> Option<DateTime<Utc>> {
        self.last_response
    }

    /// Records a response from this contact, resetting the failure count.
    pub fn mark_response(&mut self) {
        self.last_response = Some(Utc::now());
        self.failed_responses = 0;
    }

    /// Records a query received from this contact.
    pub fn mark_query(&mut self) {
        self.last_received_query = Some(Utc::now());
    }

    /// Records a query this contact failed to answer.
    pub fn mark_failed(&mut self) {
        self.failed_responses += 1;
    }

    pub fn state(&self) -> NodeState {
        if self.failed_responses >= MAX_FAILED_RESPONSES {
            return NodeState::Bad;
        }

        let window = Duration::minutes(GOOD_WINDOW_MINUTES);
        let recently = |at: Option<DateTime<Utc>>| {
            at.map(|at| Utc::now() - at < window).unwrap_or(false)
        };

        match self.last_response {
            Some(..) if recently(self.last_response) || recently(self.last_received_query) => {
                NodeState::Good
            }
            _ => NodeState::Questionable,
        }
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot(
            self.id.to_hex(),
            self.address.ip().to_string(),
            self.address.port(),
            "ipv4".to_string(),
            self.token.as_ref().map(hex::encode),
            self.last_response.map(|at| at.timestamp()),
            self.last_received_query.map(|at| at.timestamp()),
            self.failed_responses,
        )
    }

    pub fn from_snapshot(snapshot: &NodeSnapshot) -> Result<Node> {
        let NodeSnapshot(
            id_hex,
            address,
            port,
            family,
            token_hex,
            last_response,
            last_received_query,
            failed_responses,
        ) = snapshot;

        if family != "ipv4" {
            Err(ErrorKind::UnsupportedFamily {
                family: family.clone(),
            })?;
        }

        let id = NodeID::from_hex(id_hex).map_err(|_| ErrorKind::MalformedSnapshot)?;
        let ip: Ipv4Addr = address.parse().map_err(|_| ErrorKind::MalformedSnapshot)?;
        let token = match token_hex {
            Some(token_hex) => {
                Some(hex::decode(token_hex).map_err(|_| ErrorKind::MalformedSnapshot)?)
            }
            None => None,
        };

        let timestamp = |seconds: &Option<i64>| -> Result<Option<DateTime<Utc>>> {
            match seconds {
                None => Ok(None),
                Some(seconds) => Ok(Some(
                    Utc.timestamp_opt(*seconds, 0)
                        .single()
                        .ok_or(ErrorKind::MalformedSnapshot)?,
                )),
            }
        };

        Ok(Node {
            id,
            address: Addr::new(ip, *port),
            token,
            last_response: timestamp(last_response)?,
            last_received_query: timestamp(last_received_query)?,
            failed_responses: *failed_responses,
        })
    }

    #[cfg(test)]
    pub(crate) fn age_last_response(&mut self, minutes: i64) {
        self.last_response = self
            .last_response
            .map(|at| at - Duration::minutes(minutes));
    }
}

/// Flat persisted form of a contact:
/// `(id_hex, address, port, family, token_hex?, last_response,
/// last_received_query, failed)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSnapshot(
    pub String,
    pub String,
    pub u16,
    pub String,
    pub Option<String>,
    pub Option<i64>,
    pub Option<i64>,
    pub u32,
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample() -> Node {
        Node::new(
            NodeID::random(),
            Addr::new(Ipv4Addr::new(10, 0, 0, 1), 6881),
        )
    }

    #[test]
    fn fresh_contact_is_questionable() {
        assert_eq!(sample().state(), NodeState::Questionable);
    }

    #[test]
    fn responding_contact_is_good() {
        let mut node = sample();
        node.mark_response();

        assert_eq!(node.state(), NodeState::Good);
    }

    #[test]
    fn queries_alone_do_not_make_a_contact_good() {
        let mut node = sample();
        node.mark_query();

        assert_eq!(node.state(), NodeState::Questionable);
    }

    #[test]
    fn old_response_with_recent_query_is_good() {
        let mut node = sample();
        node.mark_response();
        node.age_last_response(20);
        node.mark_query();

        assert_eq!(node.state(), NodeState::Good);
    }

    #[test]
    fn stale_response_is_questionable() {
        let mut node = sample();
        node.mark_response();
        node.age_last_response(20);

        assert_eq!(node.state(), NodeState::Questionable);
    }

    #[test]
    fn three_failures_make_a_contact_bad() {
        let mut node = sample();
        node.mark_response();
        node.mark_failed();
        node.mark_failed();
        assert_eq!(node.state(), NodeState::Questionable);

        node.mark_failed();
        assert_eq!(node.state(), NodeState::Bad);
    }

    #[test]
    fn response_resets_the_failure_count() {
        let mut node = sample();
        node.mark_failed();
        node.mark_failed();
        node.mark_failed();
        node.mark_response();

        assert_eq!(node.state(), NodeState::Good);
    }

    #[test]
    fn snapshot_round_trip() {
        let mut node = sample();
        node.mark_response();
        node.mark_query();
        node.mark_failed();
        node.set_token(vec![1, 2, 3]);

        let restored = Node::from_snapshot(&node.snapshot()).unwrap();

        assert_eq!(restored.id(), node.id());
        assert_eq!(restored.address(), node.address());
        assert_eq!(restored.token(), node.token());
        assert_eq!(restored.failed_responses, node.failed_responses);
        assert_eq!(
            restored.last_response.map(|at| at.timestamp()),
            node.last_response.map(|at| at.timestamp())
        );
    }

    #[test]
    fn snapshot_rejects_unknown_family() {
        let mut snapshot = sample().snapshot();
        snapshot.3 = "ipv6".to_string();

        assert!(Node::from_snapshot(&snapshot).is_err());
    }
}
