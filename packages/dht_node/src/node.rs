use crate::errors::{ErrorKind, Result};
use crate::lookup::{LookupEngine, LookupMethod};
use crate::state::DhtState;
use crate::storage::{
    self, check_salt, check_value, immutable_target, mutable_target, validate_immutable,
    MutableItem, MutableUpdate, StorageItem,
};
use crate::token_store::TokenStore;
use ed25519_dalek::SigningKey;
use failure::ResultExt;
use futures::channel::mpsc;
use futures::future::{join_all, BoxFuture, FutureExt};
use futures::StreamExt;
use krpc_encoding::{
    error_code, Addr, KRPCError, NodeID, NodeInfo, Query, Response,
};
use log::{debug, warn};
use routing_table::{PingProber, RoutingTable, DEFAULT_CLOSEST, DEFAULT_K};
use serde_bytes::ByteBuf;
use std::convert::TryFrom;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_krpc::{
    ActiveTransactions, InboundQuery, PortType, PutMutableArgs, RecvTransport, SendTransport,
    DEFAULT_QUERY_TIMEOUT,
};

const ROTATE_INTERVAL: Duration = Duration::from_secs(10 * 60);
const REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Node configuration.
pub struct Config {
    /// Own node ID. A random one is drawn when unset; hosts that know
    /// their public address can derive one with [`crate::bep42::node_id_for_ip`].
    pub id: Option<NodeID>,

    /// Bucket capacity.
    pub k: usize,

    /// Bind address. Port 0 binds an ephemeral port.
    pub address: SocketAddrV4,

    /// Peers pinged at startup to seed the routing table.
    pub bootstrap: Vec<SocketAddr>,

    /// Per-query timeout. Zero disables it.
    pub query_timeout: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            id: None,
            k: DEFAULT_K,
            address: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 6881),
            bootstrap: Vec::new(),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

/// Probes contacts through the node's own transport, giving the routing
/// table a way to check liveness during eviction.
struct TransportProber {
    id: NodeID,
    transport: Arc<SendTransport>,
}

impl PingProber for TransportProber {
    fn ping(&self, target: &NodeInfo) -> BoxFuture<'static, bool> {
        let transport = self.transport.clone();
        let id = self.id;
        let address: SocketAddr = target.address.into();

        async move { transport.ping(id, address).await.is_ok() }.boxed()
    }
}

struct Inner {
    id: NodeID,
    k: usize,
    local_addr: SocketAddrV4,
    transport: Arc<SendTransport>,
    transactions: ActiveTransactions,
    table: Mutex<RoutingTable>,
    store: StdMutex<TokenStore>,
    prober: TransportProber,
}

/// A DHT node: one UDP socket, a routing table, the four base queries and
/// both extensions.
pub struct Dht {
    inner: Arc<Inner>,
    tasks: Vec<JoinHandle<()>>,
}

impl Dht {
    /// Binds the socket, starts the receive and maintenance tasks, pings
    /// the bootstrap peers and runs a lookup for the node's own ID.
    pub async fn listen(config: Config) -> Result<Dht> {
        let id = config.id.unwrap_or_else(NodeID::random);

        let recv = RecvTransport::bind(SocketAddr::V4(config.address))
            .await
            .context(ErrorKind::BindError)?;
        let local_addr = match recv.local_addr().context(ErrorKind::BindError)? {
            SocketAddr::V4(local_addr) => local_addr,
            SocketAddr::V6(..) => Err(ErrorKind::BindError)?,
        };

        let transport = Arc::new(recv.send_transport(config.query_timeout));
        let transactions = recv.transactions();
        let (queries, recv_handle) = recv.serve();

        let inner = Arc::new(Inner {
            id,
            k: config.k,
            local_addr,
            transport: transport.clone(),
            transactions,
            table: Mutex::new(RoutingTable::with_k(id, config.k)),
            store: StdMutex::new(TokenStore::new()),
            prober: TransportProber { id, transport },
        });

        let dispatch_handle = tokio::spawn(dispatch_queries(inner.clone(), queries));
        let maintenance_handle = tokio::spawn(run_maintenance(inner.clone()));

        let dht = Dht {
            inner,
            tasks: vec![recv_handle, dispatch_handle, maintenance_handle],
        };

        dht.bootstrap(&config.bootstrap).await;

        Ok(dht)
    }

    pub fn id(&self) -> &NodeID {
        &self.inner.id
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.inner.local_addr
    }

    async fn bootstrap(&self, peers: &[SocketAddr]) {
        for &address in peers {
            match self.inner.transport.ping(self.inner.id, address).await {
                Ok(responder) => {
                    if let SocketAddr::V4(v4) = address {
                        let contact =
                            NodeInfo::new(responder, Addr::new(*v4.ip(), v4.port()));
                        self.inner
                            .table
                            .lock()
                            .await
                            .record_response(contact, &self.inner.prober)
                            .await;
                    }
                }
                Err(cause) => debug!("bootstrap ping of {} failed: {}", address, cause),
            }
        }

        if !peers.is_empty() {
            self.inner.find_node(self.inner.id).await;
        }
    }

    /// Single liveness probe of one peer.
    pub async fn ping(&self, address: SocketAddr) -> Result<NodeID> {
        let responder = self
            .inner
            .transport
            .ping(self.inner.id, address)
            .await
            .context(ErrorKind::TransportError)?;

        if let SocketAddr::V4(v4) = address {
            let contact = NodeInfo::new(responder, Addr::new(*v4.ip(), v4.port()));
            self.inner
                .table
                .lock()
                .await
                .record_response(contact, &self.inner.prober)
                .await;
        }

        Ok(responder)
    }

    /// Iterative lookup for the nodes closest to `target` across the
    /// network.
    pub async fn find_node(&self, target: NodeID) -> Vec<NodeInfo> {
        self.inner.find_node(target).await
    }

    /// Collects peers announced for `info_hash`, local announcements
    /// included.
    pub async fn get_peers(&self, info_hash: NodeID) -> Vec<Addr> {
        self.inner.get_peers(info_hash).await
    }

    /// Announces this peer for `info_hash` to the closest writable nodes.
    /// `port: None` advertises the node's own UDP port via `implied_port`.
    /// Returns how many nodes accepted the announce.
    pub async fn announce_peer(&self, info_hash: NodeID, port: Option<u16>) -> usize {
        self.inner.announce(info_hash, port).await
    }

    /// Fetches a stored value by raw target.
    pub async fn get(&self, target: NodeID) -> Option<StorageItem> {
        self.inner.get_item(target, None).await
    }

    /// Fetches a mutable value by public key and optional salt.
    pub async fn get_mutable(
        &self,
        public_key: &[u8; storage::PUBLIC_KEY_LEN],
        salt: Option<Vec<u8>>,
    ) -> Result<Option<StorageItem>> {
        check_salt(salt.as_deref())?;
        let target = mutable_target(public_key, salt.as_deref());

        Ok(self.inner.get_item(target, salt).await)
    }

    /// Stores an immutable value on the closest writable nodes and returns
    /// its target.
    pub async fn put_immutable(&self, value: Vec<u8>) -> Result<NodeID> {
        self.inner.put_immutable(value).await
    }

    /// Stores a mutable value. `update` sees the most recent record the
    /// collecting lookup observed, if any, and decides the next value and
    /// sequence number; the node signs and fans the record out.
    pub async fn put_mutable<F>(
        &self,
        signing_key: &SigningKey,
        salt: Option<Vec<u8>>,
        update: F,
    ) -> Result<NodeID>
    where
        F: FnOnce(Option<&MutableItem>) -> MutableUpdate,
    {
        self.inner.put_mutable(signing_key, salt, update).await
    }

    /// The closest contacts to `id` in the local table only.
    pub async fn closest_nodes(&self, id: NodeID, n: Option<usize>) -> Vec<NodeInfo> {
        self.inner
            .table
            .lock()
            .await
            .closest(&id, n.unwrap_or(DEFAULT_CLOSEST))
    }

    /// Writes the state document for a later [`Dht::load`].
    pub async fn save(&self, path: &Path) -> Result<()> {
        let state = {
            let table = self.inner.table.lock().await;
            DhtState {
                k: table.k(),
                id: self.inner.id.to_hex(),
                nodes: table.snapshot(),
            }
        };

        state.save(path)
    }

    /// Reinserts contacts from a state document through the normal insert
    /// path. Returns how many made it into the table.
    pub async fn load(&self, path: &Path) -> Result<usize> {
        let state = DhtState::load(path)?;

        Ok(self
            .inner
            .table
            .lock()
            .await
            .restore(&state.nodes)
            .map_err(|_| ErrorKind::MalformedState)?)
    }

    /// Tears the node down: stops the socket and maintenance tasks,
    /// rejects every outstanding transaction with a disposal error and
    /// empties the routing table.
    pub async fn dispose(self) {
        for task in &self.tasks {
            task.abort();
        }

        self.inner.transactions.cancel_all();
        self.inner.table.lock().await.clear();
    }
}

impl Drop for Dht {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }

        self.inner.transactions.cancel_all();
    }
}

impl Inner {
    fn engine(&self) -> LookupEngine<'_> {
        LookupEngine {
            id: self.id,
            k: self.k,
            transport: &self.transport,
            table: &self.table,
            prober: &self.prober,
        }
    }

    fn store(&self) -> std::sync::MutexGuard<'_, TokenStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn find_node(&self, target: NodeID) -> Vec<NodeInfo> {
        let outcome = self
            .engine()
            .run(target, LookupMethod::FindNode, |_, _| None::<()>)
            .await;

        outcome.closest.into_iter().map(|node| node.info).collect()
    }

    async fn get_peers(&self, info_hash: NodeID) -> Vec<Addr> {
        let mut peers: Vec<Addr> = self.store().peers(&info_hash).unwrap_or_default();

        self.engine()
            .run(info_hash, LookupMethod::GetPeers, |response, _| {
                if let Some(values) = &response.values {
                    peers.extend(values.iter().copied());
                }
                None::<()>
            })
            .await;

        peers.sort_by_key(|peer| (peer.ip().octets(), peer.port()));
        peers.dedup();
        peers
    }

    async fn announce(&self, info_hash: NodeID, port: Option<u16>) -> usize {
        let outcome = self
            .engine()
            .run(info_hash, LookupMethod::GetPeers, |_, _| None::<()>)
            .await;

        let announces: Vec<_> = outcome
            .closest
            .iter()
            .filter_map(|node| {
                let token = node.token.clone()?;
                let port_type = match port {
                    Some(port) => PortType::Port(port),
                    None => PortType::Implied,
                };

                Some(self.transport.announce_peer(
                    self.id,
                    node.info.address.into(),
                    info_hash,
                    token,
                    port_type,
                ))
            })
            .collect();

        join_all(announces)
            .await
            .into_iter()
            .filter(std::result::Result::is_ok)
            .count()
    }

    async fn get_item(&self, target: NodeID, salt: Option<Vec<u8>>) -> Option<StorageItem> {
        if let Some(item) = self.store().item(&target) {
            return Some(item);
        }

        let outcome = self
            .engine()
            .run(target, LookupMethod::Get, |response, _| {
                validate_get_response(response, &target, salt.as_deref())
            })
            .await;

        outcome.found
    }

    async fn put_immutable(&self, value: Vec<u8>) -> Result<NodeID> {
        check_value(&value)?;
        let target = immutable_target(&value);

        let outcome = self
            .engine()
            .run(target, LookupMethod::Get, |_, _| None::<()>)
            .await;

        let v = ByteBuf::from(value);
        let writes: Vec<_> = outcome
            .closest
            .iter()
            .filter_map(|node| {
                let token = node.token.clone()?;
                Some(self.transport.put(
                    self.id,
                    node.info.address.into(),
                    token,
                    v.clone(),
                    None,
                ))
            })
            .collect();

        join_all(writes).await;

        Ok(target)
    }

    async fn put_mutable<F>(
        &self,
        signing_key: &SigningKey,
        salt: Option<Vec<u8>>,
        update: F,
    ) -> Result<NodeID>
    where
        F: FnOnce(Option<&MutableItem>) -> MutableUpdate,
    {
        check_salt(salt.as_deref())?;
        let key = signing_key.verifying_key().to_bytes();
        let target = mutable_target(&key, salt.as_deref());

        let mut previous: Option<MutableItem> = self.store().mutable_item(&target);

        let outcome = {
            let salt = salt.clone();
            let previous = &mut previous;

            self.engine()
                .run(target, LookupMethod::Get, move |response, _| {
                    if let Some(StorageItem::Mutable(item)) =
                        validate_get_response(response, &target, salt.as_deref())
                    {
                        let newer = previous
                            .as_ref()
                            .map(|current| current.seq < item.seq)
                            .unwrap_or(true);
                        if newer {
                            *previous = Some(item);
                        }
                    }
                    None::<()>
                })
                .await
        };

        let MutableUpdate { value, seq } = update(previous.as_ref());
        let item = MutableItem::sign(signing_key, value, seq, salt)?;

        let writes: Vec<_> = outcome
            .closest
            .iter()
            .filter_map(|node| {
                let token = node.token.clone()?;
                Some(self.transport.put(
                    self.id,
                    node.info.address.into(),
                    token,
                    ByteBuf::from(item.value.clone()),
                    Some(PutMutableArgs {
                        k: ByteBuf::from(item.key.to_vec()),
                        salt: item.salt.clone().map(ByteBuf::from),
                        seq: item.seq,
                        sig: ByteBuf::from(item.signature.to_vec()),
                        cas: None,
                    }),
                ))
            })
            .collect();

        join_all(writes).await;

        Ok(target)
    }
}

/// Interprets a `get` response as a valid record at `target`, or nothing.
fn validate_get_response(
    response: &Response,
    target: &NodeID,
    salt: Option<&[u8]>,
) -> Option<StorageItem> {
    let v = response.v.as_ref()?;

    match &response.k {
        Some(k) => {
            let key = <[u8; storage::PUBLIC_KEY_LEN]>::try_from(&k[..]).ok()?;
            let sig = response.sig.as_ref()?;
            let signature = <[u8; storage::SIGNATURE_LEN]>::try_from(&sig[..]).ok()?;
            let seq = response.seq?;

            let item = MutableItem {
                key,
                signature,
                seq,
                value: v.to_vec(),
                salt: salt.map(<[u8]>::to_vec),
            };

            item.verify(Some(target)).ok()?;
            Some(StorageItem::Mutable(item))
        }
        None => {
            if validate_immutable(v, target) {
                Some(StorageItem::Immutable { value: v.to_vec() })
            } else {
                None
            }
        }
    }
}

async fn dispatch_queries(
    inner: Arc<Inner>,
    mut queries: mpsc::UnboundedReceiver<InboundQuery>,
) {
    while let Some(inbound) = queries.next().await {
        let inner = inner.clone();
        tokio::spawn(async move {
            handle_query(inner, inbound).await;
        });
    }
}

async fn handle_query(inner: Arc<Inner>, inbound: InboundQuery) {
    let InboundQuery {
        sender,
        query,
        responder,
    } = inbound;

    if let Some(&sender_id) = query.id() {
        let contact = NodeInfo::new(sender_id, Addr::new(*sender.ip(), sender.port()));
        inner
            .table
            .lock()
            .await
            .record_query(contact, &inner.prober)
            .await;
    }

    let reply = answer_query(&inner, sender, query).await;

    let sent = match reply {
        Ok(response) => responder.respond(response).await,
        Err(error) => responder.error(error).await,
    };

    if let Err(cause) = sent {
        warn!("failed to answer {}: {}", sender, cause);
    }
}

async fn answer_query(
    inner: &Arc<Inner>,
    sender: SocketAddrV4,
    query: Query,
) -> std::result::Result<Response, KRPCError> {
    match query {
        Query::Ping { .. } => Ok(Response::only_id(inner.id)),

        Query::FindNode { target, .. } => {
            let nodes = inner.table.lock().await.closest(&target, inner.k);

            Ok(Response {
                id: Some(inner.id),
                nodes: Some(nodes),
                ..Response::default()
            })
        }

        Query::GetPeers { info_hash, .. } => {
            let nodes = inner.table.lock().await.closest(&info_hash, inner.k);
            let mut store = inner.store();
            let token = store.issue(&info_hash, *sender.ip());
            let values = store.peers(&info_hash);

            Ok(Response {
                id: Some(inner.id),
                token: Some(ByteBuf::from(token)),
                nodes: Some(nodes),
                values,
                ..Response::default()
            })
        }

        Query::AnnouncePeer {
            implied_port,
            info_hash,
            port,
            token,
            ..
        } => {
            let port = if implied_port {
                sender.port()
            } else {
                port.ok_or_else(|| {
                    KRPCError::new(error_code::PROTOCOL, "missing port")
                })?
            };

            let peer = Addr::new(*sender.ip(), port);
            if inner
                .store()
                .announce(&info_hash, peer, *sender.ip(), &token)
            {
                Ok(Response::only_id(inner.id))
            } else {
                debug!("rejecting announce from {}: bad token", sender);
                Err(KRPCError::new(error_code::PROTOCOL, "Bad token"))
            }
        }

        Query::Get { target, .. } => {
            let nodes = inner.table.lock().await.closest(&target, inner.k);
            let mut store = inner.store();
            let token = store.issue(&target, *sender.ip());

            let mut response = Response {
                id: Some(inner.id),
                token: Some(ByteBuf::from(token)),
                nodes: Some(nodes),
                ..Response::default()
            };

            match store.item(&target) {
                Some(StorageItem::Immutable { value }) => {
                    response.v = Some(ByteBuf::from(value));
                }
                Some(StorageItem::Mutable(item)) => {
                    response.v = Some(ByteBuf::from(item.value.clone()));
                    response.k = Some(ByteBuf::from(item.key.to_vec()));
                    response.sig = Some(ByteBuf::from(item.signature.to_vec()));
                    response.seq = Some(item.seq);
                }
                None => {}
            }

            Ok(response)
        }

        Query::Put {
            cas,
            k,
            salt,
            seq,
            sig,
            token,
            v,
            ..
        } => answer_put(inner, sender, cas, k, salt, seq, sig, token, v),

        Query::Unknown => Err(KRPCError::new(error_code::METHOD_UNKNOWN, "Method Unknown")),
    }
}

#[allow(clippy::too_many_arguments)]
fn answer_put(
    inner: &Arc<Inner>,
    sender: SocketAddrV4,
    cas: Option<i64>,
    k: Option<ByteBuf>,
    salt: Option<ByteBuf>,
    seq: Option<i64>,
    sig: Option<ByteBuf>,
    token: Vec<u8>,
    v: ByteBuf,
) -> std::result::Result<Response, KRPCError> {
    if v.len() > storage::MAX_VALUE_LEN {
        return Err(KRPCError::new(
            error_code::PROTOCOL,
            "message (v field) too big",
        ));
    }

    let mut store = inner.store();

    match k {
        None => {
            let target = immutable_target(&v);
            if !store.store_item(
                &target,
                StorageItem::Immutable { value: v.to_vec() },
                *sender.ip(),
                &token,
            ) {
                debug!("rejecting immutable put from {}: bad token", sender);
                return Err(KRPCError::new(error_code::PROTOCOL, "Bad token"));
            }
        }
        Some(k) => {
            let key = <[u8; storage::PUBLIC_KEY_LEN]>::try_from(&k[..])
                .map_err(|_| KRPCError::new(error_code::PROTOCOL, "invalid public key"))?;
            let signature = sig
                .and_then(|sig| <[u8; storage::SIGNATURE_LEN]>::try_from(&sig[..]).ok())
                .ok_or_else(|| KRPCError::new(error_code::PROTOCOL, "invalid signature"))?;
            let seq =
                seq.ok_or_else(|| KRPCError::new(error_code::PROTOCOL, "missing seq"))?;

            let salt = salt.map(|salt| salt.to_vec());
            if salt.as_ref().map(Vec::len).unwrap_or(0) > storage::MAX_SALT_LEN {
                return Err(KRPCError::new(error_code::PROTOCOL, "salt too big"));
            }

            let item = MutableItem {
                key,
                signature,
                seq,
                value: v.to_vec(),
                salt,
            };
            let target = item.target();

            if !store.verify(&token, &target, *sender.ip()) {
                debug!("rejecting mutable put from {}: bad token", sender);
                return Err(KRPCError::new(error_code::PROTOCOL, "Bad token"));
            }

            if item.verify(None).is_err() {
                debug!("rejecting mutable put from {}: bad signature", sender);
                return Err(KRPCError::new(error_code::PROTOCOL, "Invalid signature"));
            }

            if let Some(current) = store.mutable_item(&target) {
                if let Some(cas) = cas {
                    if cas != current.seq {
                        return Err(KRPCError::new(
                            error_code::CAS_MISMATCH,
                            "CAS mismatched, re-read value",
                        ));
                    }
                }

                if seq < current.seq {
                    return Err(KRPCError::new(
                        error_code::SEQ_LESS_THAN_CURRENT,
                        "sequence number less than current",
                    ));
                }
            }

            store.store_item(&target, StorageItem::Mutable(item), *sender.ip(), &token);
        }
    }

    Ok(Response::only_id(inner.id))
}

async fn run_maintenance(inner: Arc<Inner>) {
    let mut rotate = time::interval(ROTATE_INTERVAL);
    let mut refresh = time::interval(REFRESH_INTERVAL);

    loop {
        tokio::select! {
            _ = rotate.tick() => {
                inner.store().rotate();
            }
            _ = refresh.tick() => {
                let targets = { inner.table.lock().await.refresh_targets() };
                for target in targets {
                    debug!("refreshing bucket with a lookup for {}", target);
                    inner.find_node(target).await;
                }
            }
        }
    }
}
