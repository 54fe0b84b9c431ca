use futures::future::BoxFuture;
use krpc_encoding::NodeInfo;

/// Liveness probing delegated to the host.
///
/// The routing table calls this while deciding evictions. It applies its
/// own 5 second deadline on top of whatever the implementation does, so a
/// slow or wedged prober cannot stall eviction indefinitely.
pub trait PingProber: Send + Sync {
    /// Resolves to `true` if the node answered the probe.
    fn ping(&self, target: &NodeInfo) -> BoxFuture<'static, bool>;
}
