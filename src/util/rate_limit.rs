//! Rate limiting utilities

use governor::{
    clock::DefaultClock,
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter,
};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Keyed limiter type alias (one bucket per mesh peer address)
pub type PeerLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Max inbound mesh frames per second per peer
pub const MESH_INBOUND_RATE_LIMIT: u32 = 60;

/// Create a keyed limiter with the specified frames per second
pub fn create_peer_limiter(frames_per_second: u32) -> Arc<PeerLimiter> {
    let quota = Quota::per_second(NonZeroU32::new(frames_per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::keyed(quota))
}

/// Per-peer inbound frame limiter for the mesh medium
#[derive(Clone)]
pub struct InboundFrameLimiter {
    limiter: Arc<PeerLimiter>,
}

impl InboundFrameLimiter {
    pub fn new() -> Self {
        Self {
            limiter: create_peer_limiter(MESH_INBOUND_RATE_LIMIT),
        }
    }

    /// Check if a frame from this peer is allowed (returns true if allowed)
    pub fn check(&self, peer: IpAddr) -> bool {
        self.limiter.check_key(&peer).is_ok()
    }

    /// Drop buckets for peers that have gone quiet
    pub fn forget_idle(&self) {
        self.limiter.retain_recent();
    }
}

impl Default for InboundFrameLimiter {
    fn default() -> Self {
        Self::new()
    }
}
