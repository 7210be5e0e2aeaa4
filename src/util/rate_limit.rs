//! Rate limiting utilities

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Create a rate limiter with the specified requests per second
pub fn create_limiter(requests_per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Per-connection inbound message guard.
///
/// Unlimited unless a budget is configured; clients already throttle their
/// own position updates.
#[derive(Clone, Default)]
pub struct ConnectionRateLimiter {
    message_limiter: Option<Arc<Limiter>>,
}

impl ConnectionRateLimiter {
    pub fn new(messages_per_second: Option<u32>) -> Self {
        Self {
            message_limiter: messages_per_second.map(create_limiter),
        }
    }

    /// Check if an inbound message is allowed (returns true if allowed)
    pub fn check_message(&self) -> bool {
        self.message_limiter
            .as_ref()
            .map_or(true, |limiter| limiter.check().is_ok())
    }
}
