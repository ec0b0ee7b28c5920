use governor::clock::{Clock, DefaultClock};
use governor::middleware::StateInformationMiddleware;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;

use super::Decision;
use crate::{ClientId, ErrorKind, Result};

type KeyedLimiter =
    RateLimiter<ClientId, DefaultKeyedStateStore<ClientId>, DefaultClock, StateInformationMiddleware>;

/// Token buckets per client: `max_requests` tokens, one of which is
/// refilled every `window / max_requests`.
pub(crate) struct TokenBucketTable {
    limiter: KeyedLimiter,
}

impl fmt::Debug for TokenBucketTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucketTable")
            .field("clients", &self.limiter.len())
            .finish_non_exhaustive()
    }
}

impl TokenBucketTable {
    pub(crate) fn new(window: Duration, max_requests: u32) -> Result<Self> {
        let burst = NonZeroU32::new(max_requests)
            .ok_or_else(|| ErrorKind::invalid_config("token bucket needs at least one token"))?;
        let quota = Quota::with_period(window / max_requests)
            .ok_or_else(|| ErrorKind::invalid_config("token bucket refill period is zero"))?
            .allow_burst(burst);

        Ok(Self {
            limiter: RateLimiter::keyed(quota).with_middleware::<StateInformationMiddleware>(),
        })
    }

    pub(crate) fn evaluate(&self, client: &ClientId) -> Decision {
        match self.limiter.check_key(client) {
            Ok(snapshot) => Decision::Allowed {
                remaining: snapshot.remaining_burst_capacity(),
            },
            Err(not_until) => Decision::Rejected {
                retry_after: not_until.wait_time_from(self.limiter.clock().now()),
            },
        }
    }

    pub(crate) fn purge(&self) -> usize {
        let before = self.limiter.len();
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        before.saturating_sub(self.limiter.len())
    }

    pub(crate) fn len(&self) -> usize {
        self.limiter.len()
    }
}
