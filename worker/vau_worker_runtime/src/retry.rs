use crate::protocol::CallRequest;
use std::time::{Duration, Instant};

const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1);
const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_millis(250);
const DEFAULT_MAX_ATTEMPTS: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub max_delay: Duration,
    /// `None` replays a not-ready call for as long as it keeps deferring.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RETRY_DELAY,
            max_delay: DEFAULT_RETRY_MAX_DELAY,
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempts).unwrap_or(u32::MAX);
        self.delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeferredEntry {
    pub request: CallRequest,
    /// How many times this request has already been replayed.
    pub attempts: u32,
}

impl DeferredEntry {
    pub fn fresh(request: CallRequest) -> Self {
        Self {
            request,
            attempts: 0,
        }
    }
}

/// Requests whose module call was not ready yet, replayed in arrival order by
/// a single coalesced flush.
#[derive(Debug)]
pub struct RetryQueue {
    policy: RetryPolicy,
    pending: Vec<DeferredEntry>,
    flush_at: Option<Instant>,
}

impl RetryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            pending: Vec::new(),
            flush_at: None,
        }
    }

    /// Queues `entry` for the next flush. Returns `Ok(true)` when this call
    /// scheduled the flush and `Ok(false)` when it joined one already pending.
    /// An entry that has used up its attempts is handed back.
    pub fn defer(&mut self, entry: DeferredEntry, now: Instant) -> Result<bool, DeferredEntry> {
        if !self.policy.allows(entry.attempts) {
            return Err(entry);
        }

        let delay = self.policy.delay_for(entry.attempts);
        self.pending.push(entry);

        if self.flush_at.is_some() {
            return Ok(false);
        }

        self.flush_at = Some(now + delay);
        Ok(true)
    }

    /// Pulls a pending flush forward to `now`. Returns whether anything is
    /// waiting to be replayed.
    pub fn notify_resource(&mut self, key: &str, now: Instant) -> bool {
        if self.pending.is_empty() {
            tracing::debug!(key, "resource ready with nothing deferred");
            return false;
        }

        tracing::debug!(key, pending = self.pending.len(), "resource ready; flushing early");
        self.flush_at = Some(self.flush_at.map_or(now, |at| at.min(now)));
        true
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.flush_at
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.flush_at.is_some_and(|at| at <= now)
    }

    /// Swaps out the current batch. Anything deferred while the batch is being
    /// replayed lands in the next round.
    pub fn take_batch(&mut self) -> Vec<DeferredEntry> {
        self.flush_at = None;
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::call;
    use serde_json::json;

    fn entry(id: i64) -> DeferredEntry {
        DeferredEntry::fresh(call("evaluateExpression", id, json!(["(x)"])))
    }

    #[test]
    fn deferrals_in_one_tick_share_one_flush() {
        let mut queue = RetryQueue::new(RetryPolicy::default());
        let now = Instant::now();

        assert_eq!(queue.defer(entry(1), now), Ok(true));
        assert_eq!(queue.defer(entry(2), now), Ok(false));
        assert_eq!(queue.defer(entry(3), now), Ok(false));

        assert_eq!(queue.deadline(), Some(now + Duration::from_millis(1)));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn flush_is_never_due_inside_the_deferring_tick() {
        let mut queue = RetryQueue::new(RetryPolicy::default());
        let now = Instant::now();

        queue.defer(entry(1), now).expect("deferred");

        assert!(!queue.is_due(now));
        assert!(queue.is_due(now + Duration::from_millis(1)));
    }

    #[test]
    fn batch_preserves_arrival_order_and_resets_schedule() {
        let mut queue = RetryQueue::new(RetryPolicy::default());
        let now = Instant::now();
        for id in 1..=3 {
            queue.defer(entry(id), now).expect("deferred");
        }

        let batch = queue.take_batch();
        let ids: Vec<_> = batch.iter().map(|entry| entry.request.id.to_string()).collect();
        assert_eq!(ids, ["1", "2", "3"]);
        assert!(queue.is_empty());
        assert_eq!(queue.deadline(), None);

        let mut replay = batch[0].clone();
        replay.attempts += 1;
        assert_eq!(queue.defer(replay, now), Ok(true));
        assert_eq!(queue.deadline(), Some(now + Duration::from_millis(2)));
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(1));
        assert_eq!(policy.delay_for(3), Duration::from_millis(8));
        assert_eq!(policy.delay_for(8), Duration::from_millis(250));
        assert_eq!(policy.delay_for(40), Duration::from_millis(250));
    }

    #[test]
    fn exhausted_entries_are_handed_back() {
        let policy = RetryPolicy {
            max_attempts: Some(2),
            ..RetryPolicy::default()
        };
        let mut queue = RetryQueue::new(policy);
        let mut tired = entry(9);
        tired.attempts = 2;

        let rejected = queue.defer(tired.clone(), Instant::now()).expect_err("exhausted");
        assert_eq!(rejected, tired);
        assert!(queue.is_empty());
        assert_eq!(queue.deadline(), None);
    }

    #[test]
    fn unbounded_policy_never_exhausts() {
        let policy = RetryPolicy {
            max_attempts: None,
            ..RetryPolicy::default()
        };
        assert!(policy.allows(u32::MAX));
    }

    #[test]
    fn resource_ready_pulls_the_flush_forward() {
        let policy = RetryPolicy {
            delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5),
            max_attempts: None,
        };
        let mut queue = RetryQueue::new(policy);
        let now = Instant::now();

        assert!(!queue.notify_resource("fonts", now));
        assert_eq!(queue.deadline(), None);

        queue.defer(entry(1), now).expect("deferred");
        let later = now + Duration::from_millis(10);
        assert!(queue.notify_resource("fonts", later));
        assert!(queue.is_due(later));
    }
}
