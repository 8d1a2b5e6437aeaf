use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::time::{Duration, Instant};

use crate::io::TransId;

/// Returned by [`TransactionTracker::last_timepoint`] for tags never seen, relative to now.
pub const NEVER_SEEN_AGE: Duration = Duration::from_secs(60);

/// Attempts at drawing a fresh transaction id before giving up.
const MAX_ID_ATTEMPTS: usize = 16;

/// Issues STUN transaction ids and remembers the outstanding ones.
///
/// Every entry carries a tag saying what the request was for, a pair id for
/// connectivity checks or some other correlation value. Entries expire after
/// `timeout` and are swept on the next call to
/// [`set_transaction_id`][Self::set_transaction_id] or
/// [`remove_transaction`][Self::remove_transaction].
pub struct TransactionTracker<T> {
    rng: fastrand::Rng,
    timeout: Duration,
    /// Hash of transaction id to (sent at, tag).
    transactions: HashMap<u32, (Instant, T)>,
    /// Tag to the time of the last request sent for it.
    last_request: HashMap<T, Instant>,
}

impl<T> TransactionTracker<T>
where
    T: Copy + Eq + Hash + fmt::Debug,
{
    pub fn new(rng: fastrand::Rng, timeout: Duration) -> Self {
        TransactionTracker {
            rng,
            timeout,
            transactions: HashMap::new(),
            last_request: HashMap::new(),
        }
    }

    /// Draw a transaction id not colliding with any outstanding one and record it.
    pub fn set_transaction_id(&mut self, now: Instant, tag: T) -> TransId {
        self.purge(now);

        let mut attempts = 0;
        let trans_id = loop {
            let id = TransId::new(&mut self.rng);
            if !self.transactions.contains_key(&id.hash()) {
                break id;
            }
            attempts += 1;
            trace!("Transaction id collision, attempt {}", attempts);
            assert!(
                attempts < MAX_ID_ATTEMPTS,
                "transaction id generator keeps colliding"
            );
        };

        self.transactions.insert(trans_id.hash(), (now, tag));
        self.last_request.insert(tag, now);

        trans_id
    }

    /// A fresh id that is not tracked, for indications that get no response.
    pub fn unrecorded_id(&mut self) -> TransId {
        TransId::new(&mut self.rng)
    }

    pub fn has_transaction(&self, hash: u32) -> bool {
        self.transactions.contains_key(&hash)
    }

    /// The tag of an outstanding transaction.
    pub fn tag(&self, hash: u32) -> Option<T> {
        self.transactions.get(&hash).map(|(_, tag)| *tag)
    }

    /// Forget a transaction, typically once its response is matched.
    pub fn remove_transaction(&mut self, now: Instant, hash: u32) -> Option<T> {
        self.purge(now);
        self.transactions.remove(&hash).map(|(_, tag)| tag)
    }

    /// When a request was last sent for `tag`.
    ///
    /// Tags never seen report a time [`NEVER_SEEN_AGE`] in the past, so the caller
    /// can use the value directly as a retransmission baseline.
    pub fn last_timepoint(&self, now: Instant, tag: &T) -> Instant {
        match self.last_request.get(tag) {
            Some(t) => *t,
            None => now.checked_sub(NEVER_SEEN_AGE).unwrap_or(now),
        }
    }

    /// Number of outstanding transactions.
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    fn purge(&mut self, now: Instant) {
        let timeout = self.timeout;
        let expired = |t: &Instant| now.saturating_duration_since(*t) >= timeout;

        let before = self.transactions.len();
        self.transactions.retain(|_, (t, _)| !expired(t));
        self.last_request.retain(|_, t| !expired(t));

        let purged = before - self.transactions.len();
        if purged > 0 {
            trace!("Purged {} expired transactions", purged);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn tracker(seed: u64) -> TransactionTracker<u32> {
        TransactionTracker::new(fastrand::Rng::with_seed(seed), TIMEOUT)
    }

    #[test]
    fn set_then_has() {
        let now = Instant::now();
        let mut t = tracker(1);
        let id = t.set_transaction_id(now, 7);
        assert!(t.has_transaction(id.hash()));
        assert_eq!(t.tag(id.hash()), Some(7));
        assert_eq!(t.last_timepoint(now, &7), now);
    }

    #[test]
    fn remove_evicts() {
        let now = Instant::now();
        let mut t = tracker(2);
        let id = t.set_transaction_id(now, 1);
        assert_eq!(t.remove_transaction(now, id.hash()), Some(1));
        assert!(!t.has_transaction(id.hash()));
        assert_eq!(t.remove_transaction(now, id.hash()), None);
        // The tag keeps its last request time for retransmission scheduling.
        assert_eq!(t.last_timepoint(now, &1), now);
    }

    #[test]
    fn unknown_tag_is_long_ago() {
        let now = Instant::now() + NEVER_SEEN_AGE;
        let t = tracker(3);
        assert_eq!(t.last_timepoint(now, &99), now - NEVER_SEEN_AGE);
    }

    #[test]
    fn expired_are_evicted_on_next_call() {
        let now = Instant::now();
        let mut t = tracker(4);
        let old = t.set_transaction_id(now, 1);

        let later = now + TIMEOUT;
        assert!(t.has_transaction(old.hash()));
        let fresh = t.set_transaction_id(later, 2);
        assert!(!t.has_transaction(old.hash()));
        assert!(t.has_transaction(fresh.hash()));

        let even_later = later + TIMEOUT;
        t.remove_transaction(even_later, 0);
        assert!(t.is_empty());
        assert!(t.last_timepoint(even_later, &2) < later);
    }

    #[test]
    fn bounded_by_timeout_and_rate() {
        let start = Instant::now();
        let mut t = tracker(5);
        // One request every 50ms for a minute, a 10s timeout keeps at most 200.
        for i in 0..1200_u32 {
            let now = start + Duration::from_millis(50 * i as u64);
            t.set_transaction_id(now, i % 4);
            assert!(t.len() <= 200);
        }
    }

    #[test]
    fn collision_draws_again() {
        let now = Instant::now();
        let mut t = tracker(6);
        let first = t.set_transaction_id(now, 1);

        // Rewind the generator so the next draw repeats the outstanding id.
        t.rng = fastrand::Rng::with_seed(6);
        let second = t.set_transaction_id(now, 2);

        assert_ne!(first, second);
        assert_eq!(t.tag(first.hash()), Some(1));
        assert_eq!(t.tag(second.hash()), Some(2));
    }
}
