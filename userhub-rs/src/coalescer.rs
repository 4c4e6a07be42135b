//! Ensures that at most one fetch per key is in flight (also known as "single flight").
//!
//! If many requests ask for the same uncached user at once, only the first one actually hits the
//! store. All others attach themselves to the pending group of the first one and receive a copy
//! of its outcome. This is also true for errors: if the fetch fails, every waiter sees the same
//! failure.
//!
//! The fetch itself is run as a separate task. Therefore a caller which goes away (e.g. as its
//! HTTP connection was closed) neither cancels the fetch nor affects the other waiters. Once the
//! outcome is known, the group is removed and its waiter list is captured in the same critical
//! section. A caller arriving a moment later therefore starts a new fetch instead of attaching
//! to a group which is already being resolved.
//!
//! Groups which are pending for longer than **stale_ms** are reclaimed by a periodic sweep (see
//! [maintenance](crate::maintenance)). Their waiters receive a [CoalesceError::Timeout]. The fetch
//! keeps running, but once it completes, its outcome is discarded, as each group is tagged with
//! a generation which has to match upon delivery.
//!
//! # Configuration
//! ```yaml
//! coalescer:
//!     # Specifies after how many milliseconds a pending fetch is considered stale.
//!     stale_ms: 30000
//! ```
//!
//! # Example
//! ```
//! # use std::sync::Arc;
//! # use userhub::clock::ManualClock;
//! # use userhub::coalescer::Coalescer;
//! # #[tokio::main]
//! # async fn main() {
//! let coalescer: Coalescer<u64, String, String> =
//!     Coalescer::new(30_000, Arc::new(ManualClock::new()));
//!
//! let (a, b) = tokio::join!(
//!     coalescer.coalesce(1, || async { Ok("John Doe".to_owned()) }),
//!     coalescer.coalesce(1, || async { Ok("Someone else".to_owned()) }),
//! );
//!
//! assert_eq!(a, Ok("John Doe".to_owned()));
//! assert_eq!(b, Ok("John Doe".to_owned()));
//! assert_eq!(coalescer.fetches(), 1);
//! # }
//! ```
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fnv::FnvHashMap;
use tokio::sync::oneshot;

use crate::clock::Clock;
use crate::fmt::format_millis;

/// Enumerates the ways a coalesced fetch can fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoalesceError<E> {
    /// The fetch itself reported an error.
    Failed(E),
    /// The group was pending for too long and has been reclaimed.
    Timeout,
    /// The fetch task died without producing an outcome.
    Abandoned,
}

impl<E: Display> Display for CoalesceError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CoalesceError::Failed(error) => write!(f, "{}", error),
            CoalesceError::Timeout => write!(f, "The request timed out"),
            CoalesceError::Abandoned => write!(f, "The request was abandoned"),
        }
    }
}

impl<E: Display + std::fmt::Debug> std::error::Error for CoalesceError<E> {}

type Outcome<V, E> = Result<V, CoalesceError<E>>;

struct PendingGroup<V, E> {
    created_at: u64,
    generation: u64,
    waiters: Vec<oneshot::Sender<Outcome<V, E>>>,
}

type Groups<K, V, E> = Arc<Mutex<FnvHashMap<K, PendingGroup<V, E>>>>;

fn lock<K, V, E>(groups: &Groups<K, V, E>) -> MutexGuard<'_, FnvHashMap<K, PendingGroup<V, E>>> {
    groups.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Delivers the outcome of a fetch to its group.
///
/// If the fetch task dies before an outcome is delivered, dropping this removes the group so
/// that all waiters are released with [CoalesceError::Abandoned].
struct Delivery<K: Hash + Eq, V, E> {
    groups: Groups<K, V, E>,
    key: K,
    generation: u64,
    delivered: bool,
}

impl<K: Hash + Eq, V, E> Delivery<K, V, E> {
    fn take_waiters(&self) -> Vec<oneshot::Sender<Outcome<V, E>>> {
        let mut groups = lock(&self.groups);
        match groups.get(&self.key) {
            Some(group) if group.generation == self.generation => groups
                .remove(&self.key)
                .map(|group| group.waiters)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

impl<K: Hash + Eq, V: Clone, E: Clone> Delivery<K, V, E> {
    fn deliver(&mut self, outcome: Outcome<V, E>) {
        self.delivered = true;
        for waiter in self.take_waiters() {
            let _ = waiter.send(outcome.clone());
        }
    }
}

impl<K: Hash + Eq, V, E> Drop for Delivery<K, V, E> {
    fn drop(&mut self) {
        if !self.delivered {
            // Dropping the senders wakes up all waiters...
            drop(self.take_waiters());
        }
    }
}

/// Keeps track of all pending fetches.
pub struct Coalescer<K: Hash + Eq, V, E> {
    groups: Groups<K, V, E>,
    clock: Arc<dyn Clock>,
    stale_ms: AtomicU64,
    generations: AtomicU64,
    fetches: AtomicU64,
    timeouts: AtomicU64,
}

impl<K, V, E> Coalescer<K, V, E>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates a new coalescer which reclaims groups older than the given number of milliseconds.
    pub fn new(stale_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Coalescer {
            groups: Arc::new(Mutex::new(FnvHashMap::default())),
            clock,
            stale_ms: AtomicU64::new(stale_ms.max(1)),
            generations: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    /// Runs the given fetch for the key unless one is already pending, in which case its outcome
    /// is awaited instead.
    ///
    /// Note that **fetch** is only invoked if this call ends up starting a new group. The returned
    /// future is then run as its own task.
    pub async fn coalesce<F, Fut>(&self, key: K, fetch: F) -> Outcome<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let generation = {
            let mut groups = lock(&self.groups);
            if let Some(group) = groups.get_mut(&key) {
                group.waiters.push(tx);
                None
            } else {
                let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                let _ = groups.insert(
                    key.clone(),
                    PendingGroup {
                        created_at: self.clock.now(),
                        generation,
                        waiters: vec![tx],
                    },
                );
                Some(generation)
            }
        };

        if let Some(generation) = generation {
            let _ = self.fetches.fetch_add(1, Ordering::Relaxed);

            let mut delivery = Delivery {
                groups: self.groups.clone(),
                key,
                generation,
                delivered: false,
            };
            let fetch = fetch();

            crate::spawn!(async move {
                let outcome = fetch.await.map_err(CoalesceError::Failed);
                delivery.deliver(outcome);
            });
        }

        rx.await.unwrap_or(Err(CoalesceError::Abandoned))
    }

    /// Removes all groups which are pending for longer than **stale_ms**.
    ///
    /// All waiters of these groups receive a [CoalesceError::Timeout]. Returns the keys of the
    /// reclaimed groups.
    pub fn reclaim_stale(&self) -> Vec<K> {
        let now = self.clock.now();
        let stale_ms = self.stale_ms();

        let stale_groups: Vec<(K, PendingGroup<V, E>)> = {
            let mut groups = lock(&self.groups);
            let stale_keys: Vec<K> = groups
                .iter()
                .filter(|(_, group)| now.saturating_sub(group.created_at) > stale_ms)
                .map(|(key, _)| key.clone())
                .collect();

            stale_keys
                .into_iter()
                .filter_map(|key| groups.remove(&key).map(|group| (key, group)))
                .collect()
        };

        let mut reclaimed = Vec::with_capacity(stale_groups.len());
        for (key, group) in stale_groups {
            reclaimed.push(key);
            let _ = self
                .timeouts
                .fetch_add(group.waiters.len() as u64, Ordering::Relaxed);
            for waiter in group.waiters {
                let _ = waiter.send(Err(CoalesceError::Timeout));
            }
        }

        reclaimed
    }

    /// Returns the number of pending groups.
    pub fn pending(&self) -> usize {
        lock(&self.groups).len()
    }

    /// Returns the number of fetches started so far.
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Returns the number of waiters which have been released with a timeout.
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Returns the age (in milliseconds) after which a pending group is reclaimed.
    pub fn stale_ms(&self) -> u64 {
        self.stale_ms.load(Ordering::Relaxed)
    }

    /// Changes the age after which a pending group is reclaimed.
    pub fn set_stale_ms(&self, stale_ms: u64) {
        let stale_ms = stale_ms.max(1);
        let previous = self.stale_ms.swap(stale_ms, Ordering::Relaxed);
        if previous != stale_ms {
            log::info!(
                "Updating the coalescer timeout from {} to {}.",
                format_millis(previous),
                format_millis(stale_ms)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::ManualClock;
    use crate::coalescer::{CoalesceError, Coalescer};
    use crate::testing::test_async;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn coalescer() -> (Arc<ManualClock>, Arc<Coalescer<u64, String, String>>) {
        let clock = Arc::new(ManualClock::new());
        let coalescer = Arc::new(Coalescer::new(30_000, clock.clone()));
        (clock, coalescer)
    }

    #[test]
    fn concurrent_callers_share_a_single_fetch() {
        test_async(async {
            let (_, coalescer) = coalescer();
            let calls = Arc::new(AtomicUsize::new(0));

            let requests = (0..10).map(|_| {
                let calls = calls.clone();
                coalescer.coalesce(2, move || async move {
                    let _ = calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok("Jane Smith".to_owned())
                })
            });
            let results = futures::future::join_all(requests).await;

            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(coalescer.fetches(), 1);
            assert!(results
                .iter()
                .all(|result| result == &Ok("Jane Smith".to_owned())));
            assert_eq!(coalescer.pending(), 0);
        });
    }

    #[test]
    fn errors_are_fanned_out() {
        test_async(async {
            let (_, coalescer) = coalescer();

            let (a, b) = tokio::join!(
                coalescer.coalesce(1, || async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Err("boom".to_owned())
                }),
                coalescer.coalesce(1, || async { Ok("unused".to_owned()) })
            );

            assert_eq!(a, Err(CoalesceError::Failed("boom".to_owned())));
            assert_eq!(b, Err(CoalesceError::Failed("boom".to_owned())));
        });
    }

    #[test]
    fn completed_groups_are_not_reused() {
        test_async(async {
            let (_, coalescer) = coalescer();

            let first = coalescer.coalesce(1, || async { Ok("a".to_owned()) }).await;
            let second = coalescer.coalesce(1, || async { Ok("b".to_owned()) }).await;

            assert_eq!(first, Ok("a".to_owned()));
            assert_eq!(second, Ok("b".to_owned()));
            assert_eq!(coalescer.fetches(), 2);
        });
    }

    #[test]
    fn different_keys_do_not_interfere() {
        test_async(async {
            let (_, coalescer) = coalescer();

            let (a, b) = tokio::join!(
                coalescer.coalesce(1, || async { Ok("a".to_owned()) }),
                coalescer.coalesce(2, || async { Ok("b".to_owned()) })
            );

            assert_eq!(a, Ok("a".to_owned()));
            assert_eq!(b, Ok("b".to_owned()));
            assert_eq!(coalescer.fetches(), 2);
        });
    }

    #[test]
    fn stale_groups_are_reclaimed() {
        test_async(async {
            let (clock, coalescer) = coalescer();
            let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

            let cloned_coalescer = coalescer.clone();
            let waiter = tokio::spawn(async move {
                cloned_coalescer
                    .coalesce(1, || async move {
                        let _ = release_rx.await;
                        Ok("late".to_owned())
                    })
                    .await
            });
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(coalescer.pending(), 1);

            // Not stale yet...
            clock.advance(30_000);
            assert!(coalescer.reclaim_stale().is_empty());

            clock.advance(1);
            assert_eq!(coalescer.reclaim_stale(), vec![1]);
            assert_eq!(waiter.await.unwrap(), Err(CoalesceError::Timeout));
            assert_eq!(coalescer.pending(), 0);
            assert_eq!(coalescer.timeouts(), 1);

            // A new group for the same key must not be resolved by the reclaimed fetch...
            let (second_tx, second_rx) = tokio::sync::oneshot::channel::<()>();
            let cloned_coalescer = coalescer.clone();
            let second = tokio::spawn(async move {
                cloned_coalescer
                    .coalesce(1, || async move {
                        let _ = second_rx.await;
                        Ok("fresh".to_owned())
                    })
                    .await
            });
            tokio::time::sleep(Duration::from_millis(10)).await;

            let _ = release_tx.send(());
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(coalescer.pending(), 1);

            let _ = second_tx.send(());
            assert_eq!(second.await.unwrap(), Ok("fresh".to_owned()));
            assert_eq!(coalescer.pending(), 0);
        });
    }

    #[test]
    fn a_dying_fetch_releases_its_waiters() {
        test_async(async {
            let (_, coalescer) = coalescer();

            let result = coalescer
                .coalesce(1, || async {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    if true {
                        panic!("The fetch crashed");
                    }
                    Ok("unreachable".to_owned())
                })
                .await;

            assert_eq!(result, Err(CoalesceError::Abandoned));
            assert_eq!(coalescer.pending(), 0);
        });
    }

    #[test]
    fn dropped_callers_do_not_cancel_the_fetch() {
        test_async(async {
            let (_, coalescer) = coalescer();
            let calls = Arc::new(AtomicUsize::new(0));

            let cloned_calls = calls.clone();
            let impatient = coalescer.coalesce(1, move || async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let _ = cloned_calls.fetch_add(1, Ordering::SeqCst);
                Ok("done".to_owned())
            });
            let _ = tokio::time::timeout(Duration::from_millis(5), impatient).await;

            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(coalescer.pending(), 0);
        });
    }
}
