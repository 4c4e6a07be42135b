//! Provides the backing store which is the source of truth for all users.
//!
//! The [Store] trait is what the [UserService](crate::service::UserService) talks to. The only
//! implementation is the [MemoryStore] which keeps a few seeded users in a map and simulates the
//! latency of a real database by sleeping before each read. This latency is exactly what the
//! cache and the coalescer protect against.
//!
//! # Configuration
//! ```yaml
//! store:
//!     # Specifies the simulated latency of each read in milliseconds.
//!     latency_ms: 200
//! ```
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::settings::Settings;
use crate::user::{NewUser, User};

/// Enumerates the failures reported by a [Store].
///
/// This is **Clone** so that a single outcome can be handed to every waiter of a coalesced fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Signals that no user with the given id exists.
    NotFound(u64),
    /// Signals that the store itself failed.
    Failure(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "User {} not found", id),
            StoreError::Failure(message) => write!(f, "Store failure: {}", message),
        }
    }
}

impl std::error::Error for StoreError {}

/// Describes the source of truth for user records.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetches the user with the given id.
    async fn lookup(&self, id: u64) -> Result<User, StoreError>;

    /// Stores a new user and returns it along with its freshly assigned id.
    async fn insert(&self, user: NewUser) -> Result<User, StoreError>;

    /// Lists all users ordered by their id.
    async fn list(&self) -> Result<Vec<User>, StoreError>;

    /// Applies changed settings.
    fn reconfigure(&self, _settings: &Settings) {}
}

/// Provides an in-memory store with a simulated read latency.
pub struct MemoryStore {
    users: Mutex<BTreeMap<u64, User>>,
    latency: AtomicU64,
    lookups: AtomicUsize,
}

impl MemoryStore {
    /// Creates an empty store which delays each read by the given number of milliseconds.
    pub fn new(latency_ms: u64) -> Self {
        MemoryStore {
            users: Mutex::new(BTreeMap::new()),
            latency: AtomicU64::new(latency_ms),
            lookups: AtomicUsize::new(0),
        }
    }

    /// Creates a store which already contains the three demo users.
    ///
    /// # Example
    /// ```
    /// # use userhub::store::{MemoryStore, Store};
    /// # #[tokio::main]
    /// # async fn main() {
    /// let store = MemoryStore::seeded(0);
    /// let user = store.lookup(1).await.unwrap();
    /// assert_eq!(user.name, "John Doe");
    /// assert_eq!(user.email, "john@example.com");
    /// # }
    /// ```
    pub fn seeded(latency_ms: u64) -> Self {
        let store = MemoryStore::new(latency_ms);
        {
            let mut users = store.users.lock().unwrap_or_else(PoisonError::into_inner);
            for user in [
                User::new(1, "John Doe", "john@example.com"),
                User::new(2, "Jane Smith", "jane@example.com"),
                User::new(3, "Bob Johnson", "bob@example.com"),
            ] {
                let _ = users.insert(user.id, user);
            }
        }

        store
    }

    /// Changes the simulated latency.
    pub fn set_latency(&self, latency_ms: u64) {
        self.latency.store(latency_ms, Ordering::Relaxed);
    }

    /// Returns the simulated latency in milliseconds.
    pub fn latency(&self) -> u64 {
        self.latency.load(Ordering::Relaxed)
    }

    /// Returns the number of lookups performed so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }

    async fn simulate_latency(&self) {
        let latency = self.latency();
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn lookup(&self, id: u64) -> Result<User, StoreError> {
        let _ = self.lookups.fetch_add(1, Ordering::Relaxed);
        self.simulate_latency().await;

        self.users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn insert(&self, user: NewUser) -> Result<User, StoreError> {
        let mut users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        let id = users.keys().next_back().copied().unwrap_or(0) + 1;
        let user = User::new(id, user.name, user.email);
        let _ = users.insert(id, user.clone());

        Ok(user)
    }

    async fn list(&self) -> Result<Vec<User>, StoreError> {
        self.simulate_latency().await;

        Ok(self
            .users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }

    fn reconfigure(&self, settings: &Settings) {
        if self.latency() != settings.store_latency_ms {
            log::info!(
                "Updating the simulated store latency from {}ms to {}ms.",
                self.latency(),
                settings.store_latency_ms
            );
            self.set_latency(settings.store_latency_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::store::{MemoryStore, Store, StoreError};
    use crate::testing::test_async;
    use crate::user::NewUser;

    #[test]
    fn unknown_users_are_reported() {
        test_async(async {
            let store = MemoryStore::seeded(0);
            assert_eq!(store.lookup(999).await, Err(StoreError::NotFound(999)));
            assert_eq!(store.lookups(), 1);
        });
    }

    #[test]
    fn inserted_users_get_the_next_id() {
        test_async(async {
            let store = MemoryStore::seeded(0);
            let user = store
                .insert(NewUser {
                    name: "Test User".to_owned(),
                    email: "test@example.com".to_owned(),
                })
                .await
                .unwrap();
            assert_eq!(user.id, 4);
            assert_eq!(store.lookup(4).await.unwrap(), user);

            let ids: Vec<u64> = store.list().await.unwrap().iter().map(|u| u.id).collect();
            assert_eq!(ids, vec![1, 2, 3, 4]);
        });
    }

    #[test]
    fn an_empty_store_starts_at_one() {
        test_async(async {
            let store = MemoryStore::new(0);
            let user = store
                .insert(NewUser {
                    name: "First".to_owned(),
                    email: "first@example.com".to_owned(),
                })
                .await
                .unwrap();
            assert_eq!(user.id, 1);
        });
    }

    #[test]
    fn lookups_take_their_time() {
        test_async(async {
            let store = MemoryStore::seeded(50);
            let start = std::time::Instant::now();
            let _ = store.lookup(1).await;
            assert!(start.elapsed().as_millis() >= 50);
        });
    }
}
