//! Binds the cache, the rate limiter, the coalescer and the store into the request pipeline.
//!
//! Reading a user passes these stages:
//! 1. The id is parsed and validated. Malformed requests are turned down before they count
//!    against any rate limit.
//! 2. The [RateLimiter] decides if the client may proceed.
//! 3. The [Cache] is consulted. A fresh entry is returned right away.
//! 4. Otherwise the [Coalescer] either starts a fetch against the [Store] or attaches the request
//!    to a fetch already in flight. A successful fetch stores its result in the cache before it
//!    is handed to all waiters. Unknown users are never cached.
//!
//! Creating a user bypasses the coalescer: the record is inserted into the store and then put
//! into the cache, so that an immediate read is a cache hit.
//!
//! The service is registered in the [Platform] by [install]. It listens to config changes and
//! applies new capacities, TTLs and limits at runtime.
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use itertools::Itertools;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;

use crate::clock::{format_timestamp, Clock, MonotonicClock};
use crate::coalescer::Coalescer;
use crate::config::Config;
use crate::error::{ServiceError, ServiceResult};
use crate::fmt::format_millis;
use crate::limiter::{Admission, RateLimitHeaders, RateLimiter, Tier};
use crate::lru::{Cache, CacheStatus, SweepReport};
use crate::platform::Platform;
use crate::settings::Settings;
use crate::store::{MemoryStore, Store, StoreError};
use crate::user::{NewUser, User};

/// Contains the number of keys reported by [UserService::cache_status].
const SAMPLE_KEYS: usize = 10;

/// Specifies how often the config listener checks if the platform is still running.
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Represents the outcome of an operation which is subject to rate limiting.
///
/// If the request was admitted, the current limits are present, even if the operation itself
/// failed afterwards.
#[derive(Debug)]
pub struct Guarded<T> {
    /// Contains the limits of the client if the request was admitted.
    pub limits: Option<RateLimitHeaders>,
    /// Contains the actual result.
    pub result: ServiceResult<T>,
}

impl<T> Guarded<T> {
    fn turned_down(error: ServiceError) -> Self {
        Guarded {
            limits: None,
            result: Err(error),
        }
    }
}

/// Renders the state of the cache as JSON object.
pub fn cache_status_to_json(status: &CacheStatus<u64>) -> Value {
    json!({
        "hits": status.stats.hits,
        "misses": status.stats.misses,
        "size": status.stats.size,
        "capacity": status.stats.capacity,
        "evictions": status.stats.evictions,
        "hit_rate_pct": (status.stats.hit_rate * 100.).round() / 100.,
        "avg_latency_ms": status.stats.avg_latency_micros as f64 / 1000.,
        "latency_samples": status.stats.latency_samples,
        "sample_keys": status.sample_keys,
        "total_keys": status.total_keys,
    })
}

/// Describes the outcome of [UserService::cache_clear].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearReport {
    /// Contains the number of entries before the cache was cleared.
    pub previous_size: usize,
    /// Contains the wall clock time of the clear (ISO-8601).
    pub cleared_at: String,
}

impl ClearReport {
    /// Renders the report as JSON object.
    pub fn to_json(&self) -> Value {
        json!({
            "previous_size": self.previous_size,
            "cleared_at": self.cleared_at,
        })
    }
}

/// Renders the outcome of a cache sweep as JSON object.
pub fn sweep_report_to_json(report: &SweepReport) -> Value {
    json!({
        "entries_cleaned": report.removed,
        "size_before": report.size_before,
        "size_after": report.size_after,
    })
}

/// Serves user records while protecting the store.
pub struct UserService {
    clock: Arc<dyn Clock>,
    cache: Arc<Cache<u64, User>>,
    limiter: RateLimiter,
    coalescer: Coalescer<u64, User, StoreError>,
    store: Arc<dyn Store>,
    settings: ArcSwap<Settings>,
    started_at: u64,
}

impl UserService {
    /// Creates a new service using the given settings, store and clock.
    pub fn new(settings: Settings, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        UserService {
            cache: Arc::new(Cache::new(
                settings.cache_capacity,
                settings.cache_ttl_ms,
                clock.clone(),
            )),
            limiter: RateLimiter::new(
                settings.minute_capacity,
                settings.burst_capacity,
                clock.clone(),
            ),
            coalescer: Coalescer::new(settings.stale_ms, clock.clone()),
            store,
            started_at: clock.now(),
            settings: ArcSwap::new(Arc::new(settings)),
            clock,
        }
    }

    /// Returns the settings currently in use.
    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    /// Applies new settings to all components.
    pub fn apply(&self, settings: Settings) {
        self.cache
            .reconfigure(settings.cache_capacity, settings.cache_ttl_ms);
        self.limiter
            .reconfigure(settings.minute_capacity, settings.burst_capacity);
        self.coalescer.set_stale_ms(settings.stale_ms);
        self.store.reconfigure(&settings);
        self.settings.store(Arc::new(settings));
    }

    /// Provides access to the cache.
    pub fn cache(&self) -> &Cache<u64, User> {
        &self.cache
    }

    /// Provides access to the rate limiter.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Provides access to the coalescer.
    pub fn coalescer(&self) -> &Coalescer<u64, User, StoreError> {
        &self.coalescer
    }

    fn admit(&self, client: &str) -> ServiceResult<RateLimitHeaders> {
        match self.limiter.admit(client) {
            Admission::Allowed(limits) => Ok(limits),
            Admission::Rejected(rejection) => {
                log::info!(
                    "Rate limit ({} tier) exceeded by {}. Retry after {}s.",
                    rejection.tier,
                    client,
                    rejection.retry_after_s
                );
                Err(ServiceError::RateLimited(rejection))
            }
        }
    }

    /// Fetches the user with the given id on behalf of the given client.
    pub async fn get_user(&self, client: &str, raw_id: &str) -> Guarded<User> {
        let watch = Instant::now();

        let id = match parse_id(raw_id) {
            Ok(id) => id,
            Err(error) => return Guarded::turned_down(error),
        };
        let limits = match self.admit(client) {
            Ok(limits) => limits,
            Err(error) => return Guarded::turned_down(error),
        };

        let result = self.lookup(id).await;
        self.cache
            .record_latency(watch.elapsed().as_micros().min(i32::MAX as u128) as i32);

        match &result {
            Err(ServiceError::NotFound(_)) => log::info!("User {} not found.", id),
            Err(ServiceError::Timeout) => {
                log::warn!("Fetching user {} timed out (requested by {}).", id, client)
            }
            Err(error) => log::error!("Failed to fetch user {}: {}", id, error),
            Ok(_) => (),
        }

        Guarded {
            limits: Some(limits),
            result,
        }
    }

    async fn lookup(&self, id: u64) -> ServiceResult<User> {
        if let Some(user) = self.cache.get(&id) {
            return Ok(user);
        }

        let store = self.store.clone();
        let cache = self.cache.clone();
        self.coalescer
            .coalesce(id, move || async move {
                let user = store.lookup(id).await?;
                cache.put(id, user.clone());
                Ok(user)
            })
            .await
            .map_err(ServiceError::from)
    }

    /// Creates a new user from the given JSON body on behalf of the given client.
    pub async fn create_user(&self, client: &str, body: &[u8]) -> Guarded<User> {
        let new_user = match parse_new_user(body) {
            Ok(new_user) => new_user,
            Err(error) => return Guarded::turned_down(error),
        };
        let limits = match self.admit(client) {
            Ok(limits) => limits,
            Err(error) => return Guarded::turned_down(error),
        };

        let result = match self.store.insert(new_user).await {
            Ok(user) => {
                self.cache.put(user.id, user.clone());
                log::info!("Created user {} ({}).", user.id, user.email);
                Ok(user)
            }
            Err(error) => {
                log::error!("Failed to create a user: {}", error);
                Err(error.into())
            }
        };

        Guarded {
            limits: Some(limits),
            result,
        }
    }

    /// Lists all users on behalf of the given client.
    pub async fn list_users(&self, client: &str) -> Guarded<Vec<User>> {
        let limits = match self.admit(client) {
            Ok(limits) => limits,
            Err(error) => return Guarded::turned_down(error),
        };

        let result = self.store.list().await.map_err(|error| {
            log::error!("Failed to list users: {}", error);
            ServiceError::from(error)
        });

        Guarded {
            limits: Some(limits),
            result,
        }
    }

    /// Reports the state of the cache.
    pub fn cache_status(&self) -> CacheStatus<u64> {
        self.cache.status(SAMPLE_KEYS)
    }

    /// Removes all cached users.
    pub fn cache_clear(&self) -> ClearReport {
        let previous_size = self.cache.clear();
        log::info!("Cache cleared ({} entries removed).", previous_size);

        ClearReport {
            previous_size,
            cleared_at: format_timestamp(self.clock.wall()),
        }
    }

    /// Removes all stale users from the cache.
    pub fn cache_cleanup(&self) -> SweepReport {
        let report = self.cache.sweep();
        if report.removed > 0 {
            log::info!(
                "Removed {} stale entries from the cache ({} remaining).",
                report.removed,
                report.size_after
            );
        } else {
            log::debug!("No stale entries in the cache.");
        }

        report
    }

    /// Forgets about clients whose rate limit windows are all expired.
    pub fn limiter_cleanup(&self) -> usize {
        let removed = self.limiter.sweep();
        if removed > 0 {
            log::info!("Removed {} idle clients from the rate limiter.", removed);
        } else {
            log::debug!("No idle clients in the rate limiter.");
        }

        removed
    }

    /// Releases the waiters of all fetches which are pending for too long.
    pub fn coalescer_cleanup(&self) -> usize {
        let reclaimed = self.coalescer.reclaim_stale();
        if reclaimed.is_empty() {
            log::debug!("No stale fetches found.");
        } else {
            log::warn!(
                "Reclaimed the fetches of users {} as they were pending for more than {}.",
                reclaimed.iter().join(", "),
                format_millis(self.coalescer.stale_ms())
            );
        }

        reclaimed.len()
    }

    /// Reports uptime and the counters of all components.
    pub fn health(&self) -> Value {
        let stats = self.cache.stats();
        let uptime = self.clock.now().saturating_sub(self.started_at);

        json!({
            "status": "healthy",
            "uptime_ms": uptime,
            "uptime": format_millis(uptime),
            "cache": {
                "size": stats.size,
                "capacity": stats.capacity,
                "hits": stats.hits,
                "misses": stats.misses,
                "evictions": stats.evictions,
            },
            "limiter": {
                "clients": self.limiter.clients(),
                "burst_rejects": self.limiter.rejects(Tier::Burst),
                "minute_rejects": self.limiter.rejects(Tier::Minute),
            },
            "coalescer": {
                "pending": self.coalescer.pending(),
                "fetches": self.coalescer.fetches(),
                "timeouts": self.coalescer.timeouts(),
            },
        })
    }
}

fn parse_id(raw_id: &str) -> ServiceResult<u64> {
    match raw_id.trim().parse::<u64>() {
        Ok(id) if id >= 1 => Ok(id),
        _ => Err(crate::invalid_request!(
            "Invalid user id: '{}' (a positive integer is required)",
            raw_id
        )),
    }
}

fn parse_new_user(body: &[u8]) -> ServiceResult<NewUser> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|error| crate::invalid_request!("Invalid JSON body: {}", error))?;
    NewUser::from_json(&value).map_err(ServiceError::InvalidRequest)
}

/// Creates and installs a **UserService** backed by a seeded [MemoryStore].
///
/// If a [Config] is present, its settings are used and changes are applied at runtime. Also the
/// background [maintenance](crate::maintenance) is started.
///
/// Note that this is called by the [Builder](crate::builder::Builder) unless disabled.
pub fn install(platform: &Arc<Platform>) -> Arc<UserService> {
    let config = platform.find::<Config>();
    let settings = config
        .as_ref()
        .map(|config| config.current().settings().clone())
        .unwrap_or_default();

    let store = Arc::new(MemoryStore::seeded(settings.store_latency_ms));
    let service = Arc::new(UserService::new(
        settings,
        store,
        Arc::new(MonotonicClock::new()),
    ));
    platform.register::<UserService>(service.clone());

    if let Some(config) = config {
        watch_config(platform.clone(), &config, Arc::downgrade(&service));
    }
    crate::maintenance::start(platform, &service);

    service
}

fn watch_config(platform: Arc<Platform>, config: &Arc<Config>, service: Weak<UserService>) {
    let mut config_changed = config.notifier();
    let config = Arc::downgrade(config);
    crate::spawn!(async move {
        while platform.is_running() {
            tokio::select! {
                _ = tokio::time::sleep(SHUTDOWN_CHECK_INTERVAL) => {}
                change = config_changed.recv() => {
                    if let Err(RecvError::Closed) = change {
                        return;
                    }
                    match (service.upgrade(), config.upgrade()) {
                        (Some(service), Some(config)) => {
                            service.apply(config.current().settings().clone())
                        }
                        _ => return,
                    }
                }
            }
        }
    });
}
