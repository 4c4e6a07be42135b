//! Runs the periodic sweeps which keep the components lean.
//!
//! Three independent tasks are forked for each [UserService]:
//! * the cache sweep removes stale entries (every **maintenance.cache_sweep_ms**),
//! * the limiter sweep forgets idle clients (every **maintenance.limiter_sweep_ms**),
//! * the coalescer sweep releases the waiters of stale fetches
//!   (every **maintenance.coalescer_sweep_ms**).
//!
//! The intervals are re-read from the current settings before each sleep, therefore config
//! changes are picked up after the next run. Each task only keeps a weak reference to the
//! service and stops once the service is gone or the platform has been terminated.
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::platform::Platform;
use crate::service::UserService;
use crate::settings::Settings;

/// Starts all sweepers for the given service.
pub fn start(platform: &Arc<Platform>, service: &Arc<UserService>) {
    sweeper(
        platform.clone(),
        Arc::downgrade(service),
        |settings| settings.cache_sweep_ms,
        |service| {
            let _ = service.cache_cleanup();
        },
    );
    sweeper(
        platform.clone(),
        Arc::downgrade(service),
        |settings| settings.limiter_sweep_ms,
        |service| {
            let _ = service.limiter_cleanup();
        },
    );
    sweeper(
        platform.clone(),
        Arc::downgrade(service),
        |settings| settings.coalescer_sweep_ms,
        |service| {
            let _ = service.coalescer_cleanup();
        },
    );
}

fn sweeper<I, S>(platform: Arc<Platform>, service: Weak<UserService>, interval: I, sweep: S)
where
    I: Fn(&Settings) -> u64 + Send + 'static,
    S: Fn(&UserService) + Send + 'static,
{
    crate::spawn!(async move {
        loop {
            let wait = match service.upgrade() {
                Some(service) => interval(service.settings().as_ref()),
                None => return,
            };
            tokio::time::sleep(Duration::from_millis(wait.max(1))).await;

            if !platform.is_running() {
                return;
            }
            match service.upgrade() {
                Some(service) => sweep(service.as_ref()),
                None => return,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use crate::clock::ManualClock;
    use crate::platform::Platform;
    use crate::service::UserService;
    use crate::settings::Settings;
    use crate::store::MemoryStore;
    use crate::testing::test_async;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn sweepers_clean_up_periodically() {
        test_async(async {
            let platform = Platform::new();
            let clock = Arc::new(ManualClock::new());
            let service = Arc::new(UserService::new(
                Settings {
                    cache_sweep_ms: 10,
                    limiter_sweep_ms: 10,
                    coalescer_sweep_ms: 10,
                    ..Settings::default()
                },
                Arc::new(MemoryStore::seeded(0)),
                clock.clone(),
            ));
            crate::maintenance::start(&platform, &service);

            let _ = service.get_user("a", "1").await;
            assert_eq!(service.cache().len(), 1);
            assert_eq!(service.limiter().clients(), 1);

            clock.advance(60_001);
            tokio::time::sleep(Duration::from_millis(50)).await;

            assert_eq!(service.cache().len(), 0);
            assert_eq!(service.limiter().clients(), 0);
        });
    }

    #[test]
    fn sweepers_stop_with_their_service() {
        test_async(async {
            let platform = Platform::new();
            let store = Arc::new(MemoryStore::seeded(0));
            let service = Arc::new(UserService::new(
                Settings {
                    cache_sweep_ms: 5,
                    ..Settings::default()
                },
                store,
                Arc::new(ManualClock::new()),
            ));
            crate::maintenance::start(&platform, &service);

            let weak = Arc::downgrade(&service);
            drop(service);
            tokio::time::sleep(Duration::from_millis(20)).await;

            // Only the sweepers could keep the service alive...
            assert!(weak.upgrade().is_none());
        });
    }
}
