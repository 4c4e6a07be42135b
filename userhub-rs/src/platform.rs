//! Provides a tiny DI like container to expose all components of the system.
//!
//! The platform is more or less a simple map which keeps all central components (the
//! [Config](crate::config::Config), the [UserService](crate::service::UserService) and the
//! [Server](crate::server::Server)) as **Arc<T>** around. Also this keeps the central
//! **is_running** flag which is toggled to *false* once [Platform::terminate] is invoked.
//!
//! Note that [Platform::require] is a good way of fetching a service which is known to be there.
//! However, once the system shutdown is initiated, the internal map is cleared (so that all
//! Dropped handlers run). Therefore code which might be executed after [Platform::terminate]
//! was called (e.g. a request handler) should use [Platform::find] and gracefully handle the
//! **None** case.
//!
//! # Examples
//!
//! ```
//! # use std::sync::Arc;
//! # use userhub::platform::Platform;
//! struct Service {
//!     value : i32
//! }
//!
//! struct UnknownService;
//!
//! let platform = Platform::new();
//!
//! // Registers a new service...
//! platform.register::<Service>(Arc::new(Service { value: 42 }));
//!
//! // Obtains a reference to a previously registered service...
//! let service = platform.require::<Service>();
//! assert_eq!(service.value, 42);
//!
//! // Trying to obtain a service which hasn't been registered yet, returns an empty
//! // optional...
//! assert_eq!(platform.find::<UnknownService>().is_none(), true);
//!
//! // By default the platform is running...
//! assert_eq!(platform.is_running(), true);
//!
//! // Once terminated...
//! platform.terminate();
//! // All services are immediately released so that their "Dropped" handlers run...
//! assert_eq!(platform.find::<Service>().is_none(), true);
//!
//! // and the platform is no longer considered active...
//! assert_eq!(platform.is_running(), false);
//! ```
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Services = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// Provides a container to keep all central services in a single place.
pub struct Platform {
    services: Mutex<Services>,
    is_running: AtomicBool,
}

impl Platform {
    /// Creates a new platform instance.
    pub fn new() -> Arc<Self> {
        Arc::new(Platform {
            services: Mutex::new(HashMap::new()),
            is_running: AtomicBool::new(true),
        })
    }

    fn services(&self) -> MutexGuard<'_, Services> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new component.
    ///
    /// A previously registered component of the same type is replaced.
    pub fn register<T>(&self, service: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        let _ = self.services().insert(TypeId::of::<T>(), service);
    }

    /// Tries to resolve a previously registered service.
    ///
    /// # Examples
    /// ```
    /// # use userhub::platform::Platform;
    /// # use std::sync::Arc;
    /// struct Service {
    ///     value: i32
    /// }
    ///
    /// let platform = Platform::new();
    /// platform.register::<Service>(Arc::new(Service { value: 42 }));
    ///
    /// assert_eq!(platform.find::<Service>().unwrap().value, 42);
    /// assert_eq!(platform.find::<String>().is_none(), true);
    /// ```
    pub fn find<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.services()
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.clone().downcast::<T>().ok())
    }

    /// Resolves a previously registered service.
    ///
    /// # Panics
    /// Panics if the requested service isn't available or if the platform is already shutting
    /// down.
    ///
    /// ```should_panic
    /// # use userhub::platform::Platform;
    /// struct UnknownService;
    ///
    /// let platform = Platform::new();
    /// platform.require::<UnknownService>();
    /// ```
    pub fn require<T>(&self) -> Arc<T>
    where
        T: Any + Send + Sync,
    {
        if !self.is_running() {
            panic!(
                "A required component ({}) has been requested but the system is shutting down!",
                std::any::type_name::<T>()
            )
        }

        match self.find::<T>() {
            Some(service) => service,
            None => panic!(
                "A required component ({}) was not available in the platform registry!",
                std::any::type_name::<T>()
            ),
        }
    }

    /// Determines if the platform is still running or if [Platform::terminate] has already
    /// been called.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Terminates the platform.
    ///
    /// This will immediately release all services (so that the Dropped handlers run eventually)
    /// and toggle the [is_running()](Platform::is_running) flag to **false**. Background tasks
    /// like the sweepers and the server observe this flag and stop.
    pub fn terminate(&self) {
        self.services().clear();
        self.is_running.store(false, Ordering::Release);
    }
}
