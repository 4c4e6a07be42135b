//! Userhub serves user records from a slow backing store via HTTP while shielding that store
//! from load.
//!
//! # Introduction
//! Looking up a user in the backing store is slow (think of a remote database or a legacy
//! system). **Userhub** therefore places three protective layers in front of it:
//!
//! * **LRU-Cache**: A size constrained cache with a per entry time to live keeps recently
//!   requested users in memory. See [lru] for the details.
//! * **Rate limiting**: Each client is tracked with two fixed windows, a burst window of ten
//!   seconds and a minute window. Requests which exceed either budget are rejected with
//!   **429 Too Many Requests**. See [limiter].
//! * **Request coalescing**: Concurrent lookups for the same uncached user are merged into a
//!   single store access. See [coalescer].
//!
//! # Features
//! * **100% Async/Await** - the whole server builds upon [tokio](https://tokio.rs/) and
//!   [hyper](https://hyper.rs/).
//! * **Reload-aware config facility** which permits to update the configuration during operation.
//!   Cache capacity, TTL, rate limits and even the IP binding or port can be changed without a
//!   restart. See [config] and [settings].
//! * **Built-in management endpoints**. The cache can be inspected, cleared and swept via HTTP.
//!   A health endpoint reports the uptime along with cache statistics.
//! * **Background maintenance**. Expired cache entries, idle rate limiter clients and stale
//!   fetches are swept periodically. See [maintenance].
//!
//! # Endpoints
//! * `GET /users/{id}` - fetches a single user.
//! * `GET /users` - lists all users.
//! * `POST /users` - creates a new user from a JSON body containing **name** and **email**.
//! * `GET /cache/status` - reports the cache statistics.
//! * `POST /cache/clear` - clears the cache.
//! * `POST /cache/cleanup` - removes all expired cache entries.
//! * `GET /health` - reports the uptime and cache statistics.
//!
//! # Examples
//! A short example on how to initialize the library can be found here [Builder](builder::Builder).
//! A complete binary is provided by **userhub-io**.
#![deny(trivial_casts, unused_extern_crates, unused_import_braces)]
#![warn(missing_docs, trivial_numeric_casts, unused_results)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod average;
pub mod builder;
pub mod clock;
pub mod coalescer;
pub mod config;
pub mod error;
pub mod fmt;
pub mod limiter;
pub mod lru;
pub mod maintenance;
pub mod platform;
pub mod request;
pub mod response;
pub mod server;
pub mod service;
pub mod settings;
pub mod signals;
pub mod store;
pub mod user;

/// Contains the version of the Userhub library.
pub const USERHUB_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Contains the git commit hash of the Userhub build being used.
pub const USERHUB_REVISION: &str = "NO-REVISION";

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to set up the
/// framework, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // Tests might build several platforms, but the logger can only be installed once...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            eprintln!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned join handle to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate userhub;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}
