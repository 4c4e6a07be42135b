//! Provides a builder which can be used to setup and initialize the framework.
//!
//! This can be used to create and setup central parts of the system. As some components are
//! optional (e.g. a test might not want a server or signal handlers), a builder permits to
//! selectively enable or disable them.
//!
//! # Example
//! Setting up the system with all features enabled:
//! ```no_run
//! # use userhub::builder::Builder;
//! # use userhub::server::Server;
//! #[tokio::main]
//! async fn main() {
//!     // Enable all features and build the platform...
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Start the main event loop of the server...
//!     platform.require::<Server>().event_loop().await;
//! }
//! ```
use std::sync::Arc;

use crate::platform::Platform;
use crate::{init_logging, USERHUB_REVISION, USERHUB_VERSION};

/// Initializes the system by creating and initializing all enabled components.
#[derive(Default)]
pub struct Builder {
    setup_logging: bool,
    enable_signals: bool,
    setup_config: bool,
    setup_service: bool,
    setup_server: bool,
}

impl Builder {
    /// Creates a new builder with all components disabled.
    pub fn new() -> Self {
        Builder::default()
    }

    /// Enables all features.
    ///
    /// Note that using this method (and then maybe disabling selected components) is quite
    /// convenient, but be aware that new components which might be added in a library update
    /// will then also be enabled by default.
    pub fn enable_all(mut self) -> Self {
        self.setup_logging = true;
        self.enable_signals = true;
        self.setup_config = true;
        self.setup_service = true;
        self.setup_server = true;

        self
    }

    /// Enables the automatic setup of the logging system.
    ///
    /// Using this, we properly initialize **simplelog** to log to stdout. As we intend userhub
    /// to be run in docker containers, this is all that is needed for proper logging.
    pub fn enable_logging(mut self) -> Self {
        self.setup_logging = true;
        self
    }

    /// Disables the automatic setup of the logging system after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_logging(mut self) -> Self {
        self.setup_logging = false;
        self
    }

    /// Installs a signal listener which terminates the platform once **CTRL-C** or **SIGHUP**
    /// is received.
    ///
    /// For more details see: [signals](crate::signals)
    pub fn enable_signals(mut self) -> Self {
        self.enable_signals = true;
        self
    }

    /// Disables installing the signal listener after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_signals(mut self) -> Self {
        self.enable_signals = false;
        self
    }

    /// Installs [config::Config](crate::config::Config) and loads the **settings.yml**.
    ///
    /// For more details see: [config](crate::config)
    pub fn enable_config(mut self) -> Self {
        self.setup_config = true;
        self
    }

    /// Disables setting up a **Config** instance after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_config(mut self) -> Self {
        self.setup_config = false;
        self
    }

    /// Creates and installs the [UserService](crate::service::UserService) along with its store
    /// and background maintenance.
    pub fn enable_service(mut self) -> Self {
        self.setup_service = true;
        self
    }

    /// Disables setting up a **UserService** after [enable_all()](Builder::enable_all) has been
    /// used.
    pub fn disable_service(mut self) -> Self {
        self.setup_service = false;
        self
    }

    /// Creates and installs a [Server](crate::server::Server) instance.
    ///
    /// Note that still, the main event loop has to be invoked manually via:
    /// `platform.require::<Server>().event_loop().await`.
    pub fn enable_server(mut self) -> Self {
        self.setup_server = true;
        self
    }

    /// Disables setting up a **Server** instance after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_server(mut self) -> Self {
        self.setup_server = false;
        self
    }

    /// Builds the [Platform](crate::platform::Platform) registry with all the enabled components
    /// being registered.
    pub async fn build(self) -> Arc<Platform> {
        let platform = Platform::new();

        if self.setup_logging {
            init_logging();
        }

        log::info!(
            "||. USERHUB (v {} - rev {}) running on {} core(s) in {} CPU(s)",
            USERHUB_VERSION,
            USERHUB_REVISION,
            num_cpus::get(),
            num_cpus::get_physical()
        );

        if self.enable_signals {
            crate::signals::install(platform.clone());
        }

        if self.setup_config {
            crate::config::install(platform.clone()).await;
        }

        if self.setup_service {
            let _ = crate::service::install(&platform);
        }

        if self.setup_server {
            let _ = crate::server::Server::install(&platform);
        }

        platform
    }
}
