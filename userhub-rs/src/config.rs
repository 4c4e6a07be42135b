//! Contains the system configuration.
//!
//! Provides access to the system configuration which is loaded from the **config/settings.yml**
//! file. Note that we observe this file for changes and reload it once a change is detected.
//! Therefore each user of the config should attach itself to the
//! [Config::notifier](Config::notifier) and re-process the config once a change message is
//! received. This way the cache, the rate limiter and the server pick up new values without a
//! restart.
//!
//! Each loaded document is converted into [Settings] right away. A document which cannot be
//! parsed or which contains invalid values is rejected as a whole, so that the previously
//! loaded config remains active.
//!
//! Note that the **Config** struct is kind of constant and can be obtained from the **Platform**
//! once and then kept around. However, a [Handle] obtained via **Config::current()** should not
//! be stored, as it will not be updated once a new config has been loaded.
//!
//! # Examples
//!
//! Obtaining and reading the config:
//! ```
//! # use userhub::builder::Builder;
//! # use userhub::config::Config;
//! # #[tokio::main]
//! # async fn main() {
//! # let platform = Builder::new().enable_config().build().await;
//! // Obtain the config...
//! let config = platform.require::<Config>();
//!
//! // Fetch the current settings (might be reloaded from time to time) and read the
//! // selected server port..
//! let port = config.current().settings().port;
//!
//! // The raw document is also available...
//! let raw_port = config.current().config()["server"]["port"].as_i64();
//! # }
//! ```
//!
//! Attaching a change listener:
//! ```no_run
//! # use userhub::builder::Builder;
//! # use userhub::config::Config;
//! # #[tokio::main]
//! # async fn main() {
//! # let platform = Builder::new().enable_config().build().await;
//! let config = platform.require::<Config>();
//! tokio::spawn(async move {
//!     loop {
//!         match config.notifier().recv().await {
//!             Ok(_) => log::info!("Config update received..."),
//!             _ => return,
//!         }
//!     }
//! });
//! # }
//! ```
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use arc_swap::ArcSwap;
use yaml_rust::{Yaml, YamlLoader};

use crate::platform::Platform;
use crate::settings::Settings;

/// Provides access to the system configuration.
///
/// Most probably a config instance is installed by the [Builder](crate::builder::Builder) and
/// can be obtained via `platform.require::<Config>()`.
pub struct Config {
    filename: String,
    tx: tokio::sync::broadcast::Sender<()>,
    config: ArcSwap<Loaded>,
}

struct Loaded {
    doc: Yaml,
    settings: Settings,
    last_modified: Option<SystemTime>,
}

/// Represents the change listener.
///
/// Internally this is simply the receiver of a broadcast. The actual message being broadcast
/// can and should be ignored. All that matters is, once a message has been received, the config
/// was changed and needs to be re-processed.
pub type ChangeNotifier = tokio::sync::broadcast::Receiver<()>;

/// Represents a handle to the currently loaded configuration.
pub struct Handle {
    config: Arc<Loaded>,
}

impl Config {
    /// Creates a new config reading the given file.
    ///
    /// Until something is loaded, the default [Settings] are reported.
    pub fn new(file: &str) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(1);
        Config {
            filename: file.to_owned(),
            config: ArcSwap::new(Arc::new(Loaded {
                doc: Yaml::Null,
                settings: Settings::default(),
                last_modified: None,
            })),
            tx,
        }
    }

    /// Obtains a change notifier which receives a message once the config changed.
    pub fn notifier(&self) -> ChangeNotifier {
        self.tx.subscribe()
    }

    /// Obtains a handle to the currently loaded configuration.
    pub fn current(&self) -> Handle {
        Handle {
            config: self.config.load_full(),
        }
    }

    /// Determines the last modified date of the config file on disk.
    ///
    /// As within docker, the file is presented as volume, we check that it is a file, as an
    /// unmounted docker volume is always presented as directory.
    #[cfg(not(test))]
    async fn last_modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .and_then(|meta| meta.modified().ok())
    }

    /// Forces the config to read the underlying file.
    ///
    /// Note that this is normally called by the framework and should not be invoked manually.
    pub async fn load(&self) -> anyhow::Result<()> {
        log::info!("Loading config file {}...", &self.filename);

        match tokio::fs::metadata(&self.filename).await {
            Ok(metadata) if !metadata.is_file() => {
                log::info!("Config file is an unmounted docker volume - skipping config load.");
                return Ok(());
            }
            Err(_) => {
                log::info!("Config file doesn't exist - using the default settings.");
                return Ok(());
            }
            _ => (),
        }

        let config_data = tokio::fs::read_to_string(&self.filename)
            .await
            .with_context(|| format!("Cannot load config file {}", &self.filename))?;

        let last_modified = tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .and_then(|metadata| metadata.modified().ok());

        self.load_from_string(config_data.as_str(), last_modified)
    }

    /// Loads a configuration from the given string instead of a file.
    ///
    /// This is intended to be used in test environments where we cannot / do not want to load
    /// a config file from disk.
    ///
    /// # Example
    ///
    /// ```
    /// # use userhub::config::Config;
    /// let config = Config::new("somefile.yml");
    /// config.load_from_string("
    /// server:
    ///     port: 12345
    /// ", None).unwrap();
    ///
    /// assert_eq!(config.current().settings().port, 12345);
    /// assert_eq!(config.current().settings().cache_capacity, 100);
    /// ```
    pub fn load_from_string(
        &self,
        data: &str,
        last_modified: Option<SystemTime>,
    ) -> anyhow::Result<()> {
        let (doc, settings) = parse(data)
            .with_context(|| format!("Cannot load config file {}", &self.filename))?;

        self.config.store(Arc::new(Loaded {
            doc,
            settings,
            last_modified,
        }));

        // Notify all listeners - we ignore if there are none...
        let _ = self.tx.send(());

        Ok(())
    }
}

fn parse(data: &str) -> anyhow::Result<(Yaml, Settings)> {
    let mut docs = YamlLoader::load_from_str(data).context("Cannot parse config data")?;
    let doc = if docs.is_empty() {
        Yaml::Null
    } else {
        docs.swap_remove(0)
    };
    let settings = Settings::from_yaml(&doc)?;

    Ok((doc, settings))
}

impl Handle {
    /// Provides access to the raw config document.
    pub fn config(&self) -> &Yaml {
        &self.config.doc
    }

    /// Provides access to the validated settings.
    pub fn settings(&self) -> &Settings {
        &self.config.settings
    }
}

/// Creates and installs a **Config** for the given platform.
///
/// This will read its contents from **config/settings.yml** and also install a change listener
/// for this file. Note that this listener only watches the "last modified" date of the file and
/// doesn't perform a structural comparison.
pub async fn install(platform: Arc<Platform>) {
    let path = Path::new("config").to_path_buf();
    if let Err(error) = tokio::fs::create_dir_all(path.clone()).await {
        log::warn!(
            "Failed to create config base directory {}: {}",
            path.to_string_lossy(),
            error
        )
    }

    let config = Arc::new(Config::new("config/settings.yml"));
    platform.register::<Config>(config.clone());

    if let Err(error) = config.load().await {
        log::error!("{:#}", error);
    }

    run_config_change_monitor(platform, config);
}

#[cfg(test)]
fn run_config_change_monitor(_platform: Arc<Platform>, _config: Arc<Config>) {
    // No automatic updates during testing...
}

#[cfg(not(test))]
fn run_config_change_monitor(platform: Arc<Platform>, config: Arc<Config>) {
    crate::spawn!(async move {
        while platform.is_running() {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            let last_modified = config.last_modified().await;
            let last_loaded = config.config.load().last_modified;

            if last_modified.is_some() && (last_loaded.is_none() || last_modified > last_loaded) {
                match config.load().await {
                    Ok(_) => log::info!("System configuration was re-loaded."),
                    Err(error) => log::error!("Failed to re-load system config: {:#}", error),
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use crate::builder::Builder;
    use crate::config::Config;
    use std::time::SystemTime;

    #[test]
    fn ensure_config_update_works() {
        crate::testing::test_async(async {
            let platform = Builder::new().enable_config().build().await;
            let config = platform.require::<Config>();

            config
                .load_from_string("cache:\n    capacity: 42", Some(SystemTime::now()))
                .unwrap();

            let mut change_notifier = config.notifier();
            let (tx, rx) = tokio::sync::oneshot::channel();
            let _ = tokio::spawn(async move {
                if change_notifier.recv().await.is_ok() {
                    tx.send(()).unwrap();
                }
            });

            assert_eq!(config.current().settings().cache_capacity, 42);

            // Malformed or invalid configs are ignored...
            assert!(config
                .load_from_string("cache: 'invalid", Some(SystemTime::now()))
                .is_err());
            assert!(config
                .load_from_string("cache:\n    capacity: -1", Some(SystemTime::now()))
                .is_err());
            assert_eq!(config.current().settings().cache_capacity, 42);

            config
                .load_from_string("cache:\n    capacity: 4242", Some(SystemTime::now()))
                .unwrap();

            match rx.await {
                Ok(()) => (),
                _ => panic!("Received invalid value..."),
            };

            assert_eq!(config.current().settings().cache_capacity, 4242);
            assert_eq!(
                config.current().config()["cache"]["capacity"].as_i64(),
                Some(4242)
            );
        });
    }
}
