//! Contains the HTTP server of userhub.
//!
//! Opens a server-socket on the specified port (**server.port** in the config or 3000 as
//! fallback) and binds it to the selected IP (**server.host** in the config or 0.0.0.0 as
//! fallback). Each request is routed (see [request](crate::request)) to the
//! [UserService](crate::service::UserService) and its outcome is rendered as JSON (see
//! [response](crate::response)).
//!
//! The identity of a client (as used for rate limiting) is the IP address of its peer.
//!
//! Note that the sever periodically tries to bind the socket to the selected port. Therefore a
//! "new" instance can be started while the "old" one is bleeding out and the port will be "handed
//! through" with minimal downtime. Also, this will listen to change events of the config and will
//! relocate to another port or host if changed.
//!
//! # Example
//!
//! ```no_run
//! use userhub::builder::Builder;
//! use userhub::config::Config;
//! use userhub::server::Server;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Setup and create a platform...
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Specify a minimal config so that we run on a different port than a
//!     // production instance.
//!     platform.require::<Config>().load_from_string("
//!         server:
//!             port: 1503
//!     ", None).unwrap();
//!
//!     // Run the platform...
//!     platform.require::<Server>().event_loop().await;
//! }
//! ```
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use hyper::server::conn::{AddrIncoming, AddrStream};
use hyper::service::{make_service_fn, service_fn};
use hyper::body::HttpBody;
use hyper::{Body, Request, Response, StatusCode};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;

use crate::config::{ChangeNotifier, Config};
use crate::error::{ServiceError, ServiceResult};
use crate::platform::Platform;
use crate::request::{client_identity, Route};
use crate::response;
use crate::service::{cache_status_to_json, sweep_report_to_json, UserService};
use crate::settings::Settings;
use crate::spawn;
use crate::user::User;

/// Specifies how often the server checks if the platform is still running.
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Specifies the max size of a request body in bytes.
const MAX_BODY_SIZE: usize = 64 * 1024;

/// Specifies the pause between two attempts to bind the server socket.
const BIND_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Serves the HTTP surface of the platform.
pub struct Server {
    running: AtomicBool,
    current_address: Mutex<Option<String>>,
    platform: Arc<Platform>,
}

impl Server {
    /// Creates and installs a **Server** into the given **Platform**.
    ///
    /// Note that this is called by the [Builder](crate::builder::Builder) unless disabled.
    ///
    /// Also note, that this will not technically start the server. This has to be done manually
    /// via [event_loop](Server::event_loop) as it is most probably done in the main thread.
    pub fn install(platform: &Arc<Platform>) -> Arc<Self> {
        let server = Arc::new(Server {
            running: AtomicBool::new(false),
            current_address: Mutex::new(None),
            platform: platform.clone(),
        });

        platform.register::<Server>(server.clone());

        server
    }

    fn current_address(&self) -> MutexGuard<'_, Option<String>> {
        self.current_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Determines if the server socket should keep listening for incoming connections.
    ///
    /// In contrast to **Platform::is_running** this is not used to control the shutdown of the
    /// server. Rather we toggle this flag to false if a config and therefore address change was
    /// detected. This way the server is shut down gracefully and the **event_loop** binds a
    /// new socket for the appropriate address.
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Determines the server address based on the current configuration.
    fn address(&self) -> String {
        self.platform
            .find::<Config>()
            .map(|config| config.current().settings().address())
            .unwrap_or_else(|| Settings::default().address())
    }

    /// Returns the address the server socket is currently bound to.
    pub fn bound_address(&self) -> Option<String> {
        self.current_address().clone()
    }

    /// Starts the event loop in a separate task.
    ///
    /// This is most probably used by test scenarios where the tests itself run in the main thread.
    pub fn fork(server: &Arc<Server>) {
        let cloned_server = server.clone();
        spawn!(async move {
            cloned_server.event_loop().await;
        });
    }

    /// Starts the event loop in a separate task and waits until the server socket is bound.
    ///
    /// Just like **fork** this is intended to be used in test environments.
    pub async fn fork_and_await(server: &Arc<Server>) {
        Server::fork(server);

        while server.bound_address().is_none() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Tries to open a server socket on the specified address to serve incoming requests.
    ///
    /// Once the socket is bound, requests are served until either the platform is no longer
    /// running (in this case we exit) or the config has changed and we should try to bind the
    /// server to the new address.
    pub async fn event_loop(&self) {
        let mut address = String::new();
        let mut last_bind_error_reported: Option<Instant> = None;

        while self.platform.is_running() {
            // If the sever is started for the first time or if it has been restarted due to a
            // config change, we need to reload the address...
            if !self.is_running() {
                address = self.address();
                self.running.store(true, Ordering::Release);
            }

            match bind(&address).await {
                Ok(incoming) => {
                    log::info!("Opened server socket on {}...", &address);
                    *self.current_address() = Some(address.clone());
                    if let Err(error) = self.serve(incoming).await {
                        log::error!("The HTTP server on {} failed: {}", &address, error);
                    }
                    *self.current_address() = None;
                    log::info!("Closing server socket on {}.", &address);
                }
                Err(error) => {
                    // We only log this every once in a while (every 5s). Otherwise we would
                    // jam the log as we retry every 500ms.
                    if last_bind_error_reported
                        .map(|reported| reported.elapsed().as_secs() >= 5)
                        .unwrap_or(true)
                    {
                        log::error!("{:#}. Retrying every 500ms...", error);
                        last_bind_error_reported = Some(Instant::now());
                    }
                    tokio::time::sleep(BIND_RETRY_INTERVAL).await;
                }
            }
        }
    }

    async fn serve(&self, incoming: hyper::server::Builder<AddrIncoming>) -> hyper::Result<()> {
        let platform = self.platform.clone();
        let make_service = make_service_fn(move |connection: &AddrStream| {
            let platform = platform.clone();
            let client = client_identity(Some(connection.remote_addr()));

            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    let platform = platform.clone();
                    let client = client.clone();

                    async move { Ok::<_, Infallible>(handle(platform, client, request).await) }
                }))
            }
        });

        incoming
            .serve(make_service)
            .with_graceful_shutdown(self.shutdown_signal())
            .await
    }

    /// Completes once the platform is terminated or the configured address changed.
    async fn shutdown_signal(&self) {
        let mut notifier = self.platform.find::<Config>().map(|config| config.notifier());

        while self.platform.is_running() {
            tokio::select! {
                _ = tokio::time::sleep(SHUTDOWN_CHECK_INTERVAL) => {}
                _ = config_changed(&mut notifier) => {
                    let new_address = self.address();
                    if self.current_address().as_ref() != Some(&new_address) {
                        log::info!("Server address has changed. Restarting server socket...");

                        // Force the event_loop to re-evaluate the expected server address...
                        self.running.store(false, Ordering::Release);
                        return;
                    }
                }
            }
        }
    }
}

async fn bind(address: &str) -> anyhow::Result<hyper::server::Builder<AddrIncoming>> {
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("Cannot open server address: {}", address))?;
    let listener = listener
        .into_std()
        .context("Cannot convert the server socket")?;

    Ok(hyper::Server::from_tcp(listener)?)
}

async fn config_changed(notifier: &mut Option<ChangeNotifier>) {
    if let Some(receiver) = notifier {
        if let Err(RecvError::Closed) = receiver.recv().await {
            *notifier = None;
        }
    } else {
        futures::future::pending::<()>().await;
    }
}

/// Reads the given body but refuses to buffer more than [MAX_BODY_SIZE] bytes.
async fn read_body(mut body: Body) -> ServiceResult<Vec<u8>> {
    if body.size_hint().lower() > MAX_BODY_SIZE as u64 {
        return Err(body_too_large());
    }

    let mut data = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk
            .map_err(|error| crate::invalid_request!("Cannot read the request body: {}", error))?;
        if data.len() + chunk.len() > MAX_BODY_SIZE {
            return Err(body_too_large());
        }
        data.extend_from_slice(&chunk);
    }

    Ok(data)
}

fn body_too_large() -> ServiceError {
    crate::invalid_request!(
        "The request body exceeds the limit of {} bytes",
        MAX_BODY_SIZE
    )
}

async fn handle(platform: Arc<Platform>, client: String, request: Request<Body>) -> Response<Body> {
    let watch = Instant::now();

    let service = match platform.find::<UserService>() {
        Some(service) => service,
        None => {
            return response::failure(
                &crate::internal_error!("The user service is not available"),
                Some(watch),
            )
        }
    };

    match Route::parse(request.method(), request.uri().path()) {
        Route::GetUser(id) => response::guarded(
            service.get_user(&client, &id).await,
            StatusCode::OK,
            |user| user.to_json(),
            watch,
        ),
        Route::ListUsers => response::guarded(
            service.list_users(&client).await,
            StatusCode::OK,
            |users| Value::Array(users.iter().map(User::to_json).collect()),
            watch,
        ),
        Route::CreateUser => match read_body(request.into_body()).await {
            Ok(body) => response::guarded(
                service.create_user(&client, &body).await,
                StatusCode::CREATED,
                |user| user.to_json(),
                watch,
            ),
            Err(error) => response::failure(&error, Some(watch)),
        },
        Route::CacheStatus => response::success(
            StatusCode::OK,
            cache_status_to_json(&service.cache_status()),
            Some(watch),
        ),
        Route::CacheClear => response::success(
            StatusCode::OK,
            service.cache_clear().to_json(),
            Some(watch),
        ),
        Route::CacheCleanup => response::success(
            StatusCode::OK,
            sweep_report_to_json(&service.cache_cleanup()),
            Some(watch),
        ),
        Route::Health => response::success(StatusCode::OK, service.health(), Some(watch)),
        Route::Unknown => response::unknown_route(request.uri().path()),
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::Builder;
    use crate::config::Config;
    use crate::error::ServiceError;
    use crate::server::{read_body, Server, MAX_BODY_SIZE};
    use crate::testing::test_async;
    use hyper::body::Bytes;
    use hyper::{Body, Client, Method, Request, StatusCode};
    use serde_json::Value;

    async fn call(
        method: Method,
        path: &str,
        body: &str,
    ) -> (StatusCode, hyper::HeaderMap, Value) {
        let request = Request::builder()
            .method(method)
            .uri(format!("http://127.0.0.1:1503{}", path))
            .header("content-type", "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap();

        let response = Client::new().request(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();

        (status, headers, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn oversized_bodies_are_refused() {
        test_async(async {
            let body = read_body(Body::from(r#"{"name": "X", "email": "x@y.z"}"#))
                .await
                .unwrap();
            assert_eq!(body.len(), 31);

            let result = read_body(Body::from(vec![b' '; MAX_BODY_SIZE + 1])).await;
            assert!(matches!(result, Err(ServiceError::InvalidRequest(_))));

            // A streamed body without a length is cut off once it grows too large...
            let (mut sender, body) = Body::channel();
            let _ = tokio::spawn(async move {
                for _ in 0..3 {
                    if sender
                        .send_data(Bytes::from(vec![b' '; MAX_BODY_SIZE / 2]))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            });
            let result = read_body(body).await;
            assert!(matches!(result, Err(ServiceError::InvalidRequest(_))));
        });
    }

    #[test]
    fn integration_test() {
        // We want exclusive access to the 1503 port on which we fire up a test-server...
        log::info!("Acquiring shared resources...");
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();
        log::info!("Successfully acquired shared resources.");

        test_async(async {
            let platform = Builder::new().enable_all().build().await;

            // Specify a minimal config so that we run on a different port than a
            // production instance.
            platform
                .require::<Config>()
                .load_from_string(
                    "
server:
    host: 127.0.0.1
    port: 1503
store:
    latency_ms: 10
",
                    None,
                )
                .unwrap();

            // Normally we'd directly run the event loop here:
            // platform.require::<Server>().event_loop().await;
            //
            // However, as we want to issue some requests, we fork the server...
            Server::fork_and_await(&platform.require::<Server>()).await;

            let (status, headers, body) = call(Method::GET, "/users/1", "").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["success"], true);
            assert_eq!(body["data"]["name"], "John Doe");
            assert_eq!(body["data"]["email"], "john@example.com");
            assert_eq!(headers["X-RateLimit-Limit"], "10");
            assert_eq!(headers["X-RateLimit-Remaining"], "9");
            assert_eq!(headers["X-RateLimit-Burst-Remaining"], "4");

            let (status, _, body) = call(Method::GET, "/users/999", "").await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(body["success"], false);

            let (status, _, _) = call(Method::GET, "/users/abc", "").await;
            assert_eq!(status, StatusCode::BAD_REQUEST);

            let (status, _, body) = call(
                Method::POST,
                "/users",
                r#"{"name": "Test User", "email": "test@example.com"}"#,
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
            assert_eq!(body["data"]["id"], 4);

            let (status, _, body) = call(Method::GET, "/users", "").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["data"].as_array().map(Vec::len), Some(4));

            let (status, _, body) = call(Method::GET, "/users/4", "").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["data"]["name"], "Test User");

            // This is the sixth admitted request within 10s...
            let (status, headers, body) = call(Method::GET, "/users/1", "").await;
            assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
            assert_eq!(body["tier"], "burst");
            assert!(headers.contains_key("Retry-After"));

            let (status, _, body) = call(Method::GET, "/cache/status", "").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["data"]["size"], 2);
            assert_eq!(body["data"]["hits"], 1);

            let (status, _, body) = call(Method::POST, "/cache/cleanup", "").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["data"]["entries_cleaned"], 0);

            let (status, _, body) = call(Method::POST, "/cache/clear", "").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["data"]["previous_size"], 2);

            let (status, _, body) = call(Method::GET, "/health", "").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["data"]["status"], "healthy");

            let (status, _, _) = call(Method::GET, "/unknown", "").await;
            assert_eq!(status, StatusCode::NOT_FOUND);

            platform.terminate();
        });
    }
}
