//! Maps incoming HTTP requests to the operations of the [UserService](crate::service::UserService).
//!
//! # Examples
//!
//! ```
//! # use hyper::Method;
//! # use userhub::request::Route;
//! assert_eq!(Route::parse(&Method::GET, "/users/42"), Route::GetUser("42".to_owned()));
//! assert_eq!(Route::parse(&Method::POST, "/users"), Route::CreateUser);
//! assert_eq!(Route::parse(&Method::DELETE, "/users/42"), Route::Unknown);
//! ```
use std::net::SocketAddr;

use hyper::Method;
use regex::Regex;

lazy_static::lazy_static! {
    static ref USER_PATH: Regex = Regex::new(r"^/users/([^/]*)/?$").unwrap();
}

/// Enumerates the endpoints of the HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `GET /users/{id}` (the id is passed on as is and validated by the service).
    GetUser(String),
    /// `GET /users`
    ListUsers,
    /// `POST /users`
    CreateUser,
    /// `GET /cache/status`
    CacheStatus,
    /// `POST /cache/clear`
    CacheClear,
    /// `POST /cache/cleanup`
    CacheCleanup,
    /// `GET /health`
    Health,
    /// Anything else.
    Unknown,
}

impl Route {
    /// Determines the route for the given method and path.
    pub fn parse(method: &Method, path: &str) -> Route {
        let trimmed = match path.trim_end_matches('/') {
            "" => "/",
            trimmed => trimmed,
        };

        match (method, trimmed) {
            (&Method::GET, "/users") => Route::ListUsers,
            (&Method::POST, "/users") => Route::CreateUser,
            (&Method::GET, "/cache/status") => Route::CacheStatus,
            (&Method::POST, "/cache/clear") => Route::CacheClear,
            (&Method::POST, "/cache/cleanup") => Route::CacheCleanup,
            (&Method::GET, "/health") => Route::Health,
            (&Method::GET, _) => USER_PATH
                .captures(path)
                .and_then(|captures| captures.get(1))
                .map(|id| Route::GetUser(id.as_str().to_owned()))
                .unwrap_or(Route::Unknown),
            _ => Route::Unknown,
        }
    }
}

/// Determines the identity of a client used for rate limiting.
///
/// This is the IP address of the peer or **unknown** if none is available.
pub fn client_identity(peer: Option<SocketAddr>) -> String {
    peer.map(|address| address.ip().to_string())
        .filter(|ip| !ip.is_empty())
        .unwrap_or_else(|| "unknown".to_owned())
}

#[cfg(test)]
mod tests {
    use crate::request::{client_identity, Route};
    use hyper::Method;

    #[test]
    fn routes_are_detected() {
        assert_eq!(Route::parse(&Method::GET, "/users"), Route::ListUsers);
        assert_eq!(Route::parse(&Method::GET, "/users/"), Route::ListUsers);
        assert_eq!(
            Route::parse(&Method::GET, "/users/abc"),
            Route::GetUser("abc".to_owned())
        );
        assert_eq!(
            Route::parse(&Method::GET, "/users/7/"),
            Route::GetUser("7".to_owned())
        );
        assert_eq!(Route::parse(&Method::GET, "/cache/status"), Route::CacheStatus);
        assert_eq!(Route::parse(&Method::POST, "/cache/clear"), Route::CacheClear);
        assert_eq!(Route::parse(&Method::POST, "/cache/cleanup"), Route::CacheCleanup);
        assert_eq!(Route::parse(&Method::GET, "/health"), Route::Health);
    }

    #[test]
    fn unknown_routes_are_detected() {
        assert_eq!(Route::parse(&Method::GET, "/"), Route::Unknown);
        assert_eq!(Route::parse(&Method::GET, "/users/1/friends"), Route::Unknown);
        assert_eq!(Route::parse(&Method::GET, "/cache/clear"), Route::Unknown);
        assert_eq!(Route::parse(&Method::PUT, "/users"), Route::Unknown);
    }

    #[test]
    fn clients_are_identified_by_ip() {
        assert_eq!(
            client_identity(Some("10.0.0.1:4711".parse().unwrap())),
            "10.0.0.1"
        );
        assert_eq!(client_identity(None), "unknown");
    }
}
