//! Road-routing service abstraction.
//!
//! Both the road-snap resolver (short member segments) and the route
//! resolver (user → target) talk to the same service; they differ only in how
//! often they call it and what they fall back to.
//!
//! With the `http` feature, [`OsrmClient`] talks to an OSRM-compatible
//! `/route/v1` endpoint with retry and exponential backoff on 429.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{Position, Result};

/// A path returned by the routing service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedPath {
    pub geometry: Vec<Position>,
    pub distance_m: f64,
    pub eta_s: f64,
}

/// Anything that can route between two points.
pub trait RoutingService: Send + Sync + 'static {
    fn route(
        &self,
        origin: Position,
        destination: Position,
    ) -> impl Future<Output = Result<RoutedPath>> + Send;
}

impl<S: RoutingService> RoutingService for Arc<S> {
    fn route(
        &self,
        origin: Position,
        destination: Position,
    ) -> impl Future<Output = Result<RoutedPath>> + Send {
        (**self).route(origin, destination)
    }
}

#[cfg(feature = "http")]
pub use self::osrm::{OsrmClient, DEFAULT_BASE_URL, DEFAULT_PROFILE};

#[cfg(feature = "http")]
mod osrm {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use log::{debug, warn};
    use reqwest::Client;
    use serde::Deserialize;

    use super::{RoutedPath, RoutingService};
    use crate::{Position, Result, TrackerError};

    /// Public demo server; fine for development, not for production load.
    pub const DEFAULT_BASE_URL: &str = "https://router.project-osrm.org";
    pub const DEFAULT_PROFILE: &str = "foot";

    const MAX_RETRIES: u32 = 3;
    const REQUEST_TIMEOUT_SECS: u64 = 10;

    #[derive(Debug, Deserialize)]
    struct OsrmResponse {
        code: String,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        routes: Vec<OsrmRoute>,
    }

    #[derive(Debug, Deserialize)]
    struct OsrmRoute {
        geometry: String,
        distance: f64,
        duration: f64,
    }

    /// OSRM-compatible HTTP routing client.
    pub struct OsrmClient {
        client: Client,
        base_url: String,
        profile: String,
        consecutive_429s: AtomicU32,
    }

    impl OsrmClient {
        /// Client for `base_url` (no trailing slash needed) and routing `profile`.
        pub fn new(base_url: &str, profile: &str) -> Result<Self> {
            let client = Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .map_err(|e| TrackerError::Internal {
                    message: format!("Failed to create HTTP client: {}", e),
                })?;

            Ok(Self {
                client,
                base_url: base_url.trim_end_matches('/').to_string(),
                profile: profile.to_string(),
                consecutive_429s: AtomicU32::new(0),
            })
        }

        /// Client for the public demo server with the walking profile.
        pub fn with_defaults() -> Result<Self> {
            Self::new(DEFAULT_BASE_URL, DEFAULT_PROFILE)
        }

        pub fn route_url(&self, origin: &Position, destination: &Position) -> String {
            format!(
                "{}/route/v1/{}/{},{};{},{}?overview=full&geometries=polyline",
                self.base_url, self.profile, origin.lng, origin.lat, destination.lng, destination.lat
            )
        }

        fn record_429(&self) -> Duration {
            let count = self.consecutive_429s.fetch_add(1, Ordering::Relaxed) + 1;
            // Exponential backoff: 1s, 2s, 4s, 8s...
            let backoff_ms = 1000 * (1u64 << count.min(4));
            Duration::from_millis(backoff_ms)
        }

        async fn fetch(&self, origin: Position, destination: Position) -> Result<RoutedPath> {
            let url = self.route_url(&origin, &destination);
            let mut retries = 0;

            loop {
                let response = self.client.get(&url).send().await;

                let resp = match response {
                    Ok(resp) => resp,
                    Err(e) => {
                        retries += 1;
                        if retries > MAX_RETRIES {
                            return Err(TrackerError::Routing {
                                message: format!("Request error: {}", e),
                                status_code: None,
                            });
                        }
                        let backoff = Duration::from_millis(500 * (1 << retries));
                        warn!("[OsrmClient] Request error: {}, retry {} after {:?}", e, retries, backoff);
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                };

                let status = resp.status();
                if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        return Err(TrackerError::Routing {
                            message: "Max retries exceeded (429)".to_string(),
                            status_code: Some(status.as_u16()),
                        });
                    }
                    let backoff = self.record_429();
                    warn!("[OsrmClient] 429, retry {} after {:?}", retries, backoff);
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                self.consecutive_429s.store(0, Ordering::Relaxed);

                if !status.is_success() {
                    return Err(TrackerError::Routing {
                        message: format!("HTTP {}", status),
                        status_code: Some(status.as_u16()),
                    });
                }

                let body = resp.json::<OsrmResponse>().await.map_err(|e| TrackerError::Routing {
                    message: format!("Parse error: {}", e),
                    status_code: None,
                })?;
                return parse_response(body);
            }
        }
    }

    fn parse_response(body: OsrmResponse) -> Result<RoutedPath> {
        if body.code != "Ok" {
            return Err(TrackerError::Routing {
                message: format!(
                    "{}: {}",
                    body.code,
                    body.message.unwrap_or_else(|| "no route".to_string())
                ),
                status_code: None,
            });
        }
        let route = body.routes.into_iter().next().ok_or_else(|| TrackerError::Routing {
            message: "Response contained no routes".to_string(),
            status_code: None,
        })?;

        let line = polyline::decode_polyline(&route.geometry, 5).map_err(|e| TrackerError::Routing {
            message: format!("Bad geometry: {}", e),
            status_code: None,
        })?;
        let geometry: Vec<Position> = line.coords().map(|c| Position::new(c.y, c.x)).collect();
        debug!(
            "[OsrmClient] Route: {} points, {:.0}m, {:.0}s",
            geometry.len(),
            route.distance,
            route.duration
        );

        Ok(RoutedPath {
            geometry,
            distance_m: route.distance,
            eta_s: route.duration,
        })
    }

    impl RoutingService for OsrmClient {
        fn route(
            &self,
            origin: Position,
            destination: Position,
        ) -> impl std::future::Future<Output = Result<RoutedPath>> + Send {
            self.fetch(origin, destination)
        }
    }

}
