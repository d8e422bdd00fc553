//! # Route Resolver
//!
//! Live point-to-point route between the user and a selected target.
//!
//! Selection is answered synchronously with a straight-line fallback (great
//! circle distance at walking speed), so there is always something to draw.
//! A [`RouteRequest`] is handed back for the caller to dispatch; a successful
//! response replaces the fallback, a failure leaves it in place.
//!
//! Endpoint movement is debounced before a new fallback and request are
//! produced. The viewport is fitted to the endpoints only the first time a
//! target id is selected.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::geo_utils::haversine_distance;
use crate::routing::RoutedPath;
use crate::timing::Debouncer;
use crate::{Bounds, Position, Result, RouteResult, RouteSource};

/// Endpoint moves below this are ignored.
const ENDPOINT_EPSILON_M: f64 = 1.0;

/// Configuration for live routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Speed assumed for the straight-line ETA.
    /// Default: 1.4 m/s
    pub walking_speed_mps: f64,

    /// Quiet period after endpoint movement before re-resolving.
    /// Default: 250 ms
    pub debounce_ms: u64,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            walking_speed_mps: 1.4,
            debounce_ms: 250,
        }
    }
}

/// A routed-path request to be sent to the routing service.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRequest {
    /// Monotonic per resolver; later requests have larger ids
    pub request_id: u64,
    pub target_id: String,
    pub origin: Position,
    pub destination: Position,
}

/// The route currently shown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteView {
    pub target_id: String,
    pub origin: Position,
    pub destination: Position,
    pub result: RouteResult,
    /// Polyline to draw: the routed geometry, or the two endpoints
    pub polyline: Vec<Position>,
    pub label: String,
}

impl RouteView {
    pub fn is_fallback(&self) -> bool {
        self.result.source == RouteSource::StraightLine
    }
}

/// Outcome of selecting a target or re-resolving moved endpoints.
#[derive(Debug, Clone)]
pub struct RouteSelection {
    pub view: RouteView,
    pub request: RouteRequest,
    /// Set only the first time this target is selected
    pub auto_fit: Option<Bounds>,
}

/// Straight-line route from great-circle distance and walking speed.
pub fn fallback_route(origin: &Position, destination: &Position, speed_mps: f64) -> RouteResult {
    let distance_m = haversine_distance(origin, destination);
    RouteResult {
        distance_m,
        eta_s: distance_m / speed_mps,
        geometry: None,
        source: RouteSource::StraightLine,
    }
}

/// Human-readable "X.XX km · N min" label.
pub fn format_label(result: &RouteResult) -> String {
    let km = result.distance_m / 1000.0;
    let minutes = (result.eta_s / 60.0).round() as u64;
    match result.source {
        RouteSource::Routed => format!("{:.2} km · {} min", km, minutes),
        RouteSource::StraightLine => format!("{:.2} km · {} min (straight line)", km, minutes),
    }
}

#[derive(Debug, Clone)]
struct Endpoints {
    target_id: String,
    origin: Position,
    destination: Position,
}

/// Network-first, fallback-always route bookkeeping.
#[derive(Debug)]
pub struct RouteResolver {
    config: RouteConfig,
    debounce: Debouncer,
    active: Option<Endpoints>,
    pending: Option<(Position, Position)>,
    view: Option<RouteView>,
    next_request_id: u64,
    applied_request_id: Option<u64>,
    last_auto_fit_target: Option<String>,
}

impl RouteResolver {
    pub fn new(config: RouteConfig) -> Self {
        let debounce = Debouncer::new(config.debounce_ms);
        Self {
            config,
            debounce,
            active: None,
            pending: None,
            view: None,
            next_request_id: 1,
            applied_request_id: None,
            last_auto_fit_target: None,
        }
    }

    /// Select a target. The returned view is the straight-line fallback and is
    /// immediately renderable.
    pub fn select(&mut self, target_id: &str, origin: Position, destination: Position) -> RouteSelection {
        self.debounce.cancel();
        self.pending = None;
        self.applied_request_id = None;
        let endpoints = Endpoints {
            target_id: target_id.to_string(),
            origin,
            destination,
        };

        let auto_fit = if self.last_auto_fit_target.as_deref() != Some(target_id) {
            self.last_auto_fit_target = Some(target_id.to_string());
            Bounds::from_positions(&[origin, destination])
        } else {
            None
        };

        let (view, request) = self.resolve_fallback(&endpoints);
        self.active = Some(endpoints);
        debug!(
            "[RouteResolver] Selected '{}' ({:.0}m straight line)",
            target_id, view.result.distance_m
        );
        RouteSelection {
            view,
            request,
            auto_fit,
        }
    }

    /// Note moved endpoints for the active target. Returns true if a
    /// re-resolve was scheduled.
    pub fn update_endpoints(&mut self, origin: Position, destination: Position, now_ms: u64) -> bool {
        let Some(active) = &self.active else {
            return false;
        };
        let (cur_origin, cur_destination) = self
            .pending
            .unwrap_or((active.origin, active.destination));
        if haversine_distance(&cur_origin, &origin) < ENDPOINT_EPSILON_M
            && haversine_distance(&cur_destination, &destination) < ENDPOINT_EPSILON_M
        {
            return false;
        }
        self.pending = Some((origin, destination));
        self.debounce.trigger(now_ms);
        true
    }

    /// Produce a fresh fallback and request once the debounce has elapsed.
    pub fn poll(&mut self, now_ms: u64) -> Option<RouteSelection> {
        if !self.debounce.poll(now_ms) {
            return None;
        }
        let (origin, destination) = self.pending.take()?;
        let active = self.active.as_mut()?;
        active.origin = origin;
        active.destination = destination;
        let endpoints = active.clone();

        let (view, request) = self.resolve_fallback(&endpoints);
        Some(RouteSelection {
            view,
            request,
            auto_fit: None,
        })
    }

    /// Apply a routing response. Returns the new view when it changed.
    ///
    /// Responses for a target that is no longer active, and responses older
    /// than an already-applied routed result, are dropped. Other late
    /// responses for the active target are accepted.
    pub fn complete(&mut self, request: &RouteRequest, result: Result<RoutedPath>) -> Option<RouteView> {
        let active = self.active.as_ref()?;
        if active.target_id != request.target_id {
            debug!(
                "[RouteResolver] Dropping response for inactive target '{}'",
                request.target_id
            );
            return None;
        }
        if self
            .applied_request_id
            .map_or(false, |applied| applied > request.request_id)
        {
            debug!("[RouteResolver] Dropping stale response #{}", request.request_id);
            return None;
        }

        let routed = match result {
            Ok(routed) if routed.geometry.len() >= 2 => routed,
            Ok(_) => {
                debug!("[RouteResolver] Empty geometry, keeping straight line");
                return None;
            }
            Err(e) => {
                debug!("[RouteResolver] Routing failed, keeping straight line: {}", e);
                return None;
            }
        };

        let result = RouteResult {
            distance_m: routed.distance_m,
            eta_s: routed.eta_s,
            geometry: Some(routed.geometry.clone()),
            source: RouteSource::Routed,
        };
        let view = RouteView {
            target_id: request.target_id.clone(),
            origin: request.origin,
            destination: request.destination,
            label: format_label(&result),
            polyline: routed.geometry,
            result,
        };
        self.applied_request_id = Some(request.request_id);
        self.view = Some(view.clone());
        Some(view)
    }

    /// Drop the active route. The auto-fit memory survives, so reselecting
    /// the same target does not refit.
    pub fn clear(&mut self) {
        self.debounce.cancel();
        self.pending = None;
        self.active = None;
        self.view = None;
        self.applied_request_id = None;
    }

    /// Forget everything, auto-fit memory included.
    pub fn reset(&mut self) {
        self.clear();
        self.last_auto_fit_target = None;
    }

    pub fn view(&self) -> Option<&RouteView> {
        self.view.as_ref()
    }

    pub fn target_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.target_id.as_str())
    }

    pub fn last_auto_fit_target(&self) -> Option<&str> {
        self.last_auto_fit_target.as_deref()
    }

    fn resolve_fallback(&mut self, endpoints: &Endpoints) -> (RouteView, RouteRequest) {
        let Endpoints {
            target_id,
            origin,
            destination,
        } = endpoints.clone();

        let result = fallback_route(&origin, &destination, self.config.walking_speed_mps);
        let view = RouteView {
            target_id: target_id.clone(),
            origin,
            destination,
            label: format_label(&result),
            polyline: vec![origin, destination],
            result,
        };
        self.view = Some(view.clone());

        let request = RouteRequest {
            request_id: self.next_request_id,
            target_id,
            origin,
            destination,
        };
        self.next_request_id += 1;
        (view, request)
    }
}

impl Default for RouteResolver {
    fn default() -> Self {
        Self::new(RouteConfig::default())
    }
}
