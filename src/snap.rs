//! # Road-Snap Resolver
//!
//! Decides when a member's latest movement segment is worth refining into a
//! road-aligned polyline, and remembers the latest refinement per member.
//!
//! The resolver performs no I/O. [`RoadSnapResolver::request`] hands back a
//! [`SnapRequest`] for the caller to dispatch; the outcome comes back through
//! [`RoadSnapResolver::complete`]. Failures are swallowed: without a cached
//! polyline the straight segment is the animation path.

use std::collections::HashMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::cache::MemoCache;
use crate::geo_utils::haversine_distance;
use crate::{Position, Result};

/// A cached polyline must end this close to the requested target to be used.
const ENDPOINT_TOLERANCE_M: f64 = 25.0;

/// Configuration for road-snapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapConfig {
    /// Minimum spacing between requests for the same member.
    /// Default: 2500 ms
    pub min_interval_ms: u64,

    /// Segments shorter than this are not worth a round trip.
    /// Default: 20.0 meters
    pub min_segment_m: f64,

    /// Maximum number of members with a cached polyline.
    /// Default: 128
    pub cache_capacity: usize,
}

impl Default for SnapConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 2500,
            min_segment_m: 20.0,
            cache_capacity: 128,
        }
    }
}

/// A road-snap request to be sent to the routing service.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapRequest {
    /// Monotonic per resolver; ties a response to the request still in flight
    pub request_id: u64,
    pub entity_id: String,
    pub from: Position,
    pub to: Position,
}

#[derive(Debug, Clone)]
struct SnappedSegment {
    to: Position,
    polyline: Vec<Position>,
}

/// Throttled, deduplicated road-snap bookkeeping.
#[derive(Debug)]
pub struct RoadSnapResolver {
    config: SnapConfig,
    last_request_ms: HashMap<String, u64>,
    /// Entity id to the id of its outstanding request
    in_flight: HashMap<String, u64>,
    next_request_id: u64,
    cache: MemoCache<String, SnappedSegment>,
}

impl RoadSnapResolver {
    pub fn new(config: SnapConfig) -> Self {
        let cache = MemoCache::new(config.cache_capacity);
        Self {
            config,
            last_request_ms: HashMap::new(),
            in_flight: HashMap::new(),
            next_request_id: 1,
            cache,
        }
    }

    /// Decide whether to snap the segment `from → to` for an entity.
    ///
    /// Returns `None` for short segments, while a request for the entity is
    /// already in flight, or within the throttle window of the previous one.
    pub fn request(
        &mut self,
        entity_id: &str,
        from: Position,
        to: Position,
        now_ms: u64,
    ) -> Option<SnapRequest> {
        if haversine_distance(&from, &to) < self.config.min_segment_m {
            return None;
        }
        if self.in_flight.contains_key(entity_id) {
            return None;
        }
        if let Some(&last) = self.last_request_ms.get(entity_id) {
            if now_ms.saturating_sub(last) < self.config.min_interval_ms {
                return None;
            }
        }

        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.last_request_ms.insert(entity_id.to_string(), now_ms);
        self.in_flight.insert(entity_id.to_string(), request_id);
        Some(SnapRequest {
            request_id,
            entity_id: entity_id.to_string(),
            from,
            to,
        })
    }

    /// Record a request's outcome. Returns true if a new polyline was cached.
    ///
    /// Responses are accepted even if the member has moved on since the
    /// request was made; [`Self::preferred_path`] checks the endpoint. A
    /// response that is not the entity's outstanding request (the entity was
    /// purged, possibly re-added and re-requested) is dropped untouched.
    pub fn complete(&mut self, request: &SnapRequest, result: Result<Vec<Position>>) -> bool {
        if self.in_flight.get(&request.entity_id) != Some(&request.request_id) {
            debug!(
                "[RoadSnap] Dropping stale response #{} for '{}'",
                request.request_id, request.entity_id
            );
            return false;
        }
        self.in_flight.remove(&request.entity_id);

        match result {
            Ok(polyline) if polyline.len() >= 2 => {
                self.cache.insert(
                    request.entity_id.clone(),
                    SnappedSegment {
                        to: request.to,
                        polyline,
                    },
                );
                true
            }
            Ok(_) => {
                debug!(
                    "[RoadSnap] Degenerate polyline for '{}', keeping straight segment",
                    request.entity_id
                );
                false
            }
            Err(e) => {
                debug!("[RoadSnap] Snap failed for '{}': {}", request.entity_id, e);
                false
            }
        }
    }

    /// Path to animate from `from` to `to`: the cached road polyline when it
    /// leads to `to`, otherwise the straight segment.
    pub fn preferred_path(&mut self, entity_id: &str, from: Position, to: Position) -> Vec<Position> {
        if let Some(snapped) = self.cache.get(&entity_id.to_string()) {
            if haversine_distance(&snapped.to, &to) <= ENDPOINT_TOLERANCE_M {
                let mut path = snapped.polyline.clone();
                // Start where the marker is, land exactly on the reported position
                if let Some(first) = path.first_mut() {
                    *first = from;
                }
                if let Some(last) = path.last_mut() {
                    *last = to;
                }
                return path;
            }
        }
        vec![from, to]
    }

    pub fn is_in_flight(&self, entity_id: &str) -> bool {
        self.in_flight.contains_key(entity_id)
    }

    pub fn has_polyline(&self, entity_id: &str) -> bool {
        self.cache.contains(&entity_id.to_string())
    }

    /// Forget everything about an entity.
    pub fn purge(&mut self, entity_id: &str) {
        self.last_request_ms.remove(entity_id);
        self.in_flight.remove(entity_id);
        self.cache.remove(&entity_id.to_string());
    }

    pub fn clear(&mut self) {
        self.last_request_ms.clear();
        self.in_flight.clear();
        self.cache.clear();
    }
}

impl Default for RoadSnapResolver {
    fn default() -> Self {
        Self::new(SnapConfig::default())
    }
}
