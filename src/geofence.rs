//! # Geofence
//!
//! Derives a circular safety boundary from the group's live positions and
//! flags members who leave it.
//!
//! ## Algorithm
//!
//! 1. Drop the forced-outside member (if any) from the defining set
//! 2. Centroid = mean latitude, mean longitude of what is left
//! 3. Radius = farthest distance to the centroid × safety buffer, floored
//!
//! Recomputation is skipped while the position set's fingerprint is
//! unchanged, and otherwise debounced so a burst of updates produces one
//! computation.
//!
//! ## Breaches
//!
//! A member is outside when farther than the radius from the center, or when
//! it is the forced-outside member. [`BreachTracker`] turns that state into
//! alerts: one per continuous outside period.

use std::collections::HashSet;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::geo_utils::{centroid, haversine_distance};
use crate::timing::Debouncer;
use crate::{Geofence, Position};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for geofence derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeofenceConfig {
    /// Radius never drops below this.
    /// Default: 50.0 meters
    pub min_radius_m: f64,

    /// Multiplier applied to the farthest included member distance.
    /// Default: 1.15
    pub safety_buffer: f64,

    /// Quiet period before a changed position set is recomputed.
    /// Default: 150 ms
    pub debounce_ms: u64,

    /// Decimal places kept per coordinate in the fingerprint.
    /// Default: 5 (~1.1 m)
    pub fingerprint_decimals: usize,

    /// Automatically designate one member as forced-outside so a breach can
    /// always be demonstrated.
    /// Default: false
    pub force_outside: bool,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            min_radius_m: 50.0,
            safety_buffer: 1.15,
            debounce_ms: 150,
            fingerprint_decimals: 5,
            force_outside: false,
        }
    }
}

// ============================================================================
// Pure Functions
// ============================================================================

/// Compute a geofence around `positions`.
///
/// Returns `None` for an empty set.
pub fn compute_geofence(positions: &[Position], config: &GeofenceConfig) -> Option<Geofence> {
    let center = centroid(positions)?;
    let farthest = positions
        .iter()
        .map(|p| haversine_distance(p, &center))
        .fold(0.0_f64, f64::max);

    Some(Geofence {
        center,
        radius_m: (farthest * config.safety_buffer).max(config.min_radius_m),
    })
}

/// Order-independent fingerprint of a position set.
///
/// Coordinates are rounded to `decimals` places, sorted, and joined, so the
/// same set in any order gives the same string while any perturbation above
/// the rounding step changes it.
pub fn position_fingerprint(positions: &[Position], decimals: usize) -> String {
    let mut parts: Vec<String> = positions
        .iter()
        .map(|p| format!("{:.*},{:.*}", decimals, p.lat, decimals, p.lng))
        .collect();
    parts.sort();
    parts.join("|")
}

// ============================================================================
// Geofence Calculator
// ============================================================================

#[derive(Debug, Clone)]
struct Pending {
    positions: Vec<Position>,
    fingerprint: String,
}

/// Stateful, debounced geofence derivation.
#[derive(Debug)]
pub struct GeofenceCalculator {
    config: GeofenceConfig,
    debounce: Debouncer,
    pending: Option<Pending>,
    last_fingerprint: Option<String>,
    active: Option<Geofence>,
    forced_outside: Option<String>,
}

impl GeofenceCalculator {
    pub fn new(config: GeofenceConfig) -> Self {
        let debounce = Debouncer::new(config.debounce_ms);
        Self {
            config,
            debounce,
            pending: None,
            last_fingerprint: None,
            active: None,
            forced_outside: None,
        }
    }

    pub fn config(&self) -> &GeofenceConfig {
        &self.config
    }

    /// The geofence currently in force.
    pub fn active(&self) -> Option<Geofence> {
        self.active
    }

    /// The member currently forced outside, if any.
    pub fn forced_outside(&self) -> Option<&str> {
        self.forced_outside.as_deref()
    }

    /// Designate (or clear) the forced-outside member explicitly.
    pub fn designate_forced_outside(&mut self, member_id: Option<String>) {
        self.forced_outside = member_id;
        self.last_fingerprint = None;
    }

    /// Offer the current group positions.
    ///
    /// `group` holds every positioned entity (self included); `member_ids`
    /// names the members eligible to be forced outside. Returns true when a
    /// recomputation has been scheduled.
    pub fn submit(&mut self, group: &[(String, Position)], member_ids: &[String], now_ms: u64) -> bool {
        let Some(pending) = self.prepare(group, member_ids) else {
            self.pending = None;
            self.debounce.cancel();
            return false;
        };

        if self.last_fingerprint.as_deref() == Some(pending.fingerprint.as_str()) {
            // Back to what is already shown; drop any queued change
            if self.pending.is_some() {
                self.pending = None;
                self.debounce.cancel();
            }
            return false;
        }

        let same_as_queued = self
            .pending
            .as_ref()
            .map_or(false, |p| p.fingerprint == pending.fingerprint);
        if !same_as_queued {
            self.pending = Some(pending);
            self.debounce.trigger(now_ms);
        }
        true
    }

    /// Compute the queued geofence once the debounce window has elapsed.
    pub fn poll(&mut self, now_ms: u64) -> Option<Geofence> {
        if !self.debounce.poll(now_ms) {
            return None;
        }
        let pending = self.pending.take()?;
        self.apply(pending)
    }

    /// Recompute immediately, bypassing fingerprint and debounce.
    pub fn recompute_now(&mut self, group: &[(String, Position)], member_ids: &[String]) -> Option<Geofence> {
        self.debounce.cancel();
        self.pending = None;
        let pending = self.prepare(group, member_ids)?;
        self.apply(pending)
    }

    /// Forget the last fingerprint so the next submission recomputes
    /// (used on membership changes).
    pub fn invalidate(&mut self) {
        self.last_fingerprint = None;
    }

    /// Tear down: no geofence, nothing pending, no forced member.
    pub fn clear(&mut self) {
        self.debounce.cancel();
        self.pending = None;
        self.last_fingerprint = None;
        self.active = None;
        self.forced_outside = None;
    }

    pub fn is_pending(&self) -> bool {
        self.debounce.is_pending()
    }

    fn apply(&mut self, pending: Pending) -> Option<Geofence> {
        let fence = compute_geofence(&pending.positions, &self.config)?;
        debug!(
            "[Geofence] Recomputed from {} positions: radius {:.1}m",
            pending.positions.len(),
            fence.radius_m
        );
        self.last_fingerprint = Some(pending.fingerprint);
        self.active = Some(fence);
        Some(fence)
    }

    /// Resolve the forced member and build the defining position set.
    fn prepare(&mut self, group: &[(String, Position)], member_ids: &[String]) -> Option<Pending> {
        if group.is_empty() {
            return None;
        }
        self.resolve_forced(group, member_ids);

        let mut positions: Vec<Position> = group
            .iter()
            .filter(|(id, _)| Some(id.as_str()) != self.forced_outside.as_deref())
            .map(|(_, p)| *p)
            .collect();
        if positions.is_empty() {
            positions = group.iter().map(|(_, p)| *p).collect();
        }

        let fingerprint = format!(
            "{}#{}",
            position_fingerprint(&positions, self.config.fingerprint_decimals),
            self.forced_outside.as_deref().unwrap_or("")
        );
        Some(Pending {
            positions,
            fingerprint,
        })
    }

    /// Keep the forced member while it is still a positioned member; pick a
    /// replacement (the farthest member) only when auto-selection is on.
    fn resolve_forced(&mut self, group: &[(String, Position)], member_ids: &[String]) {
        let is_candidate = |id: &str| {
            member_ids.iter().any(|m| m == id) && group.iter().any(|(g, _)| g == id)
        };

        if let Some(current) = &self.forced_outside {
            if is_candidate(current) {
                return;
            }
            info!("[Geofence] Forced-outside member '{}' no longer present", current);
            self.forced_outside = None;
        }

        if !self.config.force_outside {
            return;
        }

        let all: Vec<Position> = group.iter().map(|(_, p)| *p).collect();
        let Some(center) = centroid(&all) else {
            return;
        };
        let farthest = group
            .iter()
            .filter(|(id, _)| is_candidate(id))
            .map(|(id, p)| (id, haversine_distance(p, &center)))
            .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(a.0)));

        if let Some((id, _)) = farthest {
            info!("[Geofence] Forcing '{}' outside", id);
            self.forced_outside = Some(id.clone());
        }
    }
}

impl Default for GeofenceCalculator {
    fn default() -> Self {
        Self::new(GeofenceConfig::default())
    }
}

// ============================================================================
// Breach Detection
// ============================================================================

/// Raised when a member goes from inside to outside the geofence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreachAlert {
    pub entity_id: String,
    pub name: String,
    pub distance_m: f64,
    pub radius_m: f64,
    /// True when the member is outside only because it is forced
    pub forced: bool,
}

/// A member to check against the geofence.
#[derive(Debug, Clone, Copy)]
pub struct BreachCandidate<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub position: Position,
}

/// Tracks which members are outside so each excursion alerts once.
#[derive(Debug, Default)]
pub struct BreachTracker {
    outside: HashSet<String>,
}

impl BreachTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate every member; returns alerts for fresh inside→outside transitions.
    ///
    /// Members absent from `members` are forgotten, so a member that
    /// disappears and comes back outside alerts again.
    pub fn evaluate(
        &mut self,
        members: &[BreachCandidate<'_>],
        fence: &Geofence,
        forced_outside: Option<&str>,
    ) -> Vec<BreachAlert> {
        let mut alerts = Vec::new();

        self.outside
            .retain(|id| members.iter().any(|m| m.id == id.as_str()));

        for member in members {
            let distance = haversine_distance(&member.position, &fence.center);
            let forced = forced_outside == Some(member.id);
            let is_outside = distance > fence.radius_m || forced;

            if is_outside {
                if self.outside.insert(member.id.to_string()) {
                    info!(
                        "[Geofence] '{}' left the geofence ({:.0}m > {:.0}m{})",
                        member.id,
                        distance,
                        fence.radius_m,
                        if forced { ", forced" } else { "" }
                    );
                    alerts.push(BreachAlert {
                        entity_id: member.id.to_string(),
                        name: member.name.to_string(),
                        distance_m: distance,
                        radius_m: fence.radius_m,
                        forced,
                    });
                }
            } else if self.outside.remove(member.id) {
                debug!("[Geofence] '{}' is back inside", member.id);
            }
        }

        alerts
    }

    pub fn is_outside(&self, id: &str) -> bool {
        self.outside.contains(id)
    }

    pub fn outside_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.outside.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn purge(&mut self, id: &str) {
        self.outside.remove(id);
    }

    pub fn clear(&mut self) {
        self.outside.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================
