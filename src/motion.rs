//! # Motion Interpolation
//!
//! Animates rendered marker positions along movement paths at walking speed.
//!
//! ## Members
//!
//! Each member follows a multi-point path segment by segment. A segment
//! takes `distance / walking_speed` to traverse and progress within it is
//! eased (slow start, slow finish). Time left over when a segment completes
//! carries into the next one, so the whole path takes exactly the sum of its
//! segment durations.
//!
//! ## Self
//!
//! The user's own marker is a single-target tween ([`SelfMotion`]): eased
//! translation to the newest fix plus a rotation that always takes the short
//! way round.
//!
//! All per-entity state lives in an [`AnimationRegistry`] owned by the
//! engine. Removing an entity cancels its token; a frame never touches an
//! entity whose token has been cancelled.

use std::collections::HashMap;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::geo_utils::{
    bearing, ease_in_out, haversine_distance, interpolate, normalize_heading, shortest_rotation,
};
use crate::Position;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for marker animation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Walking speed used to time every path segment, in m/s.
    /// Default: 1.39
    pub walking_speed_mps: f64,

    /// Moves smaller than this are treated as GPS noise and not animated.
    /// Default: 6.0 meters
    pub jitter_threshold_m: f64,

    /// Duration of the self marker's translation/rotation tween.
    /// Default: 1000 ms
    pub self_transition_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            walking_speed_mps: 1.39,
            jitter_threshold_m: 6.0,
            self_transition_ms: 1000,
        }
    }
}

/// Time to walk from `from` to `to` at `speed_mps`, in milliseconds.
pub fn segment_duration_ms(from: &Position, to: &Position, speed_mps: f64) -> u64 {
    if speed_mps <= 0.0 {
        return 0;
    }
    (haversine_distance(from, to) / speed_mps * 1000.0).round() as u64
}

/// Time to walk an entire path, in milliseconds.
pub fn path_duration_ms(path: &[Position], speed_mps: f64) -> u64 {
    path.windows(2)
        .map(|pair| segment_duration_ms(&pair[0], &pair[1], speed_mps))
        .sum()
}

// ============================================================================
// Animation Registry
// ============================================================================

/// Cancellable handle for one entity's running animation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnimationToken(u64);

#[derive(Debug, Clone)]
struct AnimationState {
    path: Vec<Position>,
    fingerprint: String,
    segment: usize,
    segment_start_ms: u64,
    /// `None` while the entity is static
    token: Option<AnimationToken>,
    rendered: Position,
    heading: Option<f64>,
}

/// Per-entity animation state, owned by whoever drives the frame loop.
#[derive(Debug, Default)]
pub struct AnimationRegistry {
    states: HashMap<String, AnimationState>,
    next_token: u64,
}

impl AnimationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn issue_token(&mut self) -> AnimationToken {
        self.next_token += 1;
        AnimationToken(self.next_token)
    }

    /// Cancel and forget an entity's animation. Returns true if it existed.
    pub fn cancel(&mut self, id: &str) -> bool {
        self.states.remove(id).is_some()
    }

    /// Cancel every animation.
    pub fn cancel_all(&mut self) {
        self.states.clear();
    }

    /// Whether `token` is still the running animation for `id`.
    pub fn is_live(&self, id: &str, token: AnimationToken) -> bool {
        self.states
            .get(id)
            .and_then(|s| s.token)
            .map_or(false, |t| t == token)
    }

    /// Token of the running animation for `id`, if any.
    pub fn token(&self, id: &str) -> Option<AnimationToken> {
        self.states.get(id).and_then(|s| s.token)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.states.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Number of entities currently animating.
    pub fn active_count(&self) -> usize {
        self.states.values().filter(|s| s.token.is_some()).count()
    }

    pub fn ids(&self) -> Vec<String> {
        self.states.keys().cloned().collect()
    }
}

// ============================================================================
// Member Motion
// ============================================================================

/// One rendered-position update produced by a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameUpdate {
    pub id: String,
    pub position: Position,
    pub heading: Option<f64>,
    /// True on the frame that lands on the final waypoint
    pub finished: bool,
}

/// What [`MotionEngine::set_path`] did with a new path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathOutcome {
    /// First sighting: marker placed at the newest waypoint without animating
    Placed,
    /// New path accepted, animation restarted at segment 0
    Started,
    /// Same path as before, animation continues where it was
    Continued,
    /// Too few points or a move below the jitter threshold
    Held,
}

/// Drives member markers along their paths.
#[derive(Debug)]
pub struct MotionEngine {
    config: MotionConfig,
    registry: AnimationRegistry,
}

impl MotionEngine {
    pub fn new(config: MotionConfig, registry: AnimationRegistry) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    pub fn registry(&self) -> &AnimationRegistry {
        &self.registry
    }

    /// Hand an entity a new path to follow.
    ///
    /// The path is compared to the previous one by its serialized
    /// fingerprint; only a different path restarts the animation.
    pub fn set_path(&mut self, id: &str, waypoints: &[Position], now_ms: u64) -> PathOutcome {
        let waypoints: Vec<Position> = waypoints.iter().copied().filter(|p| p.is_valid()).collect();

        let Some(target) = waypoints.last().copied() else {
            return PathOutcome::Held;
        };

        let Some(state) = self.registry.states.get(id) else {
            self.registry.states.insert(
                id.to_string(),
                AnimationState {
                    fingerprint: path_fingerprint(&waypoints),
                    path: waypoints,
                    segment: 0,
                    segment_start_ms: now_ms,
                    token: None,
                    rendered: target,
                    heading: None,
                },
            );
            return PathOutcome::Placed;
        };

        if waypoints.len() < 2 {
            return PathOutcome::Held;
        }
        if haversine_distance(&state.rendered, &target) < self.config.jitter_threshold_m {
            return PathOutcome::Held;
        }

        let fingerprint = path_fingerprint(&waypoints);
        if state.token.is_some() && state.fingerprint == fingerprint {
            return PathOutcome::Continued;
        }

        let token = self.registry.issue_token();
        if let Some(state) = self.registry.states.get_mut(id) {
            state.path = waypoints;
            state.fingerprint = fingerprint;
            state.segment = 0;
            state.segment_start_ms = now_ms;
            state.token = Some(token);
        }
        debug!("[Motion] '{}' restarted on a new path", id);
        PathOutcome::Started
    }

    /// Advance every running animation to `now_ms`.
    pub fn tick(&mut self, now_ms: u64) -> Vec<FrameUpdate> {
        let speed = self.config.walking_speed_mps;
        let mut updates = Vec::new();
        let mut corrupt = Vec::new();

        for (id, state) in self.registry.states.iter_mut() {
            if state.token.is_none() {
                continue;
            }
            if state.path.is_empty() {
                corrupt.push(id.clone());
                continue;
            }

            loop {
                if state.segment + 1 >= state.path.len() {
                    state.rendered = state.path[state.path.len() - 1];
                    state.token = None;
                    updates.push(FrameUpdate {
                        id: id.clone(),
                        position: state.rendered,
                        heading: state.heading,
                        finished: true,
                    });
                    break;
                }

                let from = state.path[state.segment];
                let to = state.path[state.segment + 1];
                let duration = segment_duration_ms(&from, &to, speed);
                let elapsed = now_ms.saturating_sub(state.segment_start_ms);

                if elapsed >= duration {
                    state.segment += 1;
                    state.segment_start_ms += duration;
                    continue;
                }

                let progress = ease_in_out(elapsed as f64 / duration as f64);
                state.rendered = interpolate(&from, &to, progress);
                state.heading = Some(bearing(&from, &to));
                updates.push(FrameUpdate {
                    id: id.clone(),
                    position: state.rendered,
                    heading: state.heading,
                    finished: false,
                });
                break;
            }
        }

        for id in corrupt {
            warn!("[Motion] Clearing corrupt animation state for '{}'", id);
            self.registry.cancel(&id);
        }

        updates
    }

    /// Current rendered position of an entity.
    pub fn rendered(&self, id: &str) -> Option<Position> {
        self.registry.states.get(id).map(|s| s.rendered)
    }

    /// Current rendered heading of an entity.
    pub fn rendered_heading(&self, id: &str) -> Option<f64> {
        self.registry.states.get(id).and_then(|s| s.heading)
    }

    pub fn is_animating(&self, id: &str) -> bool {
        self.registry.token(id).is_some()
    }

    /// Cancel and forget an entity's animation.
    pub fn remove(&mut self, id: &str) -> bool {
        self.registry.cancel(id)
    }

    /// Cancel everything (screen teardown).
    pub fn clear(&mut self) {
        self.registry.cancel_all();
    }
}

impl Default for MotionEngine {
    fn default() -> Self {
        Self::new(MotionConfig::default(), AnimationRegistry::new())
    }
}

fn path_fingerprint(path: &[Position]) -> String {
    serde_json::to_string(path).unwrap_or_else(|_| format!("{:?}", path))
}

// ============================================================================
// Self Motion
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Tween<T> {
    from: T,
    to: T,
    start_ms: u64,
}

/// Smooth single-target translation and rotation for the self marker.
#[derive(Debug, Clone)]
pub struct SelfMotion {
    config: MotionConfig,
    translation: Option<Tween<Position>>,
    /// Rotation stored as start heading and signed delta
    rotation: Option<Tween<f64>>,
    rendered: Option<Position>,
    heading: Option<f64>,
}

impl SelfMotion {
    pub fn new(config: MotionConfig) -> Self {
        Self {
            config,
            translation: None,
            rotation: None,
            rendered: None,
            heading: None,
        }
    }

    /// Aim the self marker at a new fix.
    pub fn update_target(&mut self, position: Position, heading: Option<f64>, now_ms: u64) {
        // Settle any running tween at `now` so the new one starts where the marker is
        self.advance(now_ms);

        let Some(current) = self.rendered else {
            self.rendered = Some(position);
            self.heading = heading.map(normalize_heading);
            return;
        };

        if haversine_distance(&current, &position) >= self.config.jitter_threshold_m {
            self.translation = Some(Tween {
                from: current,
                to: position,
                start_ms: now_ms,
            });
        }

        if let Some(target) = heading {
            match self.heading {
                Some(from) => {
                    let delta = shortest_rotation(from, target);
                    if delta.abs() > f64::EPSILON {
                        self.rotation = Some(Tween {
                            from,
                            to: delta,
                            start_ms: now_ms,
                        });
                    }
                }
                None => self.heading = Some(normalize_heading(target)),
            }
        }
    }

    /// Advance the tween; returns an update while the marker is moving or turning.
    pub fn tick(&mut self, id: &str, now_ms: u64) -> Option<FrameUpdate> {
        if self.translation.is_none() && self.rotation.is_none() {
            return None;
        }
        let finished = self.advance(now_ms);
        Some(FrameUpdate {
            id: id.to_string(),
            position: self.rendered?,
            heading: self.heading,
            finished,
        })
    }

    pub fn rendered(&self) -> Option<Position> {
        self.rendered
    }

    pub fn heading(&self) -> Option<f64> {
        self.heading
    }

    pub fn is_animating(&self) -> bool {
        self.translation.is_some() || self.rotation.is_some()
    }

    /// Apply both tweens at `now_ms`; true once both have completed.
    fn advance(&mut self, now_ms: u64) -> bool {
        let duration = self.config.self_transition_ms.max(1) as f64;

        if let Some(t) = self.translation {
            let progress = now_ms.saturating_sub(t.start_ms) as f64 / duration;
            self.rendered = Some(interpolate(&t.from, &t.to, ease_in_out(progress)));
            if progress >= 1.0 {
                self.translation = None;
            }
        }

        if let Some(r) = self.rotation {
            let progress = now_ms.saturating_sub(r.start_ms) as f64 / duration;
            self.heading = Some(normalize_heading(r.from + r.to * ease_in_out(progress)));
            if progress >= 1.0 {
                self.rotation = None;
            }
        }

        self.translation.is_none() && self.rotation.is_none()
    }
}

// ============================================================================
// Tests
// ============================================================================
