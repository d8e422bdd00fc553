//! Group member position feeds.
//!
//! The session never knows where member positions come from: it polls a
//! [`PositionFeed`] each tick and reconciles the roster against the snapshot
//! it gets back. [`SimulatedFeed`] stands in for a backend with a seeded
//! random walk that drifts toward the user; [`ChannelFeed`] accepts snapshots
//! pushed from anywhere (a websocket task, a platform bridge).

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::geo_utils::{bearing, destination, haversine_distance, normalize_heading};
use crate::Position;

/// One member's reported position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberFix {
    pub id: String,
    pub name: String,
    pub position: Position,
    #[serde(default)]
    pub heading: Option<f64>,
}

/// The full member roster at one instant. Members missing from a snapshot
/// have left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSnapshot {
    pub timestamp_ms: u64,
    pub members: Vec<MemberFix>,
}

/// A source of member positions, polled once per tick.
pub trait PositionFeed: Send {
    /// A new snapshot if one is available. `anchor` is the user's current
    /// (or fallback) position.
    fn poll(&mut self, now_ms: u64, anchor: Position) -> Option<FeedSnapshot>;

    /// Forget all members (group left).
    fn reset(&mut self) {}
}

impl<F: PositionFeed + ?Sized> PositionFeed for Box<F> {
    fn poll(&mut self, now_ms: u64, anchor: Position) -> Option<FeedSnapshot> {
        (**self).poll(now_ms, anchor)
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

// ============================================================================
// Simulated Feed
// ============================================================================

/// Configuration for the simulated group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Time between member updates.
    /// Default: 4000 ms
    pub interval_ms: u64,

    /// Members spawned on join.
    /// Default: 4
    pub member_count: usize,

    /// Members spawn within this distance of the anchor.
    /// Default: 120.0 meters
    pub spawn_radius_m: f64,

    /// Shortest step per update.
    /// Default: 4.0 meters
    pub min_step_m: f64,

    /// Longest step per update.
    /// Default: 28.0 meters
    pub max_step_m: f64,

    /// Chance that a step heads (roughly) toward the anchor.
    /// Default: 0.6
    pub anchor_bias: f64,

    /// Members farther than this always head back toward the anchor.
    /// Default: 400.0 meters
    pub max_wander_m: f64,

    /// RNG seed; `None` seeds from entropy.
    /// Default: None
    pub seed: Option<u64>,

    /// Display names, used in order and cycled.
    pub names: Vec<String>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            interval_ms: 4000,
            member_count: 4,
            spawn_radius_m: 120.0,
            min_step_m: 4.0,
            max_step_m: 28.0,
            anchor_bias: 0.6,
            max_wander_m: 400.0,
            seed: None,
            names: ["Aisha", "Omar", "Fatima", "Yusuf", "Maryam", "Ibrahim"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Random-walk member simulation around the user.
#[derive(Debug)]
pub struct SimulatedFeed {
    config: SimulationConfig,
    rng: StdRng,
    members: Vec<MemberFix>,
    last_emit_ms: Option<u64>,
}

impl SimulatedFeed {
    pub fn new(config: SimulationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng,
            members: Vec::new(),
            last_emit_ms: None,
        }
    }

    pub fn members(&self) -> &[MemberFix] {
        &self.members
    }

    fn spawn(&mut self, anchor: Position) {
        let count = self.config.member_count;
        let radius = self.config.spawn_radius_m.max(1.0);
        self.members = (0..count)
            .map(|i| {
                let name = if self.config.names.is_empty() {
                    format!("Member {}", i + 1)
                } else {
                    self.config.names[i % self.config.names.len()].clone()
                };
                let b = self.rng.gen_range(0.0..360.0);
                let d = self.rng.gen_range((radius * 0.15)..=radius);
                MemberFix {
                    id: format!("member-{}", i + 1),
                    name,
                    position: destination(&anchor, b, d),
                    heading: None,
                }
            })
            .collect();
        info!("[SimulatedFeed] Spawned {} members around anchor", count);
    }

    fn step(&mut self, anchor: Position) {
        let min_step = self.config.min_step_m.max(0.0);
        let max_step = self.config.max_step_m.max(min_step);
        for member in &mut self.members {
            let distance = haversine_distance(&member.position, &anchor);
            let homeward = bearing(&member.position, &anchor);

            let heading = if distance > self.config.max_wander_m {
                homeward
            } else if self.rng.gen_bool(self.config.anchor_bias.clamp(0.0, 1.0)) {
                homeward + self.rng.gen_range(-75.0..=75.0)
            } else {
                self.rng.gen_range(0.0..360.0)
            };
            let step = self.rng.gen_range(min_step..=max_step);

            member.position = destination(&member.position, heading, step);
            member.heading = Some(normalize_heading(heading));
        }
    }
}

impl PositionFeed for SimulatedFeed {
    fn poll(&mut self, now_ms: u64, anchor: Position) -> Option<FeedSnapshot> {
        match self.last_emit_ms {
            None => self.spawn(anchor),
            Some(last) if now_ms.saturating_sub(last) < self.config.interval_ms => return None,
            Some(_) => self.step(anchor),
        }
        self.last_emit_ms = Some(now_ms);
        Some(FeedSnapshot {
            timestamp_ms: now_ms,
            members: self.members.clone(),
        })
    }

    fn reset(&mut self) {
        self.members.clear();
        self.last_emit_ms = None;
    }
}

// ============================================================================
// Channel Feed
// ============================================================================

/// Sending half of a [`ChannelFeed`].
#[derive(Debug, Clone)]
pub struct FeedSender {
    tx: UnboundedSender<FeedSnapshot>,
}

impl FeedSender {
    /// Push a snapshot. Returns false once the feed has been dropped.
    pub fn push(&self, snapshot: FeedSnapshot) -> bool {
        self.tx.send(snapshot).is_ok()
    }
}

/// Feed of externally pushed snapshots; only the newest pending one is used.
#[derive(Debug)]
pub struct ChannelFeed {
    rx: UnboundedReceiver<FeedSnapshot>,
}

impl ChannelFeed {
    pub fn new() -> (Self, FeedSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, FeedSender { tx })
    }
}

impl PositionFeed for ChannelFeed {
    fn poll(&mut self, _now_ms: u64, _anchor: Position) -> Option<FeedSnapshot> {
        let mut latest = None;
        let mut skipped = 0;
        while let Ok(snapshot) = self.rx.try_recv() {
            if latest.is_some() {
                skipped += 1;
            }
            latest = Some(snapshot);
        }
        if skipped > 0 {
            debug!("[ChannelFeed] Coalesced {} stale snapshots", skipped);
        }
        latest
    }

    fn reset(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor() -> Position {
        Position::new(21.4225, 39.8262)
    }

    fn seeded() -> SimulatedFeed {
        SimulatedFeed::new(SimulationConfig {
            seed: Some(7),
            ..SimulationConfig::default()
        })
    }

    #[test]
    fn test_spawn_around_anchor() {
        let mut feed = seeded();
        let snapshot = feed.poll(0, anchor()).unwrap();
        assert_eq!(snapshot.members.len(), 4);
        assert_eq!(snapshot.members[0].name, "Aisha");
        for m in &snapshot.members {
            assert!(haversine_distance(&m.position, &anchor()) <= 120.5);
        }
    }

    #[test]
    fn test_emits_on_interval() {
        let mut feed = seeded();
        feed.poll(0, anchor()).unwrap();
        assert!(feed.poll(1_000, anchor()).is_none());
        assert!(feed.poll(3_999, anchor()).is_none());

        let before = feed.members().to_vec();
        let snapshot = feed.poll(4_000, anchor()).unwrap();
        for (old, new) in before.iter().zip(&snapshot.members) {
            let moved = haversine_distance(&old.position, &new.position);
            assert!(moved >= 3.9 && moved <= 28.5, "moved {}", moved);
            assert!(new.heading.is_some());
        }
    }

    #[test]
    fn test_same_seed_same_walk() {
        let mut a = seeded();
        let mut b = seeded();
        for t in [0, 4_000, 8_000] {
            assert_eq!(a.poll(t, anchor()), b.poll(t, anchor()));
        }
    }

    #[test]
    fn test_wanderers_head_home() {
        let mut feed = SimulatedFeed::new(SimulationConfig {
            seed: Some(1),
            max_wander_m: 50.0,
            spawn_radius_m: 300.0,
            ..SimulationConfig::default()
        });
        let start = feed.poll(0, anchor()).unwrap();
        let next = feed.poll(4_000, anchor()).unwrap();
        for (old, new) in start.members.iter().zip(&next.members) {
            let before = haversine_distance(&old.position, &anchor());
            if before > 50.0 {
                assert!(haversine_distance(&new.position, &anchor()) < before);
            }
        }
    }

    #[test]
    fn test_reset_respawns() {
        let mut feed = seeded();
        feed.poll(0, anchor());
        feed.reset();
        assert!(feed.members().is_empty());
        assert_eq!(feed.poll(100, anchor()).unwrap().members.len(), 4);
    }

    #[test]
    fn test_channel_feed_keeps_latest() {
        let (mut feed, sender) = ChannelFeed::new();
        assert!(feed.poll(0, anchor()).is_none());

        for ts in [1, 2, 3] {
            assert!(sender.push(FeedSnapshot {
                timestamp_ms: ts,
                members: Vec::new(),
            }));
        }
        assert_eq!(feed.poll(0, anchor()).unwrap().timestamp_ms, 3);
        assert!(feed.poll(0, anchor()).is_none());

        drop(feed);
        assert!(!sender.push(FeedSnapshot {
            timestamp_ms: 4,
            members: Vec::new(),
        }));
    }
}
