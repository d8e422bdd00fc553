//! # Position Store
//!
//! Holds every tracked entity (the user's own device plus group members):
//! latest position, heading and a bounded movement history.
//!
//! The store is the source of truth for *reported* positions. Rendered
//! (animated) positions live in [`crate::motion`].

use std::collections::HashMap;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::geo_utils::{bearing, haversine_distance, normalize_heading};
use crate::{PathPoint, Position};

/// Moves shorter than this do not update a derived heading.
const MIN_HEADING_MOVE_M: f64 = 1.0;

/// A tracked entity: the user ("self") or a group member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    /// Latest reported position. `None` marks a malformed entity that is
    /// skipped by rendering until a valid position arrives.
    pub position: Option<Position>,
    /// Heading in degrees, always within [0, 360)
    pub heading: Option<f64>,
    /// Movement history, oldest first, capped at the store's path limit
    pub path: Vec<PathPoint>,
    pub is_self: bool,
}

impl Entity {
    fn new(id: &str, name: &str, is_self: bool) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            position: None,
            heading: None,
            path: Vec::new(),
            is_self,
        }
    }
}

/// Outcome of recording a position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionChange {
    pub created: bool,
    pub previous: Option<Position>,
    pub current: Position,
}

impl PositionChange {
    /// Distance moved since the previous report (0 for new entities).
    pub fn moved_m(&self) -> f64 {
        self.previous
            .map(|p| haversine_distance(&p, &self.current))
            .unwrap_or(0.0)
    }
}

/// Per-entity positions, headings and bounded path history.
#[derive(Debug)]
pub struct PositionStore {
    entities: HashMap<String, Entity>,
    self_id: Option<String>,
    max_path_points: usize,
}

impl PositionStore {
    /// Create a store keeping at most `max_path_points` history points per entity.
    pub fn new(max_path_points: usize) -> Self {
        Self {
            entities: HashMap::new(),
            self_id: None,
            max_path_points: max_path_points.max(2),
        }
    }

    // ========================================================================
    // Self Entity
    // ========================================================================

    /// Record a location fix for the user's own device.
    ///
    /// The self entity is created on the first fix and persists for the
    /// lifetime of the store. A reported heading wins over one derived from
    /// movement.
    pub fn update_self(
        &mut self,
        id: &str,
        name: &str,
        position: Position,
        heading: Option<f64>,
        ts: u64,
    ) -> Option<PositionChange> {
        if let Some(existing) = &self.self_id {
            if existing != id {
                warn!(
                    "[PositionStore] Ignoring fix for second self entity '{}' (self is '{}')",
                    id, existing
                );
                return None;
            }
        } else {
            debug!("[PositionStore] Self entity '{}' created", id);
            self.self_id = Some(id.to_string());
        }

        self.record(id, name, true, position, heading, ts)
    }

    pub fn self_id(&self) -> Option<&str> {
        self.self_id.as_deref()
    }

    pub fn self_entity(&self) -> Option<&Entity> {
        self.self_id.as_ref().and_then(|id| self.entities.get(id))
    }

    pub fn self_position(&self) -> Option<Position> {
        self.self_entity().and_then(|e| e.position)
    }

    // ========================================================================
    // Members
    // ========================================================================

    /// Create or update a group member.
    ///
    /// Returns `None` (and leaves the store untouched) for invalid positions
    /// or ids colliding with the self entity.
    pub fn upsert_member(
        &mut self,
        id: &str,
        name: &str,
        position: Position,
        heading: Option<f64>,
        ts: u64,
    ) -> Option<PositionChange> {
        if self.self_id.as_deref() == Some(id) {
            warn!("[PositionStore] Member id '{}' collides with self", id);
            return None;
        }
        self.record(id, name, false, position, heading, ts)
    }

    /// Register a member with no position yet (malformed until a fix arrives).
    pub fn insert_placeholder(&mut self, id: &str, name: &str) {
        if self.self_id.as_deref() == Some(id) {
            return;
        }
        self.entities
            .entry(id.to_string())
            .or_insert_with(|| Entity::new(id, name, false));
    }

    /// Remove a member. The self entity cannot be removed.
    pub fn remove_member(&mut self, id: &str) -> Option<Entity> {
        if self.self_id.as_deref() == Some(id) {
            return None;
        }
        self.entities.remove(id)
    }

    /// Remove every member whose id is not in `keep`; returns removed ids.
    pub fn retain_members(&mut self, keep: &[String]) -> Vec<String> {
        let removed: Vec<String> = self
            .entities
            .values()
            .filter(|e| !e.is_self && !keep.contains(&e.id))
            .map(|e| e.id.clone())
            .collect();
        for id in &removed {
            self.entities.remove(id);
        }
        removed
    }

    /// Remove all members, keeping the self entity; returns removed ids.
    pub fn clear_members(&mut self) -> Vec<String> {
        self.retain_members(&[])
    }

    /// Member ids, sorted.
    pub fn member_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entities
            .values()
            .filter(|e| !e.is_self)
            .map(|e| e.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn members(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values().filter(|e| !e.is_self)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Positions of all entities (self included) that currently have one,
    /// sorted by id for deterministic downstream processing.
    pub fn group_positions(&self) -> Vec<(String, Position)> {
        let mut positions: Vec<(String, Position)> = self
            .entities
            .values()
            .filter_map(|e| e.position.map(|p| (e.id.clone(), p)))
            .collect();
        positions.sort_by(|a, b| a.0.cmp(&b.0));
        positions
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn record(
        &mut self,
        id: &str,
        name: &str,
        is_self: bool,
        position: Position,
        heading: Option<f64>,
        ts: u64,
    ) -> Option<PositionChange> {
        if !position.is_valid() {
            warn!(
                "[PositionStore] Dropping invalid position for '{}': {:?}",
                id, position
            );
            return None;
        }

        let created = !self.entities.contains_key(id);
        let entity = self
            .entities
            .entry(id.to_string())
            .or_insert_with(|| Entity::new(id, name, is_self));

        if entity.name != name && !name.is_empty() {
            entity.name = name.to_string();
        }

        // A reported heading wins over one derived from movement
        let previous = entity.position;
        if let Some(h) = heading {
            entity.heading = Some(normalize_heading(h));
        } else if let Some(prev) = previous {
            if haversine_distance(&prev, &position) >= MIN_HEADING_MOVE_M {
                entity.heading = Some(bearing(&prev, &position));
            }
        }

        entity.position = Some(position);
        entity.path.push(PathPoint::new(position, ts));
        if entity.path.len() > self.max_path_points {
            let excess = entity.path.len() - self.max_path_points;
            entity.path.drain(..excess);
        }

        Some(PositionChange {
            created,
            previous,
            current: position,
        })
    }
}

impl Default for PositionStore {
    fn default() -> Self {
        Self::new(50)
    }
}
