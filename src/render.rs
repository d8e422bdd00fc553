//! # Render Synchronizer
//!
//! Keeps an id → marker map in step with the live entity set while touching
//! the rendering surface as little as possible.
//!
//! Markers sit behind [`RenderableMarker`], a four-call capability, and are
//! created through a [`MarkerFactory`]. One adapter exists per rendering
//! technology; [`SnapshotSurface`] records marker state for hosts that poll
//! (FFI, tests).
//!
//! Each sync cycle:
//! - present and unmapped → create a marker
//! - present and mapped → replace the icon only when its [`IconKey`] changed
//! - mapped but no longer present → remove the marker and report the id
//! - present without a position → skipped this cycle

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheStats, MemoCache};
use crate::geo_utils::normalize_heading;
use crate::motion::FrameUpdate;
use crate::Position;

/// Icons are rebuilt only when the heading crosses a bucket boundary.
pub const HEADING_BUCKET_DEG: f64 = 5.0;

/// Default number of distinct icons kept.
pub const DEFAULT_ICON_CACHE_CAPACITY: usize = 256;

// ============================================================================
// Icon Keys and Assets
// ============================================================================

/// Marker colour category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorBucket {
    /// The device user
    SelfUser,
    /// A member inside the geofence (or no geofence yet)
    Member,
    /// A member currently outside the geofence
    Outside,
}

impl ColorBucket {
    pub fn fill(&self) -> &'static str {
        match self {
            ColorBucket::SelfUser => "#1e88e5",
            ColorBucket::Member => "#43a047",
            ColorBucket::Outside => "#e53935",
        }
    }
}

/// Everything that determines how a marker icon looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IconKey {
    pub bucket: ColorBucket,
    /// Heading rounded to the nearest 5°, in [0, 360); `None` draws a dot
    pub heading_bucket: Option<u16>,
    pub highlighted: bool,
}

impl IconKey {
    pub fn new(bucket: ColorBucket, heading: Option<f64>, highlighted: bool) -> Self {
        Self {
            bucket,
            heading_bucket: heading.map(heading_bucket),
            highlighted,
        }
    }
}

/// Round a heading to the nearest bucket; 360 folds to 0.
pub fn heading_bucket(heading: f64) -> u16 {
    let steps = (normalize_heading(heading) / HEADING_BUCKET_DEG).round();
    ((steps * HEADING_BUCKET_DEG) as u16) % 360
}

/// A built marker icon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IconAsset {
    pub key: IconKey,
    pub svg: String,
}

impl IconAsset {
    /// Build the SVG for a key.
    pub fn build(key: IconKey) -> Self {
        let (size, stroke) = if key.highlighted { (40, "#ffd600") } else { (32, "#ffffff") };
        let half = size / 2;
        let radius = half - 6;
        let pointer = match key.heading_bucket {
            Some(deg) => format!(
                r#"<path d="M{half} 1 L{l} 8 L{r} 8 Z" fill="{fill}" transform="rotate({deg} {half} {half})"/>"#,
                l = half - 5,
                r = half + 5,
                fill = key.bucket.fill(),
            ),
            None => String::new(),
        };
        let svg = format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{size}" height="{size}" viewBox="0 0 {size} {size}">{pointer}<circle cx="{half}" cy="{half}" r="{radius}" fill="{fill}" stroke="{stroke}" stroke-width="3"/></svg>"#,
            fill = key.bucket.fill(),
        );
        Self { key, svg }
    }
}

/// Memoizes icon assets by key.
#[derive(Debug)]
pub struct IconCache {
    cache: MemoCache<IconKey, Arc<IconAsset>>,
    builds: u64,
}

impl IconCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: MemoCache::new(capacity),
            builds: 0,
        }
    }

    /// The asset for `key`, built on first use.
    pub fn get(&mut self, key: IconKey) -> Arc<IconAsset> {
        let builds = &mut self.builds;
        self.cache.get_or_insert_with(key, || {
            *builds += 1;
            Arc::new(IconAsset::build(key))
        })
    }

    /// Number of assets built so far.
    pub fn builds(&self) -> u64 {
        self.builds
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

impl Default for IconCache {
    fn default() -> Self {
        Self::new(DEFAULT_ICON_CACHE_CAPACITY)
    }
}

// ============================================================================
// Marker Capability
// ============================================================================

/// Minimal capability a rendered marker must offer.
pub trait RenderableMarker {
    fn set_position(&mut self, position: Position);
    fn set_icon(&mut self, icon: Arc<IconAsset>);
    fn bind_label(&mut self, label: &str);
    fn remove(&mut self);
}

/// Creates markers on a rendering surface.
pub trait MarkerFactory {
    type Marker: RenderableMarker;

    fn create(&mut self, id: &str, position: Position, icon: Arc<IconAsset>) -> Self::Marker;
}

/// What the synchronizer needs to know about an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityView {
    pub id: String,
    pub name: String,
    /// `None` marks a malformed entity; it is skipped
    pub position: Option<Position>,
    pub heading: Option<f64>,
    pub bucket: ColorBucket,
    pub highlighted: bool,
}

impl EntityView {
    pub fn icon_key(&self) -> IconKey {
        IconKey::new(self.bucket, self.heading, self.highlighted)
    }
}

/// What one sync cycle changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: Vec<String>,
    pub reiconed: Vec<String>,
    /// Markers removed; callers purge animation and cache state for these
    pub removed: Vec<String>,
    pub skipped: Vec<String>,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.reiconed.is_empty() && self.removed.is_empty()
    }
}

struct MarkerSlot<M> {
    marker: M,
    key: IconKey,
    label: String,
}

// ============================================================================
// Synchronizer
// ============================================================================

/// Diffs entity sets against the markers on a surface.
pub struct RenderSynchronizer<F: MarkerFactory> {
    factory: F,
    icons: IconCache,
    markers: HashMap<String, MarkerSlot<F::Marker>>,
}

impl<F: MarkerFactory> RenderSynchronizer<F> {
    pub fn new(factory: F, icons: IconCache) -> Self {
        Self {
            factory,
            icons,
            markers: HashMap::new(),
        }
    }

    /// Bring the marker map in line with `entities`.
    pub fn sync(&mut self, entities: &[EntityView]) -> SyncReport {
        let mut report = SyncReport::default();

        let stale: Vec<String> = self
            .markers
            .keys()
            .filter(|id| !entities.iter().any(|e| &e.id == *id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(mut slot) = self.markers.remove(&id) {
                slot.marker.remove();
                report.removed.push(id);
            }
        }

        for entity in entities {
            let key = entity.icon_key();
            match self.markers.get_mut(&entity.id) {
                Some(slot) => {
                    if slot.key != key {
                        slot.marker.set_icon(self.icons.get(key));
                        slot.key = key;
                        report.reiconed.push(entity.id.clone());
                    }
                    if slot.label != entity.name {
                        slot.marker.bind_label(&entity.name);
                        slot.label = entity.name.clone();
                    }
                }
                None => {
                    let Some(position) = entity.position else {
                        debug!("[Render] Skipping '{}' without a position", entity.id);
                        report.skipped.push(entity.id.clone());
                        continue;
                    };
                    let mut marker = self.factory.create(&entity.id, position, self.icons.get(key));
                    marker.bind_label(&entity.name);
                    self.markers.insert(
                        entity.id.clone(),
                        MarkerSlot {
                            marker,
                            key,
                            label: entity.name.clone(),
                        },
                    );
                    report.created.push(entity.id.clone());
                }
            }
        }

        report.removed.sort();
        report
    }

    /// Move mapped markers to their animated positions. Returns how many moved.
    pub fn apply_frames(&mut self, frames: &[FrameUpdate]) -> usize {
        let mut moved = 0;
        for frame in frames {
            match self.markers.get_mut(&frame.id) {
                Some(slot) => {
                    slot.marker.set_position(frame.position);
                    moved += 1;
                }
                None => debug!("[Render] Frame for unmapped '{}'", frame.id),
            }
        }
        moved
    }

    /// Remove one marker outside the sync cycle.
    pub fn remove(&mut self, id: &str) -> bool {
        match self.markers.remove(id) {
            Some(mut slot) => {
                slot.marker.remove();
                true
            }
            None => false,
        }
    }

    /// Remove every marker.
    pub fn clear(&mut self) {
        for (_, mut slot) in self.markers.drain() {
            slot.marker.remove();
        }
    }

    pub fn is_mapped(&self, id: &str) -> bool {
        self.markers.contains_key(id)
    }

    pub fn applied_key(&self, id: &str) -> Option<IconKey> {
        self.markers.get(id).map(|slot| slot.key)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn icons(&self) -> &IconCache {
        &self.icons
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }
}

// ============================================================================
// Snapshot Surface
// ============================================================================

/// Last applied state of one marker on a [`SnapshotSurface`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerState {
    pub id: String,
    pub position: Position,
    pub icon: IconKey,
    pub svg: String,
    pub label: String,
    /// Number of times the icon was replaced after creation
    pub icon_changes: u32,
}

type SharedMarkers = Arc<Mutex<HashMap<String, MarkerState>>>;

/// Marker surface that records state for polling hosts.
#[derive(Debug, Clone, Default)]
pub struct SnapshotSurface {
    markers: SharedMarkers,
}

impl SnapshotSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current markers, sorted by id.
    pub fn markers(&self) -> Vec<MarkerState> {
        let mut markers: Vec<MarkerState> = match self.markers.lock() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => {
                warn!("[Render] Snapshot surface lock poisoned");
                Vec::new()
            }
        };
        markers.sort_by(|a, b| a.id.cmp(&b.id));
        markers
    }

    pub fn marker(&self, id: &str) -> Option<MarkerState> {
        self.markers.lock().ok()?.get(id).cloned()
    }
}

/// Marker handle produced by [`SnapshotSurface`].
#[derive(Debug)]
pub struct SnapshotMarker {
    id: String,
    markers: SharedMarkers,
}

impl SnapshotMarker {
    fn update(&self, f: impl FnOnce(&mut MarkerState)) {
        if let Ok(mut map) = self.markers.lock() {
            if let Some(state) = map.get_mut(&self.id) {
                f(state);
            }
        }
    }
}

impl RenderableMarker for SnapshotMarker {
    fn set_position(&mut self, position: Position) {
        self.update(|s| s.position = position);
    }

    fn set_icon(&mut self, icon: Arc<IconAsset>) {
        self.update(|s| {
            s.icon = icon.key;
            s.svg = icon.svg.clone();
            s.icon_changes += 1;
        });
    }

    fn bind_label(&mut self, label: &str) {
        self.update(|s| s.label = label.to_string());
    }

    fn remove(&mut self) {
        if let Ok(mut map) = self.markers.lock() {
            map.remove(&self.id);
        }
    }
}

impl MarkerFactory for SnapshotSurface {
    type Marker = SnapshotMarker;

    fn create(&mut self, id: &str, position: Position, icon: Arc<IconAsset>) -> SnapshotMarker {
        if let Ok(mut map) = self.markers.lock() {
            map.insert(
                id.to_string(),
                MarkerState {
                    id: id.to_string(),
                    position,
                    icon: icon.key,
                    svg: icon.svg.clone(),
                    label: String::new(),
                    icon_changes: 0,
                },
            );
        }
        SnapshotMarker {
            id: id.to_string(),
            markers: Arc::clone(&self.markers),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn view(id: &str, heading: Option<f64>) -> EntityView {
        EntityView {
            id: id.to_string(),
            name: format!("Pilgrim {}", id),
            position: Some(Position::new(21.4225, 39.8262)),
            heading,
            bucket: ColorBucket::Member,
            highlighted: false,
        }
    }

    fn synchronizer() -> (RenderSynchronizer<SnapshotSurface>, SnapshotSurface) {
        let surface = SnapshotSurface::new();
        (RenderSynchronizer::new(surface.clone(), IconCache::default()), surface)
    }

    #[test]
    fn test_heading_bucket_rounding() {
        assert_eq!(heading_bucket(0.0), 0);
        assert_eq!(heading_bucket(2.4), 0);
        assert_eq!(heading_bucket(2.6), 5);
        assert_eq!(heading_bucket(358.0), 0);
        assert_eq!(heading_bucket(359.9), 0);
        assert_eq!(heading_bucket(-90.0), 270);
        assert_eq!(heading_bucket(181.0), 180);
    }

    #[test]
    fn test_create_then_skip_unchanged() {
        let (mut sync, surface) = synchronizer();

        let report = sync.sync(&[view("m1", Some(90.0)), view("m2", None)]);
        assert_eq!(report.created, vec!["m1", "m2"]);
        assert_eq!(surface.markers().len(), 2);
        assert_eq!(surface.marker("m1").unwrap().label, "Pilgrim m1");

        // Heading wobble inside one bucket does not touch the icon
        let report = sync.sync(&[view("m1", Some(91.5)), view("m2", None)]);
        assert!(report.is_noop());
        assert_eq!(surface.marker("m1").unwrap().icon_changes, 0);
    }

    #[test]
    fn test_reicon_on_key_change() {
        let (mut sync, surface) = synchronizer();
        sync.sync(&[view("m1", Some(90.0))]);

        let report = sync.sync(&[view("m1", Some(100.0))]);
        assert_eq!(report.reiconed, vec!["m1"]);

        let mut highlighted = view("m1", Some(100.0));
        highlighted.highlighted = true;
        let report = sync.sync(&[highlighted]);
        assert_eq!(report.reiconed, vec!["m1"]);

        let marker = surface.marker("m1").unwrap();
        assert_eq!(marker.icon_changes, 2);
        assert!(marker.icon.highlighted);
        assert!(marker.svg.contains("#ffd600"));
    }

    #[test]
    fn test_removed_and_malformed() {
        let (mut sync, surface) = synchronizer();
        sync.sync(&[view("m1", None), view("m2", None)]);

        let mut broken = view("m3", None);
        broken.position = None;
        let report = sync.sync(&[view("m1", None), broken]);
        assert_eq!(report.removed, vec!["m2"]);
        assert_eq!(report.skipped, vec!["m3"]);
        assert!(!sync.is_mapped("m2"));
        assert!(surface.marker("m2").is_none());
        assert_eq!(sync.len(), 1);

        sync.clear();
        assert!(surface.markers().is_empty());
    }

    #[test]
    fn test_frames_move_mapped_markers_only() {
        let (mut sync, surface) = synchronizer();
        sync.sync(&[view("m1", None)]);

        let target = Position::new(21.4230, 39.8270);
        let frames = vec![
            FrameUpdate {
                id: "m1".into(),
                position: target,
                heading: None,
                finished: false,
            },
            FrameUpdate {
                id: "ghost".into(),
                position: target,
                heading: None,
                finished: true,
            },
        ];
        assert_eq!(sync.apply_frames(&frames), 1);
        assert_eq!(surface.marker("m1").unwrap().position, target);
    }

    #[test]
    fn test_icon_assets_memoized() {
        let mut icons = IconCache::new(8);
        let key = IconKey::new(ColorBucket::Outside, Some(45.0), false);
        let a = icons.get(key);
        let b = icons.get(key);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(icons.builds(), 1);
        assert!(a.svg.contains("rotate(45"));

        icons.get(IconKey::new(ColorBucket::Outside, Some(47.0), false));
        assert_eq!(icons.builds(), 1);
        icons.get(IconKey::new(ColorBucket::SelfUser, Some(45.0), false));
        assert_eq!(icons.builds(), 2);
    }
}
