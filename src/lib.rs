//! # Group Tracker
//!
//! Live group-positioning, animation and geofencing engine for a pilgrimage
//! safety map.
//!
//! This library provides:
//! - Self and group-member position tracking with bounded path history
//! - Smooth, walking-speed marker animation along movement paths
//! - A dynamic geofence derived from the group's live spread, with breach alerts
//! - Live point-to-point routing with an instant straight-line fallback
//! - Road-snapping of member movement segments
//! - Marker diffing against a rendering-library-agnostic marker capability
//!
//! ## Features
//!
//! - **`http`** - Enable the OSRM-style HTTP road-routing client (default)
//! - **`persistence`** - Enable the SQLite-backed centre hint store
//! - **`ffi`** - Enable FFI bindings for mobile platforms (iOS/Android)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use group_tracker::{compute_geofence, GeofenceConfig, Position};
//!
//! let group = vec![
//!     Position::new(21.4225, 39.8262),
//!     Position::new(21.4229, 39.8262),
//!     Position::new(21.4225, 39.8267),
//! ];
//!
//! let fence = compute_geofence(&group, &GeofenceConfig::default()).unwrap();
//! assert!(fence.radius_m >= GeofenceConfig::default().min_radius_m);
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, TrackerError};

// Geographic utilities (distance, bearing, easing)
pub mod geo_utils;

// Frame-clock debounce and throttle
pub mod timing;
pub use timing::{Debouncer, Throttle};

// Bounded memo cache shared by icon and road-snap caches
pub mod cache;
pub use cache::MemoCache;

// Per-entity position, heading and path history
pub mod store;
pub use store::{Entity, PositionStore};

// Marker animation along movement paths
pub mod motion;
pub use motion::{AnimationRegistry, FrameUpdate, MotionConfig, MotionEngine, SelfMotion};

// Road-aligned refinement of movement segments
pub mod snap;
pub use snap::{RoadSnapResolver, SnapConfig, SnapRequest};

// Dynamic geofence and breach detection
pub mod geofence;
pub use geofence::{
    compute_geofence, position_fingerprint, BreachAlert, BreachCandidate, BreachTracker,
    GeofenceCalculator, GeofenceConfig,
};

// Live point-to-point routes with straight-line fallback
pub mod route;
pub use route::{RouteConfig, RouteRequest, RouteResolver, RouteSelection, RouteView};

// Marker diffing and icon memoization
pub mod render;
pub use render::{
    ColorBucket, EntityView, IconAsset, IconCache, IconKey, MarkerFactory, MarkerState,
    RenderSynchronizer, RenderableMarker, SnapshotSurface, SyncReport,
};

// Road-routing service abstraction (and HTTP client)
pub mod routing;
pub use routing::{RoutedPath, RoutingService};
#[cfg(feature = "http")]
pub use routing::OsrmClient;

// Fire-and-forget network dispatch
pub mod dispatch;
pub use dispatch::{Completion, RequestDispatcher};

// Member position feeds (simulated and external)
pub mod feed;
pub use feed::{
    ChannelFeed, FeedSender, FeedSnapshot, MemberFix, PositionFeed, SimulatedFeed, SimulationConfig,
};

// Device geolocation subscription
pub mod location;
pub use location::{
    ChannelGeolocation, GeolocationHandle, GeolocationSource, LocationError, LocationEvent,
    LocationFix, LocationSink, Subscription,
};

// Cross-screen "centre map here" hints
pub mod hint;
pub use hint::{CenterHint, HintStore, MemoryHintStore};
#[cfg(feature = "persistence")]
pub use hint::SqliteHintStore;

// Map screen orchestration
pub mod session;
pub use session::{
    EntitySnapshot, Highlight, MapSession, MapSnapshot, SessionConfig, SessionEvent, ViewportCommand,
};

// FFI bindings for mobile platforms (iOS/Android)
#[cfg(feature = "ffi")]
pub mod ffi;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android (only used in FFI)
#[cfg(all(feature = "ffi", target_os = "android"))]
pub(crate) fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("GroupTrackerRust"),
    );
}

#[cfg(all(feature = "ffi", not(target_os = "android")))]
pub(crate) fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A geographic point in degrees.
///
/// # Example
/// ```
/// use group_tracker::Position;
/// let kaaba = Position::new(21.4225, 39.8262);
/// assert!(kaaba.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
}

impl Position {
    /// Create a new position.
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Check if the position has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && self.lat >= -90.0
            && self.lat <= 90.0
            && self.lng >= -180.0
            && self.lng <= 180.0
    }
}

/// A timestamped position, one element of an entity's movement history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PathPoint {
    pub lat: f64,
    pub lng: f64,
    /// Milliseconds since the Unix epoch (or any monotonic origin the host uses)
    pub ts: u64,
}

impl PathPoint {
    pub fn new(position: Position, ts: u64) -> Self {
        Self {
            lat: position.lat,
            lng: position.lng,
            ts,
        }
    }
}

/// A derived circular safety boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct Geofence {
    pub center: Position,
    /// Radius in meters, never below the configured floor
    pub radius_m: f64,
}

/// Where a route result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteSource {
    /// Returned by the road-routing service
    Routed,
    /// Synthesized locally from great-circle distance
    StraightLine,
}

/// A route between two points, either routed or a straight-line fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteResult {
    pub distance_m: f64,
    pub eta_s: f64,
    pub geometry: Option<Vec<Position>>,
    pub source: RouteSource,
}

/// Bounding box used for viewport fitting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Create bounds from positions.
    pub fn from_positions(positions: &[Position]) -> Option<Self> {
        if positions.is_empty() {
            return None;
        }
        let mut min_lat = f64::MAX;
        let mut max_lat = f64::MIN;
        let mut min_lng = f64::MAX;
        let mut max_lng = f64::MIN;

        for p in positions {
            min_lat = min_lat.min(p.lat);
            max_lat = max_lat.max(p.lat);
            min_lng = min_lng.min(p.lng);
            max_lng = max_lng.max(p.lng);
        }

        Some(Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        })
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Complete engine configuration.
///
/// Every field has a documented default; JSON input only needs to name the
/// values it overrides.
///
/// ```
/// use group_tracker::TrackerConfig;
///
/// let config = TrackerConfig::from_json(r#"{"geofence": {"min_radius_m": 80.0}}"#).unwrap();
/// assert_eq!(config.geofence.min_radius_m, 80.0);
/// assert_eq!(config.geofence.safety_buffer, 1.15);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub motion: MotionConfig,
    pub snap: SnapConfig,
    pub geofence: GeofenceConfig,
    pub route: RouteConfig,
    pub session: session::SessionConfig,
    pub feed: feed::SimulationConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            motion: MotionConfig::default(),
            snap: SnapConfig::default(),
            geofence: GeofenceConfig::default(),
            route: RouteConfig::default(),
            session: session::SessionConfig::default(),
            feed: feed::SimulationConfig::default(),
        }
    }
}

impl TrackerConfig {
    /// Parse a configuration from JSON, filling omitted values with defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| TrackerError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> Result<()> {
        if !(self.motion.walking_speed_mps > 0.0) {
            return Err(TrackerError::Config {
                message: "motion.walking_speed_mps must be positive".to_string(),
            });
        }
        if !(self.route.walking_speed_mps > 0.0) {
            return Err(TrackerError::Config {
                message: "route.walking_speed_mps must be positive".to_string(),
            });
        }
        if self.geofence.safety_buffer < 1.0 {
            return Err(TrackerError::Config {
                message: "geofence.safety_buffer must be at least 1.0".to_string(),
            });
        }
        if self.geofence.min_radius_m < 0.0 {
            return Err(TrackerError::Config {
                message: "geofence.min_radius_m must not be negative".to_string(),
            });
        }
        if self.session.max_path_points < 2 {
            return Err(TrackerError::Config {
                message: "session.max_path_points must be at least 2".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
