//! FFI bindings for mobile platforms (iOS/Android).
//!
//! One map session lives in a global slot so the platform side only passes
//! plain values across the boundary. Structured outputs (snapshots, events,
//! markers) are returned as JSON strings.

use std::sync::{Arc, Mutex};

use log::{info, warn};
use once_cell::sync::Lazy;
use tokio::runtime::Runtime;

use crate::feed::SimulatedFeed;
use crate::hint::{CenterHint, HintStore, MemoryHintStore};
use crate::location::{LocationError, LocationEvent, LocationFix};
use crate::render::SnapshotSurface;
use crate::routing::OsrmClient;
use crate::session::MapSession;
use crate::{init_logging, Geofence, Position, TrackerConfig};

type Session = MapSession<OsrmClient, SimulatedFeed, SnapshotSurface>;

/// Everything owned by the global session.
struct FfiSession {
    // Dropped before the runtime its requests run on
    session: Session,
    surface: SnapshotSurface,
    hints: MemoryHintStore,
    _runtime: Runtime,
}

static SESSION: Lazy<Mutex<Option<FfiSession>>> = Lazy::new(|| Mutex::new(None));

/// Run `f` against the live session; `None` when no session is running.
fn with_session<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut FfiSession) -> R,
{
    let mut guard = match SESSION.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("[GroupTracker] Session lock poisoned, recovering");
            poisoned.into_inner()
        }
    };
    guard.as_mut().map(f)
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        warn!("[GroupTracker] Serialization failed: {}", e);
        "null".to_string()
    })
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Start (or restart) the session.
///
/// `config_json` may be empty for defaults. `routing_base_url` may be empty
/// for the public OSRM demo server. Returns false if anything fails to build.
#[uniffi::export]
pub fn tracker_init(config_json: String, routing_base_url: String) -> bool {
    init_logging();

    let config = if config_json.trim().is_empty() {
        TrackerConfig::default()
    } else {
        match TrackerConfig::from_json(&config_json) {
            Ok(config) => config,
            Err(e) => {
                warn!("[GroupTracker] Bad config: {}", e);
                return false;
            }
        }
    };

    let runtime = match Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            warn!("[GroupTracker] Failed to create tokio runtime: {}", e);
            return false;
        }
    };

    let client = if routing_base_url.trim().is_empty() {
        OsrmClient::with_defaults()
    } else {
        OsrmClient::new(&routing_base_url, crate::routing::DEFAULT_PROFILE)
    };
    let client = match client {
        Ok(client) => client,
        Err(e) => {
            warn!("[GroupTracker] {}", e);
            return false;
        }
    };

    let surface = SnapshotSurface::new();
    let hints = MemoryHintStore::new();
    let feed = SimulatedFeed::new(config.feed.clone());
    let mut session = match MapSession::new(
        config,
        Arc::new(client),
        feed,
        surface.clone(),
        runtime.handle().clone(),
    ) {
        Ok(session) => session,
        Err(e) => {
            warn!("[GroupTracker] {}", e);
            return false;
        }
    };
    session.attach_hints(Arc::new(hints.clone()));

    let mut guard = match SESSION.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *guard = Some(FfiSession {
        session,
        surface,
        hints,
        _runtime: runtime,
    });
    info!("[GroupTracker] Session started");
    true
}

/// Tear down the session and release its runtime.
#[uniffi::export]
pub fn tracker_shutdown() {
    let taken = {
        let mut guard = match SESSION.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.take()
    };
    if let Some(mut ffi) = taken {
        ffi.session.shutdown();
        info!("[GroupTracker] Session shut down");
    }
}

// ============================================================================
// Inputs
// ============================================================================

/// Deliver a device location fix.
#[uniffi::export]
pub fn tracker_push_location(
    lat: f64,
    lng: f64,
    heading: Option<f64>,
    timestamp_ms: u64,
    accuracy_m: Option<f64>,
) {
    with_session(|s| {
        s.session.push_location(LocationEvent::Fix(LocationFix {
            position: Position::new(lat, lng),
            heading,
            timestamp_ms,
            accuracy_m,
        }))
    });
}

/// Report a location failure: "denied", "timeout", or anything else for
/// "unavailable".
#[uniffi::export]
pub fn tracker_push_location_error(kind: String, message: String) {
    let error = match kind.as_str() {
        "denied" => LocationError::PermissionDenied,
        "timeout" => LocationError::Timeout,
        _ => LocationError::Unavailable { message },
    };
    with_session(|s| s.session.push_location(LocationEvent::Error(error)));
}

/// Leave a "centre the map here" hint for the map screen.
#[uniffi::export]
pub fn tracker_save_center_hint(lat: f64, lng: f64, timestamp_ms: u64, source: String) -> bool {
    with_session(|s| {
        s.hints
            .save(CenterHint {
                lat,
                lng,
                timestamp_ms,
                source,
            })
            .is_ok()
    })
    .unwrap_or(false)
}

// ============================================================================
// Commands
// ============================================================================

/// Advance the engine; call once per frame.
#[uniffi::export]
pub fn tracker_tick(now_ms: u64) {
    with_session(|s| s.session.tick(now_ms));
}

#[uniffi::export]
pub fn tracker_join_group(now_ms: u64) {
    with_session(|s| s.session.join_group(now_ms));
}

#[uniffi::export]
pub fn tracker_leave_group() {
    with_session(|s| s.session.leave_group());
}

/// Select a member and start routing to it. Returns the route view as JSON,
/// or an empty string if the member cannot be routed to.
#[uniffi::export]
pub fn tracker_select_member(member_id: String) -> String {
    with_session(|s| match s.session.select_member(&member_id) {
        Ok(view) => to_json(&view),
        Err(e) => {
            warn!("[GroupTracker] {}", e);
            String::new()
        }
    })
    .unwrap_or_default()
}

#[uniffi::export]
pub fn tracker_clear_selection() {
    with_session(|s| s.session.clear_selection());
}

/// Centre on an entity (e.g. from a breach alert). Returns false if unknown.
#[uniffi::export]
pub fn tracker_focus_entity(entity_id: String) -> bool {
    with_session(|s| s.session.focus_entity(&entity_id).is_ok()).unwrap_or(false)
}

#[uniffi::export]
pub fn tracker_recompute_geofence() -> Option<Geofence> {
    with_session(|s| s.session.recompute_geofence()).flatten()
}

/// Force a member outside the geofence; `None` clears the designation.
#[uniffi::export]
pub fn tracker_set_forced_outside(member_id: Option<String>) -> bool {
    with_session(|s| s.session.set_forced_outside(member_id).is_ok()).unwrap_or(false)
}

// ============================================================================
// Outputs
// ============================================================================

/// Current map state as JSON (`null` without a session).
#[uniffi::export]
pub fn tracker_snapshot_json() -> String {
    with_session(|s| to_json(&s.session.snapshot())).unwrap_or_else(|| "null".to_string())
}

/// Events since the last call as a JSON array.
#[uniffi::export]
pub fn tracker_drain_events_json() -> String {
    with_session(|s| to_json(&s.session.drain_events())).unwrap_or_else(|| "[]".to_string())
}

/// Marker state (position, icon key, SVG, label) as a JSON array.
#[uniffi::export]
pub fn tracker_markers_json() -> String {
    with_session(|s| to_json(&s.surface.markers())).unwrap_or_else(|| "[]".to_string())
}
