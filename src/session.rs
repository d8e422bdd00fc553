//! # Map Session
//!
//! Owns every subsystem behind the map screen and advances them together,
//! one [`MapSession::tick`] per host frame.
//!
//! A tick runs, in order:
//! 1. Apply finished network requests (road-snap, routing)
//! 2. Apply throttled device location fixes
//! 3. Reconcile the member roster against the position feed
//! 4. Geofence: submit positions, recompute when due, evaluate breaches
//! 5. Route: follow moved endpoints
//! 6. Consume a pending centre hint
//! 7. Advance marker animation and sync markers
//!
//! All mutation happens inside `&mut self` calls, so a host never observes a
//! half-applied tick. Outputs are pulled: [`MapSession::snapshot`] for state,
//! [`MapSession::drain_events`] for things that happened.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::dispatch::{Completion, RequestDispatcher};
use crate::feed::{FeedSnapshot, PositionFeed};
use crate::geofence::{BreachAlert, BreachCandidate, BreachTracker, GeofenceCalculator};
use crate::hint::HintStore;
use crate::location::{GeolocationSource, LocationEvent, Subscription};
use crate::motion::{AnimationRegistry, FrameUpdate, MotionEngine, SelfMotion};
use crate::render::{ColorBucket, EntityView, IconCache, MarkerFactory, RenderSynchronizer};
use crate::route::{RouteResolver, RouteSelection, RouteView};
use crate::routing::RoutingService;
use crate::snap::RoadSnapResolver;
use crate::store::PositionStore;
use crate::timing::Throttle;
use crate::{
    Bounds, Geofence, OptionExt, Position, Result, TrackerConfig, TrackerError,
};

// ============================================================================
// Configuration
// ============================================================================

/// Session-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Path history kept per entity.
    /// Default: 50
    pub max_path_points: usize,

    /// Minimum spacing between accepted device fixes.
    /// Default: 1000 ms
    pub self_fix_interval_ms: u64,

    /// Used as the anchor until the first fix (or when location is denied).
    /// Default: 21.4225, 39.8262
    pub default_anchor: Position,

    /// Id of the self entity.
    /// Default: "self"
    pub self_id: String,

    /// Display name of the self entity.
    /// Default: "You"
    pub self_name: String,

    /// Centre hints older than this are discarded.
    /// Default: 600000 ms (10 min)
    pub hint_max_age_ms: u64,

    /// How long a hinted point stays highlighted.
    /// Default: 4000 ms
    pub highlight_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_path_points: 50,
            self_fix_interval_ms: 1000,
            default_anchor: Position::new(21.4225, 39.8262),
            self_id: "self".to_string(),
            self_name: "You".to_string(),
            hint_max_age_ms: 10 * 60 * 1000,
            highlight_ms: 4000,
        }
    }
}

// ============================================================================
// Outputs
// ============================================================================

/// Something the host should do with the map camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewportCommand {
    /// Fit both route endpoints on screen
    FitBounds { bounds: Bounds },
    /// Re-centre on a point, optionally following an entity
    CenterOn {
        position: Position,
        entity_id: Option<String>,
    },
}

/// Events accumulated between [`MapSession::drain_events`] calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Breach { alert: BreachAlert },
    LocationWarning { message: String },
    Viewport { command: ViewportCommand },
    RouteChanged { route: RouteView },
    GeofenceChanged { geofence: Option<Geofence> },
    MembersChanged { joined: Vec<String>, left: Vec<String> },
}

/// One entity as the UI should draw it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: String,
    pub name: String,
    /// Animated position; `None` for a member without a fix yet
    pub position: Option<Position>,
    /// Last reported position
    pub reported: Option<Position>,
    pub heading: Option<f64>,
    pub is_self: bool,
    pub outside: bool,
    pub selected: bool,
    pub path_len: usize,
}

/// A temporarily highlighted point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Highlight {
    pub position: Position,
    pub until_ms: u64,
}

/// Full renderable state of the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapSnapshot {
    pub entities: Vec<EntitySnapshot>,
    pub geofence: Option<Geofence>,
    pub forced_outside: Option<String>,
    pub route: Option<RouteView>,
    pub selected: Option<String>,
    pub highlight: Option<Highlight>,
    pub group_active: bool,
    /// True while running on the default anchor or a stale fix
    pub location_degraded: bool,
}

// ============================================================================
// Session
// ============================================================================

/// The map screen engine.
pub struct MapSession<S: RoutingService, F: PositionFeed, M: MarkerFactory> {
    config: TrackerConfig,
    store: PositionStore,
    motion: MotionEngine,
    self_motion: SelfMotion,
    snap: RoadSnapResolver,
    geofence: GeofenceCalculator,
    breaches: BreachTracker,
    route: RouteResolver,
    render: RenderSynchronizer<M>,
    dispatcher: RequestDispatcher<S>,
    feed: F,

    location_tx: UnboundedSender<LocationEvent>,
    location_rx: UnboundedReceiver<LocationEvent>,
    subscription: Option<Subscription>,
    fix_throttle: Throttle,
    location_error_streak: bool,

    hints: Option<Arc<dyn HintStore>>,
    hint_revision: Option<u64>,
    highlight: Option<Highlight>,

    group_active: bool,
    selected: Option<String>,
    events: Vec<SessionEvent>,
    shut_down: bool,
}

impl<S: RoutingService, F: PositionFeed, M: MarkerFactory> MapSession<S, F, M> {
    /// Build a session. Network requests are spawned on `handle`.
    pub fn new(
        config: TrackerConfig,
        service: Arc<S>,
        feed: F,
        factory: M,
        handle: Handle,
    ) -> Result<Self> {
        config.validate()?;
        let (location_tx, location_rx) = mpsc::unbounded_channel();

        info!(
            "[MapSession] Created (geofence floor {:.0}m, snap every {}ms)",
            config.geofence.min_radius_m, config.snap.min_interval_ms
        );

        Ok(Self {
            store: PositionStore::new(config.session.max_path_points),
            motion: MotionEngine::new(config.motion.clone(), AnimationRegistry::new()),
            self_motion: SelfMotion::new(config.motion.clone()),
            snap: RoadSnapResolver::new(config.snap.clone()),
            geofence: GeofenceCalculator::new(config.geofence.clone()),
            breaches: BreachTracker::new(),
            route: RouteResolver::new(config.route.clone()),
            render: RenderSynchronizer::new(factory, IconCache::default()),
            dispatcher: RequestDispatcher::new(service, handle),
            feed,
            location_tx,
            location_rx,
            subscription: None,
            fix_throttle: Throttle::new(config.session.self_fix_interval_ms),
            location_error_streak: false,
            hints: None,
            hint_revision: None,
            highlight: None,
            group_active: false,
            selected: None,
            events: Vec::new(),
            shut_down: false,
            config,
        })
    }

    // ========================================================================
    // Inputs
    // ========================================================================

    /// Subscribe to a geolocation source. Replaces any previous subscription.
    pub fn attach_geolocation(&mut self, source: &dyn GeolocationSource) {
        let tx = self.location_tx.clone();
        let subscription = source.subscribe(Arc::new(move |event| {
            let _ = tx.send(event);
        }));
        self.subscription = Some(subscription);
    }

    /// Feed a location event directly (bridges without a subscription).
    pub fn push_location(&mut self, event: LocationEvent) {
        let _ = self.location_tx.send(event);
    }

    /// Watch a cross-screen hint store. Hints already pending are consumed on
    /// the next tick.
    pub fn attach_hints(&mut self, store: Arc<dyn HintStore>) {
        self.hints = Some(store);
        self.hint_revision = None;
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Enter group-tracking mode; members appear from the feed.
    pub fn join_group(&mut self, now_ms: u64) {
        if self.group_active || self.shut_down {
            return;
        }
        info!("[MapSession] Joined group");
        self.group_active = true;
        self.geofence.invalidate();
        self.poll_feed(now_ms);
    }

    /// Leave group-tracking mode: members, geofence and breach state go away.
    pub fn leave_group(&mut self) {
        if !self.group_active {
            return;
        }
        info!("[MapSession] Left group");
        self.group_active = false;
        self.feed.reset();

        let removed = self.store.clear_members();
        for id in &removed {
            self.purge_member(id);
        }
        self.geofence.clear();
        self.breaches.clear();
        self.events.push(SessionEvent::GeofenceChanged { geofence: None });
        if !removed.is_empty() {
            self.events.push(SessionEvent::MembersChanged {
                joined: Vec::new(),
                left: removed,
            });
        }
    }

    /// Select a member: draw a route to it and fit the viewport the first
    /// time it is selected.
    pub fn select_member(&mut self, id: &str) -> Result<RouteView> {
        let entity = self.store.get(id).ok_or_unknown_entity(id)?;
        if entity.is_self {
            return Err(TrackerError::Internal {
                message: "cannot route to self".to_string(),
            });
        }
        let destination = entity.position.ok_or_missing_position(id)?;
        let origin = self.anchor();

        let selection = self.route.select(id, origin, destination);
        self.selected = Some(id.to_string());
        let view = selection.view.clone();
        self.apply_selection(selection);
        Ok(view)
    }

    /// Drop the selection and its route.
    pub fn clear_selection(&mut self) {
        if self.selected.take().is_some() {
            debug!("[MapSession] Selection cleared");
        }
        self.route.clear();
    }

    /// Centre the camera on an entity without touching its animation.
    pub fn focus_entity(&mut self, id: &str) -> Result<()> {
        let position = self
            .rendered_position(id)
            .or_else(|| self.store.get(id).and_then(|e| e.position));
        if !self.store.contains(id) {
            return Err(TrackerError::UnknownEntity {
                entity_id: id.to_string(),
            });
        }
        let position = position.ok_or_missing_position(id)?;
        self.events.push(SessionEvent::Viewport {
            command: ViewportCommand::CenterOn {
                position,
                entity_id: Some(id.to_string()),
            },
        });
        Ok(())
    }

    /// Recompute the geofence now (user action), bypassing the debounce.
    pub fn recompute_geofence(&mut self) -> Option<Geofence> {
        if !self.group_active {
            return None;
        }
        let group = self.store.group_positions();
        let member_ids = self.store.member_ids();
        let fence = self.geofence.recompute_now(&group, &member_ids);
        if let Some(fence) = fence {
            self.events.push(SessionEvent::GeofenceChanged {
                geofence: Some(fence),
            });
            self.evaluate_breaches();
        }
        fence
    }

    /// Designate (or clear) the member that is always treated as outside.
    pub fn set_forced_outside(&mut self, member_id: Option<String>) -> Result<()> {
        if let Some(id) = &member_id {
            let entity = self.store.get(id).ok_or_unknown_entity(id)?;
            if entity.is_self {
                return Err(TrackerError::Internal {
                    message: "self cannot be forced outside".to_string(),
                });
            }
        }
        self.geofence.designate_forced_outside(member_id);
        Ok(())
    }

    /// Tear everything down: subscriptions, requests, animations, markers.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        info!("[MapSession] Shutting down");
        self.subscription = None;
        self.dispatcher.shutdown();
        self.motion.clear();
        self.snap.clear();
        self.geofence.clear();
        self.breaches.clear();
        self.route.reset();
        self.render.clear();
        self.feed.reset();
        self.highlight = None;
        self.selected = None;
        self.group_active = false;
        self.shut_down = true;
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Advance the whole engine to `now_ms`.
    pub fn tick(&mut self, now_ms: u64) {
        if self.shut_down {
            return;
        }
        self.apply_completions(now_ms);
        self.apply_location(now_ms);
        if self.group_active {
            self.poll_feed(now_ms);
            self.update_geofence(now_ms);
        }
        self.update_route(now_ms);
        self.check_hints(now_ms);
        if self.highlight.map_or(false, |h| now_ms >= h.until_ms) {
            self.highlight = None;
        }
        self.render_frame(now_ms);
    }

    fn apply_completions(&mut self, now_ms: u64) {
        for completion in self.dispatcher.drain() {
            match completion {
                Completion::Snap { request, result } => {
                    let id = request.entity_id.clone();
                    if !self.snap.complete(&request, result) {
                        continue;
                    }
                    // Re-path onto the road if the member is still heading there
                    let (Some(from), Some(to)) =
                        (self.motion.rendered(&id), self.store.get(&id).and_then(|e| e.position))
                    else {
                        continue;
                    };
                    let path = self.snap.preferred_path(&id, from, to);
                    if path.len() > 2 {
                        self.motion.set_path(&id, &path, now_ms);
                    }
                }
                Completion::Route { request, result } => {
                    if let Some(view) = self.route.complete(&request, result) {
                        self.events.push(SessionEvent::RouteChanged { route: view });
                    }
                }
            }
        }
    }

    fn apply_location(&mut self, now_ms: u64) {
        while let Ok(event) = self.location_rx.try_recv() {
            match event {
                LocationEvent::Fix(fix) => {
                    if !fix.position.is_valid() {
                        warn!("[MapSession] Dropping invalid fix {:?}", fix.position);
                        continue;
                    }
                    if !self.fix_throttle.allow(fix.timestamp_ms) {
                        continue;
                    }
                    self.location_error_streak = false;
                    let id = self.config.session.self_id.clone();
                    let name = self.config.session.self_name.clone();
                    let created = self.store.self_id().is_none();
                    if self
                        .store
                        .update_self(&id, &name, fix.position, fix.heading, fix.timestamp_ms)
                        .is_some()
                    {
                        let heading = self.store.self_entity().and_then(|e| e.heading);
                        self.self_motion.update_target(fix.position, heading, now_ms);
                        if created {
                            self.geofence.invalidate();
                        }
                    }
                }
                LocationEvent::Error(error) => {
                    if !self.location_error_streak {
                        self.location_error_streak = true;
                        warn!("[MapSession] Location degraded: {}", error);
                        self.events.push(SessionEvent::LocationWarning {
                            message: TrackerError::from(error).to_string(),
                        });
                    }
                }
            }
        }
    }

    fn poll_feed(&mut self, now_ms: u64) {
        let anchor = self.anchor();
        if let Some(snapshot) = self.feed.poll(now_ms, anchor) {
            self.apply_snapshot(snapshot, now_ms);
        }
    }

    fn apply_snapshot(&mut self, snapshot: FeedSnapshot, now_ms: u64) {
        let keep: Vec<String> = snapshot.members.iter().map(|m| m.id.clone()).collect();
        let left = self.store.retain_members(&keep);
        for id in &left {
            self.purge_member(id);
        }

        let mut joined = Vec::new();
        for fix in snapshot.members {
            if !fix.position.is_valid() {
                warn!("[MapSession] Member '{}' sent an invalid position", fix.id);
                self.store.insert_placeholder(&fix.id, &fix.name);
                continue;
            }
            let Some(change) = self.store.upsert_member(
                &fix.id,
                &fix.name,
                fix.position,
                fix.heading,
                snapshot.timestamp_ms,
            ) else {
                continue;
            };

            if change.created || self.motion.rendered(&fix.id).is_none() {
                self.motion.set_path(&fix.id, &[fix.position], now_ms);
                if change.created {
                    joined.push(fix.id.clone());
                }
                continue;
            }

            let from = self
                .motion
                .rendered(&fix.id)
                .or(change.previous)
                .unwrap_or(fix.position);
            if let Some(previous) = change.previous {
                if let Some(request) = self.snap.request(&fix.id, previous, fix.position, now_ms) {
                    self.dispatcher.dispatch_snap(request);
                }
            }
            let path = self.snap.preferred_path(&fix.id, from, fix.position);
            self.motion.set_path(&fix.id, &path, now_ms);
        }

        if !joined.is_empty() || !left.is_empty() {
            self.geofence.invalidate();
            self.events.push(SessionEvent::MembersChanged { joined, left });
        }
    }

    fn update_geofence(&mut self, now_ms: u64) {
        let group = self.store.group_positions();
        let member_ids = self.store.member_ids();
        self.geofence.submit(&group, &member_ids, now_ms);
        if let Some(fence) = self.geofence.poll(now_ms) {
            self.events.push(SessionEvent::GeofenceChanged {
                geofence: Some(fence),
            });
        }
        self.evaluate_breaches();
    }

    fn evaluate_breaches(&mut self) {
        let Some(fence) = self.geofence.active() else {
            return;
        };
        let candidates: Vec<BreachCandidate<'_>> = self
            .store
            .members()
            .filter_map(|e| {
                e.position.map(|position| BreachCandidate {
                    id: &e.id,
                    name: &e.name,
                    position,
                })
            })
            .collect();
        let alerts = self
            .breaches
            .evaluate(&candidates, &fence, self.geofence.forced_outside());
        self.events
            .extend(alerts.into_iter().map(|alert| SessionEvent::Breach { alert }));
    }

    fn update_route(&mut self, now_ms: u64) {
        let Some(target) = self.selected.clone() else {
            return;
        };
        let Some(destination) = self.store.get(&target).and_then(|e| e.position) else {
            debug!("[MapSession] Route target '{}' gone", target);
            self.clear_selection();
            return;
        };
        let origin = self.anchor();
        self.route.update_endpoints(origin, destination, now_ms);
        if let Some(selection) = self.route.poll(now_ms) {
            self.apply_selection(selection);
        }
    }

    fn apply_selection(&mut self, selection: RouteSelection) {
        if let Some(bounds) = selection.auto_fit {
            self.events.push(SessionEvent::Viewport {
                command: ViewportCommand::FitBounds { bounds },
            });
        }
        self.events.push(SessionEvent::RouteChanged {
            route: selection.view,
        });
        self.dispatcher.dispatch_route(selection.request);
    }

    fn check_hints(&mut self, now_ms: u64) {
        let Some(store) = self.hints.clone() else {
            return;
        };
        let revision = match store.revision() {
            Ok(r) => r,
            Err(e) => {
                debug!("[MapSession] Hint store unavailable: {}", e);
                return;
            }
        };
        if self.hint_revision == Some(revision) {
            return;
        }
        self.hint_revision = Some(revision);

        let hint = match store.take() {
            Ok(Some(hint)) => hint,
            Ok(None) => return,
            Err(e) => {
                debug!("[MapSession] Could not take hint: {}", e);
                return;
            }
        };
        if !hint.is_fresh(now_ms, self.config.session.hint_max_age_ms) || !hint.position().is_valid() {
            debug!("[MapSession] Discarding stale hint from '{}'", hint.source);
            return;
        }

        info!("[MapSession] Centring on hint from '{}'", hint.source);
        let position = hint.position();
        self.highlight = Some(Highlight {
            position,
            until_ms: now_ms + self.config.session.highlight_ms,
        });
        self.events.push(SessionEvent::Viewport {
            command: ViewportCommand::CenterOn {
                position,
                entity_id: None,
            },
        });
    }

    fn render_frame(&mut self, now_ms: u64) {
        let mut frames: Vec<FrameUpdate> = self.motion.tick(now_ms);
        if let Some(self_id) = self.store.self_id() {
            if let Some(frame) = self.self_motion.tick(self_id, now_ms) {
                frames.push(frame);
            }
        }

        let views = self.entity_views();
        let report = self.render.sync(&views);
        for id in &report.removed {
            self.motion.remove(id);
            self.snap.purge(id);
        }
        self.render.apply_frames(&frames);
    }

    fn entity_views(&self) -> Vec<EntityView> {
        let mut views: Vec<EntityView> = self
            .store
            .entities()
            .map(|e| {
                let bucket = if e.is_self {
                    ColorBucket::SelfUser
                } else if self.breaches.is_outside(&e.id) {
                    ColorBucket::Outside
                } else {
                    ColorBucket::Member
                };
                EntityView {
                    id: e.id.clone(),
                    name: e.name.clone(),
                    position: self.rendered_position(&e.id).or(e.position),
                    heading: self.rendered_heading(&e.id).or(e.heading),
                    bucket,
                    highlighted: self.selected.as_deref() == Some(e.id.as_str()),
                }
            })
            .collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    fn purge_member(&mut self, id: &str) {
        self.motion.remove(id);
        self.snap.purge(id);
        self.breaches.purge(id);
        self.render.remove(id);
        if self.selected.as_deref() == Some(id) {
            self.clear_selection();
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// The user's position, or the configured default while there is none.
    pub fn anchor(&self) -> Position {
        self.store
            .self_position()
            .unwrap_or(self.config.session.default_anchor)
    }

    fn rendered_position(&self, id: &str) -> Option<Position> {
        if self.store.self_id() == Some(id) {
            self.self_motion.rendered()
        } else {
            self.motion.rendered(id)
        }
    }

    fn rendered_heading(&self, id: &str) -> Option<f64> {
        if self.store.self_id() == Some(id) {
            self.self_motion.heading()
        } else {
            self.motion.rendered_heading(id)
        }
    }

    /// Everything the UI needs to draw the current frame.
    pub fn snapshot(&self) -> MapSnapshot {
        let forced = self.geofence.forced_outside();
        let mut entities: Vec<EntitySnapshot> = self
            .store
            .entities()
            .map(|e| EntitySnapshot {
                id: e.id.clone(),
                name: e.name.clone(),
                position: self.rendered_position(&e.id).or(e.position),
                reported: e.position,
                heading: self.rendered_heading(&e.id).or(e.heading),
                is_self: e.is_self,
                outside: self.breaches.is_outside(&e.id) || forced == Some(e.id.as_str()),
                selected: self.selected.as_deref() == Some(e.id.as_str()),
                path_len: e.path.len(),
            })
            .collect();
        entities.sort_by(|a, b| b.is_self.cmp(&a.is_self).then_with(|| a.id.cmp(&b.id)));

        MapSnapshot {
            entities,
            geofence: self.geofence.active(),
            forced_outside: forced.map(str::to_string),
            route: self.route.view().cloned(),
            selected: self.selected.clone(),
            highlight: self.highlight,
            group_active: self.group_active,
            location_degraded: self.location_error_streak || self.store.self_position().is_none(),
        }
    }

    /// Take the events accumulated since the last call.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn store(&self) -> &PositionStore {
        &self.store
    }

    pub fn render(&self) -> &RenderSynchronizer<M> {
        &self.render
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn is_group_active(&self) -> bool {
        self.group_active
    }

    pub fn is_animating(&self, id: &str) -> bool {
        if self.store.self_id() == Some(id) {
            self.self_motion.is_animating()
        } else {
            self.motion.is_animating(id)
        }
    }

    pub fn requests_in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }
}

impl<S: RoutingService, F: PositionFeed, M: MarkerFactory> Drop for MapSession<S, F, M> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
