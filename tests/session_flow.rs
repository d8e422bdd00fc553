//! Map session integration tests.
//!
//! Drives a full [`MapSession`] with in-process feeds, a scripted routing
//! service and the snapshot marker surface. Logical time is passed to
//! `tick` explicitly; tokio is only used to run routing requests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use group_tracker::geo_utils::{destination, haversine_distance};
use group_tracker::{
    CenterHint, ChannelFeed, ChannelGeolocation, FeedSender, FeedSnapshot, HintStore, LocationError,
    LocationEvent, LocationFix, MapSession, MemberFix, MemoryHintStore, Position, Result,
    RouteSource, RoutedPath, RoutingService, SessionEvent, SnapshotSurface, TrackerConfig, TrackerError,
    ViewportCommand,
};
use tokio::runtime::Handle;

// ============================================================================
// Helpers
// ============================================================================

/// Routes via a midpoint, 30% longer than the straight line.
#[derive(Default)]
struct DetourService {
    calls: AtomicUsize,
}

impl RoutingService for DetourService {
    async fn route(&self, origin: Position, destination: Position) -> Result<RoutedPath> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mid = Position::new(
            (origin.lat + destination.lat) / 2.0 + 0.0002,
            (origin.lng + destination.lng) / 2.0,
        );
        let distance = haversine_distance(&origin, &destination) * 1.3;
        Ok(RoutedPath {
            geometry: vec![origin, mid, destination],
            distance_m: distance,
            eta_s: distance / 1.4,
        })
    }
}

struct FailingService;

impl RoutingService for FailingService {
    async fn route(&self, _origin: Position, _destination: Position) -> Result<RoutedPath> {
        Err(TrackerError::Routing {
            message: "service unavailable".to_string(),
            status_code: Some(503),
        })
    }
}

struct NeverService;

impl RoutingService for NeverService {
    async fn route(&self, _origin: Position, _destination: Position) -> Result<RoutedPath> {
        std::future::pending().await
    }
}

type Session<S> = MapSession<S, ChannelFeed, SnapshotSurface>;

fn center() -> Position {
    Position::new(21.4225, 39.8262)
}

fn member(id: &str, bearing: f64, distance_m: f64) -> MemberFix {
    MemberFix {
        id: id.to_string(),
        name: id.to_uppercase(),
        position: destination(&center(), bearing, distance_m),
        heading: None,
    }
}

fn square_group() -> Vec<MemberFix> {
    vec![
        member("member-n", 0.0, 50.0),
        member("member-e", 90.0, 50.0),
        member("member-s", 180.0, 50.0),
        member("member-w", 270.0, 50.0),
    ]
}

fn self_fix(position: Position, timestamp_ms: u64) -> LocationEvent {
    LocationEvent::Fix(LocationFix {
        position,
        heading: None,
        timestamp_ms,
        accuracy_m: Some(5.0),
    })
}

fn new_session<S: RoutingService>(service: S) -> (Session<S>, FeedSender, SnapshotSurface) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (feed, sender) = ChannelFeed::new();
    let surface = SnapshotSurface::new();
    let session = MapSession::new(
        TrackerConfig::default(),
        Arc::new(service),
        feed,
        surface.clone(),
        Handle::current(),
    )
    .expect("default config is valid");
    (session, sender, surface)
}

/// Self at the centre, the square group joined and the first geofence in force.
fn joined_session<S: RoutingService>(service: S) -> (Session<S>, FeedSender, SnapshotSurface) {
    let (mut session, sender, surface) = new_session(service);
    session.push_location(self_fix(center(), 0));
    session.tick(0);

    sender.push(FeedSnapshot {
        timestamp_ms: 0,
        members: square_group(),
    });
    session.join_group(0);
    session.tick(0);
    session.tick(150);
    (session, sender, surface)
}

/// Let spawned requests finish, then apply their completions.
async fn settle<S: RoutingService>(session: &mut Session<S>, now_ms: u64) {
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if session.requests_in_flight() == 0 {
            break;
        }
    }
    session.tick(now_ms);
}

fn breaches(events: &[SessionEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Breach { alert } => Some(alert.entity_id.clone()),
            _ => None,
        })
        .collect()
}

fn fit_count(events: &[SessionEvent]) -> usize {
    events
        .iter()
        .filter(|e| {
            matches!(
                e,
                SessionEvent::Viewport {
                    command: ViewportCommand::FitBounds { .. }
                }
            )
        })
        .count()
}

// ============================================================================
// Group and Geofence
// ============================================================================

#[tokio::test]
async fn test_join_creates_members_and_geofence() {
    let (mut session, _sender, surface) = joined_session(DetourService::default());
    let events = session.drain_events();

    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::MembersChanged { joined, left } if joined.len() == 4 && left.is_empty()
    )));

    let snapshot = session.snapshot();
    assert!(snapshot.group_active);
    assert!(!snapshot.location_degraded);
    assert_eq!(snapshot.entities.len(), 5);
    assert!(snapshot.entities[0].is_self);

    let fence = snapshot.geofence.expect("geofence after debounce");
    assert!((fence.radius_m - 57.5).abs() < 0.5);
    assert!(breaches(&events).is_empty());

    // One marker per entity
    assert_eq!(surface.markers().len(), 5);
}

#[tokio::test]
async fn test_member_walking_off_alerts_once() {
    let (mut session, sender, _surface) = joined_session(DetourService::default());
    session.drain_events();

    let mut members = square_group();
    members[0] = member("member-n", 0.0, 237.5);
    sender.push(FeedSnapshot {
        timestamp_ms: 1_000,
        members,
    });

    // Breach is detected against the fence still in force
    session.tick(1_000);
    let events = session.drain_events();
    assert_eq!(breaches(&events), vec!["member-n".to_string()]);
    assert!(session.snapshot().entities.iter().any(|e| e.id == "member-n" && e.outside));

    // Recomputed fence now contains the member again; no second alert
    session.tick(1_150);
    let events = session.drain_events();
    assert!(breaches(&events).is_empty());
    let fence = session.snapshot().geofence.unwrap();
    assert!((fence.radius_m - 230.0).abs() < 1.5, "radius {}", fence.radius_m);
    assert!(session.snapshot().entities.iter().all(|e| !e.outside));

    settle(&mut session, 1_200).await;
    assert!(breaches(&session.drain_events()).is_empty());
}

#[tokio::test]
async fn test_member_leaving_feed_is_removed() {
    let (mut session, sender, surface) = joined_session(DetourService::default());
    session.drain_events();

    let mut members = square_group();
    members.retain(|m| m.id != "member-w");
    sender.push(FeedSnapshot {
        timestamp_ms: 1_000,
        members,
    });
    session.tick(1_000);

    let events = session.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::MembersChanged { left, .. } if left == &vec!["member-w".to_string()]
    )));
    assert!(!session.store().contains("member-w"));
    assert!(surface.marker("member-w").is_none());
    assert_eq!(surface.markers().len(), 4);
}

#[tokio::test]
async fn test_leave_group_clears_members_and_geofence() {
    let (mut session, _sender, surface) = joined_session(DetourService::default());
    session.select_member("member-e").unwrap();
    session.drain_events();

    session.leave_group();
    session.tick(200);

    let events = session.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::GeofenceChanged { geofence: None })));

    let snapshot = session.snapshot();
    assert!(!snapshot.group_active);
    assert!(snapshot.geofence.is_none());
    assert!(snapshot.selected.is_none());
    assert!(snapshot.route.is_none());
    assert_eq!(snapshot.entities.len(), 1);

    // Only the self marker is left
    let markers = surface.markers();
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].id, "self");
}

#[tokio::test]
async fn test_forced_outside_member() {
    let (mut session, _sender, _surface) = joined_session(DetourService::default());
    session.drain_events();

    assert!(session.set_forced_outside(Some("self".to_string())).is_err());
    assert!(session.set_forced_outside(Some("nobody".to_string())).is_err());

    session.set_forced_outside(Some("member-s".to_string())).unwrap();
    let fence = session.recompute_geofence().expect("geofence");
    let events = session.drain_events();
    assert_eq!(breaches(&events), vec!["member-s".to_string()]);

    let snapshot = session.snapshot();
    assert_eq!(snapshot.forced_outside.as_deref(), Some("member-s"));
    assert_eq!(snapshot.geofence, Some(fence));

    // Designation is stable across ticks; no repeat alert
    session.tick(1_000);
    session.tick(1_200);
    assert!(breaches(&session.drain_events()).is_empty());
}

// ============================================================================
// Road Snapping
// ============================================================================

#[tokio::test]
async fn test_member_follows_snapped_road() {
    let (mut session, sender, surface) = joined_session(DetourService::default());
    session.drain_events();

    let start = destination(&center(), 90.0, 50.0);
    let target = destination(&center(), 90.0, 150.0);
    let mid = Position::new(
        (start.lat + target.lat) / 2.0 + 0.0002,
        (start.lng + target.lng) / 2.0,
    );

    let mut members = square_group();
    members[1] = member("member-e", 90.0, 150.0);
    sender.push(FeedSnapshot {
        timestamp_ms: 1_000,
        members,
    });
    session.tick(1_000);
    settle(&mut session, 1_100).await;

    // The road detour replaces the straight segment
    let mut closest_to_mid = f64::MAX;
    let mut now = 1_100;
    while now <= 120_000 {
        session.tick(now);
        let position = surface.marker("member-e").expect("marker").position;
        closest_to_mid = closest_to_mid.min(haversine_distance(&position, &mid));
        now += 250;
    }
    assert!(closest_to_mid < 5.0, "closest approach to detour {closest_to_mid}");
    assert!(haversine_distance(&surface.marker("member-e").unwrap().position, &target) < 0.5);
}

// ============================================================================
// Routes
// ============================================================================

#[tokio::test]
async fn test_route_falls_back_then_upgrades() {
    let (mut session, _sender, _surface) = joined_session(DetourService::default());
    session.drain_events();

    let view = session.select_member("member-n").unwrap();
    assert!(view.is_fallback());
    assert_eq!(view.polyline.len(), 2);
    assert!(view.label.ends_with("(straight line)"));
    assert!((view.result.distance_m - 50.0).abs() < 0.5);

    let events = session.drain_events();
    assert_eq!(fit_count(&events), 1);

    settle(&mut session, 200).await;
    let events = session.drain_events();
    let routed = events.iter().find_map(|e| match e {
        SessionEvent::RouteChanged { route } if !route.is_fallback() => Some(route.clone()),
        _ => None,
    });
    let routed = routed.expect("routed replacement");
    assert_eq!(routed.result.source, RouteSource::Routed);
    assert_eq!(routed.polyline.len(), 3);
    assert!(!routed.label.contains("straight line"));
    assert_eq!(session.snapshot().route, Some(routed));
}

#[tokio::test]
async fn test_route_auto_fit_once_per_target() {
    let (mut session, _sender, _surface) = joined_session(DetourService::default());
    session.drain_events();

    session.select_member("member-n").unwrap();
    session.clear_selection();
    session.select_member("member-n").unwrap();
    assert_eq!(fit_count(&session.drain_events()), 1);

    session.select_member("member-e").unwrap();
    assert_eq!(fit_count(&session.drain_events()), 1);

    assert!(session.select_member("self").is_err());
    assert!(session.select_member("nobody").is_err());
}

#[tokio::test]
async fn test_route_failure_keeps_straight_line() {
    let (mut session, _sender, _surface) = joined_session(FailingService);
    session.drain_events();

    session.select_member("member-s").unwrap();
    settle(&mut session, 200).await;

    let route = session.snapshot().route.expect("fallback stays visible");
    assert!(route.is_fallback());
    assert_eq!(route.result.source, RouteSource::StraightLine);
}

#[tokio::test]
async fn test_route_follows_moving_target() {
    let service = Arc::new(DetourService::default());
    let (feed, sender) = ChannelFeed::new();
    let surface = SnapshotSurface::new();
    let mut session = MapSession::new(
        TrackerConfig::default(),
        Arc::clone(&service),
        feed,
        surface,
        Handle::current(),
    )
    .unwrap();
    session.push_location(self_fix(center(), 0));
    session.tick(0);
    sender.push(FeedSnapshot {
        timestamp_ms: 0,
        members: square_group(),
    });
    session.join_group(0);
    session.select_member("member-e").unwrap();
    settle(&mut session, 100).await;
    let calls_after_select = service.calls.load(Ordering::SeqCst);

    let mut members = square_group();
    members[1] = member("member-e", 90.0, 120.0);
    sender.push(FeedSnapshot {
        timestamp_ms: 1_000,
        members,
    });
    session.tick(1_000);
    session.drain_events();

    // Debounced: nothing re-resolved until the window elapses
    session.tick(1_100);
    assert!(session
        .drain_events()
        .iter()
        .all(|e| !matches!(e, SessionEvent::RouteChanged { .. })));

    session.tick(1_250);
    let events = session.drain_events();
    let fallback = events.iter().find_map(|e| match e {
        SessionEvent::RouteChanged { route } => Some(route.clone()),
        _ => None,
    });
    let fallback = fallback.expect("re-resolved route");
    assert!((fallback.result.distance_m - 120.0).abs() < 0.5);
    assert_eq!(fit_count(&events), 0);

    settle(&mut session, 1_300).await;
    assert!(service.calls.load(Ordering::SeqCst) > calls_after_select);
    assert!(!session.snapshot().route.unwrap().is_fallback());
}

// ============================================================================
// Location, Hints and Focus
// ============================================================================

#[tokio::test]
async fn test_location_errors_warn_once_per_streak() {
    let (mut session, _sender, _surface) = new_session(DetourService::default());
    let (source, handle) = ChannelGeolocation::new();
    session.attach_geolocation(&source);

    assert_eq!(session.anchor(), center());
    assert!(session.snapshot().location_degraded);

    handle.push_error(LocationError::PermissionDenied);
    handle.push_error(LocationError::Timeout);
    session.tick(0);
    handle.push_error(LocationError::Timeout);
    session.tick(100);

    let warnings = |events: &[SessionEvent]| {
        events
            .iter()
            .filter(|e| matches!(e, SessionEvent::LocationWarning { .. }))
            .count()
    };
    assert_eq!(warnings(&session.drain_events()), 1);

    let here = destination(&center(), 45.0, 300.0);
    handle.push_fix(LocationFix {
        position: here,
        heading: Some(45.0),
        timestamp_ms: 200,
        accuracy_m: None,
    });
    session.tick(200);
    assert_eq!(session.anchor(), here);
    assert!(!session.snapshot().location_degraded);

    handle.push_error(LocationError::Unavailable {
        message: "no satellites".to_string(),
    });
    session.tick(300);
    assert_eq!(warnings(&session.drain_events()), 1);
}

#[tokio::test]
async fn test_fixes_are_throttled() {
    let (mut session, _sender, _surface) = new_session(DetourService::default());
    let first = center();
    let second = destination(&center(), 0.0, 10.0);
    let third = destination(&center(), 0.0, 20.0);

    session.push_location(self_fix(first, 0));
    session.push_location(self_fix(second, 400));
    session.tick(400);
    assert_eq!(session.anchor(), first);

    session.push_location(self_fix(third, 1_000));
    session.tick(1_000);
    assert_eq!(session.anchor(), third);
}

#[tokio::test]
async fn test_skewed_fix_does_not_freeze_self() {
    let (mut session, _sender, _surface) = new_session(DetourService::default());
    let far = destination(&center(), 0.0, 500.0);
    session.push_location(self_fix(far, 10_000_000_000_000));
    session.tick(0);
    assert_eq!(session.anchor(), far);

    let mut last = center();
    for i in 1..=5u64 {
        last = destination(&center(), 90.0, i as f64 * 10.0);
        session.push_location(self_fix(last, i * 2_000));
        session.tick(i * 2_000);
    }
    assert_eq!(session.anchor(), last);
}

#[tokio::test]
async fn test_fresh_hint_centres_and_highlights() {
    let (mut session, _sender, _surface) = new_session(DetourService::default());
    let hints = MemoryHintStore::new();
    session.attach_hints(Arc::new(hints.clone()));
    session.tick(1_000_000);
    session.drain_events();

    let spot = destination(&center(), 120.0, 80.0);
    hints
        .save(CenterHint {
            lat: spot.lat,
            lng: spot.lng,
            timestamp_ms: 995_000,
            source: "lost_found".to_string(),
        })
        .unwrap();
    session.tick(1_000_100);

    let events = session.drain_events();
    assert!(events.contains(&SessionEvent::Viewport {
        command: ViewportCommand::CenterOn {
            position: spot,
            entity_id: None,
        }
    }));
    let highlight = session.snapshot().highlight.expect("highlight");
    assert_eq!(highlight.position, spot);

    // Consumed: the next tick does not re-centre
    session.tick(1_000_200);
    assert!(session.drain_events().is_empty());
    assert!(hints.take().unwrap().is_none());

    session.tick(highlight.until_ms);
    assert!(session.snapshot().highlight.is_none());
}

#[tokio::test]
async fn test_stale_hint_is_discarded() {
    let (mut session, _sender, _surface) = new_session(DetourService::default());
    let hints = MemoryHintStore::new();
    hints
        .save(CenterHint {
            lat: 21.43,
            lng: 39.83,
            timestamp_ms: 100_000,
            source: "notification".to_string(),
        })
        .unwrap();
    session.attach_hints(Arc::new(hints.clone()));

    session.tick(1_000_000);
    assert!(session.drain_events().is_empty());
    assert!(session.snapshot().highlight.is_none());
    // Still consumed
    assert!(hints.take().unwrap().is_none());
}

#[tokio::test]
async fn test_focus_entity_centres_on_it() {
    let (mut session, _sender, _surface) = joined_session(DetourService::default());
    session.drain_events();

    session.focus_entity("member-w").unwrap();
    let events = session.drain_events();
    match &events[..] {
        [SessionEvent::Viewport {
            command: ViewportCommand::CenterOn { position, entity_id },
        }] => {
            assert_eq!(entity_id.as_deref(), Some("member-w"));
            let expected = destination(&center(), 270.0, 50.0);
            assert!(haversine_distance(position, &expected) < 1.0);
        }
        other => panic!("unexpected events: {:?}", other),
    }

    let err = session.focus_entity("ghost").unwrap_err();
    assert!(matches!(err, TrackerError::UnknownEntity { .. }));
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_shutdown_aborts_requests_and_freezes() {
    let (mut session, sender, surface) = joined_session(NeverService);
    session.select_member("member-n").unwrap();
    assert!(session.requests_in_flight() > 0);

    session.shutdown();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(session.requests_in_flight(), 0);
    assert!(surface.markers().is_empty());

    sender.push(FeedSnapshot {
        timestamp_ms: 2_000,
        members: square_group(),
    });
    session.drain_events();
    session.tick(2_000);
    assert!(session.drain_events().is_empty());
    assert!(!session.is_group_active());

    // Idempotent
    session.shutdown();
}
