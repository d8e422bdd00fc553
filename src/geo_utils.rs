//! Geographic utilities: great-circle distance, bearing, heading arithmetic
//! and the easing curve used by marker animation.

use geo::{Bearing, Destination, Distance, Haversine, Point};

use crate::Position;

#[inline]
fn to_point(p: &Position) -> Point<f64> {
    Point::new(p.lng, p.lat)
}

/// Great-circle distance between two positions in meters.
///
/// # Example
/// ```
/// use group_tracker::Position;
/// use group_tracker::geo_utils::haversine_distance;
///
/// let mecca = Position::new(21.4225, 39.8262);
/// let medina = Position::new(24.4672, 39.6112);
/// let km = haversine_distance(&mecca, &medina) / 1000.0;
/// assert!(km > 330.0 && km < 345.0);
/// ```
pub fn haversine_distance(p1: &Position, p2: &Position) -> f64 {
    Haversine::distance(to_point(p1), to_point(p2))
}

/// Initial great-circle bearing from `from` to `to`, normalized to [0, 360).
pub fn bearing(from: &Position, to: &Position) -> f64 {
    normalize_heading(Haversine::bearing(to_point(from), to_point(to)))
}

/// Position reached by travelling `distance_m` from `origin` along `bearing_deg`.
pub fn destination(origin: &Position, bearing_deg: f64, distance_m: f64) -> Position {
    let p = Haversine::destination(to_point(origin), bearing_deg, distance_m);
    Position::new(p.y(), p.x())
}

/// Total length of a polyline in meters.
pub fn polyline_length(points: &[Position]) -> f64 {
    points
        .windows(2)
        .map(|pair| haversine_distance(&pair[0], &pair[1]))
        .sum()
}

/// Arithmetic mean of latitudes and longitudes.
///
/// Good enough for a group spread over a few kilometers; not meant for
/// point sets straddling the antimeridian.
pub fn centroid(points: &[Position]) -> Option<Position> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let lat = points.iter().map(|p| p.lat).sum::<f64>() / n;
    let lng = points.iter().map(|p| p.lng).sum::<f64>() / n;
    Some(Position::new(lat, lng))
}

/// Linear interpolation between two positions (t clamped to [0, 1]).
///
/// Segments animated here are tens of meters long, where the difference
/// from a great-circle interpolation is far below GPS accuracy.
pub fn interpolate(from: &Position, to: &Position, t: f64) -> Position {
    if t <= 0.0 {
        return *from;
    }
    if t >= 1.0 {
        return *to;
    }
    Position::new(
        from.lat + (to.lat - from.lat) * t,
        from.lng + (to.lng - from.lng) * t,
    )
}

/// Normalize any heading in degrees into [0, 360).
pub fn normalize_heading(degrees: f64) -> f64 {
    if !degrees.is_finite() {
        return 0.0;
    }
    let h = degrees.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if h >= 360.0 {
        0.0
    } else {
        h
    }
}

/// Signed rotation from `from` to `to` taking the short way round.
///
/// Result lies in (-180, 180], so a marker never spins more than half a turn.
pub fn shortest_rotation(from: f64, to: f64) -> f64 {
    let delta = normalize_heading(to) - normalize_heading(from);
    if delta > 180.0 {
        delta - 360.0
    } else if delta <= -180.0 {
        delta + 360.0
    } else {
        delta
    }
}

/// Cubic ease-in-out on t ∈ [0, 1].
pub fn ease_in_out(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    if t < 0.5 {
        4.0 * t * t * t
    } else {
        1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
    }
}
