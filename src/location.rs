//! Device geolocation as an explicit subscription.
//!
//! A [`GeolocationSource`] delivers [`LocationEvent`]s to a sink until the
//! returned [`Subscription`] is unsubscribed or dropped. Platform bridges
//! feed [`ChannelGeolocation`] through a [`GeolocationHandle`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Position;

/// One position fix from the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub position: Position,
    #[serde(default)]
    pub heading: Option<f64>,
    pub timestamp_ms: u64,
    #[serde(default)]
    pub accuracy_m: Option<f64>,
}

/// Non-fatal geolocation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Location unavailable: {message}")]
    Unavailable { message: String },

    #[error("Location request timed out")]
    Timeout,
}

/// What a subscription delivers.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationEvent {
    Fix(LocationFix),
    Error(LocationError),
}

/// Receives location events.
pub type LocationSink = Arc<dyn Fn(LocationEvent) + Send + Sync>;

/// Live subscription; dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub fn new(active: Arc<AtomicBool>) -> Self {
        Self { active }
    }

    pub fn unsubscribe(&mut self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// A source of device location events.
pub trait GeolocationSource {
    fn subscribe(&self, sink: LocationSink) -> Subscription;
}

struct Subscriber {
    active: Arc<AtomicBool>,
    sink: LocationSink,
}

type Subscribers = Arc<Mutex<Vec<Subscriber>>>;

/// Geolocation source fed through a [`GeolocationHandle`].
#[derive(Clone)]
pub struct ChannelGeolocation {
    subscribers: Subscribers,
}

/// Pushes events into a [`ChannelGeolocation`].
#[derive(Clone)]
pub struct GeolocationHandle {
    subscribers: Subscribers,
}

impl ChannelGeolocation {
    pub fn new() -> (Self, GeolocationHandle) {
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                subscribers: Arc::clone(&subscribers),
            },
            GeolocationHandle { subscribers },
        )
    }
}

impl GeolocationSource for ChannelGeolocation {
    fn subscribe(&self, sink: LocationSink) -> Subscription {
        let active = Arc::new(AtomicBool::new(true));
        match self.subscribers.lock() {
            Ok(mut subs) => subs.push(Subscriber {
                active: Arc::clone(&active),
                sink,
            }),
            Err(_) => warn!("[Geolocation] Subscriber list poisoned; subscription is inert"),
        }
        Subscription::new(active)
    }
}

impl GeolocationHandle {
    /// Deliver a fix. Returns the number of live subscribers reached.
    pub fn push_fix(&self, fix: LocationFix) -> usize {
        self.deliver(LocationEvent::Fix(fix))
    }

    /// Deliver an error. Returns the number of live subscribers reached.
    pub fn push_error(&self, error: LocationError) -> usize {
        debug!("[Geolocation] {}", error);
        self.deliver(LocationEvent::Error(error))
    }

    pub fn subscriber_count(&self) -> usize {
        match self.subscribers.lock() {
            Ok(subs) => subs
                .iter()
                .filter(|s| s.active.load(Ordering::Acquire))
                .count(),
            Err(_) => 0,
        }
    }

    fn deliver(&self, event: LocationEvent) -> usize {
        // Sinks run outside the lock so they may subscribe or push themselves
        let sinks: Vec<LocationSink> = match self.subscribers.lock() {
            Ok(mut subs) => {
                subs.retain(|s| s.active.load(Ordering::Acquire));
                subs.iter().map(|s| Arc::clone(&s.sink)).collect()
            }
            Err(_) => return 0,
        };
        for sink in &sinks {
            sink(event.clone());
        }
        sinks.len()
    }
}
