//! Fire-and-forget request dispatch.
//!
//! Requests are spawned onto a tokio runtime; each completion is sent back
//! over an unbounded channel and picked up by [`RequestDispatcher::drain`] on
//! the owner's next tick. Nothing here mutates engine state, so the owner
//! still applies every result from its own execution context.

use std::sync::Arc;

use log::debug;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::route::RouteRequest;
use crate::routing::{RoutedPath, RoutingService};
use crate::snap::SnapRequest;
use crate::{Position, Result};

/// A finished request, waiting to be applied.
#[derive(Debug)]
pub enum Completion {
    Snap {
        request: SnapRequest,
        result: Result<Vec<Position>>,
    },
    Route {
        request: RouteRequest,
        result: Result<RoutedPath>,
    },
}

/// Spawns routing requests and collects their results.
pub struct RequestDispatcher<S: RoutingService> {
    service: Arc<S>,
    handle: Handle,
    tx: UnboundedSender<Completion>,
    rx: UnboundedReceiver<Completion>,
    tasks: Vec<JoinHandle<()>>,
}

impl<S: RoutingService> RequestDispatcher<S> {
    /// Dispatcher that spawns onto `handle`.
    pub fn new(service: Arc<S>, handle: Handle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            service,
            handle,
            tx,
            rx,
            tasks: Vec::new(),
        }
    }

    /// Dispatcher on the runtime the caller is running in.
    ///
    /// Must be called from within a tokio runtime.
    pub fn current(service: Arc<S>) -> Self {
        Self::new(service, Handle::current())
    }

    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    pub fn dispatch_snap(&mut self, request: SnapRequest) {
        let service = Arc::clone(&self.service);
        let tx = self.tx.clone();
        debug!("[Dispatch] Snap request for '{}'", request.entity_id);
        let task = self.handle.spawn(async move {
            let result = service
                .route(request.from, request.to)
                .await
                .map(|path| path.geometry);
            // Receiver gone means the session was torn down
            let _ = tx.send(Completion::Snap { request, result });
        });
        self.tasks.push(task);
    }

    pub fn dispatch_route(&mut self, request: RouteRequest) {
        let service = Arc::clone(&self.service);
        let tx = self.tx.clone();
        debug!(
            "[Dispatch] Route request #{} for '{}'",
            request.request_id, request.target_id
        );
        let task = self.handle.spawn(async move {
            let result = service.route(request.origin, request.destination).await;
            let _ = tx.send(Completion::Route { request, result });
        });
        self.tasks.push(task);
    }

    /// Take every completion that has arrived since the last drain.
    pub fn drain(&mut self) -> Vec<Completion> {
        self.tasks.retain(|task| !task.is_finished());
        let mut completions = Vec::new();
        while let Ok(completion) = self.rx.try_recv() {
            completions.push(completion);
        }
        completions
    }

    /// Requests spawned but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tasks.iter().filter(|task| !task.is_finished()).count()
    }

    /// Abort outstanding requests and discard undelivered completions.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        while self.rx.try_recv().is_ok() {}
    }
}

impl<S: RoutingService> Drop for RequestDispatcher<S> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TrackerError;
    use std::time::Duration;

    struct EchoService;

    impl RoutingService for EchoService {
        async fn route(&self, origin: Position, destination: Position) -> Result<RoutedPath> {
            if origin == destination {
                return Err(TrackerError::Routing {
                    message: "same point".into(),
                    status_code: Some(400),
                });
            }
            Ok(RoutedPath {
                geometry: vec![origin, destination],
                distance_m: 100.0,
                eta_s: 70.0,
            })
        }
    }

    struct NeverService;

    impl RoutingService for NeverService {
        async fn route(&self, _origin: Position, _destination: Position) -> Result<RoutedPath> {
            std::future::pending().await
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_completions_arrive_on_drain() {
        let mut dispatcher = RequestDispatcher::current(Arc::new(EchoService));
        let a = Position::new(21.4225, 39.8262);
        let b = Position::new(21.4235, 39.8262);

        dispatcher.dispatch_snap(SnapRequest {
            request_id: 1,
            entity_id: "m1".into(),
            from: a,
            to: b,
        });
        dispatcher.dispatch_route(RouteRequest {
            request_id: 1,
            target_id: "m2".into(),
            origin: a,
            destination: a,
        });
        settle().await;

        let completions = dispatcher.drain();
        assert_eq!(completions.len(), 2);
        for completion in completions {
            match completion {
                Completion::Snap { request, result } => {
                    assert_eq!(request.entity_id, "m1");
                    assert_eq!(result.unwrap(), vec![a, b]);
                }
                Completion::Route { result, .. } => assert!(result.is_err()),
            }
        }
        assert!(dispatcher.drain().is_empty());
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_hung_requests() {
        let mut dispatcher = RequestDispatcher::current(Arc::new(NeverService));
        let a = Position::new(21.4225, 39.8262);
        dispatcher.dispatch_route(RouteRequest {
            request_id: 1,
            target_id: "m1".into(),
            origin: a,
            destination: a,
        });
        settle().await;

        assert!(dispatcher.drain().is_empty());
        assert_eq!(dispatcher.in_flight(), 1);
        dispatcher.shutdown();
        assert_eq!(dispatcher.in_flight(), 0);
    }
}
