//! Host lifecycle: health phase and the drain that precedes shutdown.
//!
//! Every frame the host serves holds an [`InFlightGuard`]. Draining refuses
//! new sessions, tells session loops to stop reading, and then waits for the
//! in-flight count to reach zero. The count lives in a `watch` channel so
//! the drain wakes on the last guard instead of polling.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Lifecycle phase reported by the health endpoints.
///
/// Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Ready,
    /// New sessions are refused; frames already being served finish.
    Draining,
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Starting => "starting",
            HealthState::Ready => "ready",
            HealthState::Draining => "draining",
            HealthState::Stopped => "stopped",
        }
    }

    #[must_use]
    pub fn accepts_sessions(self) -> bool {
        matches!(self, HealthState::Starting | HealthState::Ready)
    }
}

/// Health phase, drain signal and in-flight frame count for one host.
#[derive(Debug)]
pub struct ShutdownController {
    phase: ArcSwap<HealthState>,
    draining: watch::Sender<bool>,
    in_flight: Arc<watch::Sender<u64>>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: ArcSwap::from_pointee(HealthState::Starting),
            draining: watch::channel(false).0,
            in_flight: Arc::new(watch::channel(0).0),
        }
    }

    pub fn set_ready(&self) {
        if !self.is_draining() {
            self.phase.store(Arc::new(HealthState::Ready));
        }
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.phase.load()
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        *self.draining.borrow()
    }

    /// Enters `Draining`. Returns `false` if a drain had already begun.
    pub fn begin_drain(&self) -> bool {
        let first = self.draining.send_if_modified(|draining| !std::mem::replace(draining, true));
        if first {
            self.phase.store(Arc::new(HealthState::Draining));
        }
        first
    }

    /// Receiver that flips to `true` when draining begins. Session loops
    /// select on it to stop reading.
    #[must_use]
    pub fn drain_receiver(&self) -> watch::Receiver<bool> {
        self.draining.subscribe()
    }

    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.send_modify(|n| *n += 1);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        *self.in_flight.borrow()
    }

    /// Waits until no frame is being served, up to `timeout`.
    ///
    /// Moves to `Stopped` and returns `true` once idle; on timeout returns
    /// `false` and stays `Draining`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let mut count = self.in_flight.subscribe();
        let idle = matches!(
            tokio::time::timeout(timeout, count.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );
        if idle {
            self.phase.store(Arc::new(HealthState::Stopped));
        }
        idle
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts one frame as in flight until dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<watch::Sender<u64>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance_and_never_return_to_ready() {
        let controller = ShutdownController::new();
        assert_eq!(controller.health_state(), HealthState::Starting);
        controller.set_ready();
        assert_eq!(controller.health_state(), HealthState::Ready);

        assert!(controller.begin_drain());
        assert!(!controller.begin_drain());
        controller.set_ready();
        assert_eq!(controller.health_state(), HealthState::Draining);
        assert!(!controller.health_state().accepts_sessions());
        assert_eq!(HealthState::Draining.as_str(), "draining");
    }

    #[test]
    fn guards_count_frames_in_flight() {
        let controller = ShutdownController::new();
        let a = controller.in_flight_guard();
        let b = controller.in_flight_guard();
        assert_eq!(controller.in_flight_count(), 2);
        drop(a);
        drop(b);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn drain_receiver_sees_the_flip() {
        let controller = ShutdownController::new();
        let mut rx = controller.drain_receiver();
        assert!(!*rx.borrow());
        controller.begin_drain();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn drain_wakes_when_the_last_frame_finishes() {
        let controller = Arc::new(ShutdownController::new());
        let guard = controller.in_flight_guard();
        controller.begin_drain();

        let finisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });
        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(controller.health_state(), HealthState::Stopped);
        finisher.await.unwrap();
    }

    #[tokio::test]
    async fn drain_times_out_while_a_frame_is_stuck() {
        let controller = ShutdownController::new();
        let _guard = controller.in_flight_guard();
        controller.begin_drain();
        assert!(!controller.wait_for_drain(Duration::from_millis(20)).await);
        assert_eq!(controller.health_state(), HealthState::Draining);
    }
}
