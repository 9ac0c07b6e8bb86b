//! Reconnection controller.
//!
//! Drives one retry cycle at a time: each failed attempt re-arms the timer
//! with the next back-off delay until a reconnect succeeds or the attempt
//! ceiling is reached.  A manual [`cancel`](ReconnectController::cancel)
//! stops the cycle silently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backoff::ReconnectPolicy;
use crate::error::SessionError;
use crate::events::{EventBus, SessionEvent};

/// Whatever owns the connection.  Held weakly so a pending timer never
/// keeps a dropped session alive.
#[async_trait]
pub trait ReconnectTarget: Send + Sync + 'static {
    async fn reconnect(&self) -> Result<(), SessionError>;

    /// A retry was armed.
    fn reconnect_scheduled(&self, _attempt: u32, _delay: Duration) {}

    /// The attempt ceiling was reached.
    fn reconnect_abandoned(&self, _attempts: u32) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled { attempt: u32, delay: Duration },
    /// Auto-reconnect is off or a cycle is already running.
    Ignored,
    GaveUp { attempts: u32 },
}

#[derive(Default)]
struct CycleState {
    active: bool,
    attempts: u32,
    timer: Option<JoinHandle<()>>,
    /// The timer has fired and its attempt is running.
    in_flight: bool,
    cycle_started: Option<Instant>,
    /// Bumped by `cancel()` so a finishing attempt from an older cycle is
    /// ignored.
    generation: u64,
}

pub struct ReconnectController {
    state: Mutex<CycleState>,
    policy: RwLock<ReconnectPolicy>,
    enabled: AtomicBool,
    events: EventBus,
}

impl ReconnectController {
    pub fn new(policy: ReconnectPolicy, enabled: bool, events: EventBus) -> Self {
        Self {
            state: Mutex::new(CycleState::default()),
            policy: RwLock::new(policy),
            enabled: AtomicBool::new(enabled),
            events,
        }
    }

    pub fn set_policy(&self, policy: ReconnectPolicy) {
        *self.policy.write() = policy;
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Consecutive failed attempts in the current cycle.
    pub fn attempts(&self) -> u32 {
        self.state.lock().attempts
    }

    /// Whether a retry is armed or running.
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Arm the next retry.  `immediate` skips the back-off delay.
    pub fn schedule_reconnect(
        self: &Arc<Self>,
        target: Weak<dyn ReconnectTarget>,
        immediate: bool,
    ) -> ScheduleOutcome {
        self.arm(target, immediate.then_some(Duration::ZERO))
    }

    /// `delay` overrides the policy's back-off for this attempt.
    fn arm(self: &Arc<Self>, target: Weak<dyn ReconnectTarget>, delay: Option<Duration>) -> ScheduleOutcome {
        if !self.is_enabled() {
            tracing::debug!("auto-reconnect disabled, not scheduling");
            return ScheduleOutcome::Ignored;
        }
        let policy = self.policy.read().clone();

        let mut state = self.state.lock();
        if state.active {
            tracing::debug!("reconnect already in progress");
            return ScheduleOutcome::Ignored;
        }

        if policy.should_give_up(state.attempts) {
            let attempts = state.attempts;
            let elapsed = state.cycle_started.map(|t| t.elapsed()).unwrap_or_default();
            state.attempts = 0;
            state.cycle_started = None;
            state.timer = None;
            drop(state);

            tracing::error!(attempts, "giving up on reconnecting");
            self.events.emit(SessionEvent::ReconnectGaveUp {
                attempts,
                elapsed_ms: elapsed.as_millis() as u64,
            });
            if let Some(target) = target.upgrade() {
                target.reconnect_abandoned(attempts);
            }
            return ScheduleOutcome::GaveUp { attempts };
        }

        state.attempts += 1;
        state.active = true;
        state.cycle_started.get_or_insert_with(Instant::now);
        let attempt = state.attempts;
        let generation = state.generation;
        let delay = delay.unwrap_or_else(|| policy.delay_for_attempt(attempt - 1));

        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        self.events.emit(SessionEvent::Reconnecting {
            attempt,
            delay_ms: delay.as_millis() as u64,
        });
        // Notify before arming so the owner's state can't trail the attempt.
        if let Some(target) = target.upgrade() {
            target.reconnect_scheduled(attempt, delay);
        }

        let controller = self.clone();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = controller.state.lock();
                if state.generation != generation {
                    return;
                }
                state.in_flight = true;
            }
            let Some(owner) = target.upgrade() else {
                let current = controller.state.lock().generation == generation;
                if current {
                    controller.reset();
                }
                return;
            };
            tracing::info!(attempt, "attempting reconnect");
            let result = owner.reconnect().await;
            drop(owner);
            controller.attempt_finished(target, generation, attempt, result);
        }));
        drop(state);

        ScheduleOutcome::Scheduled { attempt, delay }
    }

    fn attempt_finished(
        self: &Arc<Self>,
        target: Weak<dyn ReconnectTarget>,
        generation: u64,
        attempt: u32,
        result: Result<(), SessionError>,
    ) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        state.active = false;
        state.in_flight = false;
        state.timer = None;

        match result {
            Ok(()) => {
                let attempts = state.attempts;
                let elapsed = state.cycle_started.map(|t| t.elapsed()).unwrap_or_default();
                state.attempts = 0;
                state.cycle_started = None;
                drop(state);

                tracing::info!(attempts, "reconnected");
                self.events.emit(SessionEvent::Reconnected {
                    attempts,
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }
            Err(e) => {
                let next_attempt = state.attempts;
                drop(state);

                // Drawn once: the reported delay is the one that gets armed.
                let policy = self.policy.read().clone();
                let next_delay = if policy.should_give_up(next_attempt) {
                    Duration::ZERO
                } else {
                    policy.delay_for_attempt(next_attempt)
                };
                tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                self.events.emit(SessionEvent::ReconnectFailed {
                    attempt,
                    error: e.to_string(),
                    next_delay_ms: next_delay.as_millis() as u64,
                });
                self.arm(target, Some(next_delay));
            }
        }
    }

    /// Stop the current cycle without reporting a give-up.
    ///
    /// A timer that is still sleeping is aborted.  An attempt that is
    /// already running is left to finish on its own; its outcome is
    /// ignored.
    pub fn cancel(&self) {
        let (timer, in_flight) = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.active = false;
            state.attempts = 0;
            state.cycle_started = None;
            (state.timer.take(), std::mem::take(&mut state.in_flight))
        };
        if let Some(timer) = timer {
            if in_flight {
                tracing::debug!("reconnect cycle cancelled, letting the running attempt finish");
            } else {
                timer.abort();
                tracing::debug!("reconnect cycle cancelled");
            }
        }
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.active = false;
        state.in_flight = false;
        state.attempts = 0;
        state.cycle_started = None;
        state.timer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::broadcast;

    /// Target that replays scripted outcomes, failing once the script runs out.
    struct Scripted {
        outcomes: Mutex<VecDeque<Result<(), SessionError>>>,
        calls: AtomicU32,
        abandoned: AtomicU32,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<(), SessionError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: AtomicU32::new(0),
                abandoned: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ReconnectTarget for Scripted {
        async fn reconnect(&self) -> Result<(), SessionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(SessionError::ConnectionError("refused".into())))
        }

        fn reconnect_abandoned(&self, attempts: u32) {
            self.abandoned.store(attempts, Ordering::SeqCst);
        }
    }

    fn controller(max_attempts: u32) -> (Arc<ReconnectController>, broadcast::Receiver<SessionEvent>) {
        let events = EventBus::default();
        let rx = events.subscribe();
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_attempts,
        };
        (Arc::new(ReconnectController::new(policy, true, events)), rx)
    }

    fn weak(target: &Arc<Scripted>) -> Weak<dyn ReconnectTarget> {
        let target: Arc<dyn ReconnectTarget> = target.clone();
        Arc::downgrade(&target)
    }

    async fn wait_for<F>(rx: &mut broadcast::Receiver<SessionEvent>, pred: F) -> Vec<SessionEvent>
    where
        F: Fn(&SessionEvent) -> bool,
    {
        let mut seen = Vec::new();
        loop {
            let ev = rx.recv().await.unwrap();
            let done = pred(&ev);
            seen.push(ev);
            if done {
                return seen;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts_and_resets() {
        let (ctl, mut rx) = controller(3);
        let target = Scripted::new(vec![]);

        assert!(matches!(
            ctl.schedule_reconnect(weak(&target), false),
            ScheduleOutcome::Scheduled { attempt: 1, .. }
        ));
        let seen = wait_for(&mut rx, |e| matches!(e, SessionEvent::ReconnectGaveUp { .. })).await;

        assert_eq!(target.calls.load(Ordering::SeqCst), 3);
        assert_eq!(target.abandoned.load(Ordering::SeqCst), 3);
        assert_eq!(ctl.attempts(), 0);
        assert!(!ctl.is_active());

        let failed = seen
            .iter()
            .filter(|e| matches!(e, SessionEvent::ReconnectFailed { .. }))
            .count();
        assert_eq!(failed, 3);
        assert!(matches!(
            seen.last(),
            Some(SessionEvent::ReconnectGaveUp { attempts: 3, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reported_next_delay_is_the_armed_delay() {
        let (ctl, mut rx) = controller(5);
        let target = Scripted::new(vec![]);
        ctl.schedule_reconnect(weak(&target), false);
        let seen = wait_for(&mut rx, |e| matches!(e, SessionEvent::ReconnectGaveUp { .. })).await;

        let mut checked = 0;
        for pair in seen.windows(2) {
            if let (
                SessionEvent::ReconnectFailed { next_delay_ms, .. },
                SessionEvent::Reconnecting { delay_ms, .. },
            ) = (&pair[0], &pair[1])
            {
                assert_eq!(next_delay_ms, delay_ms);
                checked += 1;
            }
        }
        assert_eq!(checked, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn success_reports_attempts_and_resets_counter() {
        let (ctl, mut rx) = controller(5);
        let target = Scripted::new(vec![Err(SessionError::ConnectionError("refused".into())), Ok(())]);

        ctl.schedule_reconnect(weak(&target), false);
        let seen = wait_for(&mut rx, |e| matches!(e, SessionEvent::Reconnected { .. })).await;

        assert!(matches!(
            seen.last(),
            Some(SessionEvent::Reconnected { attempts: 2, .. })
        ));
        assert_eq!(ctl.attempts(), 0);
        assert!(!ctl.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn delays_follow_backoff() {
        let (ctl, _rx) = controller(0);
        let target = Scripted::new(vec![]);
        match ctl.schedule_reconnect(weak(&target), false) {
            ScheduleOutcome::Scheduled { attempt, delay } => {
                assert_eq!(attempt, 1);
                assert!(delay >= Duration::from_millis(100));
                assert!(delay <= Duration::from_millis(110));
            }
            other => panic!("unexpected {other:?}"),
        }
        ctl.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn reentrant_schedule_is_ignored() {
        let (ctl, _rx) = controller(3);
        let target = Scripted::new(vec![Ok(())]);
        assert!(matches!(
            ctl.schedule_reconnect(weak(&target), true),
            ScheduleOutcome::Scheduled { delay: Duration::ZERO, .. }
        ));
        assert_eq!(ctl.schedule_reconnect(weak(&target), true), ScheduleOutcome::Ignored);
        assert!(ctl.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_silent() {
        let (ctl, mut rx) = controller(3);
        let target = Scripted::new(vec![]);
        ctl.schedule_reconnect(weak(&target), false);
        assert!(matches!(rx.recv().await.unwrap(), SessionEvent::Reconnecting { .. }));

        ctl.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(target.calls.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(ctl.attempts(), 0);
        assert!(!ctl.is_active());
    }

    /// Target whose reconnect takes a second and then succeeds.
    struct Slow {
        finished: AtomicU32,
    }

    #[async_trait]
    impl ReconnectTarget for Slow {
        async fn reconnect(&self) -> Result<(), SessionError> {
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_lets_running_attempt_finish_quietly() {
        let (ctl, mut rx) = controller(3);
        let target = Arc::new(Slow {
            finished: AtomicU32::new(0),
        });
        let as_dyn: Arc<dyn ReconnectTarget> = target.clone();
        ctl.schedule_reconnect(Arc::downgrade(&as_dyn), false);
        assert!(matches!(rx.recv().await.unwrap(), SessionEvent::Reconnecting { .. }));

        // Past the back-off delay, inside the attempt.
        tokio::time::sleep(Duration::from_millis(500)).await;
        ctl.cancel();
        assert!(!ctl.is_active());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(target.finished.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(ctl.attempts(), 0);
    }

    #[tokio::test]
    async fn disabled_controller_ignores_requests() {
        let (ctl, _rx) = controller(3);
        ctl.set_enabled(false);
        let target = Scripted::new(vec![]);
        assert_eq!(ctl.schedule_reconnect(weak(&target), true), ScheduleOutcome::Ignored);
        assert_eq!(ctl.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_target_ends_cycle() {
        let (ctl, _rx) = controller(3);
        let target = Scripted::new(vec![]);
        ctl.schedule_reconnect(weak(&target), false);
        drop(target);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!ctl.is_active());
        assert_eq!(ctl.attempts(), 0);
    }
}
