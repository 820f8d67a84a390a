//! Background session monitor.
//!
//! Revalidates the locally held session against the server on a fixed
//! interval. A tick ends in one of four ways:
//!
//! - valid: keep polling
//! - transient failure: log it, keep polling
//! - no local session any more: stop quietly
//! - expired or replaced: clear the local session, emit the event, stop
//!
//! At most one polling task runs per monitor. Starting while running
//! cancels the previous task first; cancellation is checked before and
//! after every tick, so a stopped monitor never emits or reschedules.

use super::backend::AuthBackend;
use super::model::SessionEvent;
use super::session_cache::{LocalSession, SessionCache};
use crate::clock::Clock;
use crate::error::AuthError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 16;

/// Result of one revalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Valid,
    Transient,
    NoSession,
    Invalidated(SessionEvent),
}

/// The event a validation verdict should surface as, if any.
pub fn event_for(error: &AuthError) -> Option<SessionEvent> {
    match error {
        AuthError::SessionReplaced => Some(SessionEvent::Replaced),
        AuthError::SessionExpired | AuthError::AccountInactive | AuthError::NoSession => {
            Some(SessionEvent::Expired)
        }
        _ => None,
    }
}

/// One revalidation of whatever session `cache` holds.
pub async fn check_session(
    backend: &dyn AuthBackend,
    cache: &SessionCache,
    clock: &dyn Clock,
) -> TickOutcome {
    let Some(session) = cache.get() else {
        return TickOutcome::NoSession;
    };
    check_held(backend, cache, clock, &session).await
}

/// Revalidate one specific held session.
async fn check_held(
    backend: &dyn AuthBackend,
    cache: &SessionCache,
    clock: &dyn Clock,
    session: &LocalSession,
) -> TickOutcome {
    if session.is_expired(clock.now()) {
        return TickOutcome::Invalidated(SessionEvent::Expired);
    }
    let Ok(token) = session.token() else {
        return TickOutcome::Invalidated(SessionEvent::Expired);
    };

    match backend.validate_session(&token).await {
        Ok(user) => {
            cache.update_user(user);
            TickOutcome::Valid
        }
        Err(e) if e.is_transient() => {
            tracing::warn!(user_id = %session.user_id(), error = %e, "Session check failed, will retry");
            TickOutcome::Transient
        }
        Err(e) => match event_for(&e) {
            Some(event) => TickOutcome::Invalidated(event),
            None => {
                tracing::warn!(user_id = %session.user_id(), error = %e, "Unexpected session check error");
                TickOutcome::Transient
            }
        },
    }
}

struct RunningMonitor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Clone)]
struct MonitorContext {
    backend: Arc<dyn AuthBackend>,
    cache: Arc<SessionCache>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<SessionEvent>,
    interval: Duration,
}

pub struct SessionMonitor {
    ctx: MonitorContext,
    running: Mutex<Option<RunningMonitor>>,
}

impl SessionMonitor {
    pub fn new(
        backend: Arc<dyn AuthBackend>,
        cache: Arc<SessionCache>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            ctx: MonitorContext {
                backend,
                cache,
                clock,
                events,
                interval: interval.max(Duration::from_millis(10)),
            },
            running: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.ctx.events.subscribe()
    }

    /// Publish an event detected outside the polling loop.
    pub fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.ctx.events.send(event);
    }

    /// Start polling, replacing any running instance. Must be called from
    /// within a Tokio runtime.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if let Some(previous) = running.take() {
            previous.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll(self.ctx.clone(), cancel.clone()));
        *running = Some(RunningMonitor { cancel, task });
        tracing::debug!(interval_ms = self.ctx.interval.as_millis() as u64, "Session monitor started");
    }

    /// Start only if no instance is currently polling.
    pub fn ensure_running(&self) {
        if !self.is_running() {
            self.start();
        }
    }

    /// Stop polling. No tick runs or emits after this returns.
    pub fn stop(&self) {
        if let Some(previous) = self.running.lock().take() {
            previous.cancel.cancel();
            tracing::debug!("Session monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.cancel.is_cancelled() && !r.task.is_finished())
    }
}

impl Drop for SessionMonitor {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

async fn poll(ctx: MonitorContext, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(ctx.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; the first check waits a full interval
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if cancel.is_cancelled() {
            break;
        }
        let Some(held) = ctx.cache.get() else {
            break;
        };

        let outcome = check_held(ctx.backend.as_ref(), &ctx.cache, ctx.clock.as_ref(), &held).await;
        if cancel.is_cancelled() {
            break;
        }

        match outcome {
            TickOutcome::Valid | TickOutcome::Transient => {}
            TickOutcome::NoSession => break,
            TickOutcome::Invalidated(event) => {
                // A sign-in may have stored a newer session while this tick was in flight
                if ctx.cache.clear_if_token(&held.token) {
                    tracing::info!(event = %event, "Session invalidated");
                    let _ = ctx.events.send(event);
                } else {
                    tracing::debug!(event = %event, "Verdict was for a session no longer held");
                }
                break;
            }
        }
    }
}
