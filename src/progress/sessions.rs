// Per-learner progress sessions.
//
// Each learner gets one engine behind an async mutex. Handlers hold the guard
// for the whole completion round-trip, so a second completion for the same
// learner waits for the first and then sees its result. Ending a session
// (logout or idle eviction) retires the engine while holding that guard; a
// caller still holding the old handle retries and gets a fresh engine loaded
// after the last write landed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::OwnedMutexGuard;

use super::store::ProgressStore;
use super::{LearnerId, ProgressEngine};
use crate::metrics;

pub type SharedEngine = Arc<tokio::sync::Mutex<ProgressEngine>>;
pub type EngineGuard = OwnedMutexGuard<ProgressEngine>;

/// Sessions untouched for this long are dropped; the next request reloads
/// progress from the store.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Session {
    engine: SharedEngine,
    last_used: Instant,
}

struct Sessions {
    by_learner: HashMap<LearnerId, Session>,
    last_sweep: Instant,
}

#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn ProgressStore>,
    idle_timeout: Duration,
    inner: Arc<Mutex<Sessions>>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn ProgressStore>) -> Self {
        Self::with_idle_timeout(store, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(store: Arc<dyn ProgressStore>, idle_timeout: Duration) -> Self {
        Self {
            store,
            idle_timeout,
            inner: Arc::new(Mutex::new(Sessions {
                by_learner: HashMap::new(),
                last_sweep: Instant::now(),
            })),
        }
    }

    fn get_or_create(&self, learner: &LearnerId) -> SharedEngine {
        let mut sessions = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if now.duration_since(sessions.last_sweep) >= self.idle_timeout.min(MAX_SWEEP_INTERVAL) {
            self.evict_idle(&mut sessions, learner, now);
        }

        let session = sessions
            .by_learner
            .entry(learner.clone())
            .or_insert_with(|| Session {
                engine: Arc::new(tokio::sync::Mutex::new(ProgressEngine::new(
                    self.store.clone(),
                ))),
                last_used: now,
            });
        session.last_used = now;
        let engine = session.engine.clone();
        metrics::ACTIVE_SESSIONS.set(sessions.by_learner.len() as i64);
        engine
    }

    /// Drop sessions idle past the timeout. An engine that is locked right
    /// now is in use and stays.
    fn evict_idle(&self, sessions: &mut Sessions, current: &LearnerId, now: Instant) {
        let idle_timeout = self.idle_timeout;
        let before = sessions.by_learner.len();
        sessions.by_learner.retain(|learner, session| {
            if learner == current || now.duration_since(session.last_used) < idle_timeout {
                return true;
            }
            match session.engine.try_lock() {
                Ok(mut engine) => {
                    engine.retire();
                    false
                }
                Err(_) => true,
            }
        });
        sessions.last_sweep = now;

        let evicted = before - sessions.by_learner.len();
        if evicted > 0 {
            tracing::debug!("Evicted {evicted} idle progress sessions");
        }
    }

    /// Lock the learner's live engine, skipping any that a concurrent
    /// logout or eviction retired while we waited.
    async fn acquire(&self, learner: &LearnerId) -> EngineGuard {
        loop {
            let engine = self.get_or_create(learner).lock_owned().await;
            if !engine.is_retired() {
                return engine;
            }
        }
    }

    /// Start (or restart) a learner's session, reloading progress from the store.
    pub async fn login(&self, learner: &LearnerId) -> EngineGuard {
        let mut engine = self.acquire(learner).await;
        engine.initialize(Some(learner.clone())).await;
        tracing::info!("Progress session started for {learner}");
        engine
    }

    /// End a learner's session once any in-flight completion has finished.
    /// Returns whether one was active.
    pub async fn logout(&self, learner: &LearnerId) -> bool {
        let current = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_learner
            .get(learner)
            .map(|session| session.engine.clone());
        let Some(engine) = current else {
            return false;
        };

        let mut guard = engine.lock().await;
        if guard.is_retired() {
            return false;
        }
        guard.retire();
        {
            let mut sessions = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if sessions
                .by_learner
                .get(learner)
                .is_some_and(|session| Arc::ptr_eq(&session.engine, &engine))
            {
                sessions.by_learner.remove(learner);
            }
            metrics::ACTIVE_SESSIONS.set(sessions.by_learner.len() as i64);
        }
        drop(guard);

        tracing::info!("Progress session ended for {learner}");
        true
    }

    /// The learner's engine, locked and initialized on first use (e.g. a
    /// token that outlived a server restart).
    pub async fn engine(&self, learner: &LearnerId) -> EngineGuard {
        let mut engine = self.acquire(learner).await;
        if !engine.is_ready() {
            engine.initialize(Some(learner.clone())).await;
        }
        engine
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_learner
            .len()
    }
}
