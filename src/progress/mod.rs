// Learner progress: XP, levels, streaks and sequential lesson unlocking.
//
// `ProgressEngine` owns one learner's record and is the only code path that
// mutates it. Level and unlock state are derived on read and never stored.

pub mod sessions;
pub mod store;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::metrics;
use store::{ProgressStore, StoreError};

/// XP granted for each newly completed lesson.
pub const XP_PER_LESSON: u32 = 20;
/// Width of one level band.
pub const XP_PER_LEVEL: u32 = 100;

/// Opaque learner identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LearnerId(String);

impl LearnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LearnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A learner's mastery record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnerProgress {
    /// Completed lesson ids, ascending.
    pub completed_lessons: BTreeSet<i64>,
    pub xp: u32,
    pub current_streak: u32,
}

impl LearnerProgress {
    /// Derived level: `floor(xp / 100) + 1`.
    pub fn level(&self) -> u32 {
        level_for_xp(self.xp)
    }

    pub fn is_completed(&self, lesson_id: i64) -> bool {
        self.completed_lessons.contains(&lesson_id)
    }

    pub fn level_progress(&self) -> LevelProgress {
        LevelProgress {
            xp_within_level: self.xp % XP_PER_LEVEL,
            xp_for_next_level: self.level().saturating_mul(XP_PER_LEVEL),
        }
    }

    /// The record after completing `lesson_id`, or `None` if it was already completed.
    fn with_completion(&self, lesson_id: i64) -> Option<LearnerProgress> {
        if self.is_completed(lesson_id) {
            return None;
        }
        let mut next = self.clone();
        next.completed_lessons.insert(lesson_id);
        next.xp = next.xp.saturating_add(XP_PER_LESSON);
        next.current_streak = next.current_streak.saturating_add(1);
        Some(next)
    }
}

/// Progress-bar view of the current level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelProgress {
    pub xp_within_level: u32,
    pub xp_for_next_level: u32,
}

/// Everything a client needs to render progress, including derived fields.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressView {
    #[serde(flatten)]
    pub progress: LearnerProgress,
    pub level: u32,
    #[serde(flatten)]
    pub level_progress: LevelProgress,
}

impl From<&LearnerProgress> for ProgressView {
    fn from(progress: &LearnerProgress) -> Self {
        ProgressView {
            progress: progress.clone(),
            level: progress.level(),
            level_progress: progress.level_progress(),
        }
    }
}

pub fn level_for_xp(xp: u32) -> u32 {
    xp / XP_PER_LEVEL + 1
}

/// Whether `lesson_id` can be attempted, given the course's lesson ids in order.
///
/// The first lesson is always open; every other lesson opens once its
/// immediate predecessor is completed. Ids outside the course are locked.
pub fn is_unlocked(lesson_id: i64, ordered_lessons: &[i64], completed: &BTreeSet<i64>) -> bool {
    match ordered_lessons.iter().position(|&id| id == lesson_id) {
        Some(0) => true,
        Some(i) => completed.contains(&ordered_lessons[i - 1]),
        None => false,
    }
}

/// Lenient lesson id coercion: positive integers, integral floats and
/// numeric strings are accepted, everything else yields `None`.
pub fn parse_lesson_id(value: &Value) -> Option<i64> {
    let n = match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return (i > 0).then_some(i);
            }
            n.as_f64()?
        }
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if n.is_finite() && n.fract() == 0.0 && n > 0.0 && n <= i64::MAX as f64 {
        Some(n as i64)
    } else {
        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("progress could not be saved: {0}")]
    Store(#[from] StoreError),
}

/// Owns one learner's progress and keeps it in step with the backing store.
pub struct ProgressEngine {
    store: Arc<dyn ProgressStore>,
    learner: Option<LearnerId>,
    progress: LearnerProgress,
    ready: bool,
    retired: bool,
}

impl ProgressEngine {
    pub fn new(store: Arc<dyn ProgressStore>) -> Self {
        Self {
            store,
            learner: None,
            progress: LearnerProgress::default(),
            ready: false,
            retired: false,
        }
    }

    /// Load (or create) the learner's record. Never fails: read errors fall
    /// back to the zero record and are logged.
    pub async fn initialize(&mut self, learner: Option<LearnerId>) {
        self.learner = learner;
        self.progress = LearnerProgress::default();

        let Some(learner) = self.learner.as_ref() else {
            self.ready = true;
            return;
        };

        match self.store.load(learner).await {
            Ok(Some(progress)) => {
                self.progress = progress;
            }
            Ok(None) => {
                if let Err(e) = self.store.insert(learner, &self.progress).await {
                    tracing::error!("Failed to create progress record for {learner}: {e}");
                    metrics::PROGRESS_STORE_ERRORS_TOTAL
                        .with_label_values(&["insert"])
                        .inc();
                }
            }
            Err(e) => {
                tracing::warn!("Failed to load progress for {learner}, using empty record: {e}");
                metrics::PROGRESS_STORE_ERRORS_TOTAL
                    .with_label_values(&["load"])
                    .inc();
            }
        }
        self.ready = true;
    }

    /// Mark a lesson completed, granting XP and extending the streak once.
    ///
    /// Non-positive ids, a missing learner and repeat completions return the
    /// unchanged record without touching the store. The cache only changes
    /// after the store accepted the write.
    pub async fn complete_lesson(&mut self, lesson_id: i64) -> Result<LearnerProgress, ProgressError> {
        if lesson_id <= 0 {
            return Ok(self.progress.clone());
        }
        let Some(learner) = self.learner.as_ref() else {
            return Ok(self.progress.clone());
        };
        let Some(next) = self.progress.with_completion(lesson_id) else {
            metrics::DUPLICATE_COMPLETIONS_TOTAL.inc();
            return Ok(self.progress.clone());
        };

        if let Err(e) = self.store.save(learner, &next).await {
            tracing::error!("Failed to save completion of lesson {lesson_id} for {learner}: {e}");
            metrics::PROGRESS_STORE_ERRORS_TOTAL
                .with_label_values(&["save"])
                .inc();
            return Err(e.into());
        }

        tracing::debug!("{learner} completed lesson {lesson_id}, xp now {}", next.xp);
        metrics::LESSONS_COMPLETED_TOTAL.inc();
        metrics::XP_AWARDED_TOTAL.inc_by(u64::from(XP_PER_LESSON));
        self.progress = next;
        Ok(self.progress.clone())
    }

    pub fn progress(&self) -> &LearnerProgress {
        &self.progress
    }

    pub fn learner(&self) -> Option<&LearnerId> {
        self.learner.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Detach the engine from its session. A retired engine must not be
    /// used again; its learner gets a fresh one loaded from the store.
    pub fn retire(&mut self) {
        self.retired = true;
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn level(&self) -> u32 {
        self.progress.level()
    }

    pub fn level_progress(&self) -> LevelProgress {
        self.progress.level_progress()
    }

    pub fn is_unlocked(&self, lesson_id: i64, ordered_lessons: &[i64]) -> bool {
        is_unlocked(lesson_id, ordered_lessons, &self.progress.completed_lessons)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory store with switchable failures.
    #[derive(Default)]
    pub struct MemoryStore {
        pub records: Mutex<HashMap<LearnerId, LearnerProgress>>,
        pub fail_load: AtomicBool,
        pub fail_save: AtomicBool,
        pub saves: AtomicUsize,
    }

    fn unavailable() -> StoreError {
        StoreError::Io(std::io::Error::other("store unavailable"))
    }

    #[async_trait]
    impl ProgressStore for MemoryStore {
        async fn load(&self, learner: &LearnerId) -> Result<Option<LearnerProgress>, StoreError> {
            if self.fail_load.load(Ordering::SeqCst) {
                return Err(unavailable());
            }
            Ok(self.records.lock().unwrap().get(learner).cloned())
        }

        async fn insert(&self, learner: &LearnerId, progress: &LearnerProgress) -> Result<(), StoreError> {
            self.records
                .lock()
                .unwrap()
                .entry(learner.clone())
                .or_insert_with(|| progress.clone());
            Ok(())
        }

        async fn save(&self, learner: &LearnerId, progress: &LearnerProgress) -> Result<(), StoreError> {
            if self.fail_save.load(Ordering::SeqCst) {
                return Err(unavailable());
            }
            // Yield so concurrent callers get a chance to interleave
            tokio::task::yield_now().await;
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.records
                .lock()
                .unwrap()
                .insert(learner.clone(), progress.clone());
            Ok(())
        }
    }
}
