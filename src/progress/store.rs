// Persistence backends for learner progress.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{parse_lesson_id, LearnerId, LearnerProgress};
use crate::db::Database;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed progress data: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Load/save collaborator of the progress engine.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// The learner's record, or `None` if nothing has been stored yet.
    async fn load(&self, learner: &LearnerId) -> Result<Option<LearnerProgress>, StoreError>;

    /// Store `progress` unless a record already exists.
    async fn insert(&self, learner: &LearnerId, progress: &LearnerProgress) -> Result<(), StoreError>;

    /// Overwrite the learner's record.
    async fn save(&self, learner: &LearnerId, progress: &LearnerProgress) -> Result<(), StoreError>;
}

/// Parse a stored lesson list. Anything that is not a JSON array reads as
/// empty; entries that are not positive integers are dropped.
pub fn parse_stored_lessons(raw: Option<&str>) -> BTreeSet<i64> {
    let Some(raw) = raw else {
        return BTreeSet::new();
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => items.iter().filter_map(parse_lesson_id).collect(),
        _ => BTreeSet::new(),
    }
}

/// Parse a stored counter. Missing, non-numeric and negative values read as 0.
pub fn parse_stored_counter(raw: Option<&str>) -> u32 {
    let Some(raw) = raw else {
        return 0;
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return 0;
    }
    match trimmed.parse::<f64>() {
        Ok(n) if n.is_finite() && n >= 0.0 => n.floor().min(u32::MAX as f64) as u32,
        _ => 0,
    }
}

// ── Local (device-scoped key-value file) ─────────────────────────────

pub const DEFAULT_KEY_PREFIX: &str = "mathlingo";

/// Single-device store: a JSON object of string keys to string values,
/// like browser local storage. The learner id is not part of the keys.
pub struct LocalStore {
    path: PathBuf,
    prefix: String,
    // Serializes read-modify-write cycles on the file
    lock: Mutex<()>,
}

impl LocalStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_prefix(path, DEFAULT_KEY_PREFIX)
    }

    pub fn with_prefix(path: impl Into<PathBuf>, prefix: &str) -> Self {
        Self {
            path: path.into(),
            prefix: prefix.to_string(),
            lock: Mutex::new(()),
        }
    }

    fn lessons_key(&self) -> String {
        format!("{}.completedLessons", self.prefix)
    }

    fn xp_key(&self) -> String {
        format!("{}.xp", self.prefix)
    }

    fn streak_key(&self) -> String {
        format!("{}.currentStreak", self.prefix)
    }

    async fn read_entries(&self) -> Result<BTreeMap<String, String>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_entries(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let contents = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    fn has_record(&self, entries: &BTreeMap<String, String>) -> bool {
        entries.contains_key(&self.lessons_key()) || entries.contains_key(&self.xp_key())
    }

    fn put_record(&self, entries: &mut BTreeMap<String, String>, progress: &LearnerProgress) -> Result<(), StoreError> {
        entries.insert(
            self.lessons_key(),
            serde_json::to_string(&progress.completed_lessons)?,
        );
        entries.insert(self.xp_key(), progress.xp.to_string());
        entries.insert(self.streak_key(), progress.current_streak.to_string());
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for LocalStore {
    async fn load(&self, _learner: &LearnerId) -> Result<Option<LearnerProgress>, StoreError> {
        let _guard = self.lock.lock().await;
        let entries = self.read_entries().await?;
        if !self.has_record(&entries) {
            return Ok(None);
        }
        Ok(Some(LearnerProgress {
            completed_lessons: parse_stored_lessons(
                entries.get(&self.lessons_key()).map(String::as_str),
            ),
            xp: parse_stored_counter(entries.get(&self.xp_key()).map(String::as_str)),
            current_streak: parse_stored_counter(
                entries.get(&self.streak_key()).map(String::as_str),
            ),
        }))
    }

    async fn insert(&self, _learner: &LearnerId, progress: &LearnerProgress) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_entries().await?;
        if self.has_record(&entries) {
            return Ok(());
        }
        self.put_record(&mut entries, progress)?;
        self.write_entries(&entries).await
    }

    async fn save(&self, _learner: &LearnerId, progress: &LearnerProgress) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        // Keep keys that belong to other parts of the app
        let mut entries = self.read_entries().await?;
        self.put_record(&mut entries, progress)?;
        self.write_entries(&entries).await
    }
}

// ── Remote (one database row per learner) ────────────────────────────

pub struct RemoteStore {
    db: Arc<Database>,
}

impl RemoteStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

fn clamp_counter(value: i64) -> u32 {
    value.clamp(0, i64::from(u32::MAX)) as u32
}

#[async_trait]
impl ProgressStore for RemoteStore {
    async fn load(&self, learner: &LearnerId) -> Result<Option<LearnerProgress>, StoreError> {
        let row = self.db.get_learner_progress(learner.as_str()).await?;
        Ok(row.map(|row| LearnerProgress {
            completed_lessons: parse_stored_lessons(Some(row.completed_lessons.as_str())),
            xp: clamp_counter(row.xp),
            current_streak: clamp_counter(row.current_streak),
        }))
    }

    async fn insert(&self, learner: &LearnerId, progress: &LearnerProgress) -> Result<(), StoreError> {
        let lessons = serde_json::to_string(&progress.completed_lessons)?;
        let inserted = self
            .db
            .insert_learner_progress(
                learner.as_str(),
                &lessons,
                i64::from(progress.xp),
                i64::from(progress.current_streak),
            )
            .await?;
        if !inserted {
            tracing::debug!("Progress row for {learner} already existed");
        }
        Ok(())
    }

    async fn save(&self, learner: &LearnerId, progress: &LearnerProgress) -> Result<(), StoreError> {
        let lessons = serde_json::to_string(&progress.completed_lessons)?;
        self.db
            .upsert_learner_progress(
                learner.as_str(),
                &lessons,
                i64::from(progress.xp),
                i64::from(progress.current_streak),
            )
            .await?;
        Ok(())
    }
}
