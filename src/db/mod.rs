// Database access layer (SQLite via sqlx).

mod seed;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: i64,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CourseSummary {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub lesson_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Lesson {
    pub id: i64,
    pub course_id: i64,
    pub title: String,
    pub order_index: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct QuestionRow {
    id: i64,
    lesson_id: i64,
    question: String,
    options: String,
    correct_index: i64,
    order_index: i64,
}

/// A multiple-choice question. `correct_index` is never serialized so it
/// cannot leak into lesson payloads.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: i64,
    pub lesson_id: i64,
    pub question: String,
    pub options: Vec<String>,
    #[serde(skip)]
    pub correct_index: i64,
    pub order_index: i64,
}

impl From<QuestionRow> for Question {
    fn from(row: QuestionRow) -> Self {
        // Options that are not a JSON array of strings degrade to an empty list
        let options = serde_json::from_str::<Vec<serde_json::Value>>(&row.options)
            .map(|values| {
                values
                    .into_iter()
                    .map(|v| match v {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Question {
            id: row.id,
            lesson_id: row.lesson_id,
            question: row.question,
            options,
            correct_index: row.correct_index,
            order_index: row.order_index,
        }
    }
}

/// One learner's persisted progress row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProgressRow {
    pub user_id: String,
    /// JSON array of lesson ids.
    pub completed_lessons: String,
    pub xp: i64,
    pub current_streak: i64,
    pub updated_at: String,
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        // Every connection to `sqlite::memory:` opens its own empty database,
        // so keep exactly one alive for the life of the pool.
        let options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = options.connect(database_url).await?;
        let db = Self { pool };
        db.run_migrations().await?;
        db.seed_catalog().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'user',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS courses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT ''
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS lessons (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                course_id INTEGER NOT NULL REFERENCES courses(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                order_index INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS questions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                lesson_id INTEGER NOT NULL REFERENCES lessons(id) ON DELETE CASCADE,
                question TEXT NOT NULL,
                options TEXT NOT NULL DEFAULT '[]',
                correct_index INTEGER NOT NULL,
                order_index INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS learner_progress (
                user_id TEXT PRIMARY KEY,
                completed_lessons TEXT NOT NULL DEFAULT '[]',
                xp INTEGER NOT NULL DEFAULT 0,
                current_streak INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert the starter catalog when no course exists yet.
    async fn seed_catalog(&self) -> Result<(), sqlx::Error> {
        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM courses")
            .fetch_one(&self.pool)
            .await?;
        if existing > 0 {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for course in seed::COURSES {
            sqlx::query("INSERT INTO courses (id, title, description) VALUES (?, ?, ?)")
                .bind(course.id)
                .bind(course.title)
                .bind(course.description)
                .execute(&mut *tx)
                .await?;

            for (lesson_index, lesson) in course.lessons.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO lessons (id, course_id, title, order_index) VALUES (?, ?, ?, ?)",
                )
                .bind(lesson.id)
                .bind(course.id)
                .bind(lesson.title)
                .bind(lesson_index as i64)
                .execute(&mut *tx)
                .await?;

                for (question_index, q) in lesson.questions.iter().enumerate() {
                    sqlx::query(
                        "INSERT INTO questions (lesson_id, question, options, correct_index, order_index) VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(lesson.id)
                    .bind(q.question)
                    .bind(serde_json::json!(q.options).to_string())
                    .bind(q.correct_index)
                    .bind(question_index as i64)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;
        tracing::info!("Seeded starter catalog ({} courses)", seed::COURSES.len());
        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────

    /// Create an account. The first account ever created becomes an admin.
    pub async fn create_user(&self, email: &str, password_hash: &str) -> Result<User, sqlx::Error> {
        let user_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        let role = if user_count == 0 { "admin" } else { "user" };
        let id = uuid::Uuid::new_v4().to_string();

        let row = sqlx::query_as::<_, User>(
            "INSERT INTO users (id, email, password_hash, role) VALUES (?, ?, ?, ?) RETURNING id, email, password_hash, role, created_at",
        )
        .bind(&id)
        .bind(email)
        .bind(password_hash)
        .bind(role)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>, sqlx::Error> {
        let row = sqlx::query_as::<_, User>(
            "SELECT id, email, password_hash, role, created_at FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, sqlx::Error> {
        let row = sqlx::query_as::<_, User>(
            "SELECT id, email, password_hash, role, created_at FROM users WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // ── Catalog ───────────────────────────────────────────────────────

    pub async fn list_courses(&self) -> Result<Vec<CourseSummary>, sqlx::Error> {
        let rows = sqlx::query_as::<_, CourseSummary>(
            r#"
            SELECT c.id, c.title, c.description, COUNT(l.id) AS lesson_count
            FROM courses c
            LEFT JOIN lessons l ON l.course_id = c.id
            GROUP BY c.id, c.title, c.description
            ORDER BY c.id
        "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_course(&self, id: i64) -> Result<Option<Course>, sqlx::Error> {
        let row =
            sqlx::query_as::<_, Course>("SELECT id, title, description FROM courses WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    /// Lessons of a course in course order.
    pub async fn list_lessons(&self, course_id: i64) -> Result<Vec<Lesson>, sqlx::Error> {
        let rows = sqlx::query_as::<_, Lesson>(
            "SELECT id, course_id, title, order_index FROM lessons WHERE course_id = ? ORDER BY order_index, id",
        )
        .bind(course_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_lesson(&self, id: i64) -> Result<Option<Lesson>, sqlx::Error> {
        let row = sqlx::query_as::<_, Lesson>(
            "SELECT id, course_id, title, order_index FROM lessons WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_questions(&self, lesson_id: i64) -> Result<Vec<Question>, sqlx::Error> {
        let rows = sqlx::query_as::<_, QuestionRow>(
            "SELECT id, lesson_id, question, options, correct_index, order_index FROM questions WHERE lesson_id = ? ORDER BY order_index, id",
        )
        .bind(lesson_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Question::from).collect())
    }

    pub async fn get_question(&self, id: i64) -> Result<Option<Question>, sqlx::Error> {
        let row = sqlx::query_as::<_, QuestionRow>(
            "SELECT id, lesson_id, question, options, correct_index, order_index FROM questions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Question::from))
    }

    // ── Learner progress ──────────────────────────────────────────────

    pub async fn get_learner_progress(
        &self,
        user_id: &str,
    ) -> Result<Option<ProgressRow>, sqlx::Error> {
        let row = sqlx::query_as::<_, ProgressRow>(
            "SELECT user_id, completed_lessons, xp, current_streak, updated_at FROM learner_progress WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Insert a progress row unless one already exists. Returns whether a row was written.
    pub async fn insert_learner_progress(
        &self,
        user_id: &str,
        completed_lessons: &str,
        xp: i64,
        current_streak: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO learner_progress (user_id, completed_lessons, xp, current_streak) VALUES (?, ?, ?, ?) ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(completed_lessons)
        .bind(xp)
        .bind(current_streak)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Write the full progress row, creating it if needed.
    pub async fn upsert_learner_progress(
        &self,
        user_id: &str,
        completed_lessons: &str,
        xp: i64,
        current_streak: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO learner_progress (user_id, completed_lessons, xp, current_streak, updated_at)
            VALUES (?, ?, ?, ?, datetime('now'))
            ON CONFLICT(user_id) DO UPDATE SET
                completed_lessons = excluded.completed_lessons,
                xp = excluded.xp,
                current_streak = excluded.current_streak,
                updated_at = excluded.updated_at
        "#,
        )
        .bind(user_id)
        .bind(completed_lessons)
        .bind(xp)
        .bind(current_streak)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
