use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coordinator::{CreateOutcome, ParticipantStore};
use shared::{
    domain::{CompletionState, ConditionName, ParticipantId, ParticipantRecord, StudyId},
    protocol::CompletionTally,
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredParticipant {
    pub record: ParticipantRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to an in-memory database is a separate database,
        // so those get exactly one connection that is never recycled.
        let pool_options = if is_in_memory(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn list_participants(&self, study_id: &StudyId) -> Result<Vec<StoredParticipant>> {
        let rows = sqlx::query(
            "SELECT participant_id, assigned_condition, current_step_index, completion_state, created_at, updated_at
             FROM participants
             WHERE study_id = ?
             ORDER BY created_at ASC, participant_id ASC",
        )
        .bind(study_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<StoredParticipant> {
                Ok(StoredParticipant {
                    record: record_from_row(row)?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }
}

fn record_from_row(row: &SqliteRow) -> Result<ParticipantRecord> {
    let state: String = row.try_get("completion_state")?;
    Ok(ParticipantRecord {
        participant_id: ParticipantId(row.try_get("participant_id")?),
        assigned_condition: ConditionName(row.try_get("assigned_condition")?),
        current_step_index: row.try_get("current_step_index")?,
        completion_state: state
            .parse::<CompletionState>()
            .context("corrupt participant row")?,
    })
}

#[async_trait]
impl ParticipantStore for Storage {
    async fn read_participant(
        &self,
        study_id: &StudyId,
        participant_id: &ParticipantId,
    ) -> Result<Option<ParticipantRecord>> {
        let row = sqlx::query(
            "SELECT participant_id, assigned_condition, current_step_index, completion_state
             FROM participants
             WHERE study_id = ? AND participant_id = ?",
        )
        .bind(study_id.as_str())
        .bind(participant_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn create_participant(
        &self,
        study_id: &StudyId,
        participant_id: &ParticipantId,
        condition: &ConditionName,
        initial_index: i64,
    ) -> Result<CreateOutcome> {
        let inserted = sqlx::query(
            "INSERT INTO participants (study_id, participant_id, assigned_condition, current_step_index, completion_state)
             VALUES (?, ?, ?, ?, 'in_progress')
             ON CONFLICT(study_id, participant_id) DO NOTHING",
        )
        .bind(study_id.as_str())
        .bind(participant_id.as_str())
        .bind(condition.as_str())
        .bind(initial_index)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let record = self
            .read_participant(study_id, participant_id)
            .await?
            .with_context(|| format!("participant '{participant_id}' vanished after insert"))?;
        if inserted == 1 {
            Ok(CreateOutcome::Created(record))
        } else {
            debug!(%study_id, %participant_id, "participant already existed");
            Ok(CreateOutcome::Existing(record))
        }
    }

    async fn update_progress(
        &self,
        study_id: &StudyId,
        participant_id: &ParticipantId,
        index: i64,
        state: CompletionState,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE participants
             SET current_step_index = ?, completion_state = ?, updated_at = CURRENT_TIMESTAMP
             WHERE study_id = ? AND participant_id = ? AND completion_state = 'in_progress'",
        )
        .bind(index)
        .bind(state.as_str())
        .bind(study_id.as_str())
        .bind(participant_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn increment_condition_counter(
        &self,
        study_id: &StudyId,
        condition: &ConditionName,
    ) -> Result<i64> {
        let assigned: i64 = sqlx::query_scalar(
            "INSERT INTO condition_counters (study_id, condition_name, position, active, assigned)
             VALUES (
                 ?1,
                 ?2,
                 (SELECT COALESCE(MAX(position), -1) + 1 FROM condition_counters WHERE study_id = ?1),
                 0,
                 1
             )
             ON CONFLICT(study_id, condition_name) DO UPDATE SET assigned = assigned + 1
             RETURNING assigned",
        )
        .bind(study_id.as_str())
        .bind(condition.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(assigned)
    }

    async fn read_condition_counters(
        &self,
        study_id: &StudyId,
    ) -> Result<BTreeMap<ConditionName, i64>> {
        let rows = sqlx::query(
            "SELECT condition_name, assigned FROM condition_counters WHERE study_id = ?",
        )
        .bind(study_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| -> Result<(ConditionName, i64)> {
                Ok((ConditionName(r.try_get(0)?), r.try_get(1)?))
            })
            .collect()
    }

    async fn register_conditions(
        &self,
        study_id: &StudyId,
        conditions: &[ConditionName],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE condition_counters SET active = 0 WHERE study_id = ?")
            .bind(study_id.as_str())
            .execute(&mut *tx)
            .await?;
        for (position, condition) in conditions.iter().enumerate() {
            sqlx::query(
                "INSERT INTO condition_counters (study_id, condition_name, position, active, assigned)
                 VALUES (?, ?, ?, 1, 0)
                 ON CONFLICT(study_id, condition_name) DO UPDATE SET position = excluded.position, active = 1",
            )
            .bind(study_id.as_str())
            .bind(condition.as_str())
            .bind(i64::try_from(position).unwrap_or(i64::MAX))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn claim_least_assigned(
        &self,
        study_id: &StudyId,
    ) -> Result<Option<(ConditionName, i64)>> {
        // One statement, so SQLite applies select-and-increment atomically.
        let row = sqlx::query(
            "UPDATE condition_counters
             SET assigned = assigned + 1
             WHERE study_id = ?1 AND condition_name = (
                 SELECT condition_name FROM condition_counters
                 WHERE study_id = ?1 AND active = 1
                 ORDER BY assigned ASC, position ASC
                 LIMIT 1
             )
             RETURNING condition_name, assigned",
        )
        .bind(study_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| -> Result<(ConditionName, i64)> {
            Ok((ConditionName(r.try_get(0)?), r.try_get(1)?))
        })
        .transpose()
    }

    async fn release_condition(
        &self,
        study_id: &StudyId,
        condition: &ConditionName,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE condition_counters SET assigned = MAX(assigned - 1, 0)
             WHERE study_id = ? AND condition_name = ?",
        )
        .bind(study_id.as_str())
        .bind(condition.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn completion_tally(&self, study_id: &StudyId) -> Result<CompletionTally> {
        let rows = sqlx::query(
            "SELECT completion_state, COUNT(*) FROM participants
             WHERE study_id = ?
             GROUP BY completion_state",
        )
        .bind(study_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut tally = CompletionTally::default();
        for row in rows {
            let state: String = row.try_get(0)?;
            let count: i64 = row.try_get(1)?;
            tally.record(
                state.parse::<CompletionState>()?,
                u64::try_from(count).unwrap_or_default(),
            );
        }
        Ok(tally)
    }
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

/// Creates the parent directory of a file-backed SQLite url.
pub fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_in_memory(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
