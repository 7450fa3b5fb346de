//! Migration job repository: CRUD and counter updates for `migration_jobs`.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A raw migration job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub status: String,
    pub batch_size: i64,
    pub total_items: i64,
    pub processed_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub skipped_count: i64,
    pub config: String,
    pub rollback_snapshot: Option<String>,
    pub error_details: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub paused_at: Option<String>,
    pub resumed_at: Option<String>,
    pub completed_at: Option<String>,
    pub rolled_back_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            status: row.get("status")?,
            batch_size: row.get("batch_size")?,
            total_items: row.get("total_items")?,
            processed_count: row.get("processed_count")?,
            success_count: row.get("success_count")?,
            error_count: row.get("error_count")?,
            skipped_count: row.get("skipped_count")?,
            config: row.get("config")?,
            rollback_snapshot: row.get("rollback_snapshot")?,
            error_details: row.get("error_details")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            paused_at: row.get("paused_at")?,
            resumed_at: row.get("resumed_at")?,
            completed_at: row.get("completed_at")?,
            rolled_back_at: row.get("rolled_back_at")?,
        })
    }
}

/// Which lifecycle timestamp a status change stamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTimestamp {
    Started,
    Paused,
    Resumed,
    Completed,
    RolledBack,
}

impl JobTimestamp {
    fn column(self) -> &'static str {
        match self {
            JobTimestamp::Started => "started_at",
            JobTimestamp::Paused => "paused_at",
            JobTimestamp::Resumed => "resumed_at",
            JobTimestamp::Completed => "completed_at",
            JobTimestamp::RolledBack => "rolled_back_at",
        }
    }
}

/// Inserts a new job row. The rollback snapshot is never written here.
pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO migration_jobs (id, status, batch_size, total_items, processed_count,
             success_count, error_count, skipped_count, config, error_details, created_at,
             started_at, paused_at, resumed_at, completed_at, rolled_back_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                job.id,
                job.status,
                job.batch_size,
                job.total_items,
                job.processed_count,
                job.success_count,
                job.error_count,
                job.skipped_count,
                job.config,
                job.error_details,
                job.created_at,
                job.started_at,
                job.paused_at,
                job.resumed_at,
                job.completed_at,
                job.rolled_back_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM migration_jobs WHERE id = ?1",
                params![id],
                JobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Lists job IDs with the given status, newest first.
pub fn ids_by_status(db: &Database, status: &str) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id FROM migration_jobs WHERE status = ?1 ORDER BY created_at DESC",
        )?;
        let ids = stmt
            .query_map(params![status], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    })
}

/// Sets the status and, optionally, stamps one lifecycle timestamp.
pub fn update_status(
    db: &Database,
    id: &str,
    status: &str,
    stamp: Option<(JobTimestamp, &str)>,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        match stamp {
            Some((which, at)) => {
                let sql = format!(
                    "UPDATE migration_jobs SET status = ?2, {} = ?3 WHERE id = ?1",
                    which.column()
                );
                conn.execute(&sql, params![id, status, at])?;
            }
            None => {
                conn.execute(
                    "UPDATE migration_jobs SET status = ?2 WHERE id = ?1",
                    params![id, status],
                )?;
            }
        }
        Ok(())
    })
}

/// Atomically adds batch results to the job counters.
pub fn increment_counts(
    db: &Database,
    id: &str,
    success: i64,
    errors: i64,
    skipped: i64,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE migration_jobs SET
               processed_count = processed_count + ?2 + ?3,
               success_count = success_count + ?2,
               error_count = error_count + ?3,
               skipped_count = skipped_count + ?4
             WHERE id = ?1",
            params![id, success, errors, skipped],
        )?;
        Ok(())
    })
}

/// Appends one entry to the job's `error_details` JSON array.
pub fn append_error(db: &Database, id: &str, message: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE migration_jobs SET error_details = json_insert(error_details, '$[#]', ?2)
             WHERE id = ?1",
            params![id, message],
        )?;
        Ok(())
    })
}

/// Stores the rollback snapshot. Fails if one has already been captured.
pub fn set_rollback_snapshot(db: &Database, id: &str, snapshot: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE migration_jobs SET rollback_snapshot = ?2
             WHERE id = ?1 AND rollback_snapshot IS NULL",
            params![id, snapshot],
        )?;
        if changed == 0 {
            return Err(DatabaseError::AlreadySet {
                column: "rollback_snapshot",
                id: id.to_string(),
            });
        }
        Ok(())
    })
}
