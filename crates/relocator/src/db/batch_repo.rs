//! Migration batch repository.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw migration batch row.
#[derive(Debug, Clone)]
pub struct BatchRow {
    pub id: String,
    pub job_id: String,
    pub batch_number: i64,
    pub item_ids: String,
    pub status: String,
    pub processed_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub skipped_count: i64,
    pub errors: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub processing_time_ms: Option<i64>,
}

impl BatchRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            batch_number: row.get("batch_number")?,
            item_ids: row.get("item_ids")?,
            status: row.get("status")?,
            processed_count: row.get("processed_count")?,
            success_count: row.get("success_count")?,
            error_count: row.get("error_count")?,
            skipped_count: row.get("skipped_count")?,
            errors: row.get("errors")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            processing_time_ms: row.get("processing_time_ms")?,
        })
    }
}

/// Inserts every batch of a job in one transaction.
pub fn insert_all(db: &Database, batches: &[BatchRow]) -> Result<(), DatabaseError> {
    db.with_transaction(|conn| {
        let mut stmt = conn.prepare(
            "INSERT INTO migration_batches (id, job_id, batch_number, item_ids, status,
             processed_count, success_count, error_count, skipped_count, errors, started_at,
             completed_at, processing_time_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )?;
        for batch in batches {
            stmt.execute(params![
                batch.id,
                batch.job_id,
                batch.batch_number,
                batch.item_ids,
                batch.status,
                batch.processed_count,
                batch.success_count,
                batch.error_count,
                batch.skipped_count,
                batch.errors,
                batch.started_at,
                batch.completed_at,
                batch.processing_time_ms,
            ])?;
        }
        Ok(())
    })
}

/// Lists a job's batches in processing order.
pub fn list_by_job(db: &Database, job_id: &str) -> Result<Vec<BatchRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM migration_batches WHERE job_id = ?1 ORDER BY batch_number ASC",
        )?;
        let rows = stmt
            .query_map(params![job_id], BatchRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Overwrites the mutable progress fields of a batch. Membership
/// (`item_ids`, `batch_number`, `job_id`) is never touched.
pub fn update_progress(db: &Database, batch: &BatchRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE migration_batches SET status = ?2, processed_count = ?3, success_count = ?4,
             error_count = ?5, skipped_count = ?6, errors = ?7, started_at = ?8,
             completed_at = ?9, processing_time_ms = ?10
             WHERE id = ?1",
            params![
                batch.id,
                batch.status,
                batch.processed_count,
                batch.success_count,
                batch.error_count,
                batch.skipped_count,
                batch.errors,
                batch.started_at,
                batch.completed_at,
                batch.processing_time_ms,
            ],
        )?;
        Ok(())
    })
}
