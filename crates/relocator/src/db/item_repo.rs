//! Migration item repository. One row per attempt; terminal rows are frozen.

use std::collections::HashSet;

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw migration item (attempt) row.
#[derive(Debug, Clone)]
pub struct ItemRow {
    pub id: String,
    pub job_id: String,
    pub batch_id: String,
    pub photo_id: String,
    pub attempt: i64,
    pub original_path: Option<String>,
    pub original_size: Option<i64>,
    pub status: String,
    pub processed_size: Option<i64>,
    pub destination_keys: String,
    pub destination_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

impl ItemRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            batch_id: row.get("batch_id")?,
            photo_id: row.get("photo_id")?,
            attempt: row.get("attempt")?,
            original_path: row.get("original_path")?,
            original_size: row.get("original_size")?,
            status: row.get("status")?,
            processed_size: row.get("processed_size")?,
            destination_keys: row.get("destination_keys")?,
            destination_url: row.get("destination_url")?,
            thumbnail_url: row.get("thumbnail_url")?,
            error_message: row.get("error_message")?,
            error_code: row.get("error_code")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

const TERMINAL: &str = "('completed', 'failed')";

/// Inserts a new attempt row.
pub fn insert(db: &Database, item: &ItemRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO migration_items (id, job_id, batch_id, photo_id, attempt, original_path,
             original_size, status, processed_size, destination_keys, destination_url,
             thumbnail_url, error_message, error_code, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                item.id,
                item.job_id,
                item.batch_id,
                item.photo_id,
                item.attempt,
                item.original_path,
                item.original_size,
                item.status,
                item.processed_size,
                item.destination_keys,
                item.destination_url,
                item.thumbnail_url,
                item.error_message,
                item.error_code,
                item.started_at,
                item.completed_at,
            ],
        )?;
        Ok(())
    })
}

/// Returns the attempt number the next row for this photo should carry.
pub fn next_attempt(db: &Database, job_id: &str, photo_id: &str) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        let max: i64 = conn.query_row(
            "SELECT COALESCE(MAX(attempt), 0) FROM migration_items
             WHERE job_id = ?1 AND photo_id = ?2",
            params![job_id, photo_id],
            |r| r.get(0),
        )?;
        Ok(max + 1)
    })
}

/// Writes the outcome of an attempt. Refuses to touch a row that is
/// already terminal.
pub fn finish(db: &Database, item: &ItemRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            &format!(
                "UPDATE migration_items SET status = ?2, processed_size = ?3,
                 destination_keys = ?4, destination_url = ?5, thumbnail_url = ?6,
                 error_message = ?7, error_code = ?8, completed_at = ?9
                 WHERE id = ?1 AND status NOT IN {}",
                TERMINAL
            ),
            params![
                item.id,
                item.status,
                item.processed_size,
                item.destination_keys,
                item.destination_url,
                item.thumbnail_url,
                item.error_message,
                item.error_code,
                item.completed_at,
            ],
        )?;
        if changed == 0 {
            return Err(DatabaseError::AlreadySet {
                column: "status",
                id: item.id.clone(),
            });
        }
        Ok(())
    })
}

/// Lists a job's attempts, optionally filtered by status, oldest first.
pub fn list_by_job(
    db: &Database,
    job_id: &str,
    status: Option<&str>,
) -> Result<Vec<ItemRow>, DatabaseError> {
    db.with_conn(|conn| {
        let rows = match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM migration_items WHERE job_id = ?1 AND status = ?2
                     ORDER BY started_at ASC, attempt ASC",
                )?;
                let rows = stmt
                    .query_map(params![job_id, status], ItemRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM migration_items WHERE job_id = ?1
                     ORDER BY started_at ASC, attempt ASC",
                )?;
                let rows = stmt
                    .query_map(params![job_id], ItemRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(rows)
    })
}

/// Photo IDs within a batch that already reached a terminal outcome.
pub fn terminal_photo_ids(db: &Database, batch_id: &str) -> Result<HashSet<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT photo_id FROM migration_items
             WHERE batch_id = ?1 AND status IN {}",
            TERMINAL
        ))?;
        let ids = stmt
            .query_map(params![batch_id], |r| r.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    })
}
