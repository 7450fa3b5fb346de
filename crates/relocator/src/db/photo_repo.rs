//! Photo repository: the source records a migration reads and rewrites.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A raw photo row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoRow {
    pub id: String,
    pub item_id: Option<String>,
    pub file_path: Option<String>,
    pub file_size: Option<i64>,
    pub mime_type: Option<String>,
    pub storage_key: Option<String>,
    pub storage_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl PhotoRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            item_id: row.get("item_id")?,
            file_path: row.get("file_path")?,
            file_size: row.get("file_size")?,
            mime_type: row.get("mime_type")?,
            storage_key: row.get("storage_key")?,
            storage_url: row.get("storage_url")?,
            thumbnail_url: row.get("thumbnail_url")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

const ELIGIBLE: &str = "file_path IS NOT NULL AND storage_key IS NULL";

/// Inserts a new photo row.
pub fn insert(db: &Database, photo: &PhotoRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO photos (id, item_id, file_path, file_size, mime_type, storage_key,
             storage_url, thumbnail_url, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                photo.id,
                photo.item_id,
                photo.file_path,
                photo.file_size,
                photo.mime_type,
                photo.storage_key,
                photo.storage_url,
                photo.thumbnail_url,
                photo.created_at,
                photo.updated_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds a photo by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<PhotoRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM photos WHERE id = ?1",
                params![id],
                PhotoRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Loads several photos in one locked pass, preserving the order of `ids`.
/// Missing IDs are skipped.
pub fn find_many(db: &Database, ids: &[String]) -> Result<Vec<PhotoRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM photos WHERE id = ?1")?;
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = stmt
                .query_row(params![id], PhotoRow::from_row)
                .optional()?
            {
                rows.push(row);
            }
        }
        Ok(rows)
    })
}

/// Counts photos still stored on the legacy backend.
pub fn count_eligible(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM photos WHERE {}", ELIGIBLE),
            [],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Lists eligible photo IDs in stable order (oldest first).
pub fn list_eligible_ids(db: &Database) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT id FROM photos WHERE {} ORDER BY created_at ASC, id ASC",
            ELIGIBLE
        ))?;
        let ids = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    })
}

/// Points a photo at its migrated location.
pub fn set_storage_location(
    db: &Database,
    id: &str,
    storage_key: &str,
    storage_url: &str,
    thumbnail_url: Option<&str>,
    updated_at: &str,
) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE photos SET storage_key = ?2, storage_url = ?3, thumbnail_url = ?4,
             updated_at = ?5 WHERE id = ?1",
            params![id, storage_key, storage_url, thumbnail_url, updated_at],
        )?;
        Ok(changed)
    })
}

/// Clears the local file reference after the source blob has been removed.
pub fn clear_file_path(db: &Database, id: &str, updated_at: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE photos SET file_path = NULL, updated_at = ?2 WHERE id = ?1",
            params![id, updated_at],
        )?;
        Ok(changed)
    })
}

/// Writes back every location field of a photo exactly as given.
pub fn restore(db: &Database, photo: &PhotoRow, updated_at: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE photos SET file_path = ?2, file_size = ?3, mime_type = ?4, storage_key = ?5,
             storage_url = ?6, thumbnail_url = ?7, updated_at = ?8 WHERE id = ?1",
            params![
                photo.id,
                photo.file_path,
                photo.file_size,
                photo.mime_type,
                photo.storage_key,
                photo.storage_url,
                photo.thumbnail_url,
                updated_at,
            ],
        )?;
        Ok(changed)
    })
}
