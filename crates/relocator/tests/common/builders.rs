//! Builders for creating test data programmatically.

#![allow(dead_code)]

use chrono::{Duration, TimeZone, Utc};

use relocator::config::{MigrationConfig, RetryPolicy};
use relocator::db::photo_repo::PhotoRow;

/// Key the harness stores a record's original under.
pub fn source_key(id: &str) -> String {
    format!("originals/{}.jpg", id)
}

/// Bytes the harness stores as a record's original.
pub fn source_bytes(id: &str) -> Vec<u8> {
    format!("image-bytes-{}", id).into_bytes()
}

/// Stable id for the n-th seeded record.
pub fn photo_id(index: usize) -> String {
    format!("photo-{:03}", index)
}

/// Builder for source `photos` rows.
pub struct PhotoBuilder {
    row: PhotoRow,
}

impl PhotoBuilder {
    /// A record with a local original, created `index` seconds after a fixed
    /// epoch so listing order follows `index`.
    pub fn new(id: &str, index: usize) -> Self {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
            + Duration::seconds(index as i64);
        Self {
            row: PhotoRow {
                id: id.to_string(),
                item_id: Some(format!("item-{}", index)),
                file_path: Some(source_key(id)),
                file_size: Some(source_bytes(id).len() as i64),
                mime_type: Some("image/jpeg".to_string()),
                storage_key: None,
                storage_url: None,
                thumbnail_url: None,
                created_at: created.to_rfc3339(),
                updated_at: created.to_rfc3339(),
            },
        }
    }

    /// Marks the record as already living at `key`.
    pub fn migrated(mut self, key: &str) -> Self {
        self.row.storage_key = Some(key.to_string());
        self.row.storage_url = Some(format!("https://cdn.test/{}", key));
        self
    }

    pub fn without_file(mut self) -> Self {
        self.row.file_path = None;
        self
    }

    pub fn file_size(mut self, size: i64) -> Self {
        self.row.file_size = Some(size);
        self
    }

    pub fn build(self) -> PhotoRow {
        self.row
    }
}

/// Builder for `MigrationConfig` with millisecond retry delays.
pub struct MigrationConfigBuilder {
    config: MigrationConfig,
}

impl MigrationConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: MigrationConfig {
                retry: RetryPolicy {
                    max_retries: 2,
                    initial_delay_ms: 1,
                    max_delay_ms: 5,
                    backoff_multiplier: 2.0,
                },
                pause_on_error_threshold: None,
                ..MigrationConfig::default()
            },
        }
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn pause_on_errors(mut self, threshold: u64) -> Self {
        self.config.pause_on_error_threshold = Some(threshold);
        self
    }

    pub fn validate_after(mut self, enabled: bool) -> Self {
        self.config.validate_after = enabled;
        self
    }

    pub fn cleanup_source(mut self, enabled: bool) -> Self {
        self.config.cleanup_source = enabled;
        self
    }

    pub fn cost_protection(mut self, enabled: bool) -> Self {
        self.config.enable_cost_protection = enabled;
        self
    }

    pub fn build(self) -> MigrationConfig {
        self.config
    }
}

impl Default for MigrationConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
