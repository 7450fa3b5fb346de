//! The per-item step: read the original, transcode it on the worker pool,
//! upload every produced format.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{MigrationConfig, OutputFormat, TranscodeOptions};
use crate::error::{MigrationError, StorageError};
use crate::guard::{CircuitBreaker, OperationType, UsageRecorder};
use crate::storage::{ObjectStore, StoredObject};
use crate::worker::{TaskRegistry, WorkerPool};

use super::collaborators::{ErrorTracker, LogErrorTracker};
use super::model::{MigratedLocation, PhotoRecord};
use super::retry::with_retry;

/// Pool method name the processor dispatches to.
pub const TRANSCODE_METHOD: &str = "transcode";

/// Migrates a single record's asset and reports where it landed.
pub trait ItemProcessor: Send + Sync {
    fn process(
        &self,
        photo: &PhotoRecord,
        config: &MigrationConfig,
    ) -> Result<MigratedLocation, MigrationError>;
}

/// Produces one output format from the original bytes. Runs on a pool
/// worker; a panic counts as a worker crash.
pub trait Transcoder: Send + Sync {
    fn transcode(
        &self,
        input: &[u8],
        format: OutputFormat,
        options: &TranscodeOptions,
    ) -> Result<Vec<u8>, String>;
}

/// Emits the original bytes for every format.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughTranscoder;

impl Transcoder for PassthroughTranscoder {
    fn transcode(
        &self,
        input: &[u8],
        _format: OutputFormat,
        _options: &TranscodeOptions,
    ) -> Result<Vec<u8>, String> {
        if input.is_empty() {
            return Err("empty input".to_string());
        }
        Ok(input.to_vec())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TranscodeRequest {
    photo_id: String,
    mime_type: Option<String>,
    data: String,
    options: TranscodeOptions,
}

#[derive(Debug, Serialize, Deserialize)]
struct TranscodedFormat {
    format: OutputFormat,
    data: String,
    size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct FormatFailure {
    format: OutputFormat,
    error: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TranscodeResponse {
    outputs: Vec<TranscodedFormat>,
    failures: Vec<FormatFailure>,
}

/// Registers the `transcode` task backed by `transcoder`.
///
/// Each requested format is produced independently; a format that fails is
/// reported alongside the ones that succeeded. The task only fails when no
/// format could be produced.
pub fn register_transcoder(registry: &mut TaskRegistry, transcoder: Arc<dyn Transcoder>) {
    registry.register(TRANSCODE_METHOD, move |args: Value| {
        let request: TranscodeRequest = serde_json::from_value(args)
            .map_err(|e| format!("invalid transcode request: {}", e))?;
        let input = BASE64
            .decode(request.data.as_bytes())
            .map_err(|e| format!("invalid payload for {}: {}", request.photo_id, e))?;

        let mut response = TranscodeResponse::default();
        for &format in &request.options.formats {
            match transcoder.transcode(&input, format, &request.options) {
                Ok(bytes) => response.outputs.push(TranscodedFormat {
                    format,
                    size: bytes.len() as u64,
                    data: BASE64.encode(&bytes),
                }),
                Err(error) => response.failures.push(FormatFailure { format, error }),
            }
        }

        if response.outputs.is_empty() {
            let reasons: Vec<String> = response
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.format, f.error))
                .collect();
            return Err(format!(
                "no format produced for {} ({})",
                request.photo_id,
                reasons.join("; ")
            ));
        }
        serde_json::to_value(response).map_err(|e| e.to_string())
    });
}

/// Destination key for one format of a record.
pub fn destination_key(photo_id: &str, format: OutputFormat) -> String {
    format!("photos/{}/{}.{}", photo_id, format, format.extension())
}

/// Runs the transformation on a `WorkerPool` and writes results to the
/// destination store, through the circuit breaker when one is attached.
pub struct PoolItemProcessor {
    pool: Arc<WorkerPool>,
    source: Arc<dyn ObjectStore>,
    destination: Arc<dyn ObjectStore>,
    breaker: Option<Arc<CircuitBreaker>>,
    error_tracker: Arc<dyn ErrorTracker>,
    usage: Option<Arc<dyn UsageRecorder>>,
    task_timeout: Option<Duration>,
}

impl PoolItemProcessor {
    pub fn new(
        pool: Arc<WorkerPool>,
        source: Arc<dyn ObjectStore>,
        destination: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            pool,
            source,
            destination,
            breaker: None,
            error_tracker: Arc::new(LogErrorTracker),
            usage: None,
            task_timeout: None,
        }
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_error_tracker(mut self, tracker: Arc<dyn ErrorTracker>) -> Self {
        self.error_tracker = tracker;
        self
    }

    /// Reports every download, upload and discarded upload to `recorder`.
    pub fn with_usage_recorder(mut self, recorder: Arc<dyn UsageRecorder>) -> Self {
        self.usage = Some(recorder);
        self
    }

    /// Overrides the pool's default task timeout for transcode tasks.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    fn record(&self, operation: OperationType, size: u64) {
        if let Some(usage) = &self.usage {
            usage.record(operation, size, 1);
        }
    }

    fn transcode(
        &self,
        photo: &PhotoRecord,
        bytes: &[u8],
        config: &MigrationConfig,
    ) -> Result<TranscodeResponse, MigrationError> {
        let request = TranscodeRequest {
            photo_id: photo.id.clone(),
            mime_type: photo.mime_type.clone(),
            data: BASE64.encode(bytes),
            options: config.transcode.clone(),
        };
        let args = serde_json::to_value(&request)
            .map_err(|e| MigrationError::Transform(e.to_string()))?;

        let value = with_retry(
            &config.retry,
            "transcode",
            self.error_tracker.as_ref(),
            self.breaker.as_deref(),
            || {
                self.pool
                    .exec_wait(TRANSCODE_METHOD, args.clone(), self.task_timeout)
                    .map_err(MigrationError::from)
            },
        )?;
        serde_json::from_value(value).map_err(|e| MigrationError::Transform(e.to_string()))
    }

    fn upload(
        &self,
        data: &[u8],
        key: &str,
        content_type: &str,
        config: &MigrationConfig,
    ) -> Result<StoredObject, MigrationError> {
        let object = with_retry(
            &config.retry,
            "upload",
            self.error_tracker.as_ref(),
            self.breaker.as_deref(),
            || {
                let put = || {
                    self.destination
                        .put(data, key, content_type)
                        .map_err(MigrationError::from)
                };
                match &self.breaker {
                    Some(breaker) => breaker.call(put),
                    None => put(),
                }
            },
        )?;
        self.record(OperationType::Upload, object.size);
        Ok(object)
    }

    /// Best-effort removal of objects written before a later upload failed.
    fn discard(&self, uploaded: &[(OutputFormat, StoredObject)]) {
        for (_, object) in uploaded {
            match self.destination.delete(&object.key) {
                Ok(()) => self.record(OperationType::Delete, object.size),
                Err(StorageError::NotFound { .. }) => {}
                Err(e) => warn!("Failed to remove partial upload {}: {}", object.key, e),
            }
        }
    }
}

impl ItemProcessor for PoolItemProcessor {
    fn process(
        &self,
        photo: &PhotoRecord,
        config: &MigrationConfig,
    ) -> Result<MigratedLocation, MigrationError> {
        let source_key = photo.file_path.as_deref().ok_or_else(|| {
            MigrationError::Storage(StorageError::NotFound {
                key: photo.id.clone(),
            })
        })?;

        let original = with_retry(
            &config.retry,
            "download",
            self.error_tracker.as_ref(),
            self.breaker.as_deref(),
            || self.source.get(source_key).map_err(MigrationError::from),
        )?;
        self.record(OperationType::Download, original.len() as u64);

        let response = self.transcode(photo, &original, config)?;
        for failure in &response.failures {
            warn!(
                "Photo {}: {} output failed: {}",
                photo.id, failure.format, failure.error
            );
        }

        let mut uploaded: Vec<(OutputFormat, StoredObject)> = Vec::new();
        for output in &response.outputs {
            let data = BASE64
                .decode(output.data.as_bytes())
                .map_err(|e| MigrationError::Transform(e.to_string()));
            let key = destination_key(&photo.id, output.format);
            let result = data.and_then(|data| {
                self.upload(&data, &key, output.format.content_type(), config)
            });
            match result {
                Ok(object) => uploaded.push((output.format, object)),
                Err(e) => {
                    self.discard(&uploaded);
                    return Err(e);
                }
            }
        }

        let primary = uploaded
            .iter()
            .find(|(format, _)| *format != OutputFormat::Thumbnail)
            .or_else(|| uploaded.first())
            .map(|(_, object)| object.clone())
            .ok_or_else(|| MigrationError::Transform("no output produced".to_string()))?;
        let thumbnail_url = uploaded
            .iter()
            .find(|(format, _)| *format == OutputFormat::Thumbnail)
            .map(|(_, object)| object.url.clone());

        debug!(
            "Photo {} migrated to {} ({} objects)",
            photo.id,
            primary.key,
            uploaded.len()
        );

        // Primary first; rollback and validation read it from there.
        let mut destination_keys = vec![primary.key.clone()];
        destination_keys.extend(
            uploaded
                .iter()
                .map(|(_, o)| o.key.clone())
                .filter(|key| *key != primary.key),
        );

        Ok(MigratedLocation {
            storage_key: primary.key,
            storage_url: primary.url,
            thumbnail_url,
            processed_size: uploaded.iter().map(|(_, o)| o.size).sum(),
            destination_keys,
        })
    }
}
