//! Event-log ingestion
//!
//! Walks a directory of newline-delimited JSON logs, normalizes each record
//! and upserts it into the graph. One transaction per event; a store error
//! aborts the current file, which is safe to re-run.

use crate::error::IngestError;
use crate::event::{normalize, FrontpageMode, RawEvent, ReadEvent};
use crate::graph_store::GraphStore;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

/// Per-line failure policy for a log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    /// First malformed line fails the whole file.
    Strict,
    /// Malformed lines are skipped and logged.
    Lenient,
}

impl IngestMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "strict" => Some(IngestMode::Strict),
            "lenient" => Some(IngestMode::Lenient),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub ingested: usize,
    /// Frontpage events dropped under `FrontpageMode::Discard`.
    pub discarded: usize,
    /// Malformed lines skipped in lenient mode.
    pub skipped: usize,
}

pub struct Ingestor<'a> {
    store: &'a GraphStore,
    frontpage_mode: FrontpageMode,
    ingest_mode: IngestMode,
}

impl<'a> Ingestor<'a> {
    pub fn new(store: &'a GraphStore, frontpage_mode: FrontpageMode, ingest_mode: IngestMode) -> Self {
        Self {
            store,
            frontpage_mode,
            ingest_mode,
        }
    }

    /// Ingest every file in the list, logging per-file timing. A store
    /// failure aborts the run at file granularity.
    pub async fn ingest_files(&self, files: &[PathBuf]) -> Result<FileReport> {
        let total = files.len();
        info!("📥 Starting import, nr of files: {}", total);

        let mut report = FileReport::default();
        for (nr, file) in files.iter().enumerate() {
            if !file.is_file() {
                continue;
            }
            let start = Instant::now();
            info!("📄 Filename: {:?}, nr: {}/{}", file, nr + 1, total);

            let file_report = self.ingest_file(file).await?;
            report.ingested += file_report.ingested;
            report.discarded += file_report.discarded;
            report.skipped += file_report.skipped;

            info!(
                "   File took: {:.2} minutes ({} events)",
                start.elapsed().as_secs_f64() / 60.0,
                file_report.ingested
            );
        }

        info!(
            "✅ Import complete: {} events ingested, {} discarded, {} skipped",
            report.ingested, report.discarded, report.skipped
        );
        Ok(report)
    }

    /// Parse and upsert a single log file: events first, then category
    /// edges matched by documentId, mirroring the two-phase write order.
    pub async fn ingest_file(&self, path: &Path) -> Result<FileReport> {
        let content = fs::read_to_string(path).map_err(|source| IngestError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let (events, report) = parse_log(&content, &path.display().to_string(), self.frontpage_mode, self.ingest_mode)?;

        self.store
            .insert_events(&events)
            .await
            .context("Failed to upsert events")?;

        for event in &events {
            self.store
                .attach_categories(&event.document_id, &event.categories)
                .await
                .context("Failed to upsert category edges")?;
        }

        Ok(report)
    }
}

/// Parse one file's worth of newline-delimited JSON into normalized events.
/// Pure with respect to the store; all sentinel substitution happens in
/// `event::normalize` before anything reaches a merge key.
pub fn parse_log(
    content: &str,
    file_label: &str,
    frontpage_mode: FrontpageMode,
    ingest_mode: IngestMode,
) -> Result<(Vec<ReadEvent>, FileReport), IngestError> {
    let mut events = Vec::new();
    let mut report = FileReport::default();

    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let raw: RawEvent = match serde_json::from_str(trimmed) {
            Ok(raw) => raw,
            Err(source) => {
                let err = IngestError::MalformedRecord {
                    file: file_label.to_string(),
                    line: idx + 1,
                    source,
                };
                match ingest_mode {
                    IngestMode::Strict => return Err(err),
                    IngestMode::Lenient => {
                        warn!("⚠️  Skipping line: {}", err);
                        report.skipped += 1;
                        continue;
                    }
                }
            }
        };

        // Timestamp errors are fatal in both modes: a guessed publish time
        // would fragment the Article merge key.
        match normalize(raw, frontpage_mode)? {
            Some(event) => {
                events.push(event);
                report.ingested += 1;
            }
            None => report.discarded += 1,
        }
    }

    Ok((events, report))
}

/// Sorted listing of a log directory split into (train, test) by ratio.
pub fn split_files(dir: &Path, train_ratio: f64) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read log directory {:?}", dir))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();

    let total = files.len();
    let train = ((total as f64 * train_ratio) as usize).min(total);
    info!(
        "📊 Split dataset - files, train: {}, test: {}",
        train,
        total - train
    );

    let test = files.split_off(train);
    Ok((files, test))
}
