//
// tracker.rs
// Dicom-Intake-rs
//
// Batch state machine. Counters only move through conditional updates on persisted state, so concurrent
// completions and redelivered jobs never double count.
//
// Thales Matheus Mendonça Santos - November 2025

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::config::BatchPolicy;
use crate::db::{self, Database, DbError};
use crate::models::BatchStatus;

/// Batch counters right after a file was counted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_id: String,
    pub processed_count: u32,
    pub failed_count: u32,
    pub total_count: u32,
    pub status: BatchStatus,
}

#[derive(Clone)]
pub struct BatchTracker {
    db: Arc<Database>,
    policy: BatchPolicy,
}

impl BatchTracker {
    pub fn new(db: Arc<Database>, policy: BatchPolicy) -> Self {
        Self { db, policy }
    }

    /// `queued -> processing`; a no-op for any other state.
    pub fn mark_processing(&self, batch_id: &str) -> Result<bool, DbError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE batches SET status = 'processing', updated_at = ?2
                 WHERE id = ?1 AND status = 'queued'",
                params![batch_id, db::ts(Utc::now())],
            )?;
            Ok(changed > 0)
        })
    }

    /// Count a terminal upload toward its batch, at most once.
    ///
    /// Returns the batch counters when this call advanced them, `None` when the upload is
    /// not terminal, was already counted, or belongs to no batch.
    pub fn record_terminal(&self, upload_id: &str) -> Result<Option<BatchProgress>, DbError> {
        let fail_fast = self.policy == BatchPolicy::FailFast;

        let progress = self.db.with_tx(|tx| {
            let flipped: Option<(Option<String>, String)> = tx
                .query_row(
                    "UPDATE uploads SET counted = 1
                     WHERE id = ?1 AND counted = 0 AND status IN ('completed', 'failed')
                     RETURNING batch_id, status",
                    [upload_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((Some(batch_id), upload_status)) = flipped else {
                return Ok(None);
            };
            let file_failed = i64::from(upload_status == "failed");

            // All SET expressions see the old row; RETURNING sees the new one.
            let progress = tx
                .query_row(
                    "UPDATE batches SET
                         processed_count = processed_count + 1,
                         failed_count = failed_count + ?2,
                         status = CASE
                             WHEN status = 'failed' THEN 'failed'
                             WHEN ?3 AND ?2 = 1 THEN 'failed'
                             WHEN processed_count + 1 = total_count THEN 'completed'
                             ELSE 'processing'
                         END,
                         updated_at = ?4
                     WHERE id = ?1 AND processed_count < total_count
                     RETURNING id, processed_count, failed_count, total_count, status",
                    params![batch_id, file_failed, fail_fast, db::ts(Utc::now())],
                    |row| {
                        Ok(BatchProgress {
                            batch_id: row.get(0)?,
                            processed_count: row.get(1)?,
                            failed_count: row.get(2)?,
                            total_count: row.get(3)?,
                            status: db::parse_col(row, 4)?,
                        })
                    },
                )
                .optional()?;

            if progress.is_none() {
                tracing::warn!(upload_id, batch_id = %batch_id, "batch already fully counted");
            }
            Ok(progress)
        })?;

        if let Some(p) = &progress {
            if p.processed_count == p.total_count {
                tracing::info!(
                    batch_id = %p.batch_id,
                    status = %p.status,
                    failed = p.failed_count,
                    total = p.total_count,
                    "batch finished"
                );
            } else {
                tracing::debug!(
                    batch_id = %p.batch_id,
                    processed = p.processed_count,
                    total = p.total_count,
                    "batch progress"
                );
            }
        }
        Ok(progress)
    }
}
