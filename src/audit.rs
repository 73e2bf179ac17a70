//
// audit.rs
// Dicom-Intake-rs
//
// Append-only audit trail: one event per stage outcome, retry and terminal status of every upload.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::db::{self, Database, DbError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Ingress,
    Validation,
    Conversion,
    Anonymization,
    Sealing,
    Persistence,
    Dispatch,
    Pipeline,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Ingress => "ingress",
            Stage::Validation => "validation",
            Stage::Conversion => "conversion",
            Stage::Anonymization => "anonymization",
            Stage::Sealing => "sealing",
            Stage::Persistence => "persistence",
            Stage::Dispatch => "dispatch",
            Stage::Pipeline => "pipeline",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Accepted,
    Rejected,
    Success,
    Failure,
    Retry,
    DeadLetter,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Accepted => "accepted",
            Outcome::Rejected => "rejected",
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Retry => "retry",
            Outcome::DeadLetter => "dead-letter",
        }
    }
}

/// An event about to be written.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub upload_id: Option<String>,
    pub batch_id: Option<String>,
    pub stage: Stage,
    pub outcome: Outcome,
    pub actor: String,
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn upload(upload_id: impl Into<String>, stage: Stage, outcome: Outcome) -> Self {
        Self {
            upload_id: Some(upload_id.into()),
            batch_id: None,
            stage,
            outcome,
            actor: "system".to_string(),
            detail: None,
        }
    }

    pub fn with_batch(mut self, batch_id: Option<&str>) -> Self {
        self.batch_id = batch_id.map(str::to_string);
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// A stored event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub upload_id: Option<String>,
    pub batch_id: Option<String>,
    pub stage: String,
    pub outcome: String,
    pub actor: String,
    pub detail: Option<String>,
}

#[derive(Clone)]
pub struct AuditLog {
    db: Arc<Database>,
}

impl AuditLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn record(&self, event: &AuditEvent) -> Result<i64, DbError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_events (timestamp, upload_id, batch_id, stage, outcome, actor, detail)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    db::ts(Utc::now()),
                    event.upload_id,
                    event.batch_id,
                    event.stage.as_str(),
                    event.outcome.as_str(),
                    event.actor,
                    event.detail,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Record an event; a failed write is logged and otherwise ignored.
    pub fn emit(&self, event: AuditEvent) {
        if let Err(err) = self.record(&event) {
            tracing::warn!(
                upload_id = event.upload_id.as_deref().unwrap_or("-"),
                stage = %event.stage,
                error = %err,
                "failed to write audit event"
            );
        }
    }

    /// Events for one upload, oldest first.
    pub fn for_upload(&self, upload_id: &str) -> Result<Vec<AuditRecord>, DbError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, upload_id, batch_id, stage, outcome, actor, detail
                 FROM audit_events WHERE upload_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map([upload_id], |row| {
                Ok(AuditRecord {
                    id: row.get(0)?,
                    timestamp: db::ts_col(row, 1)?,
                    upload_id: row.get(2)?,
                    batch_id: row.get(3)?,
                    stage: row.get(4)?,
                    outcome: row.get(5)?,
                    actor: row.get(6)?,
                    detail: row.get(7)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }
}
