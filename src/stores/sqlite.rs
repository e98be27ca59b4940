/*!
SQLite metadata store.

Implements the relational `MetaStore` over sqlx: `documents`, `jobs`, and
`processing_records` tables. Timestamps are stored as RFC 3339 text and the
extensible fields (document metadata, full job snapshot) as JSON columns, so
the schema stays queryable while round-trips stay lossless.

Schema bootstrap runs on connect and is idempotent; external migration
tooling can own the schema instead by pointing the store at an existing
database.
*/

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use crate::errors::StoreError;
use crate::ids::{DocId, JobId};
use crate::jobs::Job;
use crate::model::{Document, SourceType, Tier};

use super::{MetaStore, ProcessingRecord};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS documents (
        doc_id TEXT PRIMARY KEY,
        source_url TEXT NOT NULL,
        source_type TEXT NOT NULL,
        title TEXT,
        author TEXT,
        published_at TEXT,
        quality_score REAL NOT NULL,
        tier TEXT NOT NULL,
        created_at TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}'
    )",
    "CREATE TABLE IF NOT EXISTS jobs (
        job_id TEXT PRIMARY KEY,
        doc_id TEXT NOT NULL,
        status TEXT NOT NULL,
        priority INTEGER NOT NULL,
        attempts INTEGER NOT NULL,
        current_stage TEXT,
        progress_pct INTEGER NOT NULL,
        error TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        snapshot TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS processing_records (
        record_id TEXT PRIMARY KEY,
        doc_id TEXT NOT NULL,
        operation TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        error TEXT,
        metadata TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_jobs_doc_id ON jobs(doc_id)",
    "CREATE INDEX IF NOT EXISTS idx_processing_records_doc_id ON processing_records(doc_id)",
];

pub struct SqliteMetaStore {
    pool: Arc<SqlitePool>,
}

impl std::fmt::Debug for SqliteMetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteMetaStore").finish()
    }
}

impl SqliteMetaStore {
    /// Connect (or create) a SQLite database at `database_url`, e.g.
    /// `sqlite://citeloom.db`. Bootstraps the schema idempotently.
    #[instrument(skip(database_url), err)]
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        // Make sure the underlying file exists; SQLite will not create it
        // through a plain connect.
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            let path = path.trim();
            if !path.is_empty() && path != ":memory:" {
                let p = std::path::Path::new(path);
                if let Some(parent) = p.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if !p.exists() {
                    let _ = std::fs::File::create_new(p);
                }
            }
        }
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(StoreError::backend)?;
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(StoreError::backend)?;
        }
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

fn to_rfc3339(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.to_rfc3339())
}

fn parse_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|err| StoreError::Serialization {
                message: format!("bad timestamp '{s}': {err}"),
            })
    })
    .transpose()
}

#[async_trait]
impl MetaStore for SqliteMetaStore {
    #[instrument(skip(self, document), fields(doc_id = %document.doc_id), err)]
    async fn upsert_document(&self, document: &Document) -> Result<(), StoreError> {
        let metadata =
            serde_json::to_string(&document.metadata).map_err(|err| StoreError::Serialization {
                message: err.to_string(),
            })?;
        sqlx::query(
            "INSERT INTO documents
                (doc_id, source_url, source_type, title, author, published_at,
                 quality_score, tier, created_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(doc_id) DO UPDATE SET
                source_url = excluded.source_url,
                source_type = excluded.source_type,
                title = excluded.title,
                author = excluded.author,
                published_at = excluded.published_at,
                quality_score = excluded.quality_score,
                tier = excluded.tier,
                metadata = excluded.metadata",
        )
        .bind(document.doc_id.as_str())
        .bind(&document.source_url)
        .bind(document.source_type.as_str())
        .bind(&document.title)
        .bind(&document.author)
        .bind(to_rfc3339(document.published_at))
        .bind(document.quality_score)
        .bind(document.tier.as_str())
        .bind(document.created_at.to_rfc3339())
        .bind(metadata)
        .execute(&*self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn get_document(&self, doc_id: &DocId) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query("SELECT * FROM documents WHERE doc_id = ?1")
            .bind(doc_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(StoreError::backend)?;
        row.map(|row| {
            let source_type_raw: String = row.try_get("source_type").map_err(StoreError::backend)?;
            let tier_raw: String = row.try_get("tier").map_err(StoreError::backend)?;
            let metadata_raw: String = row.try_get("metadata").map_err(StoreError::backend)?;
            let created_raw: String = row.try_get("created_at").map_err(StoreError::backend)?;
            Ok(Document {
                doc_id: DocId::from(
                    row.try_get::<String, _>("doc_id")
                        .map_err(StoreError::backend)?,
                ),
                source_url: row.try_get("source_url").map_err(StoreError::backend)?,
                source_type: SourceType::parse(&source_type_raw).ok_or_else(|| {
                    StoreError::Serialization {
                        message: format!("unknown source_type '{source_type_raw}'"),
                    }
                })?,
                title: row.try_get("title").map_err(StoreError::backend)?,
                author: row.try_get("author").map_err(StoreError::backend)?,
                published_at: parse_ts(
                    row.try_get("published_at").map_err(StoreError::backend)?,
                )?,
                quality_score: row.try_get("quality_score").map_err(StoreError::backend)?,
                tier: Tier::parse(&tier_raw).ok_or_else(|| StoreError::Serialization {
                    message: format!("unknown tier '{tier_raw}'"),
                })?,
                created_at: parse_ts(Some(created_raw))?.unwrap_or_else(Utc::now),
                metadata: serde_json::from_str(&metadata_raw).map_err(|err| {
                    StoreError::Serialization {
                        message: err.to_string(),
                    }
                })?,
            })
        })
        .transpose()
    }

    async fn delete_document(&self, doc_id: &DocId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM documents WHERE doc_id = ?1")
            .bind(doc_id.as_str())
            .execute(&*self.pool)
            .await
            .map_err(StoreError::backend)?;
        sqlx::query("DELETE FROM processing_records WHERE doc_id = ?1")
            .bind(doc_id.as_str())
            .execute(&*self.pool)
            .await
            .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn list_document_ids(&self) -> Result<Vec<DocId>, StoreError> {
        let rows = sqlx::query("SELECT doc_id FROM documents ORDER BY doc_id")
            .fetch_all(&*self.pool)
            .await
            .map_err(StoreError::backend)?;
        rows.into_iter()
            .map(|row| {
                Ok(DocId::from(
                    row.try_get::<String, _>("doc_id")
                        .map_err(StoreError::backend)?,
                ))
            })
            .collect()
    }

    #[instrument(skip(self, job), fields(job_id = %job.job_id), err)]
    async fn upsert_job(&self, job: &Job) -> Result<(), StoreError> {
        let snapshot = serde_json::to_string(job).map_err(|err| StoreError::Serialization {
            message: err.to_string(),
        })?;
        let error = job
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|err| StoreError::Serialization {
                message: err.to_string(),
            })?;
        sqlx::query(
            "INSERT INTO jobs
                (job_id, doc_id, status, priority, attempts, current_stage,
                 progress_pct, error, created_at, started_at, completed_at, snapshot)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(job_id) DO UPDATE SET
                status = excluded.status,
                priority = excluded.priority,
                attempts = excluded.attempts,
                current_stage = excluded.current_stage,
                progress_pct = excluded.progress_pct,
                error = excluded.error,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                snapshot = excluded.snapshot",
        )
        .bind(job.job_id.as_str())
        .bind(job.doc_id.as_str())
        .bind(job.status.as_str())
        .bind(job.priority as i64)
        .bind(job.attempts as i64)
        .bind(&job.current_stage)
        .bind(job.progress_pct as i64)
        .bind(error)
        .bind(job.created_at.to_rfc3339())
        .bind(to_rfc3339(job.started_at))
        .bind(to_rfc3339(job.completed_at))
        .bind(snapshot)
        .execute(&*self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT snapshot FROM jobs WHERE job_id = ?1")
            .bind(job_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(StoreError::backend)?;
        row.map(|row| {
            let snapshot: String = row.try_get("snapshot").map_err(StoreError::backend)?;
            serde_json::from_str(&snapshot).map_err(|err| StoreError::Serialization {
                message: err.to_string(),
            })
        })
        .transpose()
    }

    async fn record_processing(&self, record: &ProcessingRecord) -> Result<(), StoreError> {
        let metadata = record.metadata.to_string();
        sqlx::query(
            "INSERT OR REPLACE INTO processing_records
                (record_id, doc_id, operation, status, started_at, completed_at, error, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&record.record_id)
        .bind(record.doc_id.as_str())
        .bind(&record.operation)
        .bind(&record.status)
        .bind(record.started_at.to_rfc3339())
        .bind(to_rfc3339(record.completed_at))
        .bind(&record.error)
        .bind(metadata)
        .execute(&*self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn processing_records(
        &self,
        doc_id: &DocId,
    ) -> Result<Vec<ProcessingRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM processing_records WHERE doc_id = ?1 ORDER BY started_at",
        )
        .bind(doc_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(StoreError::backend)?;
        rows.into_iter()
            .map(|row| {
                let started_raw: String = row.try_get("started_at").map_err(StoreError::backend)?;
                let metadata_raw: Option<String> =
                    row.try_get("metadata").map_err(StoreError::backend)?;
                Ok(ProcessingRecord {
                    record_id: row.try_get("record_id").map_err(StoreError::backend)?,
                    doc_id: DocId::from(
                        row.try_get::<String, _>("doc_id")
                            .map_err(StoreError::backend)?,
                    ),
                    operation: row.try_get("operation").map_err(StoreError::backend)?,
                    status: row.try_get("status").map_err(StoreError::backend)?,
                    started_at: parse_ts(Some(started_raw))?.unwrap_or_else(Utc::now),
                    completed_at: parse_ts(
                        row.try_get("completed_at").map_err(StoreError::backend)?,
                    )?,
                    error: row.try_get("error").map_err(StoreError::backend)?,
                    metadata: metadata_raw
                        .and_then(|raw| serde_json::from_str(&raw).ok())
                        .unwrap_or(serde_json::Value::Null),
                })
            })
            .collect()
    }
}
