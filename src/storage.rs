//! Result persistence.
//!
//! The store holds an audit copy of session summaries and classification
//! rows. It is written off the hot path: the registry sends `StoreCommand`s
//! over an mpsc channel to a writer thread and never waits on the database.
//! While a session is resident the in-process log stays authoritative;
//! `results_verify` recomputes metrics from the stored rows and
//! cross-checks them against the stored summary.

use std::sync::mpsc;
use std::thread;

use anyhow::Result;
use log::warn;
use rand::RngCore;
use rusqlite::{params, Connection, OpenFlags};

use crate::{ClassificationResult, SessionStatus};

/// Stored summary row for one session.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub video_id: String,
    pub status: SessionStatus,
    pub tolerance_seconds: f64,
    pub total_ground_truth: u64,
    pub ignored_detections: u64,
    pub created_epoch_s: u64,
    pub completed_epoch_s: Option<u64>,
    pub failure_reason: Option<String>,
}

pub trait ResultsStore {
    /// Insert or replace the summary row for a session. Lifecycle updates
    /// resend the full record.
    fn record_session(&mut self, record: &SessionRecord) -> Result<()>;

    /// Append one classification row. `(session_id, seq)` is unique;
    /// duplicate appends are ignored, keeping the first write.
    fn append_classification(
        &mut self,
        session_id: &str,
        result: &ClassificationResult,
    ) -> Result<()>;

    fn load_session(&mut self, session_id: &str) -> Result<Option<SessionRecord>>;

    /// Classification rows for one session, in admission (seq) order.
    fn load_classifications(&mut self, session_id: &str) -> Result<Vec<ClassificationResult>>;

    fn list_sessions(&mut self) -> Result<Vec<SessionRecord>>;
}

// -------------------- Writer Thread --------------------

/// Write commands sent to the store writer thread.
#[derive(Debug)]
pub enum StoreCommand {
    UpsertSession(SessionRecord),
    AppendClassification {
        session_id: String,
        result: ClassificationResult,
    },
}

/// Drain store commands on a dedicated thread so admission never blocks on
/// the database. Write errors are logged and the command dropped; the store
/// is an audit copy, not the source of truth. The thread exits once every
/// sender is gone, so joining the handle flushes the queue.
pub fn spawn_store_writer(
    mut store: Box<dyn ResultsStore + Send>,
    rx: mpsc::Receiver<StoreCommand>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for command in rx {
            let outcome = match &command {
                StoreCommand::UpsertSession(record) => store.record_session(record),
                StoreCommand::AppendClassification { session_id, result } => {
                    store.append_classification(session_id, result)
                }
            };
            if let Err(err) = outcome {
                warn!("store writer: dropped write: {:#}", err);
            }
        }
    })
}

// -------------------- SQLite --------------------

/// URI for a process-shared in-memory database, for tests and the demo.
/// The database lives as long as at least one connection holds it open.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:scoring_engine_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

pub struct SqliteResultsStore {
    conn: Connection,
}

impl SqliteResultsStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS sessions (
              session_id TEXT PRIMARY KEY,
              video_id TEXT NOT NULL,
              status TEXT NOT NULL,
              tolerance_seconds REAL NOT NULL,
              total_ground_truth INTEGER NOT NULL,
              ignored_detections INTEGER NOT NULL,
              created_epoch_s INTEGER NOT NULL,
              completed_epoch_s INTEGER,
              failure_reason TEXT
            );

            CREATE TABLE IF NOT EXISTS classifications (
              session_id TEXT NOT NULL,
              seq INTEGER NOT NULL,
              timestamp REAL NOT NULL,
              class_label TEXT NOT NULL,
              confidence REAL NOT NULL,
              outcome TEXT NOT NULL,
              matched_ground_truth_id TEXT,
              PRIMARY KEY (session_id, seq)
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_created
              ON sessions(created_epoch_s);
            "#,
        )?;
        Ok(())
    }
}

fn record_from_row(row: &rusqlite::Row<'_>) -> Result<SessionRecord> {
    let status_raw: String = row.get(2)?;
    let completed: Option<i64> = row.get(7)?;
    Ok(SessionRecord {
        session_id: row.get(0)?,
        video_id: row.get(1)?,
        status: status_raw.parse()?,
        tolerance_seconds: row.get(3)?,
        total_ground_truth: row.get::<_, i64>(4)? as u64,
        ignored_detections: row.get::<_, i64>(5)? as u64,
        created_epoch_s: row.get::<_, i64>(6)? as u64,
        completed_epoch_s: completed.map(|v| v as u64),
        failure_reason: row.get(8)?,
    })
}

const SESSION_COLUMNS: &str = "session_id, video_id, status, tolerance_seconds, \
     total_ground_truth, ignored_detections, created_epoch_s, completed_epoch_s, \
     failure_reason";

impl ResultsStore for SqliteResultsStore {
    fn record_session(&mut self, record: &SessionRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO sessions(session_id, video_id, status,
              tolerance_seconds, total_ground_truth, ignored_detections,
              created_epoch_s, completed_epoch_s, failure_reason)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.session_id,
                record.video_id,
                record.status.as_str(),
                record.tolerance_seconds,
                record.total_ground_truth as i64,
                record.ignored_detections as i64,
                record.created_epoch_s as i64,
                record.completed_epoch_s.map(|v| v as i64),
                record.failure_reason,
            ],
        )?;
        Ok(())
    }

    fn append_classification(
        &mut self,
        session_id: &str,
        result: &ClassificationResult,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR IGNORE INTO classifications(session_id, seq, timestamp,
              class_label, confidence, outcome, matched_ground_truth_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                session_id,
                result.seq as i64,
                result.timestamp,
                result.class_label,
                result.confidence,
                result.outcome.as_str(),
                result.matched_ground_truth_id,
            ],
        )?;
        Ok(())
    }

    fn load_session(&mut self, session_id: &str) -> Result<Option<SessionRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM sessions WHERE session_id = ?1",
            SESSION_COLUMNS
        ))?;
        let mut rows = stmt.query(params![session_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(record_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn load_classifications(&mut self, session_id: &str) -> Result<Vec<ClassificationResult>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, timestamp, class_label, confidence, outcome, \
             matched_ground_truth_id \
             FROM classifications WHERE session_id = ?1 ORDER BY seq ASC",
        )?;
        let mut rows = stmt.query(params![session_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let outcome_raw: String = row.get(4)?;
            out.push(ClassificationResult {
                seq: row.get::<_, i64>(0)? as u64,
                timestamp: row.get(1)?,
                class_label: row.get(2)?,
                confidence: row.get(3)?,
                outcome: outcome_raw.parse()?,
                matched_ground_truth_id: row.get(5)?,
            });
        }
        Ok(out)
    }

    fn list_sessions(&mut self) -> Result<Vec<SessionRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM sessions ORDER BY created_epoch_s ASC, session_id ASC",
            SESSION_COLUMNS
        ))?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(record_from_row(row)?);
        }
        Ok(out)
    }
}

// -------------------- In-Memory --------------------

/// Vec-backed store for tests and the demo.
#[derive(Clone, Debug, Default)]
pub struct InMemoryResultsStore {
    sessions: Vec<SessionRecord>,
    classifications: Vec<(String, ClassificationResult)>,
}

impl ResultsStore for InMemoryResultsStore {
    fn record_session(&mut self, record: &SessionRecord) -> Result<()> {
        match self
            .sessions
            .iter_mut()
            .find(|r| r.session_id == record.session_id)
        {
            Some(existing) => *existing = record.clone(),
            None => self.sessions.push(record.clone()),
        }
        Ok(())
    }

    fn append_classification(
        &mut self,
        session_id: &str,
        result: &ClassificationResult,
    ) -> Result<()> {
        let duplicate = self
            .classifications
            .iter()
            .any(|(sid, row)| sid == session_id && row.seq == result.seq);
        if !duplicate {
            self.classifications
                .push((session_id.to_string(), result.clone()));
        }
        Ok(())
    }

    fn load_session(&mut self, session_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self
            .sessions
            .iter()
            .find(|r| r.session_id == session_id)
            .cloned())
    }

    fn load_classifications(&mut self, session_id: &str) -> Result<Vec<ClassificationResult>> {
        let mut out: Vec<ClassificationResult> = self
            .classifications
            .iter()
            .filter(|(sid, _)| sid == session_id)
            .map(|(_, row)| row.clone())
            .collect();
        out.sort_by_key(|row| row.seq);
        Ok(out)
    }

    fn list_sessions(&mut self) -> Result<Vec<SessionRecord>> {
        let mut out = self.sessions.clone();
        out.sort_by(|a, b| {
            a.created_epoch_s
                .cmp(&b.created_epoch_s)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Outcome;

    fn record(session_id: &str, status: SessionStatus) -> SessionRecord {
        SessionRecord {
            session_id: session_id.to_string(),
            video_id: "video-1".to_string(),
            status,
            tolerance_seconds: 0.1,
            total_ground_truth: 3,
            ignored_detections: 0,
            created_epoch_s: 1_700_000_000,
            completed_epoch_s: None,
            failure_reason: None,
        }
    }

    fn classification(seq: u64, outcome: Outcome) -> ClassificationResult {
        ClassificationResult {
            seq,
            timestamp: 10.0 + seq as f64,
            class_label: "pedestrian".to_string(),
            confidence: 0.9,
            outcome,
            matched_ground_truth_id: match outcome {
                Outcome::TruePositive => Some(format!("gt-{}", seq)),
                Outcome::FalsePositive => None,
            },
        }
    }

    fn assert_store_contract(store: &mut dyn ResultsStore) {
        assert!(store.load_session("run-1").expect("load").is_none());

        store
            .record_session(&record("run-1", SessionStatus::Created))
            .expect("record");
        let loaded = store.load_session("run-1").expect("load").expect("present");
        assert_eq!(loaded.status, SessionStatus::Created);

        // Lifecycle update replaces the summary row.
        let mut updated = record("run-1", SessionStatus::Completed);
        updated.completed_epoch_s = Some(1_700_000_100);
        store.record_session(&updated).expect("update");
        let loaded = store.load_session("run-1").expect("load").expect("present");
        assert_eq!(loaded.status, SessionStatus::Completed);
        assert_eq!(loaded.completed_epoch_s, Some(1_700_000_100));

        store
            .append_classification("run-1", &classification(0, Outcome::TruePositive))
            .expect("append");
        store
            .append_classification("run-1", &classification(1, Outcome::FalsePositive))
            .expect("append");
        // Redelivery of the same seq keeps the first write.
        store
            .append_classification("run-1", &classification(1, Outcome::TruePositive))
            .expect("append duplicate");

        let rows = store.load_classifications("run-1").expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].seq, 0);
        assert_eq!(rows[0].outcome, Outcome::TruePositive);
        assert_eq!(rows[1].outcome, Outcome::FalsePositive);

        store
            .record_session(&record("run-0", SessionStatus::Running))
            .expect("record second");
        let listed = store.list_sessions().expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].session_id, "run-0");
        assert_eq!(listed[1].session_id, "run-1");
    }

    #[test]
    fn sqlite_store_honors_the_contract() {
        let mut store = SqliteResultsStore::open(&shared_memory_uri()).expect("open");
        assert_store_contract(&mut store);
    }

    #[test]
    fn in_memory_store_honors_the_contract() {
        let mut store = InMemoryResultsStore::default();
        assert_store_contract(&mut store);
    }

    #[test]
    fn sqlite_round_trips_failure_reason() {
        let mut store = SqliteResultsStore::open(&shared_memory_uri()).expect("open");
        let mut rec = record("run-failed", SessionStatus::Failed);
        rec.failure_reason = Some("groundtruth.load: missing file".to_string());
        store.record_session(&rec).expect("record");
        let loaded = store
            .load_session("run-failed")
            .expect("load")
            .expect("present");
        assert_eq!(
            loaded.failure_reason.as_deref(),
            Some("groundtruth.load: missing file")
        );
    }

    #[test]
    fn writer_thread_flushes_on_join() {
        // Hold the shared in-memory database open across the writer's exit.
        let uri = shared_memory_uri();
        let mut holder = SqliteResultsStore::open(&uri).expect("open holder");

        let writer_store = SqliteResultsStore::open(&uri).expect("open writer");
        let (tx, rx) = mpsc::channel();
        let handle = spawn_store_writer(Box::new(writer_store), rx);

        tx.send(StoreCommand::UpsertSession(record(
            "run-1",
            SessionStatus::Running,
        )))
        .expect("send");
        tx.send(StoreCommand::AppendClassification {
            session_id: "run-1".to_string(),
            result: classification(0, Outcome::TruePositive),
        })
        .expect("send");
        drop(tx);
        handle.join().expect("join writer");

        let loaded = holder.load_session("run-1").expect("load").expect("row");
        assert_eq!(loaded.status, SessionStatus::Running);
        assert_eq!(holder.load_classifications("run-1").expect("rows").len(), 1);
    }
}
