//! results_verify - External checker for stored scoring results.
//!
//! This tool proves the results database is internally consistent:
//! - Classification rows are gap-free in admission (seq) order
//! - True positives carry a matched ground-truth id, false positives do not
//! - No two true positives in one session claim the same ground-truth id
//! - Matched objects never exceed the stored ground-truth total
//! - Metrics recomputed from the rows are well-formed rates in [0, 1]
//! - Closed sessions carry a close timestamp; failed sessions carry a reason
//!
//! Consistency must be provable without trusting the daemon that wrote it.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::collections::HashSet;

use scoring_engine::storage::{ResultsStore, SessionRecord, SqliteResultsStore};
use scoring_engine::{ClassificationResult, Outcome, SessionMetrics, SessionStatus};

#[derive(Parser, Debug)]
#[command(
    name = "results_verify",
    about = "Verify scoring results database consistency"
)]
struct Args {
    /// Path to the scoring results database.
    #[arg(long, env = "SCORING_DB_PATH", default_value = "scoring.db")]
    db: String,

    /// Verify one session only.
    #[arg(long)]
    session_id: Option<String>,

    /// Verbose output.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut store = SqliteResultsStore::open(&args.db)?;

    let records = match &args.session_id {
        Some(session_id) => {
            let record = store
                .load_session(session_id)?
                .ok_or_else(|| anyhow!("no stored session '{}'", session_id))?;
            vec![record]
        }
        None => store.list_sessions()?,
    };

    println!("results_verify: checking {}", args.db);
    println!();
    println!("=== Sessions ===");

    let mut findings = Vec::new();
    for record in &records {
        let rows = store.load_classifications(&record.session_id)?;
        let session_findings = verify_session(record, &rows);
        let verdict = if session_findings.is_empty() {
            "OK"
        } else {
            "FAIL"
        };
        println!(
            "session {}: status={} rows={} ground_truth={} {}",
            record.session_id,
            record.status.as_str(),
            rows.len(),
            record.total_ground_truth,
            verdict
        );
        if args.verbose {
            for row in &rows {
                println!(
                    "  #{} {} t={:.3} matched={}",
                    row.seq,
                    row.outcome.as_str(),
                    row.timestamp,
                    row.matched_ground_truth_id.as_deref().unwrap_or("-")
                );
            }
        }
        for finding in &session_findings {
            println!("  FINDING: {}", finding);
        }
        findings.extend(session_findings);
    }

    println!();
    if findings.is_empty() {
        println!("OK: {} sessions consistent.", records.len());
        Ok(())
    } else {
        Err(anyhow!(
            "{} consistency findings across {} sessions",
            findings.len(),
            records.len()
        ))
    }
}

fn verify_session(record: &SessionRecord, rows: &[ClassificationResult]) -> Vec<String> {
    let mut findings = Vec::new();

    for (i, row) in rows.iter().enumerate() {
        if row.seq != i as u64 {
            findings.push(format!(
                "seq gap: row {} has seq {} (expected {})",
                i, row.seq, i
            ));
            break;
        }
    }

    let mut matched = HashSet::new();
    for row in rows {
        match (&row.outcome, &row.matched_ground_truth_id) {
            (Outcome::TruePositive, Some(id)) => {
                if !matched.insert(id.clone()) {
                    findings.push(format!(
                        "ground-truth id '{}' matched by more than one true positive",
                        id
                    ));
                }
            }
            (Outcome::TruePositive, None) => {
                findings.push(format!("true positive at seq {} has no matched id", row.seq));
            }
            (Outcome::FalsePositive, Some(id)) => {
                findings.push(format!(
                    "false positive at seq {} carries matched id '{}'",
                    row.seq, id
                ));
            }
            (Outcome::FalsePositive, None) => {}
        }
    }

    let true_positives = matched.len() as u64;
    if true_positives > record.total_ground_truth {
        findings.push(format!(
            "{} matched objects exceed ground-truth total {}",
            true_positives, record.total_ground_truth
        ));
    } else if record.status != SessionStatus::Failed {
        let false_positives = rows.len() as u64 - rows
            .iter()
            .filter(|r| r.outcome == Outcome::TruePositive)
            .count() as u64;
        let false_negatives = record.total_ground_truth - true_positives;
        let metrics =
            SessionMetrics::from_counts(true_positives, false_positives, false_negatives);
        if !metrics.rates_well_formed() {
            findings.push(format!(
                "recomputed rates out of range: precision={} recall={} f1={} accuracy={}",
                metrics.precision, metrics.recall, metrics.f1_score, metrics.accuracy
            ));
        }
    }

    match record.status {
        SessionStatus::Completed | SessionStatus::Failed => {
            if record.completed_epoch_s.is_none() {
                findings.push("closed session has no close timestamp".to_string());
            }
        }
        _ => {}
    }
    if record.status == SessionStatus::Failed && record.failure_reason.is_none() {
        findings.push("failed session has no failure reason".to_string());
    }

    findings
}
