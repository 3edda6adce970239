//! export_results - compile stored session results into a report bundle.
//!
//! Reads the scoringd results database and writes a `ResultsBundle` JSON
//! artifact, either for one session or for every stored session. Metrics
//! are recomputed from the stored classification rows, so the artifact is
//! reproducible from the database alone.

use anyhow::{anyhow, Result};
use clap::Parser;

use scoring_engine::storage::{ResultsStore, SqliteResultsStore};
use scoring_engine::{ResultsBundle, SessionReport};

#[derive(Parser, Debug)]
#[command(author, version, about = "Export stored scoring results to a JSON bundle")]
struct Args {
    /// Path to the scoring results database.
    #[arg(long, env = "SCORING_DB_PATH", default_value = "scoring.db")]
    db_path: String,

    /// Session to export. Exports every stored session when omitted.
    #[arg(long)]
    session_id: Option<String>,

    /// Attach the full classification log to each report.
    #[arg(long)]
    include_log: bool,

    /// Output file path for the bundle.
    #[arg(long, default_value = "scoring_results.json")]
    output: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut store = SqliteResultsStore::open(&args.db_path)?;
    let records = match &args.session_id {
        Some(session_id) => {
            let record = store
                .load_session(session_id)
                .map_err(|e| anyhow!("load session '{}': {:#}", session_id, e))?
                .ok_or_else(|| anyhow!("no stored session '{}'", session_id))?;
            vec![record]
        }
        None => store.list_sessions()?,
    };
    if records.is_empty() {
        return Err(anyhow!("no sessions stored in {}", args.db_path));
    }

    let mut reports = Vec::with_capacity(records.len());
    for record in &records {
        let rows = store.load_classifications(&record.session_id)?;
        reports.push(SessionReport::from_stored(record, &rows, args.include_log));
    }

    let bundle = ResultsBundle::new(reports);
    let json = serde_json::to_vec_pretty(&bundle)?;
    std::fs::write(&args.output, json)?;
    println!(
        "results bundle written to {} ({} sessions)",
        args.output,
        bundle.sessions.len()
    );
    Ok(())
}
