//! demo - end-to-end synthetic scoring run for the Detection Scoring Engine

use anyhow::{anyhow, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use scoring_engine::registry::{CreateSession, SessionRegistry};
use scoring_engine::session::SessionConfig;
use scoring_engine::storage::{
    shared_memory_uri, spawn_store_writer, ResultsStore, SqliteResultsStore,
};
use scoring_engine::{
    GroundTruthObject, Outcome, SessionReport, SessionStatus, StaticGroundTruthSource,
};

const DEMO_SESSION_ID: &str = "demo-run";
const DEMO_VIDEO_ID: &str = "demo-video";

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of ground-truth objects to synthesize.
    #[arg(long, default_value_t = 20)]
    objects: u64,
    /// Fraction of objects the synthetic detector finds (0.0-1.0).
    #[arg(long, default_value_t = 0.8)]
    hit_rate: f64,
    /// Spurious detections with no nearby ground truth.
    #[arg(long, default_value_t = 4)]
    spurious: u64,
    /// Matching tolerance in seconds.
    #[arg(long, default_value_t = 0.1)]
    tolerance: f64,
    /// Output directory for the report artifact.
    #[arg(long, default_value = "demo_out")]
    out: String,
    /// Deterministic seed for the synthetic run.
    #[arg(long, default_value_t = 7)]
    seed: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    if !(0.0..=1.0).contains(&args.hit_rate) {
        return Err(anyhow!("hit-rate must be within 0.0..=1.0"));
    }

    let out_dir = PathBuf::from(&args.out);
    fs::create_dir_all(&out_dir)?;
    let report_path = out_dir.join("demo_report.json");

    let mut rng = StdRng::seed_from_u64(args.seed);

    stage("synthesize ground truth + detections");
    // Objects sit 5 seconds apart so the tolerance window never spans two.
    let objects: Vec<GroundTruthObject> = (0..args.objects)
        .map(|i| GroundTruthObject {
            id: format!("gt-{}", i),
            timestamp: 10.0 + i as f64 * 5.0,
            class_label: if i % 3 == 0 { "vehicle" } else { "pedestrian" }.to_string(),
            confidence: 1.0,
            bbox: None,
        })
        .collect();

    let mut detections = Vec::new();
    let mut expected_tp = 0u64;
    for object in &objects {
        if rng.gen::<f64>() < args.hit_rate {
            // Jitter stays inside the window, so every hit scores.
            let jitter = rng.gen_range(-args.tolerance..=args.tolerance) * 0.9;
            detections.push((object.timestamp + jitter, object.class_label.clone()));
            expected_tp += 1;
        }
    }
    for i in 0..args.spurious {
        // Spurious detections land between objects, outside every window.
        let timestamp = 12.5 + i as f64 * 5.0;
        detections.push((timestamp, "pedestrian".to_string()));
    }
    let expected_fp = args.spurious;
    let expected_fn = args.objects - expected_tp;

    stage("open shared-memory store + writer thread");
    let store_uri = shared_memory_uri();
    let mut holder = SqliteResultsStore::open(&store_uri)?;
    let writer_store = SqliteResultsStore::open(&store_uri)?;
    let (store_tx, store_rx) = mpsc::channel();
    let writer = spawn_store_writer(Box::new(writer_store), store_rx);

    stage("create session + score detections");
    let mut source = StaticGroundTruthSource::new();
    source.insert(DEMO_VIDEO_ID, objects);
    let registry = Arc::new(
        SessionRegistry::new(
            Box::new(source),
            SessionConfig {
                tolerance_seconds: args.tolerance,
                class_labels: None,
            },
        )
        .with_store_sink(store_tx),
    );
    registry.create_session(CreateSession {
        session_id: DEMO_SESSION_ID.to_string(),
        video_id: DEMO_VIDEO_ID.to_string(),
        tolerance_seconds: None,
        class_labels: None,
    })?;

    for (timestamp, class_label) in &detections {
        registry.submit(scoring_engine::DetectionEvent {
            session_id: DEMO_SESSION_ID.to_string(),
            timestamp: *timestamp,
            confidence: 0.9,
            class_label: class_label.clone(),
        })?;
    }

    let report = registry.complete(DEMO_SESSION_ID)?;
    let full = registry.results(DEMO_SESSION_ID, true)?;
    fs::write(&report_path, serde_json::to_vec_pretty(&full)?)?;

    stage("flush store + cross-check");
    drop(registry);
    writer
        .join()
        .map_err(|_| anyhow!("store writer thread panicked"))?;
    let check_result = check_run(&report, &mut holder, expected_tp, expected_fp, expected_fn);

    let metrics = report.metrics.as_ref().expect("completed session metrics");
    println!("demo summary:");
    println!("  ground-truth objects: {}", args.objects);
    println!("  detections submitted: {}", detections.len());
    println!(
        "  tp={} fp={} fn={}",
        metrics.true_positives, metrics.false_positives, metrics.false_negatives
    );
    println!(
        "  precision={:.3} recall={:.3} f1={:.3} accuracy={:.3}",
        metrics.precision, metrics.recall, metrics.f1_score, metrics.accuracy
    );
    println!("  report: {}", report_path.display());
    println!(
        "  check: {}",
        if check_result.is_ok() { "OK" } else { "FAIL" }
    );
    println!("next steps:");
    println!("  cat {}", report_path.display());
    println!("  cargo run --bin scoringd");

    check_result
}

fn stage(msg: &str) {
    eprintln!("demo: {}", msg);
}

fn check_run(
    report: &SessionReport,
    store: &mut SqliteResultsStore,
    expected_tp: u64,
    expected_fp: u64,
    expected_fn: u64,
) -> Result<()> {
    if report.status != SessionStatus::Completed || !report.metrics_final {
        return Err(anyhow!("session did not complete"));
    }
    let metrics = report
        .metrics
        .as_ref()
        .ok_or_else(|| anyhow!("completed session has no metrics"))?;
    if metrics.true_positives != expected_tp
        || metrics.false_positives != expected_fp
        || metrics.false_negatives != expected_fn
    {
        return Err(anyhow!(
            "counts diverge from construction: got tp={} fp={} fn={}, expected tp={} fp={} fn={}",
            metrics.true_positives,
            metrics.false_positives,
            metrics.false_negatives,
            expected_tp,
            expected_fp,
            expected_fn
        ));
    }
    if !metrics.rates_well_formed() {
        return Err(anyhow!("rates out of range"));
    }

    // The flushed store must agree with the live run.
    let record = store
        .load_session(DEMO_SESSION_ID)?
        .ok_or_else(|| anyhow!("session missing from store"))?;
    if record.status != SessionStatus::Completed {
        return Err(anyhow!("stored status is {}", record.status.as_str()));
    }
    let rows = store.load_classifications(DEMO_SESSION_ID)?;
    let stored_tp = rows
        .iter()
        .filter(|r| r.outcome == Outcome::TruePositive)
        .count() as u64;
    if rows.len() as u64 != expected_tp + expected_fp || stored_tp != expected_tp {
        return Err(anyhow!(
            "stored rows diverge: {} rows, {} true positives",
            rows.len(),
            stored_tp
        ));
    }
    Ok(())
}
