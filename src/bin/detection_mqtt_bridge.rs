//! detection_mqtt_bridge - Score detector events published over MQTT.
//!
//! This bridge scores a live detector run without going through the HTTP
//! API:
//! 1. Loads one video's ground-truth file and opens a scoring session
//! 2. Subscribes to the detection topic and feeds each payload to the session
//! 3. Logs every classification as it happens
//! 4. On Ctrl-C, completes the session and writes the final report JSON
//!
//! Payloads are `{timestamp, confidence?, class_label}` JSON; `label` is
//! accepted as an alias for `class_label`.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use scoring_engine::registry::{CreateSession, SessionRegistry};
use scoring_engine::session::SessionConfig;
use scoring_engine::transport::{
    parse_detection_payload, parse_mqtt_endpoint, validate_loopback_addr, MqttEndpoint,
};
use scoring_engine::{load_objects, rejection_code, StaticGroundTruthSource};

const BRIDGE_NAME: &str = "detection_mqtt_bridge";

#[derive(Parser, Debug)]
#[command(author, version, about = "Score MQTT detection events against ground truth")]
struct Args {
    /// MQTT broker address.
    /// By default, only loopback addresses are allowed.
    #[arg(long, env = "MQTT_BROKER_ADDR", default_value = "127.0.0.1:1883")]
    mqtt_broker_addr: String,

    /// Allow non-loopback MQTT connections.
    /// Use in trusted environments where the broker runs on another host.
    #[arg(long, env = "ALLOW_REMOTE_MQTT")]
    allow_remote_mqtt: bool,

    /// MQTT username for authentication.
    #[arg(long, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    /// MQTT password for authentication.
    #[arg(long, env = "MQTT_PASSWORD")]
    mqtt_password: Option<String>,

    /// Detection topic to subscribe to.
    #[arg(long, env = "SCORING_MQTT_TOPIC", default_value = "scoring/detections")]
    detection_topic: String,

    /// MQTT client identifier.
    #[arg(long, env = "MQTT_CLIENT_ID", default_value = BRIDGE_NAME)]
    mqtt_client_id: String,

    /// Path to the ground-truth JSON file for the video under test.
    #[arg(long, env = "SCORING_GROUNDTRUTH_FILE")]
    groundtruth: PathBuf,

    /// Session identifier for this run.
    #[arg(long, env = "SCORING_SESSION_ID", default_value = "mqtt-run")]
    session_id: String,

    /// Video identifier the ground truth belongs to.
    #[arg(long, env = "SCORING_VIDEO_ID", default_value = "mqtt-video")]
    video_id: String,

    /// Matching tolerance in seconds.
    #[arg(long, env = "SCORING_TOLERANCE_SECS", default_value_t = 0.1)]
    tolerance_seconds: f64,

    /// Comma-separated class labels to score. Empty scores every label.
    #[arg(long, env = "SCORING_CLASS_LABELS")]
    class_labels: Option<String>,

    /// Path for the final report JSON. Defaults to stdout.
    #[arg(long, env = "SCORING_REPORT_PATH")]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mqtt_endpoint = parse_mqtt_endpoint(&args.mqtt_broker_addr)?;
    if !args.allow_remote_mqtt {
        validate_loopback_addr(&mqtt_endpoint, &args.mqtt_broker_addr)?;
    } else {
        log::warn!("Remote MQTT enabled - ensure broker is in a trusted network");
    }

    let class_labels: Option<Vec<String>> = args.class_labels.as_ref().map(|s| {
        s.split(',')
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect()
    });

    log::info!("Detection bridge starting");
    log::info!("  MQTT broker: {}:{}", mqtt_endpoint.host, mqtt_endpoint.port);
    log::info!("  Topic: {}", args.detection_topic);
    log::info!("  Ground truth: {}", args.groundtruth.display());
    log::info!(
        "  Session: {} (video {}, tolerance {}s)",
        args.session_id,
        args.video_id,
        args.tolerance_seconds
    );

    let objects = load_objects(&args.groundtruth)?;
    log::info!("  {} ground-truth objects loaded", objects.len());
    let mut source = StaticGroundTruthSource::new();
    source.insert(args.video_id.clone(), objects);

    let registry = Arc::new(SessionRegistry::new(
        Box::new(source),
        SessionConfig {
            tolerance_seconds: args.tolerance_seconds,
            class_labels: class_labels.clone(),
        },
    ));
    let report = registry.create_session(CreateSession {
        session_id: args.session_id.clone(),
        video_id: args.video_id.clone(),
        tolerance_seconds: None,
        class_labels: None,
    })?;
    if let Some(reason) = &report.failure_reason {
        return Err(anyhow!("session failed at creation: {}", reason));
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
            let _ = shutdown_tx.send(());
        })?;
    }

    let worker = {
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        let endpoint = mqtt_endpoint.clone();
        let args_topic = args.detection_topic.clone();
        let client_id = args.mqtt_client_id.clone();
        let username = args.mqtt_username.clone();
        let password = args.mqtt_password.clone();
        let session_id = args.session_id.clone();
        std::thread::spawn(move || {
            consume_detections(
                &registry,
                &shutdown,
                &endpoint,
                &args_topic,
                &client_id,
                username.as_deref(),
                password.as_deref(),
                &session_id,
            );
        })
    };

    shutdown_rx
        .recv()
        .map_err(|_| anyhow!("shutdown channel closed"))?;
    log::info!("shutdown requested; completing session {}", args.session_id);
    worker
        .join()
        .map_err(|_| anyhow!("mqtt worker thread panicked"))?;

    registry.complete(&args.session_id)?;
    let report = registry.results(&args.session_id, true)?;
    let json = serde_json::to_string_pretty(&report)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, &json)
                .with_context(|| format!("write report to {}", path.display()))?;
            log::info!("report written to {}", path.display());
        }
        None => println!("{}", json),
    }
    if let Some(metrics) = &report.metrics {
        log::info!(
            "final: tp={} fp={} fn={} precision={:.3} recall={:.3} f1={:.3}",
            metrics.true_positives,
            metrics.false_positives,
            metrics.false_negatives,
            metrics.precision,
            metrics.recall,
            metrics.f1_score
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn consume_detections(
    registry: &SessionRegistry,
    shutdown: &AtomicBool,
    endpoint: &MqttEndpoint,
    topic: &str,
    client_id: &str,
    username: Option<&str>,
    password: Option<&str>,
    session_id: &str,
) {
    while !shutdown.load(Ordering::SeqCst) {
        let (client, mut connection) = match connect_mqtt(endpoint, client_id, username, password)
        {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("MQTT connect failed: {}. Retrying...", e);
                std::thread::sleep(Duration::from_secs(5));
                continue;
            }
        };
        if let Err(e) = client.subscribe(topic, QoS::AtMostOnce) {
            log::error!("MQTT subscribe failed: {}. Retrying...", e);
            std::thread::sleep(Duration::from_secs(5));
            continue;
        }
        log::info!("Subscribed to {}", topic);

        loop {
            if shutdown.load(Ordering::SeqCst) {
                let _ = client.disconnect();
                return;
            }
            match connection.recv_timeout(Duration::from_millis(500)) {
                Ok(Ok(Event::Incoming(Incoming::Publish(publish)))) => {
                    if let Err(e) = score_payload(registry, session_id, &publish.payload) {
                        log::warn!("detection not scored: {}", e);
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    log::error!("MQTT connection error: {}. Reconnecting...", e);
                    std::thread::sleep(Duration::from_secs(5));
                    break;
                }
                // Timed out waiting for an event; re-check the shutdown
                // flag. Connection failures surface as Ok(Err(_)) above.
                Err(_) => continue,
            }
        }
    }
}

fn score_payload(registry: &SessionRegistry, session_id: &str, payload: &[u8]) -> Result<()> {
    let detection = parse_detection_payload(payload)?;
    let event = detection.into_event(session_id);
    match registry.submit(event) {
        Ok(Some(result)) => {
            log::info!(
                "detection #{}: {} t={:.3} conf={:.2} matched={}",
                result.seq,
                result.outcome.as_str(),
                result.timestamp,
                result.confidence,
                result.matched_ground_truth_id.as_deref().unwrap_or("-")
            );
            Ok(())
        }
        Ok(None) => {
            log::debug!("detection ignored: label outside configured set");
            Ok(())
        }
        Err(e) => match rejection_code(&e) {
            Some(code) => Err(anyhow!("rejected ({}): {}", code, e)),
            None => Err(e),
        },
    }
}

fn connect_mqtt(
    endpoint: &MqttEndpoint,
    client_id: &str,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<(Client, Connection)> {
    let mut options = MqttOptions::new(client_id, &endpoint.host, endpoint.port);
    options.set_keep_alive(Duration::from_secs(60));
    options.set_clean_start(true);
    if let Some(user) = username {
        options.set_credentials(user, password.unwrap_or_default());
    }

    let (client, connection) = Client::new(options, 10);
    log::info!(
        "Connected to MQTT broker {}:{} (auth: {})",
        endpoint.host,
        endpoint.port,
        username.is_some()
    );
    Ok((client, connection))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scoring_engine::{GroundTruthObject, Outcome};

    fn bridge_registry() -> SessionRegistry {
        let mut source = StaticGroundTruthSource::new();
        source.insert(
            "mqtt-video",
            vec![GroundTruthObject {
                id: "gt-1".to_string(),
                timestamp: 10.0,
                class_label: "pedestrian".to_string(),
                confidence: 1.0,
                bbox: None,
            }],
        );
        let registry = SessionRegistry::new(
            Box::new(source),
            SessionConfig {
                tolerance_seconds: 0.1,
                class_labels: None,
            },
        );
        registry
            .create_session(CreateSession {
                session_id: "mqtt-run".to_string(),
                video_id: "mqtt-video".to_string(),
                tolerance_seconds: None,
                class_labels: None,
            })
            .expect("create session");
        registry
    }

    #[test]
    fn wire_payload_is_scored_against_the_session() {
        let registry = bridge_registry();
        score_payload(
            &registry,
            "mqtt-run",
            br#"{"timestamp":10.05,"confidence":0.9,"class_label":"pedestrian"}"#,
        )
        .expect("score");

        let report = registry.results("mqtt-run", true).expect("results");
        let log = report.classifications.expect("log");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].outcome, Outcome::TruePositive);
        assert_eq!(log[0].matched_ground_truth_id.as_deref(), Some("gt-1"));
    }

    #[test]
    fn label_alias_payload_is_accepted() {
        let registry = bridge_registry();
        score_payload(&registry, "mqtt-run", br#"{"timestamp":20.0,"label":"pedestrian"}"#)
            .expect("score");
        let report = registry.results("mqtt-run", true).expect("results");
        assert_eq!(report.classifications.map(|c| c.len()), Some(1));
    }

    #[test]
    fn malformed_payload_is_an_error_not_a_crash() {
        let registry = bridge_registry();
        assert!(score_payload(&registry, "mqtt-run", b"{not json").is_err());
        // Nothing was admitted.
        let report = registry.results("mqtt-run", true).expect("results");
        assert_eq!(report.classifications.map(|c| c.len()), Some(0));
    }

    #[test]
    fn boundary_rejection_carries_the_code() {
        let registry = bridge_registry();
        let err = score_payload(
            &registry,
            "mqtt-run",
            br#"{"timestamp":10.0,"confidence":1.5,"class_label":"pedestrian"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("input.confidence_range"));
    }
}
