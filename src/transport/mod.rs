//! Detection ingestion wire shapes.
//!
//! The engine does not care how detections travel; it consumes
//! `{timestamp, confidence, class_label}` tuples scoped to a session. This
//! module holds the serde shapes and parse helpers shared by the HTTP API
//! and the MQTT bridge, plus MQTT endpoint parsing for the bridge binary.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::DetectionEvent;

/// One detection as it arrives on the wire. `label` is accepted as an
/// alias because several detector exports use it instead of `class_label`.
#[derive(Debug, Deserialize)]
pub struct DetectionPayload {
    pub timestamp: f64,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(alias = "label")]
    pub class_label: String,
}

fn default_confidence() -> f64 {
    1.0
}

impl DetectionPayload {
    /// Bind the payload to a session. Range validation happens at
    /// admission, not here.
    pub fn into_event(self, session_id: &str) -> DetectionEvent {
        DetectionEvent {
            session_id: session_id.to_string(),
            timestamp: self.timestamp,
            confidence: self.confidence,
            class_label: self.class_label,
        }
    }
}

/// Parse one detection payload from raw JSON bytes.
pub fn parse_detection_payload(payload: &[u8]) -> Result<DetectionPayload> {
    serde_json::from_slice(payload).context("parse detection payload JSON")
}

// -------------------- MQTT Endpoint --------------------

#[derive(Clone, Debug)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
}

/// Parse an MQTT endpoint from an address string.
///
/// Supports `host:port`, `mqtt://host:port`, `tcp://host:port`, and
/// `[ipv6]:port`.
pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    Ok(MqttEndpoint { host, port })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    // IPv6 addresses in brackets: [::1]:1883
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid MQTT port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok((host.to_string(), port))
}

/// Require a loopback broker unless the caller opted into remote MQTT.
pub fn validate_loopback_addr(endpoint: &MqttEndpoint, original: &str) -> Result<()> {
    let host = endpoint.host.as_str();
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        return Ok(());
    }
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        if ip.is_loopback() {
            return Ok(());
        }
    }
    Err(anyhow!(
        "MQTT broker must be loopback: {} (use --allow-remote-mqtt to override)",
        original
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_payload() {
        let payload = parse_detection_payload(
            br#"{"timestamp":10.05,"confidence":0.9,"class_label":"pedestrian"}"#,
        )
        .expect("parse");
        assert_eq!(payload.timestamp, 10.05);
        assert_eq!(payload.confidence, 0.9);
        assert_eq!(payload.class_label, "pedestrian");
    }

    #[test]
    fn accepts_label_alias_and_defaults_confidence() {
        let payload =
            parse_detection_payload(br#"{"timestamp":3.0,"label":"vehicle"}"#).expect("parse");
        assert_eq!(payload.class_label, "vehicle");
        assert_eq!(payload.confidence, 1.0);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(parse_detection_payload(b"{not json").is_err());
        assert!(parse_detection_payload(br#"{"confidence":0.5}"#).is_err());
    }

    #[test]
    fn binds_payload_to_session() {
        let payload = parse_detection_payload(br#"{"timestamp":1.0,"class_label":"pedestrian"}"#)
            .expect("parse");
        let event = payload.into_event("run-1");
        assert_eq!(event.session_id, "run-1");
        assert_eq!(event.timestamp, 1.0);
    }

    #[test]
    fn parse_endpoint_plain() {
        let ep = parse_mqtt_endpoint("127.0.0.1:1883").expect("parse");
        assert_eq!(ep.host, "127.0.0.1");
        assert_eq!(ep.port, 1883);
    }

    #[test]
    fn parse_endpoint_mqtt_scheme() {
        let ep = parse_mqtt_endpoint("mqtt://broker.local:1884").expect("parse");
        assert_eq!(ep.host, "broker.local");
        assert_eq!(ep.port, 1884);
    }

    #[test]
    fn parse_endpoint_ipv6() {
        let ep = parse_mqtt_endpoint("[::1]:1883").expect("parse");
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.port, 1883);
    }

    #[test]
    fn parse_endpoint_rejects_unknown_scheme() {
        assert!(parse_mqtt_endpoint("mqtts://broker:8883").is_err());
        assert!(parse_mqtt_endpoint("no-port").is_err());
    }

    #[test]
    fn loopback_guard_accepts_localhost() {
        let ep = MqttEndpoint {
            host: "localhost".to_string(),
            port: 1883,
        };
        assert!(validate_loopback_addr(&ep, "localhost:1883").is_ok());
    }

    #[test]
    fn loopback_guard_rejects_remote() {
        let ep = MqttEndpoint {
            host: "192.168.1.10".to_string(),
            port: 1883,
        };
        assert!(validate_loopback_addr(&ep, "192.168.1.10:1883").is_err());
    }
}
