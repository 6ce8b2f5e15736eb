//! Line codec and record types for the delivery log
//!
//! Every file written by the journal is newline-delimited. Each line has the
//! shape
//!
//! ```text
//! <timestamp> <level> <logName> <json-object>
//! ```
//!
//! where the first three fields never contain spaces, so a line splits
//! cleanly into four parts with the JSON object taking the remainder.

use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Log name used for manifest lines
pub const MANIFEST_LOG_NAME: &str = "manifest";

/// Level written on every journal line
pub const RECORD_LEVEL: &str = "INFO";

/// A message that failed to send and is waiting to be replayed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryLogEntry {
    /// Connection the message was addressed to
    pub connection_name: String,

    /// The message body as handed to `send`
    pub message: Map<String, Value>,

    /// Send-time options handed to `send` alongside the message
    #[serde(rename = "configuration")]
    pub send_config: Map<String, Value>,
}

impl DeliveryLogEntry {
    pub fn new(
        connection_name: impl Into<String>,
        message: Map<String, Value>,
        send_config: Map<String, Value>,
    ) -> Self {
        Self {
            connection_name: connection_name.into(),
            message,
            send_config,
        }
    }
}

/// Per-connection replay state kept in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Connection this entry tracks
    #[serde(rename = "brokerName")]
    pub connection_name: String,

    /// Location of the connection's append-only log
    #[serde(rename = "filePath")]
    pub log_location: PathBuf,

    /// Offset (0-based line) of the next entry to replay
    #[serde(rename = "nextMessageToSend")]
    pub next_message_to_send: u64,
}

/// Render one journal line, including the trailing newline
pub fn render_line<T: Serialize>(log_name: &str, body: &T) -> serde_json::Result<String> {
    let json = serde_json::to_string(body)?;
    Ok(format!(
        "{} {} {} {}\n",
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        RECORD_LEVEL,
        log_name_token(log_name),
        json
    ))
}

/// Decode the JSON object carried by a journal line
pub fn parse_line<T: DeserializeOwned>(line: &str) -> Result<T, String> {
    let line = line.trim_end_matches(['\n', '\r']);
    let mut parts = line.splitn(4, ' ');

    let _timestamp = parts.next().filter(|s| !s.is_empty()).ok_or("missing timestamp")?;
    let _level = parts.next().ok_or("missing level")?;
    let _log_name = parts.next().ok_or("missing log name")?;
    let json = parts.next().ok_or("missing JSON object")?;

    serde_json::from_str(json).map_err(|e| e.to_string())
}

/// Log names are written as a single space-free token
pub fn log_name_token(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

/// File name used for a connection's log.
///
/// Characters outside `[A-Za-z0-9._-]` are percent-encoded byte by byte, so
/// distinct connection names always map to distinct file names and the name
/// can never introduce a path separator.
pub fn log_file_name(connection_name: &str) -> String {
    let mut encoded = String::with_capacity(connection_name.len());
    for byte in connection_name.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    format!("{}.delivery.log", encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_entry_line_shape() {
        let entry = DeliveryLogEntry::new("orders", props(json!({"a": 1})), Map::new());
        let line = render_line("orders", &entry).unwrap();

        assert!(line.ends_with('\n'));
        let parts: Vec<&str> = line.trim_end().splitn(4, ' ').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[1], "INFO");
        assert_eq!(parts[2], "orders");
        assert_eq!(
            parts[3],
            r#"{"connectionName":"orders","message":{"a":1},"configuration":{}}"#
        );

        let decoded: DeliveryLogEntry = parse_line(&line).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_manifest_entry_field_names() {
        let entry = ManifestEntry {
            connection_name: "q1".to_string(),
            log_location: PathBuf::from("/var/lib/tether/q1.delivery.log"),
            next_message_to_send: 3,
        };
        let value = serde_json::to_value(&entry).unwrap();

        assert_eq!(value["brokerName"], "q1");
        assert_eq!(value["filePath"], "/var/lib/tether/q1.delivery.log");
        assert_eq!(value["nextMessageToSend"], 3);
    }

    #[test]
    fn test_log_name_with_spaces_stays_one_token() {
        let entry = DeliveryLogEntry::new("billing events", Map::new(), Map::new());
        let line = render_line("billing events", &entry).unwrap();

        assert!(line.contains(" billing_events {"));
        let decoded: DeliveryLogEntry = parse_line(&line).unwrap();
        assert_eq!(decoded.connection_name, "billing events");
    }

    #[test]
    fn test_parse_rejects_truncated_lines() {
        assert!(parse_line::<DeliveryLogEntry>("").is_err());
        assert!(parse_line::<DeliveryLogEntry>("2024-01-01T00:00:00Z INFO q1").is_err());
        assert!(
            parse_line::<DeliveryLogEntry>("2024-01-01T00:00:00Z INFO q1 {\"connectionName\":")
                .is_err()
        );
    }

    #[test]
    fn test_log_file_name_is_escaped() {
        assert_eq!(log_file_name("orders"), "orders.delivery.log");
        assert_eq!(log_file_name("a/b c"), "a%2Fb%20c.delivery.log");
        assert_eq!(log_file_name("../etc"), "..%2Fetc.delivery.log");
        assert_eq!(log_file_name("caf\u{e9}"), "caf%C3%A9.delivery.log");
    }

    #[test]
    fn test_distinct_names_get_distinct_files() {
        let names = ["a/b", "a_b", "a b", "a%2Fb", "a\\b"];
        let files: std::collections::HashSet<String> =
            names.iter().map(|name| log_file_name(name)).collect();
        assert_eq!(files.len(), names.len());
    }
}
