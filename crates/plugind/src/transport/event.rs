//! Decoding of plugin output lines into typed events.

use plugind_protocol::{PluginEventType, PluginLogEvent, PluginUniversalEvent};
use serde_json::value::RawValue;
use tracing::warn;

use super::MAX_ERR_MSG_LEN;

/// One decoded line of plugin output.
#[derive(Debug)]
pub enum PluginEvent {
    Log(PluginLogEvent),
    Session {
        session_id: String,
        data: Box<RawValue>,
    },
    Error(String),
    Heartbeat,
}

/// Parse one line of plugin output.
///
/// `Err` carries a diagnostic for a line that is not a valid envelope: the
/// decode error, `status`, and at most [`MAX_ERR_MSG_LEN`] bytes of the line.
/// `Ok(None)` means a valid envelope whose log payload could not be decoded;
/// that is logged here and otherwise ignored.
pub fn parse_universal_event(line: &[u8], status: &str) -> Result<Option<PluginEvent>, String> {
    let envelope: PluginUniversalEvent = match serde_json::from_slice(line) {
        Ok(e) => e,
        Err(e) => return Err(malformed_diagnostic(&e.to_string(), status, line)),
    };

    let event = match envelope.event {
        PluginEventType::Log => match serde_json::from_str::<PluginLogEvent>(envelope.data.get()) {
            Ok(log) => PluginEvent::Log(log),
            Err(e) => {
                warn!(error = %e, "Failed to decode plugin log event");
                return Ok(None);
            }
        },
        PluginEventType::Session => PluginEvent::Session {
            session_id: envelope.session_id,
            data: envelope.data,
        },
        PluginEventType::Error => PluginEvent::Error(error_text(&envelope.data)),
        PluginEventType::Heartbeat => PluginEvent::Heartbeat,
    };
    Ok(Some(event))
}

/// A JSON string payload is unquoted; anything else is kept as raw JSON.
fn error_text(data: &RawValue) -> String {
    serde_json::from_str::<String>(data.get()).unwrap_or_else(|_| data.get().to_string())
}

fn malformed_diagnostic(err: &str, status: &str, line: &[u8]) -> String {
    if line.len() > MAX_ERR_MSG_LEN {
        format!(
            "{err} status: {status} original response: {}...",
            String::from_utf8_lossy(&line[..MAX_ERR_MSG_LEN])
        )
    } else {
        format!(
            "{err} status: {status} original response: {}",
            String::from_utf8_lossy(line)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_event() {
        let ev = parse_universal_event(br#"{"session_id":"","event":"heartbeat","data":{}}"#, "")
            .unwrap()
            .unwrap();
        assert!(matches!(ev, PluginEvent::Heartbeat));
    }

    #[test]
    fn session_event_keeps_payload() {
        let ev = parse_universal_event(
            br#"{"session_id":"s-1","event":"session","data":{"type":"end","data":null}}"#,
            "",
        )
        .unwrap()
        .unwrap();
        match ev {
            PluginEvent::Session { session_id, data } => {
                assert_eq!(session_id, "s-1");
                assert_eq!(data.get(), r#"{"type":"end","data":null}"#);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn log_event_decoded() {
        let ev = parse_universal_event(
            br#"{"event":"log","data":{"level":"warn","message":"hi","timestamp":1.5}}"#,
            "",
        )
        .unwrap()
        .unwrap();
        match ev {
            PluginEvent::Log(log) => {
                assert_eq!(log.level, "warn");
                assert_eq!(log.message, "hi");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn bad_log_payload_is_skipped() {
        let ev = parse_universal_event(br#"{"event":"log","data":"not an object"}"#, "").unwrap();
        assert!(ev.is_none());
    }

    #[test]
    fn error_event_string_is_unquoted() {
        let ev = parse_universal_event(br#"{"event":"error","data":"exploded"}"#, "")
            .unwrap()
            .unwrap();
        assert!(matches!(ev, PluginEvent::Error(ref m) if m == "exploded"));

        let ev = parse_universal_event(br#"{"event":"error","data":{"code":1}}"#, "")
            .unwrap()
            .unwrap();
        assert!(matches!(ev, PluginEvent::Error(ref m) if m == r#"{"code":1}"#));
    }

    #[test]
    fn malformed_line_reports_status_and_excerpt() {
        let err = parse_universal_event(b"not json", "running").unwrap_err();
        assert!(err.contains("status: running"));
        assert!(err.ends_with("original response: not json"));
    }

    #[test]
    fn malformed_excerpt_is_truncated() {
        let line = vec![b'x'; MAX_ERR_MSG_LEN * 2];
        let err = parse_universal_event(&line, "").unwrap_err();
        assert!(err.ends_with("..."));
        let excerpt = err.split("original response: ").nth(1).unwrap();
        assert_eq!(excerpt.len(), MAX_ERR_MSG_LEN + 3);
    }
}
