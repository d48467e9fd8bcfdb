//! Payload <-> line serialization
//!
//! One payload is one line of UTF-8 JSON. Absent optional fields are omitted
//! rather than written as empty strings, so `None` and `""` stay distinct.

use swb_core::Payload;
use tracing::debug;

use crate::error::{ProtocolError, ProtocolResult};

/// Serialize a payload to a single line (without the trailing newline)
pub fn encode(payload: &Payload) -> String {
    // serde_json escapes control characters, so the result never contains '\n'
    serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string())
}

/// Serialize a payload followed by `\n`, ready for the socket
pub fn encode_line(payload: &Payload) -> Vec<u8> {
    let mut line = encode(payload).into_bytes();
    line.push(b'\n');
    line
}

/// Strict decoding; reports why a line is not a payload
pub fn try_decode(line: &str) -> ProtocolResult<Payload> {
    serde_json::from_str(line.trim()).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
}

/// Total decoding: blank or unparseable input becomes a `Ping`
pub fn decode(line: &str) -> Payload {
    if line.trim().is_empty() {
        return Payload::ping();
    }
    match try_decode(line) {
        Ok(payload) => payload,
        Err(e) => {
            debug!(error = %e, "Malformed frame treated as Ping");
            Payload::ping()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swb_core::{ArgSchema, PING};

    fn full_payload() -> Payload {
        Payload::new("ZigBeeProtocol")
            .with_action("SetLevel")
            .with_data(r#"{"device":"bulb-1","level":"12"}"#)
            .with_response("line one\nline two \"quoted\"")
            .with_commands(["SetLevel", "On", "Off", "ResetCurrent", "Reset"])
    }

    #[test]
    fn test_round_trip() {
        let payloads = [
            full_payload(),
            Payload::default(),
            Payload::ping(),
            Payload::new("k").with_data(""),
            Payload::new("k").with_response("Bye."),
            ArgSchema::new("SetLevel", "d", "s")
                .entry("level", 3)
                .challenge("ZigBeeProtocol", vec!["Reset".into()]),
        ];
        for payload in payloads {
            let line = encode(&payload);
            assert!(!line.contains('\n'));
            assert_eq!(decode(&line), payload);
        }
    }

    #[test]
    fn test_absent_is_not_empty() {
        let empty_data = Payload::new("k").with_data("");
        let line = encode(&empty_data);
        assert!(line.contains("\"data\":\"\""));
        assert_eq!(decode(&line).data(), Some(""));

        let no_data = decode(&encode(&Payload::new("k")));
        assert_eq!(no_data.data(), None);
    }

    #[test]
    fn test_garbage_decodes_to_ping() {
        for line in ["", "   ", "???", "null", "[1,2]", "{\"commands\": 5}", "{\"key\":"] {
            let payload = decode(line);
            assert_eq!(payload.action(), Some(PING), "input {:?}", line);
        }
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let payload = decode(r#"{"key":"k","action":"On","extra":{"a":1}}"#);
        assert_eq!(payload.key(), "k");
        assert_eq!(payload.action(), Some("On"));
        assert!(payload.commands().is_empty());
    }

    #[test]
    fn test_encode_line_terminates() {
        let line = encode_line(&Payload::ping());
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
    }
}
