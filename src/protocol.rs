//! Terminal websocket frames.

use serde::{Deserialize, Serialize};

/// Structured messages a client may send instead of raw input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Resize { cols: u16, rows: u16 },
    Ping,
}

/// What an incoming payload means to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Control(ControlMessage),
    /// Bytes for the process, forwarded verbatim.
    Input(Vec<u8>),
    /// Looked like a control object but was not a valid one. Dropped.
    Ignored,
}

impl ClientFrame {
    /// Anything shaped like a JSON object is a control candidate and never
    /// reaches the shell. Everything else is input.
    pub fn classify(payload: Vec<u8>) -> Self {
        let trimmed = payload.trim_ascii();
        if !(trimmed.starts_with(b"{") && trimmed.ends_with(b"}")) {
            return ClientFrame::Input(payload);
        }
        match serde_json::from_slice::<ControlMessage>(trimmed) {
            Ok(ControlMessage::Resize { cols, rows }) if cols == 0 || rows == 0 => {
                ClientFrame::Ignored
            }
            Ok(message) => ClientFrame::Control(message),
            Err(_) => ClientFrame::Ignored,
        }
    }
}

/// Structured messages sent to the client. Process output travels as raw
/// binary frames and is not represented here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Connected {
        #[serde(rename = "sessionId")]
        session_id: String,
        cwd: String,
        platform: &'static str,
    },
    Pong,
    Exit {
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
        signal: Option<String>,
    },
    Error {
        message: String,
    },
}

impl ServerFrame {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recognizes_control_messages() {
        assert_eq!(
            ClientFrame::classify(br#"{"type":"ping"}"#.to_vec()),
            ClientFrame::Control(ControlMessage::Ping)
        );
        assert_eq!(
            ClientFrame::classify(b" {\"type\":\"resize\",\"cols\":120,\"rows\":40}\n".to_vec()),
            ClientFrame::Control(ControlMessage::Resize { cols: 120, rows: 40 })
        );
    }

    #[test]
    fn malformed_objects_are_dropped() {
        for payload in [
            r#"{"type":"reboot"}"#,
            r#"{"type":"resize","cols":"wide","rows":10}"#,
            r#"{"type":"resize","cols":0,"rows":10}"#,
            r#"{"type":"ping",}"#,
            "{not json}",
            "{}",
        ] {
            assert_eq!(
                ClientFrame::classify(payload.as_bytes().to_vec()),
                ClientFrame::Ignored,
                "{payload}"
            );
        }
    }

    #[test]
    fn plain_bytes_are_input() {
        for payload in ["echo hi\n", "{", "}", "ls {a,b}\r", "\x03", ""] {
            assert_eq!(
                ClientFrame::classify(payload.as_bytes().to_vec()),
                ClientFrame::Input(payload.as_bytes().to_vec())
            );
        }
    }

    #[test]
    fn server_frames_use_camel_case_fields() {
        let connected = ServerFrame::Connected {
            session_id: "abc".to_string(),
            cwd: "/work".to_string(),
            platform: "linux",
        };
        let value: serde_json::Value = serde_json::from_str(&connected.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "connected", "sessionId": "abc", "cwd": "/work", "platform": "linux"})
        );

        let exit = ServerFrame::Exit {
            exit_code: None,
            signal: Some("SIGKILL".to_string()),
        };
        let value: serde_json::Value = serde_json::from_str(&exit.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "exit", "exitCode": null, "signal": "SIGKILL"}));

        assert_eq!(ServerFrame::Pong.encode().unwrap(), r#"{"type":"pong"}"#);
    }
}
