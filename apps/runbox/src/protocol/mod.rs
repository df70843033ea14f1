//! Wire frames exchanged with the execution service. One JSON object
//! per WebSocket text message, discriminated by the `type` field.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frames the client writes to the service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame after the socket opens; the credential is single
    /// use and consumed by the server on receipt.
    Execute {
        job_id: String,
        job_token: String,
        code: String,
        language: String,
    },
    /// One line of stdin. `data` must carry its newline terminator.
    Input { data: String },
}

impl ClientFrame {
    pub fn kind_label(&self) -> &'static str {
        match self {
            ClientFrame::Execute { .. } => "execute",
            ClientFrame::Input { .. } => "input",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Frames the service writes back. `Complete` and `Error` are
/// terminal and mutually exclusive; `Output` may repeat any number of
/// times before either.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Output { stream: StreamKind, data: String },
    Complete { exit_code: i32, execution_time: f64 },
    Error { message: String },
}

const SERVER_TAGS: &[&str] = &["output", "complete", "error"];

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown frame type '{0}'")]
    UnknownType(String),
}

pub fn encode_client_frame(frame: &ClientFrame) -> Result<String, WireError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decodes one inbound payload. Unknown `type` tags come back as
/// `WireError::UnknownType` so the transport can drop them without
/// tearing the connection down.
pub fn decode_server_frame(text: &str) -> Result<ServerFrame, WireError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let tag = value
        .get("type")
        .and_then(|tag| tag.as_str())
        .unwrap_or_default()
        .to_string();
    if !SERVER_TAGS.contains(&tag.as_str()) {
        return Err(WireError::UnknownType(tag));
    }
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_frame_serializes_flat() {
        let frame = ClientFrame::Execute {
            job_id: "j1".into(),
            job_token: "t1".into(),
            code: "print(1)".into(),
            language: "python".into(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&encode_client_frame(&frame).unwrap()).unwrap();
        assert_eq!(value["type"], "execute");
        assert_eq!(value["job_id"], "j1");
        assert_eq!(value["job_token"], "t1");
        assert_eq!(value["code"], "print(1)");
        assert_eq!(value["language"], "python");
    }

    #[test]
    fn input_frame_keeps_newline() {
        let frame = ClientFrame::Input { data: "5\n".into() };
        let value: serde_json::Value =
            serde_json::from_str(&encode_client_frame(&frame).unwrap()).unwrap();
        assert_eq!(value["type"], "input");
        assert_eq!(value["data"], "5\n");
    }

    #[test]
    fn decodes_output_frame() {
        let frame =
            decode_server_frame(r#"{"type":"output","stream":"stdout","data":"1\n"}"#).unwrap();
        assert_eq!(
            frame,
            ServerFrame::Output {
                stream: StreamKind::Stdout,
                data: "1\n".into()
            }
        );
    }

    #[test]
    fn decodes_complete_frame() {
        let frame =
            decode_server_frame(r#"{"type":"complete","exit_code":0,"execution_time":0.01}"#)
                .unwrap();
        assert_eq!(
            frame,
            ServerFrame::Complete {
                exit_code: 0,
                execution_time: 0.01
            }
        );
    }

    #[test]
    fn decodes_error_frame() {
        let frame = decode_server_frame(r#"{"type":"error","message":"boom"}"#).unwrap();
        assert_eq!(
            frame,
            ServerFrame::Error {
                message: "boom".into()
            }
        );
    }

    #[test]
    fn unknown_tag_is_distinguished() {
        let err = decode_server_frame(r#"{"type":"bogus","data":"x"}"#).unwrap_err();
        assert!(matches!(err, WireError::UnknownType(tag) if tag == "bogus"));
        let err = decode_server_frame(r#"{"data":"no tag"}"#).unwrap_err();
        assert!(matches!(err, WireError::UnknownType(tag) if tag.is_empty()));
    }

    #[test]
    fn client_tags_are_unknown_inbound() {
        let err = decode_server_frame(r#"{"type":"input","data":"x\n"}"#).unwrap_err();
        assert!(matches!(err, WireError::UnknownType(_)));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            decode_server_frame("not json"),
            Err(WireError::Malformed(_))
        ));
        assert!(matches!(
            decode_server_frame(r#"{"type":"output","stream":"tty","data":""}"#),
            Err(WireError::Malformed(_))
        ));
    }
}
