//! The wire frame shared by both transports.
//!
//! A frame is a single-line JSON object with exactly one key, the command,
//! whose value is an object of named arguments:
//!
//! ```text
//! {"status": {"node_address": "light1", "driver_control": "ST", "value": 100, "uom": 51}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Named frame arguments.
pub type Args = Map<String, Value>;

/// Maximum accepted frame length in bytes (one line, without the newline).
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// One protocol message: a command name and its named arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: String,
    pub args: Args,
}

/// Reasons a line could not be decoded into a [`Frame`].
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no command")]
    Empty,

    #[error("frame carries {0} commands, expected exactly one")]
    MultipleCommands(usize),

    #[error("arguments of `{0}` are not a JSON object")]
    ArgsNotAnObject(String),

    #[error("frame exceeds {MAX_FRAME_BYTES} bytes")]
    TooLarge,
}

impl Frame {
    /// Build a frame from a command and an argument map.
    pub fn new(command: impl Into<String>, args: Args) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    /// A frame without arguments (`{"ping": {}}`).
    pub fn bare(command: impl Into<String>) -> Self {
        Self::new(command, Args::new())
    }

    /// Build a frame from any serializable argument struct.
    ///
    /// `None` fields should be skipped by the struct itself; anything that
    /// does not serialize to an object is wrapped under `"value"`.
    pub fn from_args<T: Serialize>(command: impl Into<String>, args: &T) -> Result<Self, FrameError> {
        let args = match serde_json::to_value(args)? {
            Value::Object(map) => map,
            Value::Null => Args::new(),
            other => {
                let mut map = Args::new();
                map.insert("value".into(), other);
                map
            }
        };
        Ok(Self::new(command, args))
    }

    /// Decode one line (trailing whitespace tolerated).
    pub fn decode(line: &str) -> Result<Self, FrameError> {
        let line = line.trim();
        if line.len() > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge);
        }
        let value: Value = serde_json::from_str(line)?;
        Self::from_value(value)
    }

    /// Decode a raw payload (MQTT message body).
    pub fn decode_bytes(payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge);
        }
        let value: Value = serde_json::from_slice(payload)?;
        Self::from_value(value)
    }

    fn from_value(value: Value) -> Result<Self, FrameError> {
        let Value::Object(map) = value else {
            return Err(FrameError::NotAnObject);
        };
        if map.len() > 1 {
            return Err(FrameError::MultipleCommands(map.len()));
        }
        let Some((command, args)) = map.into_iter().next() else {
            return Err(FrameError::Empty);
        };
        let args = match args {
            Value::Object(args) => args,
            // `{"pong": null}` is tolerated as an empty argument list.
            Value::Null => Args::new(),
            _ => return Err(FrameError::ArgsNotAnObject(command)),
        };
        Ok(Self { command, args })
    }

    /// Encode as a single JSON line without the trailing newline.
    ///
    /// serde_json escapes control characters inside strings, so the output
    /// never contains a raw newline.
    pub fn encode(&self) -> String {
        let mut map = Map::with_capacity(1);
        map.insert(self.command.clone(), Value::Object(self.args.clone()));
        Value::Object(map).to_string()
    }

    /// Deserialize the arguments into a typed struct.
    pub fn parse_args<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.args.clone()))
    }

    /// Borrow a string argument.
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_single_command() {
        let frame = Frame::decode(r#"{"status": {"node_address": "a", "value": 1}}"#).unwrap();
        assert_eq!(frame.command, "status");
        assert_eq!(frame.str_arg("node_address"), Some("a"));
        assert_eq!(frame.args["value"], json!(1));
    }

    #[test]
    fn null_args_are_empty() {
        let frame = Frame::decode(r#"{"pong": null}"#).unwrap();
        assert_eq!(frame.command, "pong");
        assert!(frame.args.is_empty());
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(matches!(Frame::decode("not json"), Err(FrameError::Json(_))));
        assert!(matches!(Frame::decode("[1, 2]"), Err(FrameError::NotAnObject)));
        assert!(matches!(Frame::decode("{}"), Err(FrameError::Empty)));
        assert!(matches!(
            Frame::decode(r#"{"a": {}, "b": {}}"#),
            Err(FrameError::MultipleCommands(2))
        ));
        assert!(matches!(
            Frame::decode(r#"{"status": [1]}"#),
            Err(FrameError::ArgsNotAnObject(c)) if c == "status"
        ));
    }

    #[test]
    fn encoding_never_contains_newlines() {
        let mut args = Args::new();
        args.insert("name".into(), json!("line one\nline two"));
        let line = Frame::new("renamed", args.clone()).encode();
        assert!(!line.contains('\n'));
        assert_eq!(Frame::decode(&line).unwrap().args, args);
    }

    #[test]
    fn bare_frame_encodes_empty_object() {
        assert_eq!(Frame::bare("ping").encode(), r#"{"ping":{}}"#);
    }

    #[test]
    fn oversized_payload_rejected() {
        let payload = vec![b' '; MAX_FRAME_BYTES + 1];
        assert!(matches!(Frame::decode_bytes(&payload), Err(FrameError::TooLarge)));
    }
}
