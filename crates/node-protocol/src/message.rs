//! Typed views of the frames exchanged with workers.
//!
//! Downstream requests serialize through serde's externally tagged enum
//! representation, which is exactly the frame shape (`{"query": {...}}`).
//! Upstream frames are parsed by command name so that an unknown command
//! and a known command with bad arguments can be told apart.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::address::{self, AddressError};
use crate::frame::{Args, Frame, FrameError};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Controller → worker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A controller request addressed to one worker.
///
/// Addresses are global when the request enters the manager and are
/// rewritten to local form with [`ControllerRequest::localize`] before the
/// frame is sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerRequest {
    Install {
        profile_number: u32,
    },
    Query {
        node_address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Status {
        node_address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    AddAll {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Added {
        node_address: String,
        node_def_id: String,
        primary_node_address: String,
        name: String,
    },
    Removed {
        node_address: String,
    },
    Renamed {
        node_address: String,
        name: String,
    },
    Enabled {
        node_address: String,
    },
    Disabled {
        node_address: String,
    },
    Cmd(NodeCommand),
    Ping {},
    Exit {},
}

/// Arguments of a `cmd` request (and of an upstream `command` report).
///
/// Extra `<param>.<uom>` pairs are kept in `params` and flattened into the
/// frame next to the fixed fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCommand {
    pub node_address: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uom: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub params: BTreeMap<String, Value>,
}

impl ControllerRequest {
    /// The frame command this request is sent as.
    pub fn command(&self) -> &'static str {
        match self {
            Self::Install { .. } => "install",
            Self::Query { .. } => "query",
            Self::Status { .. } => "status",
            Self::AddAll { .. } => "add_all",
            Self::Added { .. } => "added",
            Self::Removed { .. } => "removed",
            Self::Renamed { .. } => "renamed",
            Self::Enabled { .. } => "enabled",
            Self::Disabled { .. } => "disabled",
            Self::Cmd(_) => "cmd",
            Self::Ping {} => "ping",
            Self::Exit {} => "exit",
        }
    }

    /// The correlation id the controller expects a `request` report for.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Query { request_id, .. }
            | Self::Status { request_id, .. }
            | Self::AddAll { request_id } => request_id.as_deref(),
            Self::Cmd(cmd) => cmd.request_id.as_deref(),
            _ => None,
        }
    }

    /// Rewrite every node address from global to `worker_id`-local form.
    pub fn localize(self, worker_id: &str) -> Result<Self, AddressError> {
        let local = |addr: String| address::to_local(worker_id, &addr);
        Ok(match self {
            Self::Query { node_address, request_id } => Self::Query {
                node_address: local(node_address)?,
                request_id,
            },
            Self::Status { node_address, request_id } => Self::Status {
                node_address: local(node_address)?,
                request_id,
            },
            Self::Added {
                node_address,
                node_def_id,
                primary_node_address,
                name,
            } => Self::Added {
                node_address: local(node_address)?,
                node_def_id,
                primary_node_address: local(primary_node_address)?,
                name,
            },
            Self::Removed { node_address } => Self::Removed {
                node_address: local(node_address)?,
            },
            Self::Renamed { node_address, name } => Self::Renamed {
                node_address: local(node_address)?,
                name,
            },
            Self::Enabled { node_address } => Self::Enabled {
                node_address: local(node_address)?,
            },
            Self::Disabled { node_address } => Self::Disabled {
                node_address: local(node_address)?,
            },
            Self::Cmd(mut cmd) => {
                cmd.node_address = local(cmd.node_address)?;
                Self::Cmd(cmd)
            }
            other @ (Self::Install { .. } | Self::AddAll { .. } | Self::Ping {} | Self::Exit {}) => other,
        })
    }

    /// Encode as a wire frame.
    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        let line = serde_json::to_string(self)?;
        Frame::decode(&line)
    }
}

/// Startup parameters sent right after the persisted config.
///
/// Field names follow what existing node servers read from `params`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Params {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<u32>,
    pub sandbox: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configfile: Option<String>,
    /// `"Default"` for stdio workers, `"mqtt"` for broker workers.
    pub interface: String,
    pub isyver: String,
    pub pgver: String,
    pub pgapiver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt_port: Option<u16>,
}

impl Params {
    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        Frame::from_args("params", self)
    }
}

/// The `config` frame delivering a worker's persisted blob.
pub fn config_frame(config: &Args) -> Frame {
    Frame::new("config", config.clone())
}

/// How an upstream call went, sent back to the worker as a `result` frame
/// when its report carried a `seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    pub seq: Value,
    /// HTTP status, or a code below 100 when no response arrived:
    /// 1 timeout, 3 unusable request, 4 connection failure.
    pub status_code: u16,
    /// Seconds spent on the call, retries included.
    pub elapsed: f64,
    /// Response body for `restcall`, error text for failed calls.
    pub text: Option<String>,
    pub retries: u32,
}

impl CallResult {
    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        Frame::from_args("result", self)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker → controller
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub node_address: String,
    pub driver_control: String,
    pub value: Value,
    pub uom: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReport {
    pub node_address: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uom: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<Value>,
    #[serde(flatten)]
    pub params: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddNode {
    pub node_address: String,
    pub node_def_id: String,
    pub primary: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNode {
    pub node_address: String,
    pub node_def_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveNode {
    pub node_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestReport {
    pub request_id: String,
    /// Older node server libraries send this as `success`.
    #[serde(alias = "success")]
    pub result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<Value>,
}

/// A raw `GET /rest/<api>` made on the worker's behalf. Only useful with a
/// `seq`, since the response body comes back in the `result` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestCall {
    pub api: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<Value>,
}

/// A report the manager forwards to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamReport {
    Status(StatusReport),
    Command(CommandReport),
    Add(AddNode),
    Change(ChangeNode),
    Remove(RemoveNode),
    Request(RequestReport),
    #[serde(rename = "restcall")]
    RestCall(RestCall),
}

impl UpstreamReport {
    pub fn command(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Command(_) => "command",
            Self::Add(_) => "add",
            Self::Change(_) => "change",
            Self::Remove(_) => "remove",
            Self::Request(_) => "request",
            Self::RestCall(_) => "restcall",
        }
    }

    fn timeout_and_seq(&self) -> (Option<&Value>, Option<&Value>) {
        match self {
            Self::Status(r) => (r.timeout.as_ref(), r.seq.as_ref()),
            Self::Command(r) => (r.timeout.as_ref(), r.seq.as_ref()),
            Self::Add(r) => (r.timeout.as_ref(), r.seq.as_ref()),
            Self::Change(r) => (r.timeout.as_ref(), r.seq.as_ref()),
            Self::Remove(r) => (r.timeout.as_ref(), r.seq.as_ref()),
            Self::Request(r) => (r.timeout.as_ref(), r.seq.as_ref()),
            Self::RestCall(r) => (r.timeout.as_ref(), r.seq.as_ref()),
        }
    }

    /// Per-call timeout, given by the worker in seconds as a number or a
    /// numeric string. Zero, negative and unparseable values are ignored.
    pub fn timeout(&self) -> Option<Duration> {
        let secs = match self.timeout_and_seq().0? {
            Value::Number(n) => n.as_f64()?,
            Value::String(s) => s.trim().parse().ok()?,
            _ => return None,
        };
        Duration::try_from_secs_f64(secs).ok().filter(|d| !d.is_zero())
    }

    /// The worker's callback id; a `result` frame is owed when present.
    pub fn seq(&self) -> Option<&Value> {
        self.timeout_and_seq().1.filter(|seq| !seq.is_null())
    }

    /// Rewrite every node address from local to global form.
    pub fn globalize(mut self, worker_id: &str) -> Self {
        let global = |addr: &mut String| *addr = address::to_global(worker_id, addr);
        match &mut self {
            Self::Status(r) => global(&mut r.node_address),
            Self::Command(r) => global(&mut r.node_address),
            Self::Add(r) => {
                global(&mut r.node_address);
                global(&mut r.primary);
            }
            Self::Change(r) => global(&mut r.node_address),
            Self::Remove(r) => global(&mut r.node_address),
            Self::Request(_) | Self::RestCall(_) => {}
        }
        self
    }
}

/// Every frame a worker may send, parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    /// Save the worker's config blob.
    Config(Args),
    Report(UpstreamReport),
    Pong,
    Exit,
    /// MQTT presence marker published by the worker.
    Connected,
    /// The worker's MQTT last-will fired.
    Disconnected,
    /// Recognised but not handled by this supervisor (`statistics`, ...).
    Unsupported(String),
}

/// A frame that decoded but does not follow the protocol.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("bad arguments for `{command}`: {source}")]
    BadArgs {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}

impl WorkerMessage {
    pub fn parse(frame: Frame) -> Result<Self, ProtocolError> {
        fn args<T: for<'de> Deserialize<'de>>(frame: &Frame) -> Result<T, ProtocolError> {
            frame.parse_args().map_err(|source| ProtocolError::BadArgs {
                command: frame.command.clone(),
                source,
            })
        }

        let msg = match frame.command.as_str() {
            "config" => Self::Config(frame.args),
            "status" => Self::Report(UpstreamReport::Status(args(&frame)?)),
            "command" => Self::Report(UpstreamReport::Command(args(&frame)?)),
            "add" => Self::Report(UpstreamReport::Add(args(&frame)?)),
            "change" => Self::Report(UpstreamReport::Change(args(&frame)?)),
            "remove" => Self::Report(UpstreamReport::Remove(args(&frame)?)),
            "request" => Self::Report(UpstreamReport::Request(args(&frame)?)),
            "restcall" => Self::Report(UpstreamReport::RestCall(args(&frame)?)),
            "pong" => Self::Pong,
            "exit" => Self::Exit,
            "connected" => Self::Connected,
            "disconnected" => Self::Disconnected,
            "statistics" | "manager" | "install" => Self::Unsupported(frame.command),
            _ => return Err(ProtocolError::UnknownCommand(frame.command)),
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(line: &str) -> Result<WorkerMessage, ProtocolError> {
        WorkerMessage::parse(Frame::decode(line).unwrap())
    }

    #[test]
    fn add_report_is_globalized() {
        let msg = parse(
            r#"{"add": {"node_address": "light1", "node_def_id": "COLOR_LIGHT", "primary": "hub", "name": "Lamp"}}"#,
        )
        .unwrap();
        let WorkerMessage::Report(report) = msg else {
            panic!("expected report");
        };
        let UpstreamReport::Add(add) = report.globalize("hue") else {
            panic!("expected add");
        };
        assert_eq!(add.node_address, "hue_light1");
        assert_eq!(add.primary, "hue_hub");
        assert_eq!(add.node_def_id, "COLOR_LIGHT");
        assert_eq!(add.name, "Lamp");
    }

    #[test]
    fn request_accepts_success_alias() {
        let msg = parse(r#"{"request": {"request_id": "42", "success": true}}"#).unwrap();
        assert_eq!(
            msg,
            WorkerMessage::Report(UpstreamReport::Request(RequestReport {
                request_id: "42".into(),
                result: true,
                timeout: None,
                seq: None,
            }))
        );
    }

    #[test]
    fn command_report_keeps_extra_params() {
        let msg = parse(
            r#"{"command": {"node_address": "sw", "command": "DON", "value": 1, "ramp.58": 2.5}}"#,
        )
        .unwrap();
        let WorkerMessage::Report(UpstreamReport::Command(cmd)) = msg else {
            panic!("expected command");
        };
        assert_eq!(cmd.params.get("ramp.58"), Some(&json!(2.5)));
        assert_eq!(cmd.value, Some(json!(1)));
    }

    #[test]
    fn unknown_and_bad_frames_are_distinguished() {
        assert!(matches!(parse(r#"{"dance": {}}"#), Err(ProtocolError::UnknownCommand(c)) if c == "dance"));
        assert!(matches!(
            parse(r#"{"status": {"node_address": "a"}}"#),
            Err(ProtocolError::BadArgs { command, .. }) if command == "status"
        ));
        assert_eq!(
            parse(r#"{"statistics": {}}"#).unwrap(),
            WorkerMessage::Unsupported("statistics".into())
        );
    }

    #[test]
    fn restcall_is_forwarded_untouched() {
        let msg = parse(r#"{"restcall": {"api": "nodes/hue_light1", "seq": 1001}}"#).unwrap();
        let WorkerMessage::Report(report) = msg else {
            panic!("expected report");
        };
        let report = report.globalize("hue");
        assert_eq!(report.command(), "restcall");
        assert!(matches!(&report, UpstreamReport::RestCall(r) if r.api == "nodes/hue_light1"));
        assert_eq!(report.seq(), Some(&json!(1001)));
    }

    #[test]
    fn timeouts_are_seconds() {
        let with_timeout = |timeout: Value| {
            UpstreamReport::Remove(RemoveNode {
                node_address: "a".into(),
                timeout: Some(timeout),
                seq: Some(Value::Null),
            })
        };
        assert_eq!(with_timeout(json!(10)).timeout(), Some(Duration::from_secs(10)));
        assert_eq!(with_timeout(json!(2.5)).timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(with_timeout(json!("3")).timeout(), Some(Duration::from_secs(3)));
        assert_eq!(with_timeout(json!(-1)).timeout(), None);
        assert_eq!(with_timeout(json!(0)).timeout(), None);
        assert_eq!(with_timeout(json!("soon")).timeout(), None);
        // A null seq asks for no callback.
        assert_eq!(with_timeout(json!(1)).seq(), None);
    }

    #[test]
    fn call_result_frame_keeps_null_text() {
        let result = CallResult {
            seq: json!(1001),
            status_code: 200,
            elapsed: 0.5,
            text: None,
            retries: 0,
        };
        let frame = result.to_frame().unwrap();
        assert_eq!(frame.command, "result");
        assert_eq!(frame.args["seq"], json!(1001));
        assert_eq!(frame.args["text"], Value::Null);
    }

    #[test]
    fn cmd_request_localizes_and_flattens_params() {
        let mut params = BTreeMap::new();
        params.insert("level.51".to_string(), json!(50.0));
        let req = ControllerRequest::Cmd(NodeCommand {
            node_address: "hue_light1".into(),
            command: "DON".into(),
            value: None,
            uom: None,
            request_id: Some("7".into()),
            params,
        });
        assert_eq!(req.request_id(), Some("7"));
        let frame = req.localize("hue").unwrap().to_frame().unwrap();
        assert_eq!(frame.command, "cmd");
        assert_eq!(frame.args["node_address"], json!("light1"));
        assert_eq!(frame.args["level.51"], json!(50.0));
        assert_eq!(frame.args["request_id"], json!("7"));
        assert!(!frame.args.contains_key("value"));
    }

    #[test]
    fn added_localizes_primary_too() {
        let req = ControllerRequest::Added {
            node_address: "hue_light1".into(),
            node_def_id: "COLOR_LIGHT".into(),
            primary_node_address: "hue_hub".into(),
            name: "Lamp".into(),
        };
        let frame = req.localize("hue").unwrap().to_frame().unwrap();
        assert_eq!(frame.args["primary_node_address"], json!("hub"));
    }

    #[test]
    fn foreign_address_is_rejected() {
        let req = ControllerRequest::Query {
            node_address: "kodi_player".into(),
            request_id: None,
        };
        assert!(matches!(req.localize("hue"), Err(AddressError::Mismatch { .. })));
    }

    #[test]
    fn empty_requests_encode_as_empty_objects() {
        assert_eq!(ControllerRequest::Ping {}.to_frame().unwrap().encode(), r#"{"ping":{}}"#);
        assert_eq!(ControllerRequest::Exit {}.to_frame().unwrap().encode(), r#"{"exit":{}}"#);
        assert_eq!(
            ControllerRequest::AddAll { request_id: None }.to_frame().unwrap().encode(),
            r#"{"add_all":{}}"#
        );
    }
}
