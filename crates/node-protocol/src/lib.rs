//! Node server protocol: frame codec, typed messages, and address namespacing.
//!
//! Workers are independent processes (a device integration each) that talk
//! to the supervisor with single-line JSON frames, either over their standard
//! streams or through an MQTT broker. Both transports carry the same frames.

pub mod address;
pub mod frame;
pub mod message;

pub use address::{to_global, to_local, validate_worker_id, AddressError};
pub use frame::{Args, Frame, FrameError, MAX_FRAME_BYTES};
pub use message::{
    config_frame, AddNode, CallResult, ChangeNode, CommandReport, ControllerRequest, NodeCommand, Params,
    ProtocolError, RemoveNode, RequestReport, RestCall, StatusReport, UpstreamReport, WorkerMessage,
};

/// Version of the manager ↔ worker API, sent to workers as `pgapiver`.
///
/// Bump when a breaking change or a new message is added.
pub const API_VERSION: &str = "1";

/// MQTT topic naming.
pub mod topics {
    use crate::frame::Frame;

    pub const ROOT: &str = "udi/polyglot";

    /// Worker → manager.
    pub fn poly(worker_id: &str) -> String {
        format!("{ROOT}/{worker_id}/poly")
    }

    /// Manager → worker, also carries the retained connection marker.
    pub fn node(worker_id: &str) -> String {
        format!("{ROOT}/{worker_id}/node")
    }

    /// Extract the worker id from a `poly` topic.
    pub fn worker_of_poly(topic: &str) -> Option<&str> {
        topic
            .strip_prefix(ROOT)?
            .strip_prefix('/')?
            .strip_suffix("/poly")
            .filter(|id| !id.is_empty() && !id.contains('/'))
    }

    pub fn connected_marker() -> String {
        Frame::bare("connected").encode()
    }

    pub fn disconnected_marker() -> String {
        Frame::bare("disconnected").encode()
    }

}
