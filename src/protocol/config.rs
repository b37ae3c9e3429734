//! Configuration for the server-side upgrade and the connections it
//! produces.

use http::Request;

use crate::{
    DEFAULT_READ_BUFFER_SIZE, DEFAULT_WRITE_BUFFER_SIZE, MAX_FRAME_PAYLOAD, MAX_MESSAGE_SIZE,
};

/// Predicate deciding whether a request's origin is acceptable.
pub type OriginPredicate = Box<dyn Fn(&Request<()>) -> bool + Send + Sync>;

/// Options governing the WebSocket upgrade and the resulting connection.
pub struct UpgradeOptions {
    /// Subprotocols the server is willing to speak. The first
    /// client-offered protocol also present here is selected; an empty list
    /// disables negotiation.
    pub subprotocols: Vec<String>,

    /// Origin check invoked with the parsed request. `None` allows every
    /// origin, which is only safe when the host performs its own check.
    pub check_origin: Option<OriginPredicate>,

    /// Capacity of the buffered reader wrapping the inbound stream.
    pub read_buffer_size: usize,

    /// Capacity of the buffered writer wrapping the outbound stream.
    pub write_buffer_size: usize,

    /// Largest single-frame payload accepted or emitted.
    pub max_frame_size: usize,

    /// Largest reassembled message accepted.
    pub max_message_size: usize,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        UpgradeOptions {
            subprotocols: Vec::new(),
            check_origin: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            max_frame_size: MAX_FRAME_PAYLOAD,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl std::fmt::Debug for UpgradeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeOptions")
            .field("subprotocols", &self.subprotocols)
            .field("check_origin", &self.check_origin.as_ref().map(|_| "<predicate>"))
            .field("read_buffer_size", &self.read_buffer_size)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("max_frame_size", &self.max_frame_size)
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}
