//! Wire framing for the backend's push protocol.
//!
//! Inbound frames are a small JSON envelope: a connection id under `C` and a
//! list of method invocations under `M`, each tagged with a hub (`H`), a
//! method (`M`) and arguments (`A`). The accepted hub/method pair signals
//! "something changed" without carrying the changed record, so the channel
//! treats it purely as a refresh trigger.

use serde::{Deserialize, Serialize};

/// Decoded inbound envelope.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Envelope {
    /// Connection id assigned by the backend.
    #[serde(rename = "C")]
    pub connection_id: Option<String>,

    /// Method invocations carried by this frame.
    #[serde(rename = "M", default)]
    pub invocations: Vec<Invocation>,
}

/// One hub method invocation.
#[derive(Clone, Debug, Deserialize)]
pub struct Invocation {
    #[serde(rename = "H")]
    pub hub: Option<String>,

    #[serde(rename = "M")]
    pub method: Option<String>,

    #[serde(rename = "A", default)]
    pub args: Vec<serde_json::Value>,
}

impl Invocation {
    /// Whether this invocation targets the subscribed hub/method pair.
    /// Hub and method names compare case-insensitively; the backend is not
    /// consistent about casing.
    pub fn matches(&self, hub: &str, method: &str) -> bool {
        let hub_ok = self
            .hub
            .as_deref()
            .is_some_and(|h| h.eq_ignore_ascii_case(hub));
        let method_ok = self
            .method
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case(method));
        hub_ok && method_ok
    }
}

impl Envelope {
    /// Count of invocations matching the subscribed hub/method pair.
    pub fn matching(&self, hub: &str, method: &str) -> usize {
        self.invocations
            .iter()
            .filter(|inv| inv.matches(hub, method))
            .count()
    }
}

/// Decode one inbound frame. Malformed frames (non-JSON, non-object, wrong
/// field shapes) yield `None` and are dropped by the caller; they are never
/// fatal to the channel.
pub fn decode(text: &str) -> Option<Envelope> {
    serde_json::from_str(text).ok()
}

/// Outbound control frame.
#[derive(Serialize)]
struct ControlFrame<'a> {
    #[serde(rename = "H")]
    hub: &'a str,
    #[serde(rename = "M")]
    method: &'a str,
    #[serde(rename = "A")]
    args: [(); 0],
    #[serde(rename = "I")]
    id: u64,
}

fn control_frame(hub: &str, method: &str, id: u64) -> String {
    serde_json::to_string(&ControlFrame {
        hub,
        method,
        args: [],
        id,
    })
    .expect("control frame serialization cannot fail")
}

/// "Join subscription" frame, sent once after the transport opens.
pub fn join_frame(hub: &str, id: u64) -> String {
    control_frame(hub, "Join", id)
}

/// Keep-alive ping frame.
pub fn ping_frame(hub: &str, id: u64) -> String {
    control_frame(hub, "ping", id)
}
