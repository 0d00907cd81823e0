//! Inspector interaction protocol (spec §4.4 step 2, §6 "Inspector
//! protocol", §9 design note on the dual-payload ambiguity).
//!
//! Per DESIGN.md, the legacy/whole-flow ambiguity in the original is
//! resolved to a single canonical shape: every `ask` call receives the
//! whole [`siphon_core::Flow`], never just the child request/response.

use siphon_core::{Flow, Response};

/// Which point in the flow lifecycle the inspector is being consulted at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Request,
    Response,
    Error,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Request => "request",
            Topic::Response => "response",
            Topic::Error => "error",
        }
    }
}

/// The inspector's verdict on a flow (spec §6, "Inspector protocol").
/// Replaces the legacy null/KILL-sentinel/Response/mutated-original union
/// with an explicit enum; "mutated original" is represented by the
/// inspector mutating the `&mut Flow` it was given and returning
/// `Reply::Proceed`.
#[derive(Debug)]
pub enum Reply {
    /// Proceed with the (possibly mutated) flow as given.
    Proceed,
    /// Drop the connection without any further processing.
    Kill,
    /// Short-circuit: use this response instead of contacting upstream.
    Respond(Response),
}

/// The external observer consulted at the request, response, and error
/// points of a flow (spec §4.4, §6). The core blocks on `ask` until a
/// reply arrives — callers that need genuine concurrency serialize access
/// themselves (spec §5, "the inspector channel is... responsible for
/// serializing access").
pub trait Inspector: Send + Sync {
    async fn ask(&self, topic: Topic, flow: &mut Flow) -> Reply;
}

/// Default inspector: logs every flow at every topic via `tracing` and
/// always proceeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInspector;

impl Inspector for LoggingInspector {
    async fn ask(&self, topic: Topic, flow: &mut Flow) -> Reply {
        match topic {
            Topic::Request => {
                if let Some(req) = &flow.request {
                    tracing::info!(flow_id = flow.id, method = %req.value.method, path = ?req.value.path, "request");
                }
            }
            Topic::Response => {
                if let Some(resp) = &flow.response {
                    tracing::info!(flow_id = flow.id, code = resp.value.code, "response");
                }
            }
            Topic::Error => {
                if let Some(err) = &flow.error {
                    tracing::warn!(flow_id = flow.id, msg = %err.value.msg, "flow error");
                }
            }
        }
        Reply::Proceed
    }
}

/// Optional sink for completed flows (e.g. recording for later replay).
/// Out of scope per spec.md §1 ("persistence of recorded flows" is an
/// external collaborator); kept as a trait so a caller can plug one in
/// without the flow engine knowing about storage.
pub trait FlowSink: Send + Sync {
    fn record(&self, flow: &Flow);
}

/// A `FlowSink` that discards everything, for callers with no recording
/// requirement.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFlowSink;

impl FlowSink for NullFlowSink {
    fn record(&self, _flow: &Flow) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use siphon_core::flow::ConnectionSnapshot;

    fn sample_flow() -> Flow {
        let snapshot = ConnectionSnapshot { address: "127.0.0.1:1".into(), ssl_established: false };
        Flow::new(1, snapshot, None)
    }

    #[tokio::test]
    async fn logging_inspector_always_proceeds() {
        let inspector = LoggingInspector;
        let mut flow = sample_flow();
        let reply = inspector.ask(Topic::Request, &mut flow).await;
        assert!(matches!(reply, Reply::Proceed));
    }

    #[test]
    fn null_sink_accepts_any_flow_without_panicking() {
        let sink = NullFlowSink;
        sink.record(&sample_flow());
    }
}
