use thiserror::Error;

use siphon_core::FlowError;
use siphon_net::TransportError;

/// Errors the flow engine itself can raise, layering
/// `siphon_net::TransportError` under `siphon_core::FlowError`.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Flow(#[from] FlowError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("listener error: {0}")]
    Listener(#[from] std::io::Error),
}
