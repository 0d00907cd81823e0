//! Message model and wire codec for intercepted HTTP/1.x traffic: header
//! storage, request/response parsing and assembly, content-encoding
//! handling, the flow data model, and replay support. Transport and the
//! per-connection state machine live in `siphon-net` / `siphon-proxy`.

pub mod codec;
pub mod content;
pub mod encoding;
pub mod error;
pub mod flow;
pub mod form;
pub mod headers;
pub mod replay;
pub mod request;
pub mod response;

pub use content::Content;
pub use error::{Error, FlowError};
pub use flow::{attach, ConnectionSnapshot, Flow, FlowId, FlowState, Owned, RequestState, ResponseState};
pub use form::{HttpVersion, RequestForm};
pub use headers::HeaderMap;
pub use request::Request;
pub use response::Response;
