use serde::{Deserialize, Serialize};

use crate::error::{Error, FlowError};
use crate::form::{HttpVersion, RequestForm};
use crate::headers::HeaderMap;
use crate::request::Request;
use crate::response::Response;

/// Identifies a [`Flow`] for the purposes of the backreference invariant.
/// Assigned by the caller (the flow state machine owns a monotonic
/// counter); `siphon-core` itself has no global mutable state.
pub type FlowId = u64;

/// A child value (`Request`, `Response`, or `Error`) tagged with the id of
/// the `Flow` it's attached to, replacing the setter-intercepting
/// backreference mixin in the original with the explicit `attach`
/// operation DESIGN.md calls for.
#[derive(Debug, Clone)]
pub struct Owned<T> {
    owner: Option<FlowId>,
    pub value: T,
}

impl<T> Owned<T> {
    pub fn new(value: T) -> Self {
        Self { owner: None, value }
    }

    pub fn owner(&self) -> Option<FlowId> {
        self.owner
    }
}

/// Installs `owner` on `child` if it is unattached or already owned by
/// `owner`; fails if `child` already belongs to a different flow (spec §3
/// Invariants, "Backreference consistency").
pub fn attach<T>(owner: FlowId, child: &mut Owned<T>) -> Result<(), FlowError> {
    match child.owner {
        Some(existing) if existing != owner => {
            Err(FlowError::InvalidRequest(format!("child already attached to flow {existing}")))
        }
        _ => {
            child.owner = Some(owner);
            Ok(())
        }
    }
}

/// A snapshot of a connection's identity, substituted for the live socket
/// handle when a [`Flow`] is serialized (spec §3 Invariants).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub address: String,
    pub ssl_established: bool,
}

/// One HTTP transaction: the request, the response (if any), the error
/// (if any), and the connections it ran over (spec §3).
#[derive(Debug, Clone)]
pub struct Flow {
    pub id: FlowId,
    pub conntype: String,
    pub client_conn: ConnectionSnapshot,
    pub server_conn: Option<ConnectionSnapshot>,
    pub request: Option<Owned<Request>>,
    pub response: Option<Owned<Response>>,
    pub error: Option<Owned<Error>>,
}

impl Flow {
    pub fn new(id: FlowId, client_conn: ConnectionSnapshot, server_conn: Option<ConnectionSnapshot>) -> Self {
        Self { id, conntype: "http".to_string(), client_conn, server_conn, request: None, response: None, error: None }
    }

    pub fn set_request(&mut self, request: Request) {
        let mut owned = Owned::new(request);
        attach(self.id, &mut owned).expect("fresh Owned value can always attach");
        self.request = Some(owned);
    }

    pub fn set_response(&mut self, response: Response) {
        let mut owned = Owned::new(response);
        attach(self.id, &mut owned).expect("fresh Owned value can always attach");
        self.response = Some(owned);
    }

    pub fn set_error(&mut self, error: Error) {
        let mut owned = Owned::new(error);
        attach(self.id, &mut owned).expect("fresh Owned value can always attach");
        self.error = Some(owned);
    }

    /// Attaches an already-`Owned` child (e.g. moved from another flow).
    /// Fails if it is owned by a different flow id.
    pub fn try_attach_request(&mut self, mut owned: Owned<Request>) -> Result<(), FlowError> {
        attach(self.id, &mut owned)?;
        self.request = Some(owned);
        Ok(())
    }

    /// Clones this flow's request/response/error into a fresh flow with
    /// `new_id`. Per DESIGN.md, the response is copied from `self.response`
    /// (the original implementation's `self.request` here was a
    /// known bug, not reproduced).
    pub fn copy(&self, new_id: FlowId) -> Flow {
        let mut f = Flow::new(new_id, self.client_conn.clone(), self.server_conn.clone());
        f.conntype = self.conntype.clone();
        if let Some(req) = &self.request {
            f.set_request(req.value.copy());
        }
        if let Some(resp) = &self.response {
            f.set_response(resp.value.copy());
        }
        if let Some(err) = &self.error {
            f.set_error(err.value.clone());
        }
        f
    }

    pub fn to_state(&self) -> FlowState {
        FlowState {
            conntype: self.conntype.clone(),
            client_conn: self.client_conn.clone(),
            server_conn: self.server_conn.clone(),
            request: self.request.as_ref().map(|r| RequestState::from(&r.value)),
            response: self.response.as_ref().map(|r| ResponseState::from(&r.value)),
            error: self.error.as_ref().map(|e| e.value.clone()),
        }
    }

    pub fn from_state(id: FlowId, state: FlowState) -> Self {
        let mut f = Flow::new(id, state.client_conn, state.server_conn);
        f.conntype = state.conntype;
        if let Some(r) = state.request {
            f.set_request(r.into());
        }
        if let Some(r) = state.response {
            f.set_response(r.into());
        }
        if let Some(e) = state.error {
            f.set_error(e);
        }
        f
    }
}

/// Plain-value-tree form of a [`Request`], excluding the transient
/// `stickycookie`/`stickyauth`/`is_replay` flags (spec §3 Invariants).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestState {
    pub form_in: RequestForm,
    pub form_out: RequestForm,
    pub method: String,
    pub scheme: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub httpversion: HttpVersion,
    pub headers: HeaderMap,
    pub content: crate::content::Content,
    pub timestamp_start: f64,
    pub timestamp_end: f64,
}

impl From<&Request> for RequestState {
    fn from(r: &Request) -> Self {
        Self {
            form_in: r.form_in,
            form_out: r.form_out,
            method: r.method.clone(),
            scheme: r.scheme.clone(),
            host: r.host.clone(),
            port: r.port,
            path: r.path.clone(),
            httpversion: r.httpversion,
            headers: r.headers.clone(),
            content: r.content.clone(),
            timestamp_start: r.timestamp_start,
            timestamp_end: r.timestamp_end,
        }
    }
}

impl From<RequestState> for Request {
    fn from(s: RequestState) -> Self {
        Request {
            form_in: s.form_in,
            form_out: s.form_out,
            method: s.method,
            scheme: s.scheme,
            host: s.host,
            port: s.port,
            path: s.path,
            httpversion: s.httpversion,
            headers: s.headers,
            content: s.content,
            timestamp_start: s.timestamp_start,
            timestamp_end: s.timestamp_end,
            stickycookie: false,
            stickyauth: false,
            is_replay: false,
        }
    }
}

/// Plain-value-tree form of a [`Response`], excluding `is_replay`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseState {
    pub httpversion: HttpVersion,
    pub code: u16,
    pub msg: String,
    pub headers: HeaderMap,
    pub content: crate::content::Content,
    pub timestamp_start: f64,
    pub timestamp_end: f64,
}

impl From<&Response> for ResponseState {
    fn from(r: &Response) -> Self {
        Self {
            httpversion: r.httpversion,
            code: r.code,
            msg: r.msg.clone(),
            headers: r.headers.clone(),
            content: r.content.clone(),
            timestamp_start: r.timestamp_start,
            timestamp_end: r.timestamp_end,
        }
    }
}

impl From<ResponseState> for Response {
    fn from(s: ResponseState) -> Self {
        Response {
            httpversion: s.httpversion,
            code: s.code,
            msg: s.msg,
            headers: s.headers,
            content: s.content,
            timestamp_start: s.timestamp_start,
            timestamp_end: s.timestamp_end,
            is_replay: false,
        }
    }
}

/// The plain value tree a [`Flow`] serializes to and restores from (spec §3
/// Invariants, "serializable to a plain value tree").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowState {
    pub conntype: String,
    pub client_conn: ConnectionSnapshot,
    pub server_conn: Option<ConnectionSnapshot>,
    pub request: Option<RequestState>,
    pub response: Option<ResponseState>,
    pub error: Option<Error>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Content;

    fn snapshot() -> ConnectionSnapshot {
        ConnectionSnapshot { address: "127.0.0.1:9".into(), ssl_established: false }
    }

    fn sample_request() -> Request {
        Request {
            form_in: RequestForm::Origin,
            form_out: RequestForm::Origin,
            method: "GET".into(),
            scheme: None,
            host: None,
            port: None,
            path: Some("/".into()),
            httpversion: HttpVersion::HTTP_11,
            headers: HeaderMap::new(),
            content: Content::Absent,
            timestamp_start: 1.0,
            timestamp_end: 2.0,
            stickycookie: true,
            stickyauth: true,
            is_replay: true,
        }
    }

    #[test]
    fn setting_request_attaches_backreference() {
        let mut flow = Flow::new(1, snapshot(), None);
        flow.set_request(sample_request());
        assert_eq!(flow.request.as_ref().unwrap().owner(), Some(1));
    }

    #[test]
    fn reattaching_to_a_different_flow_fails() {
        let mut flow_a = Flow::new(1, snapshot(), None);
        flow_a.set_request(sample_request());
        let owned = flow_a.request.take().unwrap();

        let mut flow_b = Flow::new(2, snapshot(), None);
        let result = flow_b.try_attach_request(owned);
        assert!(result.is_err());
    }

    #[test]
    fn reattaching_to_the_same_flow_succeeds() {
        let mut flow = Flow::new(1, snapshot(), None);
        flow.set_request(sample_request());
        let owned = flow.request.take().unwrap();
        assert!(flow.try_attach_request(owned).is_ok());
    }

    #[test]
    fn state_round_trip_excludes_transient_flags() {
        let mut flow = Flow::new(7, snapshot(), None);
        flow.set_request(sample_request());

        let state = flow.to_state();
        let json = serde_json::to_string(&state).unwrap();
        let restored_state: FlowState = serde_json::from_str(&json).unwrap();
        let restored = Flow::from_state(7, restored_state);

        let restored_req = &restored.request.as_ref().unwrap().value;
        assert_eq!(restored_req.method, "GET");
        assert!(!restored_req.stickycookie);
        assert!(!restored_req.stickyauth);
        assert!(!restored_req.is_replay);
    }

    #[test]
    fn copy_copies_response_from_response_not_request() {
        let mut flow = Flow::new(1, snapshot(), None);
        flow.set_request(sample_request());
        flow.set_response(Response {
            httpversion: HttpVersion::HTTP_11,
            code: 200,
            msg: "OK".into(),
            headers: HeaderMap::new(),
            content: Content::Absent,
            timestamp_start: 0.0,
            timestamp_end: 0.0,
            is_replay: false,
        });

        let copied = flow.copy(2);
        assert_eq!(copied.response.unwrap().value.code, 200);
    }
}
