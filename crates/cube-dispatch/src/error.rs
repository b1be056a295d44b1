use crate::director::Endpoint;

/// Errors surfaced by the dispatch engine.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("director {0} already registered")]
    DuplicateDirector(Endpoint),

    #[error("no director available for '{0}'")]
    NoDirector(String),

    #[error("director {0} has no live connection")]
    NotConnected(Endpoint),

    #[error("send to {endpoint} failed: {reason}")]
    SendFailed { endpoint: Endpoint, reason: String },

    #[error("service '{service}' timed out (sn {sn})")]
    Timeout { service: String, sn: u64 },

    #[error("pending call {0} was dropped before a reply arrived")]
    Cancelled(u64),
}
