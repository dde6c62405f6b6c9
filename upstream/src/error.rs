use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("primary upstream error: {0}")]
    Primary(String),

    #[error("fallback upstream error: {0}")]
    Fallback(String),

    /// Both the selected upstream and the retry path failed. `status`
    /// carries the last HTTP status seen, if the failure happened above
    /// the transport layer.
    #[error("all upstreams failed: {message}")]
    Exhausted {
        status: Option<u16>,
        message: String,
    },
}

impl UpstreamError {
    /// The HTTP status the proxy should answer with: the upstream's own
    /// status when one was observed, 500 otherwise.
    pub fn response_status(&self) -> u16 {
        match self {
            UpstreamError::Exhausted {
                status: Some(status),
                ..
            } => *status,
            _ => 500,
        }
    }
}
