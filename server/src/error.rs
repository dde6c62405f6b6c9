use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("TLS bootstrap error: {0}")]
    Tls(String),

    #[error("server error: {0}")]
    Serve(String),
}
