use thiserror::Error;

use palisade_store::StoreError;

#[derive(Debug, Error)]
pub enum PostgresError {
    #[error("connection pool error: {0}")]
    Pool(#[from] bb8::RunError<tokio_postgres::Error>),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

impl From<PostgresError> for StoreError {
    fn from(e: PostgresError) -> Self {
        match e {
            PostgresError::Pool(err) => StoreError::Connection(err.to_string()),
            PostgresError::Postgres(err) => {
                // A missing SQLSTATE means the failure happened below the
                // server (socket closed, protocol violation); everything
                // else is a query-level rejection.
                if err.code().is_none() {
                    StoreError::Connection(err.to_string())
                } else {
                    StoreError::Query(err.to_string())
                }
            }
        }
    }
}

/// Whether a statement failure should abort the whole batch (connection
/// lost) or only the row it was for (server rejected the statement).
pub(crate) fn is_batch_fatal(err: &tokio_postgres::Error) -> bool {
    err.code().is_none()
}
