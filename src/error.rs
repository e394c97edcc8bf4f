use thiserror::Error;

/// Errors crossing the Store/GitterClient/MatrixClient boundary into `Bridge`.
///
/// Internal plumbing within each component uses `anyhow::Result`; this enum
/// exists at the seams where `Bridge` needs to pattern-match on failure kind
/// (e.g. to decide whether a user-facing message should mention "not logged
/// in" versus a generic remote failure).
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("database error: {0}")]
    Db(#[from] diesel::result::Error),

    #[error("database pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("gitter API error ({status}): {body}")]
    GitterApi { status: u16, body: String },

    #[error("matrix API error ({status}): {body}")]
    MatrixApi { status: u16, body: String },

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to parse JSON response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("user is not logged in to Gitter")]
    NotAuthenticated,

    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("{0}")]
    Other(String),
}

impl BridgeError {
    pub fn other(msg: impl Into<String>) -> Self {
        BridgeError::Other(msg.into())
    }
}
