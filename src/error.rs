use cid::Cid;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("block not found: {0}")]
    BlockNotFound(Cid),

    /// The clock references an event whose block is not resolvable in the
    /// store. Callers typically fetch the missing block and retry.
    #[error("missing event: {0}")]
    MissingEvent(Cid),

    #[error("failed to decode block {cid}: {reason}")]
    Decode { cid: Cid, reason: String },

    #[error("failed to encode block: {0}")]
    Encode(String),

    #[error("block {0} does not match its cid")]
    InvalidBlock(Cid),

    #[error("index build failed: {0}")]
    IndexBuild(anyhow::Error),

    #[error("block store: {0}")]
    Store(anyhow::Error),

    #[error(transparent)]
    Cid(#[from] cid::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
