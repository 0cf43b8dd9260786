use std::io;

/// The crate's error taxonomy. Every fallible public operation surfaces one
/// of these; detail beyond the variant goes to the log, nothing is ever
/// retried internally.
#[derive(Debug, thiserror::Error)]
pub enum RdmaError {
    /// A CM call rejected, or delivered an event other than the one the
    /// handshake step expected. Setup is aborted; no `Proxy` is produced.
    #[error("rdma setup failed: {0}")]
    Setup(String),

    /// The send or recv MR allocator had no free block large enough for
    /// the request. The connection remains live.
    #[error("memory region allocator exhausted (requested {requested} bytes)")]
    AllocatorExhausted { requested: usize },

    /// `post_send`/`post_recv` returned a non-zero status.
    #[error("work request submission failed: {0}")]
    WrSubmission(String),

    /// A completion arrived with `status != IBV_WC_SUCCESS`.
    #[error("work completion failed: wr_id={wr_id} status={status}")]
    Completion { wr_id: u64, status: i32 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type RdmaResult<T> = Result<T, RdmaError>;

impl RdmaError {
    pub(crate) fn setup<S: Into<String>>(msg: S) -> RdmaError {
        RdmaError::Setup(msg.into())
    }

    pub(crate) fn from_errno(context: &str) -> RdmaError {
        let err = io::Error::last_os_error();
        RdmaError::Setup(format!("{}: {}", context, err))
    }
}
