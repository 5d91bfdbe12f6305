/// Failure of a single dispatch.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The formatter could not render the entry; nothing was written.
    #[error("failed to format entry: {0}")]
    Format(String),
    /// The destination rejected the write.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
