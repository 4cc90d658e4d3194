use crate::source::SourceError;
use crate::store::StoreError;

/// Failures a client can observe. The `Display` text is the message carried
/// by the `error` event.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    /// The video could not be opened. Terminal for the session.
    #[error("could not open video: {0}")]
    SourceUnreadable(#[source] SourceError),
    /// A single frame failed to decode. Logged; the loop continues.
    #[error("frame decode failed: {0}")]
    FrameDecodeTransient(#[source] SourceError),
    /// Missing or malformed request parameters. No session is created.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Settings were applied in memory but could not be persisted.
    #[error("failed to update settings: {0}")]
    SettingsUpdateFailure(#[source] StoreError),
}
