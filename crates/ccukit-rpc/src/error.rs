// ── Wire-layer errors ──

use thiserror::Error;

/// Errors produced by the RPC transports.
///
/// The split that matters upstream is transport vs. fault: a transport
/// error means the interface process is unreachable and the client should
/// be torn down and rebuilt, while a fault is the remote side answering
/// "no" to a well-delivered call and must never trigger a reconnect.
#[derive(Debug, Error)]
pub enum Error {
    /// HTTP-level failure on the XML dialect.
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Socket-level failure on the binary dialect.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote answered with a methodResponse fault.
    #[error("rpc fault {code}: {message}")]
    Fault { code: i64, message: String },

    /// Malformed payload in either direction.
    #[error("codec error: {0}")]
    Codec(String),

    /// A frame exceeded the configured size limit.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// The call did not complete within its deadline.
    #[error("rpc call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The endpoint address could not be parsed.
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),

    /// The server was shut down while the call was in flight.
    #[error("rpc server shut down")]
    Shutdown,
}

impl Error {
    /// True when the failure indicates the peer is unreachable and the
    /// client connection should be rebuilt.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Http(_) | Error::Io(_) | Error::Timeout(_) | Error::Shutdown
        )
    }

    /// True when the remote side rejected the call itself.
    pub fn is_fault(&self) -> bool {
        matches!(self, Error::Fault { .. })
    }

    pub(crate) fn codec(msg: impl Into<String>) -> Self {
        Error::Codec(msg.into())
    }
}
