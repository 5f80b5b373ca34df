use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("header line longer than {0} bytes")]
    LineTooLong(usize),
    #[error("connection closed in the middle of the proxy handshake")]
    UnexpectedEof,
    #[error("client closed connection before handshake completed")]
    ClientGone,
    #[error("destination lookup via {backend} failed: {source}")]
    DestLookup {
        backend: &'static str,
        #[source]
        source: std::io::Error,
    },
}
