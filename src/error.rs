use thiserror::Error;

/// Errors surfaced by the overlay network.
///
/// Transport errors propagate as `Result`s; per-packet protocol errors are
/// logged by the node and never crash it. `Bind` is the one startup error
/// callers are expected to handle (typically by retrying on an incremented
/// port).
#[derive(Debug, Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("timeout")]
    Timeout,

    #[error("transport disconnected")]
    Disconnect,

    #[error("invalid opcode {0}")]
    InvalidOpcode(u8),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("could not find an entry node")]
    NoEntryNode,
}
