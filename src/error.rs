//! Errors returned by this crate.

use std::io;

/// Set of errors that can occur while decoding a trace stream.
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The stream ended partway through a packet. A clean end of stream
    /// on a packet boundary is not an error and is reported as the end
    /// of iteration instead.
    #[error("end of stream in the middle of a packet")]
    EofDuringPacket,

    /// A magic field did not carry the expected constant.
    #[error("bad {kind} magic: {found:#018x} (expected {expected:#018x})")]
    BadMagic {
        /// Which magic was wrong ("execution header", "integer
        /// extension" or "memory extension").
        kind: &'static str,

        /// The value read from the stream.
        found: u64,

        /// The constant that should have been there.
        expected: u64,
    },
}

/// Errors surfaced by the harness lifecycle calls.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("failed to set up the engine listener: {0}")]
    Listen(#[source] io::Error),

    #[error("failed to install signal dispositions: {0}")]
    Signals(#[source] nix::Error),

    #[error("failed to spawn a harness thread: {0}")]
    Thread(#[source] io::Error),

    #[error("failed to pick a port for the reference simulator: {0}")]
    PortDiscovery(#[source] io::Error),

    #[error("the reference model is already running")]
    RefAlreadyRunning,
}
