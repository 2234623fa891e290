//! Per-module error enums, composed at the `Device` boundary (§7).

use thiserror::Error;

use crate::wire::ReaderError;

/// Transport/protocol errors (§7 `TransportLost`/`ProtocolViolation`).
#[derive(Error, Debug)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed packet: {0}")]
    Malformed(#[from] ReaderError),
    #[error("protocol negotiation failed: local range {local_min}..={local_max}, peer range {peer_min}..={peer_max}")]
    NoProtocolOverlap {
        local_min: u32,
        local_max: u32,
        peer_min: u32,
        peer_max: u32,
    },
    #[error("connection closed by peer")]
    Closed,
}

/// Named sub-codes for `propose()` rejections (§4.1, caller-visible).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    #[error("refusing second primary")]
    NoTwoPrimaries,
    #[error("cannot become primary without good local data")]
    PrimaryWithoutGoodData,
    #[error("refusing to connect: split brain detected")]
    SplitBrainRefused,
    #[error("primary requires peer to be up to date")]
    PrimaryNeedsPeerUpToDate,
    #[error("cannot connect while peer disk is diskless")]
    ConnectedButPeerDiskless,
    #[error("refusing to become primary against an outdated peer")]
    OutdatedPrimaryRefused,
}

/// TL/Barrier invariant errors (§7 `FatalInvariant` is intentionally not a
/// variant here — those abort the process at the call site instead of being
/// returned, per spec.md's elevation of `tl_release` mismatches to fatal).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlError {
    #[error("barrier epoch {found} does not match expected {expected}")]
    EpochMismatch { expected: u32, found: u32 },
    #[error("request not found in transfer log")]
    RequestNotFound,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineError {
    #[error("write conflicts with an in-flight peer write")]
    WriteConflict,
    #[error("device is not connected")]
    NotConnected,
    #[error(transparent)]
    LocalIo(#[from] IoPolicyError),
}

/// Outcomes of the local-disk failure policy (§6 `on_io_error`).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoPolicyError {
    #[error("local I/O error propagated to caller")]
    PassedOn,
    #[error("local disk detached after I/O error")]
    Detached,
}

/// Umbrella error returned across the `Device` boundary.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Tl(#[from] TlError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    IoPolicy(#[from] IoPolicyError),
}
