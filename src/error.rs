use std::io;

use thiserror::Error;

/// Why an inbound datagram failed to decode.
///
/// The multiplexer logs these and drops the datagram; they never tear down
/// an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("datagram shorter than the fixed four byte header")]
    ShortHeader,
    #[error("token length outside 0..=8 or running past the datagram")]
    BadTokenLength,
    #[error("reserved option delta nibble or truncated delta extension")]
    BadOptionDelta,
    #[error("reserved option length nibble or value running past the datagram")]
    BadOptionLength,
    #[error("payload marker with no payload bytes after it")]
    TrailingAfterPayloadMarker,
}

/// Why a [`Packet`](crate::Packet) could not be serialized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("encoded datagram would be {0} bytes, above the 1280 byte limit")]
    PacketTooLong(usize),
    #[error("if-none-match is presence-only and must carry no value")]
    InvalidOptionValue,
}

/// An option value whose bytes do not fit the expected shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("incompatible option value: {reason}")]
pub struct IncompatibleOptionValue {
    pub(crate) reason: &'static str,
}

impl IncompatibleOptionValue {
    pub(crate) fn new(reason: &'static str) -> Self {
        IncompatibleOptionValue { reason }
    }
}

/// Block-wise transfer bookkeeping failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BlockError {
    /// A block number was received twice with different bytes.
    #[error("conflicting bytes for block {0}")]
    Conflict(u32),
    /// The final block arrived but an earlier number was never seen.
    #[error("missing block {0} at reassembly")]
    MissingBlock(u32),
}

/// Errors surfaced by the user-facing request API.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid url: {0}")]
    InvalidUrl(&'static str),
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
    #[error("invalid method for this operation")]
    InvalidMethod,
    /// The peer answered our confirmable message with a reset.
    #[error("peer reset the exchange")]
    Reset,
    /// Either retransmissions were exhausted or the response wait elapsed.
    #[error("timed out awaiting a response")]
    Timeout,
    #[error("block-wise transfer failed: {0}")]
    Block(#[from] BlockError),
    #[error("{0}")]
    BadOption(#[from] IncompatibleOptionValue),
    #[error("malformed reply: {0}")]
    Malformed(#[from] ParseError),
    #[error("could not encode message: {0}")]
    Encode(#[from] EncodeError),
    #[error("socket failure: {0}")]
    Socket(#[from] io::Error),
    /// The exchange task went away underneath the coordinator.
    #[error("exchange closed")]
    ExchangeClosed,
}
