//! Domain-specific error types for the bridge protocol.
//!
//! Non-fatal errors (protocol violations, resource-lookup failures) are
//! logged by the dispatcher and the offending message is dropped; only
//! transport failures and the unimplemented query path end a session.

use thiserror::Error;

/// The canonical error type for the bridge.
#[derive(Debug, Error)]
pub enum PrismError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// A payload ended before all documented fields could be read.
    #[error("payload truncated: wanted {wanted} more bytes, {remaining} left")]
    Truncated { wanted: usize, remaining: usize },

    /// A message violated protocol rules.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// Frame size exceeded the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// UTF-8 conversion of a wire string failed.
    #[error("invalid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    // ── Resource Errors ──────────────────────────────────────────
    /// A message addressed a device id with no registered device.
    #[error("unknown device id: {0}")]
    UnknownDevice(u64),

    /// A message addressed an object id with no registered object.
    #[error("unknown object id {object} on device {device}")]
    UnknownObject { device: u64, object: u64 },

    /// A client-chosen id exceeded the table growth cap.
    #[error("object id {0} exceeds table cap")]
    ObjectIdTooLarge(u64),

    // ── Codec Errors ─────────────────────────────────────────────
    /// A compression codec failed to encode a channel.
    #[error("codec error: {0}")]
    Codec(String),

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// The work queue was closed while a reply was pending.
    #[error("work queue closed")]
    QueueClosed,

    // ── Fatal dispatcher paths ───────────────────────────────────
    /// A documented-but-unimplemented query shape was requested.
    #[error("not implemented: {0}")]
    Unimplemented(&'static str),
}

impl PrismError {
    /// Whether this error must end the session.
    ///
    /// Everything else is log-and-continue: the dispatcher drops the
    /// offending message and keeps the connection open.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PrismError::Io(_) | PrismError::Unimplemented(_))
    }

    /// Whether this is a malformed-message problem (logged at warning)
    /// rather than a resource or device failure (logged at error).
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            PrismError::Truncated { .. }
                | PrismError::Protocol(_)
                | PrismError::UnknownVariant { .. }
                | PrismError::FrameTooLarge { .. }
                | PrismError::InvalidUtf8(_)
        )
    }
}
