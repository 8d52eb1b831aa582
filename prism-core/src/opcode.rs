//! Wire opcodes.
//!
//! Numeric values are part of the wire contract and must match the
//! client side; never renumber.

use std::fmt;

use crate::error::PrismError;

/// All messages understood by the bridge protocol.
///
/// Requests flow client → server; replies flow server → client. The
/// session starts with [`NewDevice`](Opcode::NewDevice) — there is no
/// handshake opcode.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // ── Device lifecycle ─────────────────────────────────────────
    /// Create a device of a named subtype.
    NewDevice = 0,
    /// Reply: minted device id plus server compression features.
    DeviceHandle = 1,

    // ── Object / array construction ──────────────────────────────
    /// Construct an object via the type-indexed constructor table.
    NewObject = 2,
    /// Construct an array of rank 1/2/3, optionally seeded with data.
    NewArray = 3,

    // ── Parameters ───────────────────────────────────────────────
    /// Set one named parameter on an object.
    SetParam = 4,
    /// Remove one named parameter from an object.
    UnsetParam = 5,
    /// Remove every parameter from an object.
    UnsetAllParams = 6,
    /// Commit pending parameters on the device or one object.
    CommitParams = 7,

    // ── Reference counting (forwarded, not tracked) ──────────────
    Release = 8,
    Retain = 9,

    // ── Array mapping ────────────────────────────────────────────
    /// Map an array and ship its bytes to the client.
    MapArray = 10,
    /// Reply: object id, byte count, raw array contents.
    ArrayMapped = 11,
    /// Write the client's bytes back and unmap.
    UnmapArray = 12,
    /// Reply: object id.
    ArrayUnmapped = 13,

    // ── Rendering ────────────────────────────────────────────────
    /// Render a frame, wait for completion, stream its channels.
    RenderFrame = 14,
    /// Propagate a frame-ready wait to the device.
    FrameReady = 15,
    /// Reply: frame object id.
    FrameIsReady = 16,
    /// Reply: color channel of a rendered frame.
    ChannelColor = 17,
    /// Reply: depth channel of a rendered frame.
    ChannelDepth = 18,

    // ── Introspection ────────────────────────────────────────────
    GetProperty = 19,
    Property = 20,
    GetObjectSubtypes = 21,
    ObjectSubtypes = 22,
    GetObjectInfo = 23,
    ObjectInfo = 24,
    GetParameterInfo = 25,
    ParameterInfo = 26,
}

impl TryFrom<u32> for Opcode {
    type Error = PrismError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Opcode::NewDevice,
            1 => Opcode::DeviceHandle,
            2 => Opcode::NewObject,
            3 => Opcode::NewArray,
            4 => Opcode::SetParam,
            5 => Opcode::UnsetParam,
            6 => Opcode::UnsetAllParams,
            7 => Opcode::CommitParams,
            8 => Opcode::Release,
            9 => Opcode::Retain,
            10 => Opcode::MapArray,
            11 => Opcode::ArrayMapped,
            12 => Opcode::UnmapArray,
            13 => Opcode::ArrayUnmapped,
            14 => Opcode::RenderFrame,
            15 => Opcode::FrameReady,
            16 => Opcode::FrameIsReady,
            17 => Opcode::ChannelColor,
            18 => Opcode::ChannelDepth,
            19 => Opcode::GetProperty,
            20 => Opcode::Property,
            21 => Opcode::GetObjectSubtypes,
            22 => Opcode::ObjectSubtypes,
            23 => Opcode::GetObjectInfo,
            24 => Opcode::ObjectInfo,
            25 => Opcode::GetParameterInfo,
            26 => Opcode::ParameterInfo,
            _ => {
                return Err(PrismError::UnknownVariant {
                    type_name: "Opcode",
                    value: value as u64,
                })
            }
        })
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Opcode {
    /// Whether this opcode names a server → client reply.
    ///
    /// Replies arriving inbound are unhandled and dropped with a
    /// warning.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            Opcode::DeviceHandle
                | Opcode::ArrayMapped
                | Opcode::ArrayUnmapped
                | Opcode::FrameIsReady
                | Opcode::ChannelColor
                | Opcode::ChannelDepth
                | Opcode::Property
                | Opcode::ObjectSubtypes
                | Opcode::ObjectInfo
                | Opcode::ParameterInfo
        )
    }
}
