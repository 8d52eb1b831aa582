//! The rendering API's closed type enumeration.
//!
//! These tags come from the rendering API's public header; their numeric
//! values are reused verbatim on the wire, so they are as much a part of
//! the protocol as the opcodes are. Object kinds occupy the 100 block,
//! string/list kinds the 200 block, and POD element types the 300 block.

use std::fmt;

use crate::error::PrismError;

/// A type tag from the rendering API.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Unknown = 0,

    // ── Object kinds ─────────────────────────────────────────────
    Device = 100,
    Object = 101,
    Array = 102,
    Array1D = 103,
    Array2D = 104,
    Array3D = 105,
    Camera = 106,
    Frame = 107,
    Geometry = 108,
    Group = 109,
    Instance = 110,
    Light = 111,
    Material = 112,
    Renderer = 113,
    Sampler = 114,
    SpatialField = 115,
    Surface = 116,
    Volume = 117,
    World = 118,

    // ── Strings and lists ────────────────────────────────────────
    String = 200,
    StringList = 201,
    DataTypeList = 202,
    ParameterList = 203,

    // ── POD element types ────────────────────────────────────────
    Bool = 300,
    Int8 = 301,
    UInt8 = 302,
    Int16 = 303,
    UInt16 = 304,
    Int32 = 305,
    UInt32 = 306,
    Int64 = 307,
    UInt64 = 308,
    Float32 = 309,
    Float64 = 310,
    Int32Vec2 = 311,
    Int32Vec3 = 312,
    Int32Vec4 = 313,
    UInt32Vec2 = 314,
    UInt32Vec3 = 315,
    UInt32Vec4 = 316,
    Float32Vec2 = 317,
    Float32Vec3 = 318,
    Float32Vec4 = 319,
    Float32Mat3 = 320,
    Float32Mat4 = 321,
    UFixed8Vec4 = 322,
    /// 8-bit sRGB-encoded RGBA — the only layout the lossy color codec
    /// accepts.
    UFixed8RgbaSrgb = 323,
}

impl TryFrom<u32> for DataType {
    type Error = PrismError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        use DataType::*;
        Ok(match value {
            0 => Unknown,
            100 => Device,
            101 => Object,
            102 => Array,
            103 => Array1D,
            104 => Array2D,
            105 => Array3D,
            106 => Camera,
            107 => Frame,
            108 => Geometry,
            109 => Group,
            110 => Instance,
            111 => Light,
            112 => Material,
            113 => Renderer,
            114 => Sampler,
            115 => SpatialField,
            116 => Surface,
            117 => Volume,
            118 => World,
            200 => String,
            201 => StringList,
            202 => DataTypeList,
            203 => ParameterList,
            300 => Bool,
            301 => Int8,
            302 => UInt8,
            303 => Int16,
            304 => UInt16,
            305 => Int32,
            306 => UInt32,
            307 => Int64,
            308 => UInt64,
            309 => Float32,
            310 => Float64,
            311 => Int32Vec2,
            312 => Int32Vec3,
            313 => Int32Vec4,
            314 => UInt32Vec2,
            315 => UInt32Vec3,
            316 => UInt32Vec4,
            317 => Float32Vec2,
            318 => Float32Vec3,
            319 => Float32Vec4,
            320 => Float32Mat3,
            321 => Float32Mat4,
            322 => UFixed8Vec4,
            323 => UFixed8RgbaSrgb,
            _ => {
                return Err(PrismError::UnknownVariant {
                    type_name: "DataType",
                    value: value as u64,
                })
            }
        })
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl DataType {
    /// Whether this tag denotes an object reference.
    ///
    /// Object references travel the wire as 8-byte client object ids
    /// and are rewritten to device handles by the resource manager.
    pub fn is_object(&self) -> bool {
        (100..=118).contains(&(*self as u32))
    }

    /// Whether this tag is one of the array kinds.
    pub fn is_array(&self) -> bool {
        matches!(
            self,
            DataType::Array | DataType::Array1D | DataType::Array2D | DataType::Array3D
        )
    }

    /// Array rank for the ranked array kinds.
    pub fn array_rank(&self) -> Option<u32> {
        match self {
            DataType::Array1D => Some(1),
            DataType::Array2D => Some(2),
            DataType::Array3D => Some(3),
            _ => None,
        }
    }

    /// Fixed byte width of a value of this type, if it has one.
    ///
    /// Object references are 8 bytes by protocol invariant, and
    /// `String` is pointer-wide like them, so every parameter payload
    /// is sized by one generic rule. Lists are variable-width and
    /// return `None`, as does `Unknown`.
    pub fn size_of(&self) -> Option<usize> {
        use DataType::*;
        if self.is_object() {
            return Some(8);
        }
        match self {
            Bool | Int32 | UInt32 | Float32 | UFixed8Vec4 | UFixed8RgbaSrgb => Some(4),
            Int8 | UInt8 => Some(1),
            Int16 | UInt16 => Some(2),
            String | Int64 | UInt64 | Float64 | Int32Vec2 | UInt32Vec2 | Float32Vec2 => Some(8),
            Int32Vec3 | UInt32Vec3 | Float32Vec3 => Some(12),
            Int32Vec4 | UInt32Vec4 | Float32Vec4 => Some(16),
            Float32Mat3 => Some(36),
            Float32Mat4 => Some(64),
            _ => None,
        }
    }
}

/// One named parameter in an introspection reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub ty: DataType,
}
