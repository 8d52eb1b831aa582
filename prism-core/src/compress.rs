//! Channel compression: feature negotiation and the two codecs.
//!
//! Color channels use a lossy JPEG encoder, depth channels a lossless
//! zstd pass. A codec is applied only when both sides of the session
//! advertise it *and* the channel's element type matches the layout the
//! codec accepts; everything else ships raw.

use crate::datatype::DataType;
use crate::error::PrismError;

/// JPEG quality used for color channels.
const JPEG_QUALITY: u8 = 80;

/// zstd level for depth channels. Level 1 favours speed — depth planes
/// are highly repetitive and compress well even at the fastest setting.
const ZSTD_LEVEL: i32 = 1;

// ── CompressionFeatures ──────────────────────────────────────────

/// Codec capability bitmask advertised by each side at session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompressionFeatures {
    /// Lossy JPEG codec for 8-bit sRGB RGBA color channels.
    pub color_jpeg: bool,
    /// Lossless zstd codec for 32-bit float depth channels.
    pub depth_zstd: bool,
}

const FEATURE_COLOR_JPEG: u32 = 1 << 0;
const FEATURE_DEPTH_ZSTD: u32 = 1 << 1;

impl CompressionFeatures {
    /// Everything this build of the server supports.
    pub fn server() -> Self {
        Self {
            color_jpeg: true,
            depth_zstd: true,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            color_jpeg: bits & FEATURE_COLOR_JPEG != 0,
            depth_zstd: bits & FEATURE_DEPTH_ZSTD != 0,
        }
    }

    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.color_jpeg {
            bits |= FEATURE_COLOR_JPEG;
        }
        if self.depth_zstd {
            bits |= FEATURE_DEPTH_ZSTD;
        }
        bits
    }

    /// Codecs usable in a session: the intersection of what both sides
    /// advertise.
    pub fn negotiate(&self, remote: &CompressionFeatures) -> CompressionFeatures {
        CompressionFeatures {
            color_jpeg: self.color_jpeg && remote.color_jpeg,
            depth_zstd: self.depth_zstd && remote.depth_zstd,
        }
    }
}

// ── Color codec ──────────────────────────────────────────────────

/// Whether the color codec accepts this element type.
pub fn color_codec_accepts(ty: DataType) -> bool {
    ty == DataType::UFixed8RgbaSrgb
}

/// JPEG-encode an RGBA color plane.
pub fn compress_color(rgba: &[u8], width: u32, height: u32) -> Result<Vec<u8>, PrismError> {
    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    encoder
        .encode(rgba, width, height, image::ExtendedColorType::Rgba8)
        .map_err(|e| PrismError::Codec(format!("jpeg encode failed: {e}")))?;
    Ok(out)
}

// ── Depth codec ──────────────────────────────────────────────────

/// Whether the depth codec accepts this element type.
pub fn depth_codec_accepts(ty: DataType) -> bool {
    ty == DataType::Float32
}

/// Worst-case compressed size for a depth plane of `input_len` bytes.
pub fn depth_max_bound(input_len: usize) -> usize {
    zstd::zstd_safe::compress_bound(input_len)
}

/// zstd-encode a depth plane into a `max_bound`-sized buffer.
pub fn compress_depth(input: &[u8]) -> Result<Vec<u8>, PrismError> {
    let mut out = vec![0u8; depth_max_bound(input.len())];
    let written = zstd::bulk::compress_to_buffer(input, &mut out, ZSTD_LEVEL)
        .map_err(|e| PrismError::Codec(format!("zstd encode failed: {e}")))?;
    out.truncate(written);
    Ok(out)
}
