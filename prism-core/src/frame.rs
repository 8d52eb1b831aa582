//! Frame streamer: turn mapped framebuffer channels into channel
//! replies.
//!
//! Invoked by the dispatcher while it holds the device borrow for the
//! current `RenderFrame`; no pointer outlives that handling. Every
//! channel reply starts with `<u64 frame_id><u32 width><u32 height>
//! <u32 type>`, followed by either `<u32 compressed_size><bytes>` or
//! the raw plane.

use tracing::{debug, warn};

use crate::compress::{
    color_codec_accepts, compress_color, compress_depth, depth_codec_accepts, CompressionFeatures,
};
use crate::device::MappedFrame;
use crate::error::PrismError;
use crate::opcode::Opcode;
use crate::payload::PayloadWriter;
use crate::wire::Message;

/// The two declared output planes of a rendered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameChannel {
    Color,
    Depth,
}

impl FrameChannel {
    /// Channel name as known to the rendering API.
    pub fn name(&self) -> &'static str {
        match self {
            FrameChannel::Color => "channel.color",
            FrameChannel::Depth => "channel.depth",
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            FrameChannel::Color => Opcode::ChannelColor,
            FrameChannel::Depth => Opcode::ChannelDepth,
        }
    }
}

/// Build the reply for one mapped channel.
///
/// Returns `Ok(None)` when the channel should be skipped (unknown
/// element type or an undersized mapping). Codec selection requires
/// both a negotiated feature bit and a matching element type; anything
/// else ships raw.
pub fn channel_reply(
    frame_id: u64,
    mapped: &MappedFrame<'_>,
    channel: FrameChannel,
    features: CompressionFeatures,
) -> Result<Option<Message>, PrismError> {
    let Some(element_size) = mapped.ty.size_of() else {
        return Ok(None);
    };
    let byte_size = mapped.width as usize * mapped.height as usize * element_size;
    if byte_size == 0 || mapped.data.len() < byte_size {
        return Ok(None);
    }
    let plane = &mapped.data[..byte_size];

    let mut out = PayloadWriter::new();
    out.u64(frame_id)
        .u32(mapped.width)
        .u32(mapped.height)
        .u32(mapped.ty as u32);

    let compressed = match channel {
        FrameChannel::Color if features.color_jpeg && color_codec_accepts(mapped.ty) => {
            match compress_color(plane, mapped.width, mapped.height) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!("color codec failed, sending raw: {e}");
                    None
                }
            }
        }
        FrameChannel::Depth if features.depth_zstd && depth_codec_accepts(mapped.ty) => {
            match compress_depth(plane) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!("depth codec failed, sending raw: {e}");
                    None
                }
            }
        }
        _ => None,
    };

    match compressed {
        Some(bytes) => {
            debug!(
                "{}: {} -> {} bytes compressed",
                channel.name(),
                byte_size,
                bytes.len()
            );
            out.u32(bytes.len() as u32).raw(&bytes);
        }
        None => {
            out.raw(plane);
        }
    }

    Ok(Some(Message::new(channel.opcode(), out.freeze())))
}
