//! Stream framing for multipart messages.
//!
//! ## Wire Format
//!
//! All integers are little-endian. One protocol message is a sequence of
//! opaque frames:
//!
//! | Field       | Layout |
//! |-------------|--------|
//! | frame count | `[count:4]` |
//! | per frame   | `[len:4][bytes:len]` |
//!
//! The decoder is incremental: bytes accumulate in a connection buffer
//! and messages are peeled off the front as they complete, so a slow
//! peer can deliver a message across any number of reads.

use thiserror::Error;

/// One multipart message: an ordered sequence of opaque byte frames.
pub type Multipart = Vec<Vec<u8>>;

/// Upper bound on frames per message (a dispatch with env updates sends
/// two frames per object).
pub const MAX_FRAMES: u32 = 16 * 1024;

/// Upper bound on a single frame's length (1 GiB).
pub const MAX_FRAME_LEN: u32 = 1 << 30;

/// Errors from multipart framing.
#[derive(Debug, Error)]
pub enum FramingError {
    /// Frame count field exceeds [`MAX_FRAMES`].
    #[error("message claims {0} frames")]
    TooManyFrames(u32),
    /// A frame length field exceeds [`MAX_FRAME_LEN`].
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(u32),
}

/// Appends the encoded form of `frames` to `out`.
///
/// The buffer is not cleared; connection write buffers accumulate
/// multiple messages between flushes.
///
/// # Errors
///
/// Returns a [`FramingError`] when the message would violate the frame
/// count or length bounds; nothing is written in that case.
pub fn encode_into(frames: &[Vec<u8>], out: &mut Vec<u8>) -> Result<(), FramingError> {
    if frames.len() > MAX_FRAMES as usize {
        return Err(FramingError::TooManyFrames(
            u32::try_from(frames.len()).unwrap_or(u32::MAX),
        ));
    }
    for frame in frames {
        let len = u32::try_from(frame.len()).unwrap_or(u32::MAX);
        if len > MAX_FRAME_LEN {
            return Err(FramingError::FrameTooLarge(len));
        }
    }

    out.extend_from_slice(&(frames.len() as u32).to_le_bytes());
    for frame in frames {
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(frame);
    }
    Ok(())
}

/// Attempts to decode one complete message from the front of `buf`.
///
/// Returns `Ok(None)` while the message is still incomplete; on success
/// returns the frames plus the number of bytes consumed, which the
/// caller drains from its buffer.
///
/// # Errors
///
/// Returns a [`FramingError`] when a count or length field exceeds its
/// bound; the connection cannot be resynchronized after that.
pub fn try_decode(buf: &[u8]) -> Result<Option<(Multipart, usize)>, FramingError> {
    let Some(count) = take_u32(buf, 0) else {
        return Ok(None);
    };
    if count > MAX_FRAMES {
        return Err(FramingError::TooManyFrames(count));
    }

    let mut cursor = 4;
    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let Some(len) = take_u32(buf, cursor) else {
            return Ok(None);
        };
        if len > MAX_FRAME_LEN {
            return Err(FramingError::FrameTooLarge(len));
        }
        cursor += 4;
        let end = cursor + len as usize;
        if end > buf.len() {
            return Ok(None);
        }
        frames.push(buf[cursor..end].to_vec());
        cursor = end;
    }
    Ok(Some((frames, cursor)))
}

fn take_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + 4)?;
    let mut arr = [0u8; 4];
    arr.copy_from_slice(bytes);
    Some(u32::from_le_bytes(arr))
}
