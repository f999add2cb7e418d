//! Frame codec
//!
//! One message per frame, encoded with bincode over the serde derives.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{TransferError, TransferResult};

/// Largest frame accepted by [`decode`]; comfortably above one chunk plus
/// envelope at the default chunk sizes.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Encode a message into a frame
pub fn encode<M: Serialize>(message: &M) -> TransferResult<Vec<u8>> {
    let frame = bincode::serialize(message)?;
    if frame.len() > MAX_FRAME_BYTES {
        return Err(TransferError::FrameTooLarge(frame.len()));
    }
    Ok(frame)
}

/// Decode a frame into a message
pub fn decode<M: DeserializeOwned>(frame: &[u8]) -> TransferResult<M> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(TransferError::FrameTooLarge(frame.len()));
    }
    Ok(bincode::deserialize(frame)?)
}
