//! Length-prefixed record framing: `uvarint length || length payload bytes`.
//! A reader either produces one whole payload or nothing; partially received
//! frames stay buffered until the rest arrives.

use crate::error::{Error, Result};
use crate::net::buffer::Buffer;
use crate::net::wire;

/// Upper bound on a single frame payload. Anything larger is a protocol
/// violation and fails the whole connection.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Append one complete frame to the write buffer.
pub fn write_frame(buffer: &mut Buffer, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "outgoing frame of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }

    let mut prefix = Vec::with_capacity(10);
    wire::write_uvarint(&mut prefix, payload.len() as u64);
    buffer.put_slice(&prefix);
    buffer.put_slice(payload);
    Ok(())
}

/// Extract one complete frame payload from the read buffer, or `None` if a
/// whole frame has not arrived yet. The length prefix is validated before any
/// bytes are consumed, so a bad frame leaves the buffer untouched for the
/// connection teardown path to report.
pub fn read_frame(buffer: &mut Buffer) -> Result<Option<Vec<u8>>> {
    let data = buffer.data();

    let (length, prefix_len) = match wire::read_uvarint(data) {
        Some(header) => header,
        None if data.len() >= 10 => {
            return Err(Error::protocol("unterminated frame length prefix"));
        }
        None => return Ok(None),
    };

    if length as usize > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "incoming frame of {} bytes exceeds the {} byte limit",
            length, MAX_FRAME_SIZE
        )));
    }

    let total = prefix_len + length as usize;
    if data.len() < total {
        return Ok(None);
    }

    let payload = data[prefix_len..total].to_vec();
    buffer.consume(total);
    Ok(Some(payload))
}
