use serde::{Deserialize, Serialize};

use super::command::Command;
use super::message::ServerMessage;
use crate::error::{Error, Result};

/// Magic preamble sent once at the start of a driver connection.
pub const CLIENT_MAGIC: &[u8] = b"coraldb-wire-v1\0";

/// Maximum message size (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Frame layout: `[length: u32 BE][MessagePack payload]`.
const LEN_PREFIX: usize = 4;

fn frame(payload: Vec<u8>) -> Result<Vec<u8>> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(Error::MessageTooLarge);
    }
    let mut buf = Vec::with_capacity(LEN_PREFIX + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Encode a command with length prefix.
pub fn encode_command(cmd: &Command) -> Result<Vec<u8>> {
    // Named serialization is required for tagged enums
    let payload = rmp_serde::to_vec_named(cmd)
        .map_err(|e| Error::MalformedFrame(format!("serialization failed: {}", e)))?;
    frame(payload)
}

/// Encode a generic message with length prefix.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec_named(msg)
        .map_err(|e| Error::MalformedFrame(format!("serialization failed: {}", e)))?;
    frame(payload)
}

/// Decode a message payload (without the length prefix).
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    rmp_serde::from_slice(data)
        .map_err(|e| Error::MalformedFrame(format!("deserialization failed: {}", e)))
}

/// Decode one server message from the front of `buf`.
///
/// Returns `Ok(None)` while the buffer holds an incomplete frame, and the
/// decoded message together with the number of bytes consumed once a full
/// frame is available. Invalid length prefixes fail loudly; bytes are never
/// silently dropped.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(ServerMessage, usize)>> {
    if buf.len() < LEN_PREFIX {
        return Ok(None);
    }
    let mut len_buf = [0u8; LEN_PREFIX];
    len_buf.copy_from_slice(&buf[..LEN_PREFIX]);
    let msg_len = u32::from_be_bytes(len_buf) as usize;
    if msg_len > MAX_MESSAGE_SIZE {
        return Err(Error::MalformedFrame(format!(
            "frame length {} exceeds maximum",
            msg_len
        )));
    }
    if buf.len() < LEN_PREFIX + msg_len {
        return Ok(None);
    }
    let msg = decode_message(&buf[LEN_PREFIX..LEN_PREFIX + msg_len])?;
    Ok(Some((msg, LEN_PREFIX + msg_len)))
}
