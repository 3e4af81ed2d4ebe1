use std::io::{Cursor, Read};

use byteorder::ReadBytesExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::bytes::{BufMut, BytesMut};

use crate::error::{CResult, Error};

/// Serializes a value with bincode, without framing. Used for persisted row
/// payloads where the surrounding row already carries the length.
pub fn serialize<T>(value: &T) -> CResult<Vec<u8>>
where
    T: ?Sized + Serialize,
{
    Ok(bincode::serialize(value)?)
}

/// Deserializes an unframed bincode payload.
pub fn deserialize<R>(bytes: &[u8]) -> CResult<R>
where
    R: DeserializeOwned,
{
    Ok(bincode::deserialize(bytes)?)
}

/// Length-framed bincode codec for replicated operation buffers.
///
/// Every frame is the payload length as a big-endian u64 followed by the
/// bincode body. Frames can be concatenated and decoded back with a cursor.
#[derive(Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec
    }

    pub fn encode<T>(&self, value: &T) -> CResult<Vec<u8>>
    where
        T: ?Sized + Serialize,
    {
        let body = bincode::serialize(value)?;

        let mut buf = BytesMut::with_capacity(8 + body.len());
        buf.put_u64(body.len() as u64);
        buf.put(body.as_slice());

        Ok(buf.to_vec())
    }

    pub fn decode<R>(&self, value: &[u8]) -> CResult<R>
    where
        R: DeserializeOwned,
    {
        let mut cursor = Cursor::new(value);
        match self.decode_cursor(&mut cursor)? {
            Some(r) => Ok(r),
            None => Err(Error::Parse("empty frame".to_string())),
        }
    }

    /// Decodes the next frame at the cursor, or None at end of input.
    pub fn decode_cursor<R>(&self, cursor: &mut Cursor<&[u8]>) -> CResult<Option<R>>
    where
        R: DeserializeOwned,
    {
        if cursor.position() >= cursor.get_ref().len() as u64 {
            return Ok(None);
        }

        let len = cursor
            .read_u64::<byteorder::BigEndian>()
            .map_err(|err| Error::Parse(err.to_string()))? as usize;

        let remaining = cursor.get_ref().len() as u64 - cursor.position();
        if (len as u64) > remaining {
            return Err(Error::Parse(format!(
                "frame length {} exceeds remaining {} bytes",
                len, remaining
            )));
        }

        let mut body = vec![0; len];
        cursor
            .read_exact(&mut body)
            .map_err(|err| Error::Parse(err.to_string()))?;

        Ok(Some(bincode::deserialize(&body)?))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}
