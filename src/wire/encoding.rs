use super::ConversionError;
use prost::bytes::BufMut;

/// Frames start with the payload length as a big-endian u16.
pub const FRAME_HEADER_LEN: usize = 2;

/// Encodes `msg` into a single frame.
pub fn encode_frame<T: prost::Message>(msg: &T) -> Result<Vec<u8>, ConversionError> {
    // The length is a fixed u16, so `encode_length_delimited` (LEB128) does
    // not fit here.
    let len = msg.encoded_len();
    if len > u16::MAX as usize {
        return Err(ConversionError::FrameTooLarge(len));
    }

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + len);
    buf.put_slice(&(len as u16).to_be_bytes());
    msg.encode(&mut buf)
        .map_err(|e| ConversionError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decodes the first frame in `bytes`. Returns the message and the number of
/// bytes consumed, so several frames can be read from one buffer.
pub fn decode_frame<T: prost::Message + Default>(
    bytes: &[u8],
) -> Result<(T, usize), ConversionError> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(ConversionError::Truncated);
    }
    let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    let end = FRAME_HEADER_LEN + len;
    let body = bytes
        .get(FRAME_HEADER_LEN..end)
        .ok_or(ConversionError::Truncated)?;
    let msg = T::decode(body).map_err(|e| ConversionError::Decode(e.to_string()))?;
    Ok((msg, end))
}
