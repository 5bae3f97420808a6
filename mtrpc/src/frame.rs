use bytes::{Buf, Bytes, BytesMut};

use crate::{
    Message, MsgMeta,
    error::{Error, ErrorKind, Result},
    msg::SendMsg,
};

pub(crate) const MAGIC_NUM: u32 = u32::from_be_bytes(*b"MTRP");
pub const MAX_MSG_SIZE: usize = 64 << 20;

/// Data frames a sender may have unconsumed on one call before the
/// receiver hands back credit.
pub const CALL_WINDOW: usize = 64;

/// Written by the server right after the TLS handshake.
pub(crate) const PREFACE: [u8; 8] = *b"MTRPC/1\n";

const HEADER_SIZE: usize = std::mem::size_of::<u64>();

/// Frame buffer: `magic | total_len | meta_len | meta | payload`.
struct FrameBytes(BytesMut);

impl SendMsg for FrameBytes {
    fn size(&self) -> usize {
        self.0.size()
    }

    fn prepare(&mut self) -> Result<()> {
        self.0.extend_from_slice(&MAGIC_NUM.to_be_bytes());
        self.0.extend_from_slice(&0u32.to_be_bytes());
        self.0.prepare()
    }

    fn finish(&mut self, meta_offset: usize, payload_offset: usize) -> Result<()> {
        const S: usize = std::mem::size_of::<u32>();
        if meta_offset < S {
            return Err(Error::new(
                ErrorKind::SerializeFailed,
                format!("invalid meta offset: {meta_offset}"),
            ));
        }

        self.0.finish(meta_offset, payload_offset)?;
        let total_len = u32::try_from(self.size() - meta_offset)?;
        self.0[meta_offset - S..meta_offset].copy_from_slice(&total_len.to_be_bytes());
        Ok(())
    }

    fn writer(&mut self) -> impl std::io::Write {
        self.0.writer()
    }
}

/// Encodes one frame ready to be written to the stream.
///
/// # Errors
///
/// Returns `Protocol` if the frame would exceed [`MAX_MSG_SIZE`].
pub fn encode_frame(meta: &MsgMeta, payload: &[u8]) -> Result<Bytes> {
    let mut bytes = FrameBytes(BytesMut::with_capacity(64 + payload.len()));
    meta.serialize_to(payload, &mut bytes)?;
    if bytes.0.len() >= MAX_MSG_SIZE {
        return Err(Error::new(
            ErrorKind::Protocol,
            format!("msg is too long: {}", bytes.0.len()),
        ));
    }
    Ok(bytes.0.freeze())
}

/// Splits one complete frame body off the front of `buffer`.
///
/// Returns `Ok(None)` when more bytes are needed.
///
/// # Errors
///
/// Returns `Protocol` on a bad magic number or an oversized frame.
pub fn parse_frame(buffer: &mut BytesMut) -> Result<Option<Message>> {
    let Some(header) = buffer.get(..HEADER_SIZE) else {
        return Ok(None);
    };
    let header = u64::from_be_bytes(header.try_into()?);
    if (header >> 32) as u32 != MAGIC_NUM {
        return Err(Error::new(
            ErrorKind::Protocol,
            format!("invalid header: {header:016X}"),
        ));
    }

    let len = usize::try_from(header & u64::from(u32::MAX))?;
    if HEADER_SIZE + len >= MAX_MSG_SIZE {
        return Err(Error::new(
            ErrorKind::Protocol,
            format!("msg is too long: {len}"),
        ));
    }

    if buffer.len() < HEADER_SIZE + len {
        Ok(None)
    } else {
        buffer.advance(HEADER_SIZE);
        Message::parse(buffer.split_to(len))
            .map(Some)
            .map_err(|e| Error::new(ErrorKind::Protocol, e.to_string()))
    }
}
