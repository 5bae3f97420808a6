use std::io::Write;

use bitflags::bitflags;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};

use crate::{
    Payload,
    error::{Error, ErrorKind, Result},
};

/// Frame flags.
///
/// A frame is one step of a call:
/// - `Open` starts a call and carries the method name
/// - `Data` carries one message
/// - `EndOfStream` half-closes the sender's direction
/// - `Status` carries the terminal status (server to client only)
/// - `Cancel` aborts the call (client to server only)
/// - `Credit` returns send credit for consumed `Data` frames
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
#[repr(transparent)]
#[serde(transparent)]
pub struct MsgFlags(u8);

bitflags! {
    impl MsgFlags: u8 {
        /// Frame travels from client to server.
        const IsReq = 1;
        const Open = 2;
        const Data = 4;
        const EndOfStream = 8;
        const Status = 16;
        const Cancel = 32;
        /// Payloads of this call are MessagePack instead of JSON.
        const UseMessagePack = 64;
        const Credit = 128;
    }
}

/// Metadata serialized at the beginning of each frame body.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct MsgMeta {
    /// The method name (e.g. "SearchService/Search"), only set on `Open`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    pub flags: MsgFlags,
    /// Call id, allocated by the client and unique per connection.
    pub callid: u64,
}

impl MsgMeta {
    #[must_use]
    pub fn new(callid: u64, flags: MsgFlags) -> Self {
        Self {
            method: String::new(),
            flags,
            callid,
        }
    }

    #[must_use]
    pub fn is_req(&self) -> bool {
        self.flags.contains(MsgFlags::IsReq)
    }

    #[must_use]
    pub fn use_msgpack(&self) -> bool {
        self.flags.contains(MsgFlags::UseMessagePack)
    }
}

/// A decoded frame: metadata plus the still-encoded payload.
///
/// Body layout:
///
/// ```text
/// | 4 bytes  | N bytes  | M bytes |
/// | meta_len | metadata | payload |
/// ```
#[derive(Debug, Default, Clone)]
pub struct Message {
    pub meta: MsgMeta,
    pub payload: Payload,
}

impl Message {
    pub fn new(meta: MsgMeta, payload: Payload) -> Self {
        Self { meta, payload }
    }

    /// Parses a frame body. Metadata may be JSON or MessagePack (auto-detected).
    ///
    /// # Errors
    ///
    /// Returns `DeserializeFailed` if the body is truncated or the metadata
    /// cannot be decoded.
    pub fn parse(payload: impl Into<Payload>) -> Result<Self> {
        const S: usize = std::mem::size_of::<u32>();
        let mut payload: Payload = payload.into();

        let len = payload.len();
        let meta_len = if let Some(Ok(b)) = payload.get(..S).map(<[u8; S]>::try_from) {
            u32::from_be_bytes(b) as usize
        } else {
            return Err(Error::new(
                ErrorKind::DeserializeFailed,
                format!("invalid msg length: {len}"),
            ));
        };

        if meta_len == 0 {
            return Err(Error::new(
                ErrorKind::DeserializeFailed,
                format!("invalid meta length: {meta_len}"),
            ));
        }

        let offset = S + meta_len;
        if offset > len {
            return Err(Error::new(
                ErrorKind::DeserializeFailed,
                format!("invalid meta length: {meta_len}, msg length: {len}"),
            ));
        }

        let meta: MsgMeta = if payload[S] == b'{' {
            serde_json::from_slice(&payload[S..offset])?
        } else {
            rmp_serde::from_slice(&payload[S..offset])?
        };

        payload.advance(offset);
        Ok(Message { meta, payload })
    }

    /// Decodes the payload with the encoding negotiated for this call.
    ///
    /// # Errors
    pub fn deserialize<P: for<'c> Deserialize<'c>>(&self) -> Result<P> {
        self.payload.decode(self.meta.use_msgpack())
    }

    /// Decodes the terminal status carried by a `Status` frame.
    ///
    /// # Errors
    ///
    /// Returns the decode error if the status body is malformed.
    pub fn status(&self) -> Result<std::result::Result<(), Error>> {
        let status: Option<Error> = self.deserialize()?;
        Ok(status.map_or(Ok(()), Err))
    }
}

/// Target buffer for frame serialization.
///
/// `prepare` reserves any header, `finish` back-fills length prefixes once
/// the sizes are known.
pub trait SendMsg {
    fn size(&self) -> usize;

    /// # Errors
    fn prepare(&mut self) -> Result<()>;

    /// # Errors
    fn finish(&mut self, meta_offset: usize, payload_offset: usize) -> Result<()>;

    fn writer(&mut self) -> impl std::io::Write;
}

impl MsgMeta {
    /// Serializes the metadata followed by the already encoded payload.
    ///
    /// # Errors
    ///
    /// Returns an error if metadata serialization or length conversion fails.
    pub fn serialize_to<M: SendMsg>(&self, payload: &[u8], msg: &mut M) -> Result<()> {
        msg.prepare()?;

        let meta_offset = msg.size();
        // reserve for meta len.
        msg.writer()
            .write_all(&0u32.to_be_bytes())
            .map_err(|e| Error::new(ErrorKind::SerializeFailed, e.to_string()))?;
        if self.use_msgpack() {
            rmp_serde::encode::write_named(&mut msg.writer(), self)?;
        } else {
            serde_json::to_writer(msg.writer(), self)?;
        }

        let payload_offset = msg.size();
        msg.writer()
            .write_all(payload)
            .map_err(|e| Error::new(ErrorKind::SerializeFailed, e.to_string()))?;

        msg.finish(meta_offset, payload_offset)?;

        Ok(())
    }
}

impl SendMsg for BytesMut {
    fn size(&self) -> usize {
        self.len()
    }

    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self, meta_offset: usize, payload_offset: usize) -> Result<()> {
        const S: usize = std::mem::size_of::<u32>();
        let meta_len = u32::try_from(payload_offset - meta_offset - S)?;
        self[meta_offset..meta_offset + S].copy_from_slice(&meta_len.to_be_bytes());
        Ok(())
    }

    fn writer(&mut self) -> impl std::io::Write {
        #[repr(transparent)]
        struct Writer<'a>(&'a mut BytesMut);

        impl std::io::Write for Writer<'_> {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.write_all(buf)?;
                Ok(buf.len())
            }

            fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
                self.0.extend_from_slice(buf);
                Ok(())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        Writer(self)
    }
}
