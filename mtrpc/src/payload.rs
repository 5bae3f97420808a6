use std::borrow::Cow;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Encoded body of a single message.
///
/// Encoding is JSON unless the call negotiated MessagePack through
/// [`MsgFlags::UseMessagePack`](crate::MsgFlags::UseMessagePack).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Payload {
    #[default]
    Empty,
    Normal(Bytes),
}

impl Payload {
    /// # Errors
    pub fn encode<P: Serialize + ?Sized>(value: &P, use_msgpack: bool) -> Result<Self> {
        let mut writer = BytesMut::with_capacity(128).writer();
        if use_msgpack {
            rmp_serde::encode::write_named(&mut writer, value)?;
        } else {
            serde_json::to_writer(&mut writer, value)?;
        }
        Ok(writer.into_inner().into())
    }

    /// # Errors
    pub fn decode<P: for<'c> Deserialize<'c>>(&self, use_msgpack: bool) -> Result<P> {
        if self.is_empty() {
            // treat an empty body as null so unit requests need no bytes.
            Ok(serde_json::from_value(serde_json::Value::Null)?)
        } else if use_msgpack {
            Ok(rmp_serde::from_slice(self)?)
        } else {
            Ok(serde_json::from_slice(self)?)
        }
    }

    /// Human-readable rendering for logs.
    #[must_use]
    pub fn preview(&self, use_msgpack: bool) -> Cow<'_, str> {
        const LIMIT: usize = 256;
        if use_msgpack {
            Cow::Owned(format!("<{} bytes msgpack>", self.len()))
        } else if self.len() > LIMIT {
            Cow::Owned(format!(
                "{}...(+{} bytes)",
                String::from_utf8_lossy(&self[..LIMIT]),
                self.len() - LIMIT
            ))
        } else {
            String::from_utf8_lossy(self)
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Empty => 0,
            Payload::Normal(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Empty => true,
            Payload::Normal(bytes) => bytes.is_empty(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Empty => &[],
            Payload::Normal(bytes) => bytes,
        }
    }

    pub fn advance(&mut self, offset: usize) {
        match self {
            Payload::Empty => {}
            Payload::Normal(bytes) => bytes.advance(offset),
        }
    }
}

impl std::ops::Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Normal(value)
    }
}

impl From<BytesMut> for Payload {
    fn from(value: BytesMut) -> Self {
        Payload::Normal(value.into())
    }
}

impl From<Payload> for Bytes {
    fn from(value: Payload) -> Self {
        match value {
            Payload::Empty => Bytes::new(),
            Payload::Normal(bytes) => bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_codec() {
        let payload = Payload::encode("gRPC", false).unwrap();
        assert_eq!(payload.as_slice(), b"\"gRPC\"");
        assert_eq!(payload.preview(false), "\"gRPC\"");
        assert_eq!(payload.decode::<String>(false).unwrap(), "gRPC");

        let payload = Payload::encode(&(2018u32, "List"), true).unwrap();
        assert_eq!(payload.decode::<(u32, String)>(true).unwrap().0, 2018);
        assert!(payload.preview(true).contains("msgpack"));

        Payload::Empty.decode::<()>(false).unwrap();
        Payload::encode(&1u8, false)
            .unwrap()
            .decode::<String>(false)
            .unwrap_err();
    }
}
