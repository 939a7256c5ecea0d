use std::fmt;

use bytes::Bytes;

use crate::rtun::tunnel::frame::FrameError;

const TYPE_MASK: u8 = 0x0F;
const RESPONSE: u8 = 0x80;
const FAIL: u8 = 0x40;
const NEED_ACK: u8 = 0x20;

/// Message type carried in the low nibble of the control byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Register = 0x00,
    Open = 0x01,
    Close = 0x02,
    Read = 0x03,
    Write = 0x04,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Register => "register",
            MessageType::Open => "open",
            MessageType::Close => "close",
            MessageType::Read => "read",
            MessageType::Write => "write",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value & TYPE_MASK {
            0x00 => Ok(MessageType::Register),
            0x01 => Ok(MessageType::Open),
            0x02 => Ok(MessageType::Close),
            0x03 => Ok(MessageType::Read),
            0x04 => Ok(MessageType::Write),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// Decoded control byte.
///
/// `fail` is only meaningful on responses and `need_ack` only on requests;
/// both are kept as decoded so re-encoding is lossless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control {
    pub kind: MessageType,
    pub response: bool,
    pub fail: bool,
    pub need_ack: bool,
}

impl Control {
    pub fn request(kind: MessageType, need_ack: bool) -> Self {
        Self {
            kind,
            response: false,
            fail: false,
            need_ack,
        }
    }

    pub fn response(kind: MessageType, success: bool) -> Self {
        Self {
            kind,
            response: true,
            fail: !success,
            need_ack: false,
        }
    }

    pub fn from_byte(b: u8) -> Result<Self, FrameError> {
        Ok(Self {
            kind: MessageType::try_from(b)?,
            response: b & RESPONSE != 0,
            fail: b & FAIL != 0,
            need_ack: b & NEED_ACK != 0,
        })
    }

    pub fn to_byte(self) -> u8 {
        let mut b = self.kind as u8;
        if self.response {
            b |= RESPONSE;
        }
        if self.fail {
            b |= FAIL;
        }
        if self.need_ack {
            b |= NEED_ACK;
        }
        b
    }
}

/// A decoded frame payload: correlation key, control byte and data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub key: String,
    pub control: Control,
    pub data: Bytes,
}

impl Packet {
    pub fn new(key: impl Into<String>, control: Control, data: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            control,
            data: data.into(),
        }
    }

    pub fn request(
        key: impl Into<String>,
        kind: MessageType,
        need_ack: bool,
        data: impl Into<Bytes>,
    ) -> Self {
        Self::new(key, Control::request(kind, need_ack), data)
    }

    pub fn is_request(&self) -> bool {
        !self.control.response
    }

    pub fn is_success(&self) -> bool {
        !self.control.fail
    }

    pub fn needs_ack(&self) -> bool {
        self.control.need_ack
    }

    pub fn message_type(&self) -> MessageType {
        self.control.kind
    }

    /// Builds the reply correlated with this packet (same key and type).
    pub fn new_response(&self, success: bool, data: impl Into<Bytes>) -> Packet {
        Packet::new(
            self.key.clone(),
            Control::response(self.control.kind, success),
            data,
        )
    }

    /// Data interpreted as UTF-8 text, as carried by Fail responses and Close requests.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ", self.key, self.control.kind.as_str())?;
        if self.is_request() {
            let ack = if self.needs_ack() { "need-ack" } else { "no-ack" };
            write!(f, "request|{ack}")?;
        } else {
            let res = if self.is_success() { "success" } else { "fail" };
            write!(f, "response|{res}")?;
        }
        const PREVIEW: usize = 64;
        if self.data.len() > PREVIEW {
            write!(
                f,
                " data={:?}... ({} bytes)",
                String::from_utf8_lossy(&self.data[..PREVIEW]),
                self.data.len()
            )
        } else {
            write!(f, " data={:?}", String::from_utf8_lossy(&self.data))
        }
    }
}

/// Big-endian byte count, used by Write responses and Read requests.
pub fn encode_count(n: usize) -> Bytes {
    let n: u32 = n.try_into().unwrap_or(u32::MAX);
    Bytes::copy_from_slice(&n.to_be_bytes())
}

pub fn decode_count(data: &[u8]) -> Option<u32> {
    let b: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(b))
}
