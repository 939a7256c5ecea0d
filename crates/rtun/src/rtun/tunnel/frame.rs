use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::rtun::tunnel::packet::{Control, Packet};

pub const MAGIC: [u8; 2] = [0x89, 0x89];
pub const SEPARATOR: u8 = b'#';

const HEADER_LEN: usize = MAGIC.len() + 4;
// separator + control byte
const MIN_PAYLOAD_LEN: u32 = 2;

pub const DEFAULT_MAX_FRAME_BYTES: u32 = 16 << 20; // 16 MiB

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("unknown message type: {0:#04x}")]
    UnknownType(u8),
    #[error("frame too large: {0} bytes")]
    TooLarge(u32),
    #[error("key must not contain '#': {0:?}")]
    InvalidKey(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-delimited framing for tunnel packets.
///
/// `[0x89 0x89][u32 BE length][key '#' control data]`
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    pub max_frame_bytes: u32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl FrameCodec {
    pub fn new(max_frame_bytes: u32) -> Self {
        Self {
            max_frame_bytes: max_frame_bytes.max(MIN_PAYLOAD_LEN),
        }
    }

    /// Encodes a packet into one complete frame, header included.
    pub fn encode(&self, p: &Packet) -> Result<Bytes, FrameError> {
        if p.key.as_bytes().contains(&SEPARATOR) {
            return Err(FrameError::InvalidKey(p.key.clone()));
        }
        let payload_len = p.key.len() + MIN_PAYLOAD_LEN as usize + p.data.len();
        let n: u32 = payload_len
            .try_into()
            .map_err(|_| FrameError::TooLarge(u32::MAX))?;
        if n > self.max_frame_bytes {
            return Err(FrameError::TooLarge(n));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len);
        buf.put_slice(&MAGIC);
        buf.put_u32(n);
        buf.put_slice(p.key.as_bytes());
        buf.put_u8(SEPARATOR);
        buf.put_u8(p.control.to_byte());
        buf.put_slice(&p.data);
        Ok(buf.freeze())
    }

    /// Decodes a frame payload (without magic and length).
    pub fn decode(&self, payload: Bytes) -> Result<Packet, FrameError> {
        if payload.len() < MIN_PAYLOAD_LEN as usize {
            return Err(FrameError::Malformed("payload shorter than header"));
        }
        let sep = payload
            .iter()
            .position(|b| *b == SEPARATOR)
            .ok_or(FrameError::Malformed("missing separator"))?;
        let control = *payload
            .get(sep + 1)
            .ok_or(FrameError::Malformed("missing control byte"))?;
        let key = std::str::from_utf8(&payload[..sep])
            .map_err(|_| FrameError::Malformed("key is not utf-8"))?
            .to_string();
        let control = Control::from_byte(control)?;
        let data = payload.slice(sep + 2..);
        Ok(Packet { key, control, data })
    }

    /// Reads the next frame payload from `r`.
    ///
    /// Bytes preceding the magic are skipped one at a time. Once the magic is
    /// found, the length and payload are read exactly or the call fails.
    pub async fn read_frame<R: AsyncRead + Unpin>(&self, r: &mut R) -> Result<Bytes, FrameError> {
        let mut window = [0u8; 2];
        r.read_exact(&mut window).await?;
        let mut skipped: u64 = 0;
        while window != MAGIC {
            window[0] = window[1];
            window[1] = r.read_u8().await?;
            skipped += 1;
        }
        if skipped > 0 {
            tracing::debug!(skipped, "tunnel: resynchronized frame stream");
        }

        let n = r.read_u32().await?;
        if n > self.max_frame_bytes {
            return Err(FrameError::TooLarge(n));
        }
        if n < MIN_PAYLOAD_LEN {
            return Err(FrameError::Malformed("length below minimum payload"));
        }

        let mut buf = vec![0u8; n as usize];
        r.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    pub async fn read_packet<R: AsyncRead + Unpin>(&self, r: &mut R) -> Result<Packet, FrameError> {
        let payload = self.read_frame(r).await?;
        self.decode(payload)
    }
}
