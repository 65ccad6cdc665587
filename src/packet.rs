//! Packet framing between the viewer and the master.
//!
//! ```text
//! frame:  u32 len | body
//! body:   u8 kind | u32 seq | u16 cmd_len | cmd | u16 argc | args...
//! arg:    'i' i32 | 'd' f64 | 's' u32 len + utf8
//! ```
//!
//! All integers little-endian.

use crate::status::DboxError;
use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_FRAME: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Request,
    Reply,
    Notify,
}

impl PacketKind {
    fn code(self) -> u8 {
        match self {
            PacketKind::Request => 1,
            PacketKind::Reply => 2,
            PacketKind::Notify => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Double(f64),
    Str(String),
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

/// Wire integers are signed; values past `i32::MAX` are refused.
impl TryFrom<u32> for Value {
    type Error = DboxError;

    fn try_from(v: u32) -> Result<Self, DboxError> {
        i32::try_from(v)
            .map(Value::Int)
            .map_err(|_| DboxError::InvalidParameter)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Int(v as i32)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Option<&str>> for Value {
    fn from(v: Option<&str>) -> Self {
        Value::Str(v.unwrap_or_default().to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub kind: PacketKind,
    pub seq: u32,
    pub command: String,
    pub args: Vec<Value>,
}

impl Packet {
    pub fn request(command: &str, args: Vec<Value>) -> Self {
        Self {
            kind: PacketKind::Request,
            seq: 0,
            command: command.to_string(),
            args,
        }
    }

    pub fn notify(command: &str, args: Vec<Value>) -> Self {
        Self {
            kind: PacketKind::Notify,
            seq: 0,
            command: command.to_string(),
            args,
        }
    }

    pub fn reply(seq: u32, command: &str, args: Vec<Value>) -> Self {
        Self {
            kind: PacketKind::Reply,
            seq,
            command: command.to_string(),
            args,
        }
    }

    /// Cursor over the arguments.
    pub fn reader(&self) -> ArgReader<'_> {
        ArgReader {
            args: &self.args,
            pos: 0,
        }
    }

    /// Frame the packet. Fails on anything the length fields or the peer's
    /// frame limit cannot carry.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let cmd_len = u16::try_from(self.command.len()).context("command too long")?;
        let argc = u16::try_from(self.args.len()).context("too many arguments")?;
        let mut body = Vec::with_capacity(32 + self.command.len());
        body.push(self.kind.code());
        body.extend_from_slice(&self.seq.to_le_bytes());
        body.extend_from_slice(&cmd_len.to_le_bytes());
        body.extend_from_slice(self.command.as_bytes());
        body.extend_from_slice(&argc.to_le_bytes());
        for arg in &self.args {
            match arg {
                Value::Int(v) => {
                    body.push(b'i');
                    body.extend_from_slice(&v.to_le_bytes());
                }
                Value::Double(v) => {
                    body.push(b'd');
                    body.extend_from_slice(&v.to_le_bytes());
                }
                Value::Str(s) => {
                    let len = u32::try_from(s.len()).context("string argument too long")?;
                    body.push(b's');
                    body.extend_from_slice(&len.to_le_bytes());
                    body.extend_from_slice(s.as_bytes());
                }
            }
        }

        if body.len() > MAX_FRAME {
            bail!("{} packet of {} bytes exceeds the frame limit", self.command, body.len());
        }
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&u32::try_from(body.len())?.to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode a frame body (without the length prefix).
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut cur = Cursor { data: body, pos: 0 };

        let kind = match cur.u8()? {
            1 => PacketKind::Request,
            2 => PacketKind::Reply,
            3 => PacketKind::Notify,
            k => bail!("unknown packet kind {k}"),
        };
        let seq = cur.u32()?;
        let cmd_len = cur.u16()? as usize;
        let command = String::from_utf8(cur.take(cmd_len)?.to_vec()).context("command not utf8")?;
        let argc = cur.u16()? as usize;

        let mut args = Vec::with_capacity(argc.min(64));
        for _ in 0..argc {
            let arg = match cur.u8()? {
                b'i' => Value::Int(i32::from_le_bytes(cur.array()?)),
                b'd' => Value::Double(f64::from_le_bytes(cur.array()?)),
                b's' => {
                    let len = cur.u32()? as usize;
                    let s = String::from_utf8(cur.take(len)?.to_vec()).context("string not utf8")?;
                    Value::Str(s)
                }
                t => bail!("unknown argument tag {t:#x}"),
            };
            args.push(arg);
        }

        if cur.pos != body.len() {
            bail!("{} trailing bytes in packet", body.len() - cur.pos);
        }

        Ok(Self {
            kind,
            seq,
            command,
            args,
        })
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).context("length overflow")?;
        let slice = self.data.get(self.pos..end).context("truncated packet")?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }
}

/// Typed access to packet arguments. Any mismatch is `InvalidParameter`.
#[derive(Debug)]
pub struct ArgReader<'a> {
    args: &'a [Value],
    pos: usize,
}

impl<'a> ArgReader<'a> {
    fn next(&mut self) -> Result<&'a Value, DboxError> {
        let v = self.args.get(self.pos).ok_or(DboxError::InvalidParameter)?;
        self.pos += 1;
        Ok(v)
    }

    pub fn int(&mut self) -> Result<i32, DboxError> {
        match self.next()? {
            Value::Int(v) => Ok(*v),
            _ => Err(DboxError::InvalidParameter),
        }
    }

    pub fn uint(&mut self) -> Result<u32, DboxError> {
        u32::try_from(self.int()?).map_err(|_| DboxError::InvalidParameter)
    }

    pub fn flag(&mut self) -> Result<bool, DboxError> {
        Ok(self.int()? != 0)
    }

    pub fn double(&mut self) -> Result<f64, DboxError> {
        match self.next()? {
            Value::Double(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f64),
            _ => Err(DboxError::InvalidParameter),
        }
    }

    pub fn str(&mut self) -> Result<&'a str, DboxError> {
        match self.next()? {
            Value::Str(s) => Ok(s.as_str()),
            _ => Err(DboxError::InvalidParameter),
        }
    }

    /// String argument where empty means "unset".
    pub fn opt_str(&mut self) -> Result<Option<&'a str>, DboxError> {
        let s = self.str()?;
        Ok((!s.is_empty()).then_some(s))
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

/// Read one frame; `Ok(None)` on clean EOF.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Packet>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        bail!("frame too large: {len} bytes");
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Packet::decode(&body).map(Some)
}

pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    writer.write_all(&packet.encode()?).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Packet {
        Packet {
            kind: PacketKind::Request,
            seq: 7,
            command: "new".into(),
            args: vec![
                "weather".into(),
                Value::Double(1.5),
                Value::Int(-3),
                "".into(),
            ],
        }
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let frame = sample().encode().unwrap();
        let body = &frame[4..frame.len() - 1];
        assert!(Packet::decode(body).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing() {
        let mut frame = sample().encode().unwrap();
        frame.push(0);
        assert!(Packet::decode(&frame[4..]).is_err());
    }

    #[test]
    fn test_encode_refuses_oversized_fields() {
        let long_command = Packet::notify(&"x".repeat(usize::from(u16::MAX) + 1), vec![]);
        assert!(long_command.encode().is_err());

        let too_many = Packet::notify("scroll", vec![Value::Int(0); usize::from(u16::MAX) + 1]);
        assert!(too_many.encode().is_err());

        let huge = Packet::notify("scroll", vec!["x".repeat(MAX_FRAME).into()]);
        assert!(huge.encode().is_err());
    }

    #[test]
    fn test_u32_values_stay_in_range() {
        assert_eq!(Value::try_from(7u32), Ok(Value::Int(7)));
        assert_eq!(
            Value::try_from(u32::MAX),
            Err(DboxError::InvalidParameter)
        );
    }

    #[test]
    fn test_arg_reader_types() {
        let p = sample();
        let mut r = p.reader();
        assert_eq!(r.str(), Ok("weather"));
        assert_eq!(r.double(), Ok(1.5));
        assert_eq!(r.uint(), Err(DboxError::InvalidParameter));
        assert_eq!(r.opt_str(), Ok(None));
        assert_eq!(r.int(), Err(DboxError::InvalidParameter));
    }

    #[tokio::test]
    async fn test_stream_framing() {
        let (mut a, mut b) = tokio::io::duplex(256);
        write_packet(&mut a, &sample()).await.unwrap();
        write_packet(&mut a, &Packet::notify("scroll", vec![1i32.into()]))
            .await
            .unwrap();
        drop(a);

        assert_eq!(read_packet(&mut b).await.unwrap(), Some(sample()));
        let second = read_packet(&mut b).await.unwrap().unwrap();
        assert_eq!(second.kind, PacketKind::Notify);
        assert_eq!(second.command, "scroll");
        assert_eq!(read_packet(&mut b).await.unwrap(), None);
    }
}
