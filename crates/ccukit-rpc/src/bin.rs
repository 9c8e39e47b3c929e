// ── BIN-RPC codec ──
//
// The binary dialect spoken by CUxD and the interface processes' binary
// ports. Frames are `Bin` + a kind byte + a u32 big-endian payload length,
// followed by a recursively typed payload. Implemented as a tokio-util
// `Decoder`/`Encoder` pair so both sides run over `Framed` streams.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::value::Value;

const MAGIC: &[u8; 3] = b"Bin";
const HEADER_LEN: usize = 8;

const KIND_REQUEST: u8 = 0x00;
const KIND_RESPONSE: u8 = 0x01;
const KIND_FAULT: u8 = 0xff;

const TYPE_INTEGER: u32 = 0x0001;
const TYPE_BOOL: u32 = 0x0002;
const TYPE_STRING: u32 = 0x0003;
const TYPE_DOUBLE: u32 = 0x0004;
const TYPE_ARRAY: u32 = 0x0100;
const TYPE_STRUCT: u32 = 0x0101;

/// Upper bound on a single frame. listDevices answers from a large
/// installation stay well under this.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// One message on a binary connection, either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum BinFrame {
    Request { method: String, params: Vec<Value> },
    Response(Value),
    Fault { code: i64, message: String },
}

/// Framed codec for the binary dialect.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinCodec;

impl Decoder for BinCodec {
    type Item = BinFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BinFrame>, Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        if &src[0..3] != MAGIC {
            return Err(Error::codec("bad frame magic"));
        }
        let kind = src[3];
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Error::MessageTooLarge { size: len, max: MAX_FRAME_SIZE });
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        let frame = src.split_to(HEADER_LEN + len);
        let mut cursor = Cursor::new(&frame[HEADER_LEN..]);
        let decoded = match kind {
            KIND_REQUEST => {
                let method = cursor.string()?;
                let count = cursor.u32()? as usize;
                let mut params = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    params.push(read_value(&mut cursor)?);
                }
                BinFrame::Request { method, params }
            }
            KIND_RESPONSE => BinFrame::Response(read_value(&mut cursor)?),
            KIND_FAULT => {
                let detail = read_value(&mut cursor)?;
                let code = detail.get("faultCode").and_then(Value::as_i64).unwrap_or(-1);
                let message = detail
                    .get("faultString")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown fault")
                    .to_owned();
                BinFrame::Fault { code, message }
            }
            other => return Err(Error::codec(format!("unknown frame kind 0x{other:02x}"))),
        };
        Ok(Some(decoded))
    }
}

impl Encoder<BinFrame> for BinCodec {
    type Error = Error;

    fn encode(&mut self, frame: BinFrame, dst: &mut BytesMut) -> Result<(), Error> {
        let mut payload = BytesMut::with_capacity(64);
        let kind = match &frame {
            BinFrame::Request { method, params } => {
                payload.put_u32(method.len() as u32);
                payload.put_slice(method.as_bytes());
                payload.put_u32(params.len() as u32);
                for p in params {
                    write_value(p, &mut payload);
                }
                KIND_REQUEST
            }
            BinFrame::Response(value) => {
                write_value(value, &mut payload);
                KIND_RESPONSE
            }
            BinFrame::Fault { code, message } => {
                let detail = Value::Struct(BTreeMap::from([
                    ("faultCode".to_owned(), Value::Int(*code)),
                    ("faultString".to_owned(), Value::String(message.clone())),
                ]));
                write_value(&detail, &mut payload);
                KIND_FAULT
            }
        };
        if payload.len() > MAX_FRAME_SIZE {
            return Err(Error::MessageTooLarge { size: payload.len(), max: MAX_FRAME_SIZE });
        }
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_slice(MAGIC);
        dst.put_u8(kind);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

// ── Value encoding ──

fn write_value(value: &Value, out: &mut BytesMut) {
    match value {
        Value::Bool(b) => {
            out.put_u32(TYPE_BOOL);
            out.put_u8(u8::from(*b));
        }
        Value::Int(i) => {
            out.put_u32(TYPE_INTEGER);
            out.put_i32(*i as i32);
        }
        Value::Double(d) => {
            out.put_u32(TYPE_DOUBLE);
            let (mantissa, exponent) = split_double(*d);
            out.put_i32(mantissa);
            out.put_i32(exponent);
        }
        Value::String(s) => {
            out.put_u32(TYPE_STRING);
            out.put_u32(s.len() as u32);
            out.put_slice(s.as_bytes());
        }
        // The binary dialect has no raw-bytes type; bytes go out verbatim
        // in a string slot, matching what CUxD does for its data blobs.
        Value::Binary(b) => {
            out.put_u32(TYPE_STRING);
            out.put_u32(b.len() as u32);
            out.put_slice(b);
        }
        Value::Array(items) => {
            out.put_u32(TYPE_ARRAY);
            out.put_u32(items.len() as u32);
            for item in items {
                write_value(item, out);
            }
        }
        Value::Struct(members) => {
            out.put_u32(TYPE_STRUCT);
            out.put_u32(members.len() as u32);
            for (name, member) in members {
                out.put_u32(name.len() as u32);
                out.put_slice(name.as_bytes());
                write_value(member, out);
            }
        }
    }
}

fn read_value(cursor: &mut Cursor<'_>) -> Result<Value, Error> {
    match cursor.u32()? {
        TYPE_BOOL => Ok(Value::Bool(cursor.u8()? != 0)),
        TYPE_INTEGER => Ok(Value::Int(i64::from(cursor.i32()?))),
        TYPE_DOUBLE => {
            let mantissa = cursor.i32()?;
            let exponent = cursor.i32()?;
            Ok(Value::Double(join_double(mantissa, exponent)))
        }
        TYPE_STRING => Ok(Value::String(cursor.string_body()?)),
        TYPE_ARRAY => {
            let count = cursor.u32()? as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(read_value(cursor)?);
            }
            Ok(Value::Array(items))
        }
        TYPE_STRUCT => {
            let count = cursor.u32()? as usize;
            let mut members = BTreeMap::new();
            for _ in 0..count {
                let name = cursor.string_body()?;
                members.insert(name, read_value(cursor)?);
            }
            Ok(Value::Struct(members))
        }
        other => Err(Error::codec(format!("unknown value type 0x{other:04x}"))),
    }
}

/// Doubles travel as a base-2 mantissa/exponent pair: value = m / 2^30 * 2^e.
fn split_double(d: f64) -> (i32, i32) {
    if d == 0.0 || !d.is_finite() {
        return (0, 0);
    }
    let exponent = d.abs().log2().floor() as i32 + 1;
    let mantissa = (d * 2f64.powi(-exponent) * f64::from(0x4000_0000)).round() as i32;
    (mantissa, exponent)
}

fn join_double(mantissa: i32, exponent: i32) -> f64 {
    f64::from(mantissa) / f64::from(0x4000_0000) * 2f64.powi(exponent)
}

// ── Bounds-checked payload reader ──

struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.buf.len() < n {
            return Err(Error::codec("truncated frame payload"));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, Error> {
        let mut bytes = self.take(4)?;
        Ok(bytes.get_u32())
    }

    fn i32(&mut self) -> Result<i32, Error> {
        let mut bytes = self.take(4)?;
        Ok(bytes.get_i32())
    }

    /// Length-prefixed string body (no leading type tag).
    fn string_body(&mut self) -> Result<String, Error> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Length-prefixed string used in request headers.
    fn string(&mut self) -> Result<String, Error> {
        self.string_body()
    }
}
