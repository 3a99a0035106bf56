//! Wire vocabulary shared by the device, the peer and the resource broker.
//!
//! Opcodes are single bytes. Integers are big-endian, strings carry a `u16`
//! length prefix, and structured values travel as `u32`-length-prefixed JSON
//! frames.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::invocation::InvocationOutcome;

pub const HELLO: u8 = 0x01;
pub const REGISTER_APP: u8 = 0x10;
pub const APP_PRESENT: u8 = 0x11;
pub const APP_REQUEST: u8 = 0x12;
pub const OFFLOAD_REQUEST: u8 = 0x20;

/// Upload acknowledgement byte sent by the peer after storing a payload.
pub const UPLOAD_ACK: u8 = APP_PRESENT;

pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Offload requests always ask for a single replica.
pub const SINGLE_REPLICA: u32 = 1;

/// Where the remote clone can be reached. Immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub address: String,
    pub port: u16,
    pub secure_port: u16,
    #[serde(default)]
    pub crypto_capable: bool,
}

impl PeerDescriptor {
    pub fn plaintext_endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn secure_endpoint(&self) -> String {
        format!("{}:{}", self.address, self.secure_port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverSnapshot {
    pub type_name: String,
    pub state: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationDescriptor {
    pub receiver: ReceiverSnapshot,
    pub method: String,
    pub param_types: Vec<String>,
    pub args: Vec<Value>,
}

/// Peer reply to one offload request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultContainer {
    pub function_result: InvocationOutcome,
    /// Post-call receiver state; absent when the remote call failed.
    #[serde(default)]
    pub state_delta: Option<Value>,
    pub pure_execution_nanos: u64,
}

pub fn opcode_name(op: u8) -> &'static str {
    match op {
        HELLO => "HELLO",
        REGISTER_APP => "REGISTER_APP",
        APP_PRESENT => "APP_PRESENT",
        APP_REQUEST => "APP_REQUEST",
        OFFLOAD_REQUEST => "OFFLOAD_REQUEST",
        _ => "UNKNOWN",
    }
}

pub fn write_opcode<W: Write + ?Sized>(w: &mut W, op: u8) -> Result<(), ProtocolError> {
    w.write_all(&[op])?;
    Ok(())
}

pub fn read_opcode<R: Read + ?Sized>(r: &mut R) -> Result<u8, ProtocolError> {
    let mut buf = [0_u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn expect_opcode<R: Read + ?Sized>(
    r: &mut R,
    expected: u8,
) -> Result<(), ProtocolError> {
    let got = read_opcode(r)?;
    if got != expected {
        return Err(ProtocolError::UnexpectedOpcode {
            got,
            expected: opcode_name(expected),
        });
    }
    Ok(())
}

pub fn write_u32<W: Write + ?Sized>(w: &mut W, v: u32) -> Result<(), ProtocolError> {
    w.write_all(&v.to_be_bytes())?;
    Ok(())
}

pub fn read_u32<R: Read + ?Sized>(r: &mut R) -> Result<u32, ProtocolError> {
    let mut buf = [0_u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

pub fn write_u64<W: Write + ?Sized>(w: &mut W, v: u64) -> Result<(), ProtocolError> {
    w.write_all(&v.to_be_bytes())?;
    Ok(())
}

pub fn read_u64<R: Read + ?Sized>(r: &mut R) -> Result<u64, ProtocolError> {
    let mut buf = [0_u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

pub fn write_str<W: Write + ?Sized>(w: &mut W, s: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(s.len()).map_err(|_| ProtocolError::StringTooLong(s.len()))?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

pub fn read_str<R: Read + ?Sized>(r: &mut R) -> Result<String, ProtocolError> {
    let mut len = [0_u8; 2];
    r.read_exact(&mut len)?;
    let mut buf = vec![0_u8; u16::from_be_bytes(len) as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| ProtocolError::InvalidUtf8)
}

/// Encode `value` into a fresh frame. Nothing is cached between calls, so a
/// mutated receiver is always re-encoded in full.
pub fn write_frame<W: Write + ?Sized, T: Serialize>(
    w: &mut W,
    value: &T,
) -> Result<(), ProtocolError> {
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    write_u32(w, body.len() as u32)?;
    w.write_all(&body)?;
    Ok(())
}

pub fn read_frame<R: Read + ?Sized, T: DeserializeOwned>(r: &mut R) -> Result<T, ProtocolError> {
    let len = read_u32(r)? as usize;
    if len > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_BYTES,
        });
    }
    let mut body = vec![0_u8; len];
    r.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn opcode_values_are_fixed() {
        assert_eq!(HELLO, 0x01);
        assert_eq!(REGISTER_APP, 0x10);
        assert_eq!(APP_PRESENT, 0x11);
        assert_eq!(APP_REQUEST, 0x12);
        assert_eq!(OFFLOAD_REQUEST, 0x20);
    }

    #[test]
    fn strings_use_u16_big_endian_prefix() {
        let mut buf = Vec::new();
        write_str(&mut buf, "calc").unwrap();
        assert_eq!(buf, vec![0, 4, b'c', b'a', b'l', b'c']);
        assert_eq!(read_str(&mut Cursor::new(buf)).unwrap(), "calc");
    }

    #[test]
    fn read_frame_rejects_oversized_length() {
        let mut buf = Vec::new();
        write_u32(&mut buf, (MAX_FRAME_BYTES + 1) as u32).unwrap();
        let err = read_frame::<_, Value>(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }), "{err}");
    }

    #[test]
    fn truncated_frame_is_an_io_error() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 10).unwrap();
        buf.extend_from_slice(b"{}");
        let err = read_frame::<_, Value>(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)), "{err}");
    }

    #[test]
    fn expect_opcode_names_the_mismatch() {
        let err = expect_opcode(&mut Cursor::new(vec![APP_REQUEST]), APP_PRESENT).unwrap_err();
        assert!(err.to_string().contains("APP_PRESENT"), "{err}");
    }
}
