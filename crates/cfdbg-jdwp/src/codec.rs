//! Packet framing and big-endian payload coding shared by the client and the
//! mock VM.

use std::io::Read;

use crate::types::{
    FrameId, JdwpError, JdwpIdSizes, JdwpValue, Location, MethodId, ObjectId, ReferenceTypeId,
    Result,
};

pub const HANDSHAKE: &[u8] = b"JDWP-Handshake";
pub const HEADER_LEN: usize = 11;
pub const FLAG_REPLY: u8 = 0x80;

/// A raw packet as it comes off the socket, before any payload decoding.
#[derive(Debug, Clone)]
pub enum RawPacket {
    Reply {
        id: u32,
        error_code: u16,
        payload: Vec<u8>,
    },
    Command {
        id: u32,
        command_set: u8,
        command: u8,
        payload: Vec<u8>,
    },
}

pub fn read_packet(reader: &mut impl Read) -> Result<RawPacket> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if length < HEADER_LEN {
        return Err(JdwpError::Protocol(format!("invalid packet length {length}")));
    }

    let id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let flags = header[8];

    let mut payload = vec![0u8; length - HEADER_LEN];
    reader.read_exact(&mut payload)?;

    if flags & FLAG_REPLY != 0 {
        Ok(RawPacket::Reply {
            id,
            error_code: u16::from_be_bytes([header[9], header[10]]),
            payload,
        })
    } else {
        Ok(RawPacket::Command {
            id,
            command_set: header[9],
            command: header[10],
            payload,
        })
    }
}

pub fn encode_command(id: u32, command_set: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let length = HEADER_LEN + payload.len();
    let mut buf = Vec::with_capacity(length);
    buf.extend_from_slice(&(length as u32).to_be_bytes());
    buf.extend_from_slice(&id.to_be_bytes());
    buf.push(0);
    buf.push(command_set);
    buf.push(command);
    buf.extend_from_slice(payload);
    buf
}

pub fn encode_reply(id: u32, error_code: u16, payload: &[u8]) -> Vec<u8> {
    let length = HEADER_LEN + payload.len();
    let mut buf = Vec::with_capacity(length);
    buf.extend_from_slice(&(length as u32).to_be_bytes());
    buf.extend_from_slice(&id.to_be_bytes());
    buf.push(FLAG_REPLY);
    buf.extend_from_slice(&error_code.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub struct JdwpReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> JdwpReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(JdwpError::Protocol("unexpected end of packet".to_string()));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_id(&mut self, size: usize) -> Result<u64> {
        let bytes = self.take(size)?;
        let mut value = 0u64;
        for b in bytes {
            value = (value << 8) | (*b as u64);
        }
        Ok(value)
    }

    pub fn read_object_id(&mut self, sizes: &JdwpIdSizes) -> Result<ObjectId> {
        self.read_id(sizes.object_id)
    }

    pub fn read_reference_type_id(&mut self, sizes: &JdwpIdSizes) -> Result<ReferenceTypeId> {
        self.read_id(sizes.reference_type_id)
    }

    pub fn read_method_id(&mut self, sizes: &JdwpIdSizes) -> Result<MethodId> {
        self.read_id(sizes.method_id)
    }

    pub fn read_frame_id(&mut self, sizes: &JdwpIdSizes) -> Result<FrameId> {
        self.read_id(sizes.frame_id)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    pub fn read_location(&mut self, sizes: &JdwpIdSizes) -> Result<Location> {
        Ok(Location {
            type_tag: self.read_u8()?,
            class_id: self.read_reference_type_id(sizes)?,
            method_id: self.read_method_id(sizes)?,
            index: self.read_u64()?,
        })
    }

    /// Reads an untagged value whose tag was read separately.
    pub fn read_value(&mut self, tag: u8, sizes: &JdwpIdSizes) -> Result<JdwpValue> {
        Ok(match tag {
            b'Z' => JdwpValue::Boolean(self.read_u8()? != 0),
            b'B' => JdwpValue::Byte(self.read_u8()? as i8),
            b'C' => JdwpValue::Char(self.read_u16()?),
            b'S' => JdwpValue::Short(self.read_u16()? as i16),
            b'I' => JdwpValue::Int(self.read_i32()?),
            b'J' => JdwpValue::Long(self.read_i64()?),
            b'F' => JdwpValue::Float(f32::from_bits(self.read_u32()?)),
            b'D' => JdwpValue::Double(f64::from_bits(self.read_u64()?)),
            b'V' => JdwpValue::Void,
            _ => JdwpValue::Object {
                tag,
                id: self.read_object_id(sizes)?,
            },
        })
    }

    pub fn read_tagged_value(&mut self, sizes: &JdwpIdSizes) -> Result<JdwpValue> {
        let tag = self.read_u8()?;
        self.read_value(tag, sizes)
    }
}

#[derive(Default)]
pub struct JdwpWriter {
    buf: Vec<u8>,
}

impl JdwpWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_id(&mut self, v: u64, size: usize) {
        let bytes = v.to_be_bytes();
        self.buf.extend_from_slice(&bytes[bytes.len() - size..]);
    }

    pub fn write_object_id(&mut self, v: ObjectId, sizes: &JdwpIdSizes) {
        self.write_id(v, sizes.object_id);
    }

    pub fn write_reference_type_id(&mut self, v: ReferenceTypeId, sizes: &JdwpIdSizes) {
        self.write_id(v, sizes.reference_type_id);
    }

    pub fn write_method_id(&mut self, v: MethodId, sizes: &JdwpIdSizes) {
        self.write_id(v, sizes.method_id);
    }

    pub fn write_string(&mut self, v: &str) {
        self.write_u32(v.len() as u32);
        self.buf.extend_from_slice(v.as_bytes());
    }

    pub fn write_location(&mut self, loc: &Location, sizes: &JdwpIdSizes) {
        self.write_u8(loc.type_tag);
        self.write_reference_type_id(loc.class_id, sizes);
        self.write_method_id(loc.method_id, sizes);
        self.write_u64(loc.index);
    }

    pub fn write_tagged_value(&mut self, value: &JdwpValue, sizes: &JdwpIdSizes) {
        match value {
            JdwpValue::Boolean(v) => {
                self.write_u8(b'Z');
                self.write_bool(*v);
            }
            JdwpValue::Byte(v) => {
                self.write_u8(b'B');
                self.write_u8(*v as u8);
            }
            JdwpValue::Char(v) => {
                self.write_u8(b'C');
                self.write_u16(*v);
            }
            JdwpValue::Short(v) => {
                self.write_u8(b'S');
                self.write_u16(*v as u16);
            }
            JdwpValue::Int(v) => {
                self.write_u8(b'I');
                self.write_i32(*v);
            }
            JdwpValue::Long(v) => {
                self.write_u8(b'J');
                self.write_i64(*v);
            }
            JdwpValue::Float(v) => {
                self.write_u8(b'F');
                self.write_u32(v.to_bits());
            }
            JdwpValue::Double(v) => {
                self.write_u8(b'D');
                self.write_u64(v.to_bits());
            }
            JdwpValue::Object { tag, id } => {
                self.write_u8(*tag);
                self.write_object_id(*id, sizes);
            }
            JdwpValue::Void => self.write_u8(b'V'),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_packet_round_trips() {
        let encoded = encode_reply(42, 0, b"ok");
        let mut cursor = std::io::Cursor::new(encoded);
        match read_packet(&mut cursor).unwrap() {
            RawPacket::Reply {
                id,
                error_code,
                payload,
            } => {
                assert_eq!(id, 42);
                assert_eq!(error_code, 0);
                assert_eq!(payload, b"ok");
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn command_packet_round_trips() {
        let encoded = encode_command(7, 15, 1, &[1, 2, 3]);
        let mut cursor = std::io::Cursor::new(encoded);
        match read_packet(&mut cursor).unwrap() {
            RawPacket::Command {
                id,
                command_set,
                command,
                payload,
            } => {
                assert_eq!(id, 7);
                assert_eq!(command_set, 15);
                assert_eq!(command, 1);
                assert_eq!(payload, vec![1, 2, 3]);
            }
            other => panic!("expected command, got {other:?}"),
        }
    }

    #[test]
    fn sized_ids_use_the_configured_width() {
        let sizes = JdwpIdSizes {
            object_id: 4,
            ..Default::default()
        };
        let mut w = JdwpWriter::new();
        w.write_object_id(0xAABBCCDD, &sizes);
        let bytes = w.into_vec();
        assert_eq!(bytes, vec![0xAA, 0xBB, 0xCC, 0xDD]);

        let mut r = JdwpReader::new(&bytes);
        assert_eq!(r.read_object_id(&sizes).unwrap(), 0xAABBCCDD);
    }

    #[test]
    fn tagged_long_round_trips() {
        let sizes = JdwpIdSizes::default();
        let mut w = JdwpWriter::new();
        w.write_tagged_value(&JdwpValue::Long(-5), &sizes);
        let bytes = w.into_vec();
        let mut r = JdwpReader::new(&bytes);
        assert_eq!(r.read_tagged_value(&sizes).unwrap(), JdwpValue::Long(-5));
    }
}
