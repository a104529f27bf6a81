/*
Copyright (c) 2022 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
 */

//! Framing for the control protocol.
//!
//! Requests and replies are length-prefixed packets: one byte of protocol
//! version, one byte of packet type, one byte of payload length, then the
//! payload.  A packet fits well within `PIPE_BUF`, so each one rides in a
//! single atomic FIFO write and is consumed by a single read; there is no
//! connection state to resynchronize.
//!
//! Request types are `C` (command, one payload byte) and `Q` (status query).
//! Replies are `E` (a four-byte big-endian error code, zero for success) and
//! `S` (the full status record).

use std::io::{Error, ErrorKind, Read, Write};

use crate::status::StatusRecord;

pub const PROTO_VERSION: u8 = 1;
pub const MAX_PAYLOAD: usize = 255;

pub const TYPE_COMMAND: u8 = b'C';
pub const TYPE_QUERY: u8 = b'Q';
pub const TYPE_ERROR: u8 = b'E';
pub const TYPE_STATUS: u8 = b'S';

const HEADER_SIZE: usize = 3;

#[derive(Debug, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub typ: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(typ: u8, payload: Vec<u8>) -> Packet {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        Packet { version: PROTO_VERSION, typ, payload }
    }

    /// An `E` reply carrying `code` (0 for success, else `EPROTO` or a
    /// captured errno).
    pub fn error_reply(code: u32) -> Packet {
        Packet::new(TYPE_ERROR, code.to_be_bytes().to_vec())
    }

    /// An `S` reply carrying the status record.
    pub fn status_reply(record: &StatusRecord) -> Packet {
        Packet::new(TYPE_STATUS, record.bytes().to_vec())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.push(self.version);
        buf.push(self.typ);
        buf.push(self.payload.len() as u8);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parses one packet occupying exactly `buf`.  Framing errors (truncated
    /// header, length disagreeing with the data read) are `InvalidData`; the
    /// version byte is not checked here.
    pub fn parse(buf: &[u8]) -> Result<Packet, Error> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::new(ErrorKind::InvalidData, "truncated packet header"));
        }
        let len = buf[2] as usize;
        if buf.len() != HEADER_SIZE + len {
            return Err(Error::new(ErrorKind::InvalidData, "packet length mismatch"));
        }
        Ok(Packet {
            version: buf[0],
            typ: buf[1],
            payload: buf[HEADER_SIZE..].to_vec(),
        })
    }

    /// Reads one packet with a single `read` call, retrying `EINTR`.
    pub fn read_from(mut reader: impl Read) -> Result<Packet, Error> {
        let mut buf = [0u8; HEADER_SIZE + MAX_PAYLOAD];
        let n = loop {
            match reader.read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        Packet::parse(&buf[..n])
    }

    /// Writes the packet with a single `write` call, retrying `EINTR`.
    pub fn write_to(&self, mut writer: impl Write) -> Result<(), Error> {
        let buf = self.encode();
        let n = loop {
            match writer.write(&buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        if n < buf.len() {
            return Err(Error::new(ErrorKind::WriteZero, "short packet write"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn encode_parse() {
        let pkt = Packet::new(TYPE_COMMAND, vec![b'u']);
        let parsed = Packet::parse(&pkt.encode()).unwrap();
        assert_eq!(parsed, pkt);
        assert_eq!(parsed.version, PROTO_VERSION);
    }

    #[test]
    fn framing_errors() {
        assert_eq!(Packet::parse(&[1, b'C']).unwrap_err().kind(), ErrorKind::InvalidData);
        // Length byte claims one payload byte, none present.
        assert_eq!(Packet::parse(&[1, b'C', 1]).unwrap_err().kind(), ErrorKind::InvalidData);
        // Trailing garbage after the declared payload.
        assert_eq!(
            Packet::parse(&[1, b'C', 1, b'u', b'u']).unwrap_err().kind(),
            ErrorKind::InvalidData
        );
    }

    #[test]
    fn version_is_read_not_rejected() {
        let parsed = Packet::parse(&[2, b'Q', 0]).unwrap();
        assert_eq!(parsed.version, 2);
    }

    #[test]
    fn error_reply_payload_is_big_endian() {
        let pkt = Packet::error_reply(libc::EPROTO as u32);
        assert_eq!(pkt.typ, TYPE_ERROR);
        assert_eq!(pkt.payload, (libc::EPROTO as u32).to_be_bytes());
    }

    #[test]
    fn read_consumes_one_packet() {
        let pkt = Packet::new(TYPE_QUERY, vec![]);
        let read = Packet::read_from(Cursor::new(pkt.encode())).unwrap();
        assert_eq!(read, pkt);
    }
}
