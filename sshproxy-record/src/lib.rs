// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/*! sshproxy-record is the framed binary format a recorded session is
written in: a fixed-layout header followed by any number of record
frames, all integers big endian. See `Header` and `Record` for the
exact layout. */

use std::{
    io::{self, Read, Write},
    net::IpAddr,
};

use anyhow::{anyhow, bail, Context};
use byteorder::{BigEndian, ReadBytesExt as _, WriteBytesExt as _};

/// Only version 1 of the on-disk format exists. Future incompatible
/// changes must bump this and teach `Reader` to reject mismatches
/// rather than silently misparse.
pub const VERSION: u16 = 1;

/// Which of the session's three standard streams a record frame came
/// from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fd {
    Stdin,
    Stdout,
    Stderr,
}

impl Fd {
    fn to_u8(self) -> u8 {
        match self {
            Fd::Stdin => 0,
            Fd::Stdout => 1,
            Fd::Stderr => 2,
        }
    }

    fn from_u8(v: u8) -> anyhow::Result<Self> {
        match v {
            0 => Ok(Fd::Stdin),
            1 => Ok(Fd::Stdout),
            2 => Ok(Fd::Stderr),
            _ => Err(anyhow!("unknown fd tag {}", v)),
        }
    }
}

/// The fixed-layout header every dump file begins with.
///
/// ```text
/// version:u16 | size:u16 | src_ip:16B | src_port:u16
/// dst_ip:16B | dst_port:u16 | start_ns:u64 | user:cstr | command:cstr
/// ```
///
/// `size` is the total header length in bytes, including both NUL
/// terminators, so a reader can skip straight to the first record frame
/// without having to understand the variable-length tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub start_ns: u64,
    pub user: String,
    pub command: String,
}

fn ip_to_16(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

impl Header {
    /// The number of bytes this header will occupy on the wire,
    /// including both cstr NUL terminators.
    pub fn encoded_size(&self) -> usize {
        2 + 2 + 16 + 2 + 16 + 2 + 8 + self.user.len() + 1 + self.command.len() + 1
    }

    pub fn write_to<W: Write>(&self, mut w: W) -> anyhow::Result<()> {
        if self.user.contains('\0') || self.command.contains('\0') {
            bail!("user and command must not contain embedded NUL bytes");
        }
        let size = self.encoded_size();
        if size > u16::MAX as usize {
            bail!("header of size {} exceeds the u16 size field", size);
        }

        w.write_u16::<BigEndian>(VERSION).context("writing version")?;
        w.write_u16::<BigEndian>(size as u16).context("writing size")?;
        w.write_all(&ip_to_16(self.src_ip)).context("writing src_ip")?;
        w.write_u16::<BigEndian>(self.src_port).context("writing src_port")?;
        w.write_all(&ip_to_16(self.dst_ip)).context("writing dst_ip")?;
        w.write_u16::<BigEndian>(self.dst_port).context("writing dst_port")?;
        w.write_u64::<BigEndian>(self.start_ns).context("writing start_ns")?;
        w.write_all(self.user.as_bytes()).context("writing user")?;
        w.write_u8(0).context("writing user terminator")?;
        w.write_all(self.command.as_bytes()).context("writing command")?;
        w.write_u8(0).context("writing command terminator")?;

        Ok(())
    }

    fn read_from<R: Read>(mut r: R) -> anyhow::Result<Self> {
        let version = r.read_u16::<BigEndian>().context("reading version")?;
        if version != VERSION {
            return Err(anyhow!("UnsupportedVersion: got {}, only {} is supported", version, VERSION));
        }
        let size = r.read_u16::<BigEndian>().context("reading size")?;

        let mut src_ip_buf = [0u8; 16];
        r.read_exact(&mut src_ip_buf).context("reading src_ip")?;
        let src_port = r.read_u16::<BigEndian>().context("reading src_port")?;

        let mut dst_ip_buf = [0u8; 16];
        r.read_exact(&mut dst_ip_buf).context("reading dst_ip")?;
        let dst_port = r.read_u16::<BigEndian>().context("reading dst_port")?;

        let start_ns = r.read_u64::<BigEndian>().context("reading start_ns")?;

        let user = read_cstr(&mut r).context("reading user")?;
        let command = read_cstr(&mut r).context("reading command")?;

        let hdr = Header {
            src_ip: std::net::Ipv6Addr::from(src_ip_buf).to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(std::net::Ipv6Addr::from(src_ip_buf))),
            src_port,
            dst_ip: std::net::Ipv6Addr::from(dst_ip_buf).to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(std::net::Ipv6Addr::from(dst_ip_buf))),
            dst_port,
            start_ns,
            user,
            command,
        };

        if hdr.encoded_size() != size as usize {
            return Err(anyhow!(
                "header size mismatch: file says {}, decoded fields total {}",
                size,
                hdr.encoded_size()
            ));
        }

        Ok(hdr)
    }
}

fn read_cstr<R: Read>(mut r: R) -> anyhow::Result<String> {
    let mut buf = Vec::new();
    loop {
        let b = r.read_u8().context("reading cstr byte")?;
        if b == 0 {
            break;
        }
        buf.push(b);
    }
    String::from_utf8(buf).context("cstr was not valid utf8")
}

/// A single frame of intercepted data: `time_ns:u64 | fd:u8 | size:u32 |
/// data:size bytes`. Frames are produced in the order bytes crossed the
/// tap; there is no reordering guarantee across fds, only within a
/// single fd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub time_ns: u64,
    pub fd: Fd,
    pub data: Vec<u8>,
}

impl Record {
    pub fn write_to<W: Write>(&self, mut w: W) -> anyhow::Result<()> {
        if self.data.len() > u32::MAX as usize {
            bail!("record of size {} exceeds the u32 size field", self.data.len());
        }
        w.write_u64::<BigEndian>(self.time_ns).context("writing time_ns")?;
        w.write_u8(self.fd.to_u8()).context("writing fd")?;
        w.write_u32::<BigEndian>(self.data.len() as u32).context("writing size")?;
        w.write_all(&self.data).context("writing data")?;
        Ok(())
    }
}

/// A streaming writer that appends frames unbuffered, one `write_to`
/// call at a time. Callers that want buffering should wrap the
/// underlying `Write` themselves (e.g. in an `io::BufWriter`) before
/// constructing this.
pub struct Writer<W> {
    inner: W,
}

impl<W: Write> Writer<W> {
    /// Writes the header and returns a writer ready to append frames.
    pub fn create(mut inner: W, header: &Header) -> anyhow::Result<Self> {
        header.write_to(&mut inner).context("writing dump header")?;
        Ok(Writer { inner })
    }

    pub fn write_record(&mut self, rec: &Record) -> anyhow::Result<()> {
        rec.write_to(&mut self.inner)
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// A streaming reader exposing a `next` method that fills a
/// caller-owned record, reusing its data buffer's capacity across
/// calls when it's big enough.
pub struct Reader<R> {
    inner: R,
    pub header: Header,
}

impl<R: Read> Reader<R> {
    pub fn open(mut inner: R) -> anyhow::Result<Self> {
        let header = Header::read_from(&mut inner).context("reading dump header")?;
        Ok(Reader { inner, header })
    }

    /// Fills `rec` with the next frame. Returns `Ok(false)` at a clean
    /// EOF (no partial frame pending), `Ok(true)` if a frame was read.
    pub fn next(&mut self, rec: &mut Record) -> anyhow::Result<bool> {
        let time_ns = match self.inner.read_u64::<BigEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e).context("reading time_ns"),
        };
        let fd = Fd::from_u8(self.inner.read_u8().context("reading fd")?)?;
        let size = self.inner.read_u32::<BigEndian>().context("reading size")? as usize;

        rec.data.clear();
        rec.data.resize(size, 0);
        self.inner.read_exact(&mut rec.data).context("reading data")?;
        rec.time_ns = time_ns;
        rec.fd = fd;

        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn sample_header() -> Header {
        Header {
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            src_port: 54321,
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_port: 22,
            start_ns: 1_700_000_000_000_000_000,
            user: String::from("alice"),
            command: String::from("bash -l"),
        }
    }

    #[test]
    fn header_size_consistency() {
        let hdr = sample_header();
        let mut buf = Vec::new();
        hdr.write_to(&mut buf).unwrap();

        let size_field = u16::from_be_bytes([buf[2], buf[3]]);
        assert_eq!(size_field as usize, hdr.encoded_size());
        assert_eq!(size_field as usize, buf.len());

        let reader = Reader::open(io::Cursor::new(buf)).unwrap();
        assert_eq!(reader.header, hdr);
    }

    #[test]
    fn header_round_trip_ipv6() {
        let hdr = Header {
            src_ip: IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)),
            src_port: 1,
            dst_ip: IpAddr::V6(Ipv6Addr::LOCALHOST),
            dst_port: 22,
            start_ns: 42,
            user: String::from("bob"),
            command: String::from(""),
        };
        let mut buf = Vec::new();
        hdr.write_to(&mut buf).unwrap();
        let reader = Reader::open(io::Cursor::new(buf)).unwrap();
        assert_eq!(reader.header, hdr);
    }

    #[test]
    fn unsupported_version_fails() {
        let mut buf = Vec::new();
        buf.write_u16::<BigEndian>(2).unwrap();
        buf.write_u16::<BigEndian>(0).unwrap();
        let err = Reader::open(io::Cursor::new(buf)).unwrap_err();
        assert!(format!("{err:?}").contains("UnsupportedVersion"));
    }

    #[test]
    fn record_round_trip() {
        let hdr = sample_header();
        let mut buf = Vec::new();
        let mut w = Writer::create(&mut buf, &hdr).unwrap();

        let recs = vec![
            Record { time_ns: 1, fd: Fd::Stdin, data: b"hello".to_vec() },
            Record { time_ns: 2, fd: Fd::Stdout, data: b"world".to_vec() },
            Record { time_ns: 3, fd: Fd::Stderr, data: vec![] },
            Record { time_ns: u64::MAX, fd: Fd::Stdout, data: vec![0xff; 4096] },
        ];
        for r in &recs {
            w.write_record(r).unwrap();
        }

        let mut reader = Reader::open(io::Cursor::new(buf)).unwrap();
        assert_eq!(reader.header, hdr);

        let mut got = Record { time_ns: 0, fd: Fd::Stdin, data: Vec::new() };
        let mut i = 0;
        while reader.next(&mut got).unwrap() {
            assert_eq!(got, recs[i]);
            i += 1;
        }
        assert_eq!(i, recs.len());
    }

    #[test]
    fn reuses_data_buffer_capacity() {
        let hdr = sample_header();
        let mut buf = Vec::new();
        let mut w = Writer::create(&mut buf, &hdr).unwrap();
        w.write_record(&Record { time_ns: 1, fd: Fd::Stdout, data: vec![1; 64] }).unwrap();
        w.write_record(&Record { time_ns: 2, fd: Fd::Stdout, data: vec![2; 8] }).unwrap();

        let mut reader = Reader::open(io::Cursor::new(buf)).unwrap();
        let mut rec = Record { time_ns: 0, fd: Fd::Stdin, data: Vec::with_capacity(64) };
        reader.next(&mut rec).unwrap();
        let cap_after_first = rec.data.capacity();
        reader.next(&mut rec).unwrap();
        assert_eq!(rec.data.len(), 8);
        // capacity from the bigger first record should still be available
        assert!(rec.data.capacity() <= cap_after_first || cap_after_first >= 64);
    }
}
