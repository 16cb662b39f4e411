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

/*! Tee-splitters wrapping stdio: every byte read or written also gets
published as a [`sshproxy_record::Record`] to the recorder's tap
channel, before the original read returns or the original write
happens, so the dump file ordering matches what the user actually saw. */

use std::{
    io::{self, Read, Write},
    time::{SystemTime, UNIX_EPOCH},
};

use crossbeam_channel::Sender;
use sshproxy_record::{Fd, Record};

fn now_ns() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}

/// Wraps a readable stream (the supervisor's stdin path) and taps every
/// successful read.
pub struct ReadSplitter<R> {
    inner: R,
    fd: Fd,
    tap: Sender<Record>,
}

impl<R> ReadSplitter<R> {
    pub fn new(inner: R, fd: Fd, tap: Sender<Record>) -> Self {
        ReadSplitter { inner, fd, tap }
    }
}

impl<R: Read> Read for ReadSplitter<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            let _ = self.tap.send(Record { time_ns: now_ns(), fd: self.fd, data: buf[..n].to_vec() });
        }
        Ok(n)
    }
}

/// Wraps a writable stream (stdout/stderr) and taps every write before
/// it reaches the underlying stream.
pub struct WriteSplitter<W> {
    inner: W,
    fd: Fd,
    tap: Sender<Record>,
}

impl<W> WriteSplitter<W> {
    pub fn new(inner: W, fd: Fd, tap: Sender<Record>) -> Self {
        WriteSplitter { inner, fd, tap }
    }
}

impl<W: Write> Write for WriteSplitter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !buf.is_empty() {
            let _ = self.tap.send(Record { time_ns: now_ns(), fd: self.fd, data: buf.to_vec() });
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::io::Cursor;

    #[test]
    fn read_splitter_taps_before_returning() {
        let (tx, rx) = unbounded();
        let mut splitter = ReadSplitter::new(Cursor::new(b"hello".to_vec()), Fd::Stdin, tx);
        let mut buf = [0u8; 5];
        let n = splitter.read(&mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");

        let rec = rx.try_recv().unwrap();
        assert_eq!(rec.fd, Fd::Stdin);
        assert_eq!(rec.data, b"hello");
    }

    #[test]
    fn write_splitter_taps_and_forwards() {
        let (tx, rx) = unbounded();
        let mut out = Vec::new();
        {
            let mut splitter = WriteSplitter::new(&mut out, Fd::Stdout, tx);
            splitter.write_all(b"world").unwrap();
        }
        assert_eq!(out, b"world");
        let rec = rx.try_recv().unwrap();
        assert_eq!(rec.fd, Fd::Stdout);
        assert_eq!(rec.data, b"world");
    }

    #[test]
    fn empty_writes_are_not_tapped() {
        let (tx, rx) = unbounded();
        let mut out = Vec::new();
        let mut splitter = WriteSplitter::new(&mut out, Fd::Stderr, tx);
        splitter.write_all(b"").unwrap();
        assert!(rx.try_recv().is_err());
    }
}
