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

/*! The recorder: a concurrent tap on the session's three standard
streams. [`create`] hands the supervisor three splitter objects to
use in place of raw stdio; [`Recorder::run`] drains the tap channel,
writes the framed dump (§4.A), publishes periodic bandwidth stats, and
enforces the dump-size rate limit. */

pub mod limiter;
pub mod splitter;

use std::{
    fs,
    io::Write,
    net::TcpStream,
    path::Path,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use sshproxy_record::{Header, Record};
use tracing::{info, instrument, warn};

use crate::coord::{Client, UpdatedStats};
use crate::scope::Scope;
use limiter::Limiter;
use splitter::{ReadSplitter, WriteSplitter};

#[derive(Debug, Default, Clone, Copy)]
pub struct Totals {
    pub stdin: u64,
    pub stdout: u64,
    pub stderr: u64,
}

impl Totals {
    fn add(&mut self, fd: sshproxy_record::Fd, n: u64) {
        match fd {
            sshproxy_record::Fd::Stdin => self.stdin += n,
            sshproxy_record::Fd::Stdout => self.stdout += n,
            sshproxy_record::Fd::Stderr => self.stderr += n,
        }
    }
}

/// The running byte counters. Protected by a reader-writer lock per the
/// concurrency contract: the main loop writes on every record, the
/// etcd-stats publisher and the final teardown logger only ever read a
/// snapshot and release the lock before doing any I/O of their own.
#[derive(Default)]
struct Shared {
    totals: Totals,
    etcd_in: u64,
    etcd_out: u64,
}

pub struct RecorderConfig {
    pub dump: String,
    pub etcd_stats_interval: Duration,
    pub log_stats_interval: Duration,
    pub dump_limit_size: u64,
    pub dump_limit_window: Duration,
}

pub struct Recorder {
    header: Header,
    cfg: RecorderConfig,
    tap_rx: Receiver<Record>,
    shared: Arc<RwLock<Shared>>,
}

/// Builds a recorder and the three tap-wrapped stream objects the
/// supervisor should use in place of raw stdin/stdout/stderr.
pub fn create(
    header: Header,
    cfg: RecorderConfig,
    stdin: Box<dyn std::io::Read + Send>,
    stdout: Box<dyn Write + Send>,
    stderr: Box<dyn Write + Send>,
) -> (
    Recorder,
    ReadSplitter<Box<dyn std::io::Read + Send>>,
    WriteSplitter<Box<dyn Write + Send>>,
    WriteSplitter<Box<dyn Write + Send>>,
) {
    let (tap_tx, tap_rx): (Sender<Record>, Receiver<Record>) = unbounded();

    let stdin_s = ReadSplitter::new(stdin, sshproxy_record::Fd::Stdin, tap_tx.clone());
    let stdout_s = WriteSplitter::new(stdout, sshproxy_record::Fd::Stdout, tap_tx.clone());
    let stderr_s = WriteSplitter::new(stderr, sshproxy_record::Fd::Stderr, tap_tx);

    let recorder = Recorder { header, cfg, tap_rx, shared: Arc::new(RwLock::new(Shared::default())) };
    (recorder, stdin_s, stdout_s, stderr_s)
}

enum Sink {
    None,
    File(fs::File),
    Tcp(TcpStream),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Sink::None => Ok(buf.len()),
            Sink::File(f) => f.write(buf),
            Sink::Tcp(s) => s.write(buf),
        }
    }
    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Sink::None => Ok(()),
            Sink::File(f) => f.flush(),
            Sink::Tcp(s) => s.flush(),
        }
    }
}

impl Recorder {
    /// Runs the recorder's main loop until `scope` cancels. `client` and
    /// `update_path` are `None` when the coordination store isn't in use;
    /// the recorder still dumps and logs.
    #[instrument(skip_all)]
    pub fn run(mut self, client: Option<Arc<dyn Client>>, update_path: Option<String>, scope: &Scope) -> Totals {
        let mut writer = self.open_writer();
        let mut limiter = Limiter::new(self.cfg.dump_limit_size, self.cfg.dump_limit_window);

        let started = Instant::now();
        let log_ticker = ticker(self.cfg.log_stats_interval);
        let etcd_ticker = ticker(self.cfg.etcd_stats_interval);
        let window_ticker = ticker(self.cfg.dump_limit_window);
        let cancelled = scope.cancelled();

        loop {
            select! {
                recv(self.tap_rx) -> msg => {
                    let Ok(rec) = msg else { continue };
                    let len = rec.data.len() as u64;
                    {
                        let mut shared = self.shared.write().unwrap();
                        shared.totals.add(rec.fd, len);
                        match rec.fd {
                            sshproxy_record::Fd::Stdin => shared.etcd_in += len,
                            sshproxy_record::Fd::Stdout | sshproxy_record::Fd::Stderr => shared.etcd_out += len,
                        }
                    }

                    let admitted = limiter.admit(len);
                    if admitted {
                        if let Some(w) = writer.as_mut() {
                            if let Err(e) = w.write_record(&rec) {
                                warn!("writing dump record failed, disabling dump: {:#}", e);
                                writer = None;
                            }
                        }
                    } else if limiter.is_closed() {
                        if writer.is_some() {
                            info!("dump rate limit exceeded with no recovery window, closing dump");
                        }
                        writer = None;
                    }
                }
                recv(log_ticker) -> _ => {
                    let snapshot = self.shared.read().unwrap().totals;
                    info!(
                        elapsed_secs = started.elapsed().as_secs_f64(),
                        stdin = snapshot.stdin, stdout = snapshot.stdout, stderr = snapshot.stderr,
                        "session stats"
                    );
                }
                recv(etcd_ticker) -> _ => {
                    let (in_bytes, out_bytes) = {
                        let mut shared = self.shared.write().unwrap();
                        let r = (shared.etcd_in, shared.etcd_out);
                        shared.etcd_in = 0;
                        shared.etcd_out = 0;
                        r
                    };
                    if let (Some(client), Some(path)) = (&client, &update_path) {
                        let secs = self.cfg.etcd_stats_interval.as_secs_f64().max(1.0);
                        let stats = UpdatedStats {
                            in_kbps: (in_bytes as f64 / secs / 1024.0) as i64,
                            out_stdout_kbps: (out_bytes as f64 / secs / 1024.0) as i64,
                            out_stderr_kbps: 0,
                        };
                        if let Err(e) = client.update_stats(path, stats) {
                            warn!("publishing bandwidth stats failed: {:#}", e);
                        }
                    }
                }
                recv(window_ticker) -> _ => {
                    limiter.tick();
                }
                recv(cancelled) -> _ => break,
            }
        }

        let totals = self.shared.read().unwrap().totals;
        info!(
            stdin = totals.stdin, stdout = totals.stdout, stderr = totals.stderr,
            "recorder totals on session end"
        );
        if let Some(mut w) = writer {
            let _ = w.into_inner().flush();
        }
        totals
    }

    fn open_writer(&self) -> Option<sshproxy_record::Writer<Sink>> {
        if self.cfg.dump.is_empty() || self.cfg.dump == "etcd" {
            return None;
        }

        let sink = if let Some(hostport) = self.cfg.dump.strip_prefix("TCP:") {
            match TcpStream::connect(hostport) {
                Ok(s) => Sink::Tcp(s),
                Err(e) => {
                    warn!("connecting dump sink '{}' failed, dumping disabled: {:#}", hostport, e);
                    return None;
                }
            }
        } else {
            match open_dump_file(&self.cfg.dump) {
                Ok(f) => Sink::File(f),
                Err(e) => {
                    warn!("opening dump file '{}' failed, dumping disabled: {:#}", self.cfg.dump, e);
                    return None;
                }
            }
        };

        match sshproxy_record::Writer::create(sink, &self.header) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!("writing dump header failed, dumping disabled: {:#}", e);
                None
            }
        }
    }
}

fn open_dump_file(path: &str) -> anyhow::Result<fs::File> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| format!("creating dump parent dir '{}'", parent.display()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                    .with_context(|| format!("setting dump parent dir mode '{}'", parent.display()))?;
            }
        }
    }
    fs::File::create(path).with_context(|| format!("creating dump file '{}'", path))
}

/// `crossbeam_channel::tick` with a zero duration panics; a zero
/// interval in policy means "disabled", so return a channel that never
/// fires instead.
fn ticker(d: Duration) -> Receiver<Instant> {
    if d.is_zero() {
        crossbeam_channel::never()
    } else {
        crossbeam_channel::tick(d)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::coord::mock::MockClient;
    use std::io::Cursor;
    use std::net::IpAddr;

    fn sample_header() -> Header {
        Header {
            src_ip: IpAddr::from([10, 0, 0, 1]),
            src_port: 1,
            dst_ip: IpAddr::from([10, 0, 0, 2]),
            dst_port: 22,
            start_ns: 0,
            user: "alice".into(),
            command: "bash".into(),
        }
    }

    #[test]
    fn totals_on_clean_exit_match_bytes_written() {
        let cfg = RecorderConfig {
            dump: String::new(),
            etcd_stats_interval: Duration::ZERO,
            log_stats_interval: Duration::ZERO,
            dump_limit_size: 0,
            dump_limit_window: Duration::ZERO,
        };
        let (recorder, _stdin, mut stdout, mut stderr) =
            create(sample_header(), cfg, Box::new(Cursor::new(Vec::new())), Box::new(Vec::new()), Box::new(Vec::new()));

        stdout.write_all(&[0u8; 100]).unwrap();
        stderr.write_all(&[0u8; 50]).unwrap();

        let scope = Scope::new();
        scope.cancel();
        let totals = recorder.run(None, None, &scope);
        assert_eq!(totals.stdin, 0);
        assert_eq!(totals.stdout, 100);
        assert_eq!(totals.stderr, 50);
    }

    #[test]
    fn dump_disabled_still_counts_totals() {
        let cfg = RecorderConfig {
            dump: "etcd".into(),
            etcd_stats_interval: Duration::ZERO,
            log_stats_interval: Duration::ZERO,
            dump_limit_size: 0,
            dump_limit_window: Duration::ZERO,
        };
        let (recorder, _stdin, mut stdout, _stderr) =
            create(sample_header(), cfg, Box::new(Cursor::new(Vec::new())), Box::new(Vec::new()), Box::new(Vec::new()));
        stdout.write_all(b"hello").unwrap();

        let scope = Scope::new();
        scope.cancel();
        let totals = recorder.run(None, None, &scope);
        assert_eq!(totals.stdout, 5);
    }

    #[test]
    fn publishes_stats_when_client_present() {
        let client: Arc<dyn Client> = Arc::new(MockClient::new());
        let reg = client.set_destination("alice@default", "gw:22", "host1:22", 0).unwrap();

        let cfg = RecorderConfig {
            dump: String::new(),
            etcd_stats_interval: Duration::from_millis(20),
            log_stats_interval: Duration::ZERO,
            dump_limit_size: 0,
            dump_limit_window: Duration::ZERO,
        };
        let (recorder, _stdin, mut stdout, _stderr) =
            create(sample_header(), cfg, Box::new(Cursor::new(Vec::new())), Box::new(Vec::new()), Box::new(Vec::new()));
        stdout.write_all(&[0u8; 4096]).unwrap();

        let scope = Scope::new();
        let path = reg.path.clone();
        std::thread::scope(|s| {
            let handle = s.spawn(move || recorder.run(Some(Arc::clone(&client)), Some(path), &scope));
            std::thread::sleep(Duration::from_millis(60));
            scope.cancel();
            handle.join().unwrap();
        });
    }
}
