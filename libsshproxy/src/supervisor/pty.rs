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

/*! The PTY child-launch path (§4.G step 9): allocate a pty, spawn the
child ssh attached to its slave side as controlling terminal, put the
host tty into raw mode, propagate SIGWINCH onto the pty, and copy bytes
between the recorder's splitters and the pty master. */

use std::{
    fs::File,
    io::{self, Read, Write},
    os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd},
    process::{Child, Command, Stdio},
    sync::Arc,
    thread,
};

use anyhow::Context;
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::unistd::setsid;
use tracing::{error, warn};

use crate::tty::Size;

nix::ioctl_write_int_bad!(tiocsctty, libc::TIOCSCTTY);

fn dup_as_stdio(fd: RawFd) -> io::Result<Stdio> {
    let owned = nix::unistd::dup(fd).map(|f| unsafe { OwnedFd::from_raw_fd(f) })?;
    Ok(Stdio::from(owned))
}

/// Spawns `cmd` attached to a freshly allocated pty sized to the host's
/// current stdin terminal. Returns the child and the master fd wrapped
/// for reading/writing; the slave fd is closed in the parent once the
/// child has it inherited.
pub fn spawn_attached(mut cmd: Command) -> anyhow::Result<(Child, OwnedFd)> {
    let winsize = Size::from_fd(io::stdin().as_raw_fd())
        .map(|s| Winsize { ws_row: s.rows, ws_col: s.cols, ws_xpixel: 0, ws_ypixel: 0 })
        .unwrap_or(Winsize { ws_row: 24, ws_col: 80, ws_xpixel: 0, ws_ypixel: 0 });

    let OpenptyResult { master, slave } = openpty(Some(&winsize), None).context("allocating pty")?;

    let slave_fd = slave.as_raw_fd();
    cmd.stdin(dup_as_stdio(slave_fd)?);
    cmd.stdout(dup_as_stdio(slave_fd)?);
    cmd.stderr(dup_as_stdio(slave_fd)?);

    // Safety: runs in the forked child before exec, async-signal-safe
    // calls only.
    unsafe {
        cmd.pre_exec(move || {
            setsid().map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            // Safety: runs single-threaded in the forked child, before exec.
            unsafe { tiocsctty(0, 0) }.map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }

    let child = cmd.spawn().context("spawning ssh child on pty")?;
    drop(slave); // the child holds its own copy via the dup'd Stdio fds

    Ok((child, master))
}

/// Copies `recorder_stdin -> pty_master` and `pty_master -> recorder_stdout`
/// on two background threads, returning their join handles. Both threads
/// exit on their own once the pty closes (child exit) or the reader side
/// reaches EOF.
pub fn splice<R, W>(
    master: OwnedFd,
    mut recorder_stdin: R,
    mut recorder_stdout: W,
) -> anyhow::Result<(thread::JoinHandle<()>, thread::JoinHandle<()>)>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let master_fd = master.as_raw_fd();
    let write_half = unsafe { File::from_raw_fd(nix::unistd::dup(master_fd)?) };
    let read_half = unsafe { File::from_raw_fd(master.into_raw_fd()) };

    let to_pty = thread::spawn(move || {
        let mut w = write_half;
        let mut buf = [0u8; crate::consts::BUF_SIZE];
        loop {
            match recorder_stdin.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    if w.write_all(&buf[..n]).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return,
            }
        }
    });

    let from_pty = thread::spawn(move || {
        let mut r = read_half;
        let mut buf = [0u8; crate::consts::BUF_SIZE];
        loop {
            match r.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    if recorder_stdout.write_all(&buf[..n]).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return,
            }
        }
    });

    Ok((to_pty, from_pty))
}

/// Spawns a SIGWINCH watcher that copies the host's stdin window size
/// onto `master_fd` every time it fires, for the scope's lifetime.
pub fn watch_winch(master_fd: RawFd, scope: Arc<crate::scope::Scope>) -> anyhow::Result<thread::JoinHandle<()>> {
    let mut signals =
        signal_hook::iterator::Signals::new([signal_hook::consts::SIGWINCH]).context("registering SIGWINCH handler")?;
    let cancelled = scope.cancelled();

    Ok(thread::spawn(move || loop {
        crossbeam_channel::select! {
            recv(cancelled) -> _ => return,
            default(std::time::Duration::from_millis(200)) => {
                if signals.pending().next().is_some() {
                    if let Ok(size) = Size::from_fd(io::stdin().as_raw_fd()) {
                        if let Err(e) = size.set_fd(master_fd) {
                            warn!("propagating window size to pty failed: {:#}", e);
                        }
                    }
                }
            }
        }
    }))
}
