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

/*! The session supervisor (§4.G): admits the session, runs the
precondition command, registers the destination, spawns the recorder
and the child ssh process (pty or piped), watches for the parent
dying, and tears everything down through one [`crate::scope::Scope`]. */

mod command;
mod pty;
mod signals;

use std::{
    io::{self, Read, Write},
    os::fd::AsRawFd,
    os::unix::process::ExitStatusExt,
    process::{Child, Command, ExitStatus, Stdio},
    sync::Arc,
    thread,
};

use anyhow::Context;
use crossbeam_channel::select;
use sshproxy_record::Header;
use tracing::{info, warn};

use crate::config::EffectivePolicy;
use crate::consts::{self, SSHPROXY_ARGS_VAR};
use crate::coord::{Client, Registration};
use crate::errors::GatewayError;
use crate::recorder::{self, RecorderConfig};
use crate::scope::Scope;
use crate::session::SessionContext;
use crate::tty;

/// Runs one session end to end and returns the process exit code.
pub fn run(
    policy: &EffectivePolicy,
    session: &SessionContext,
    sshd_hostport: &str,
    dest: &str,
    client: Option<Arc<dyn Client>>,
) -> anyhow::Result<i32> {
    // 1. Admission.
    if let Some(client) = &client {
        if client.is_alive() && policy.max_connections_per_user > 0 {
            match client.get_user_connections_count(&session.user) {
                Ok(count) if count >= policy.max_connections_per_user => {
                    return Err(GatewayError::TooManyConnections.into());
                }
                Ok(_) => {}
                Err(e) => warn!("admission count lookup failed, letting the session through: {:#}", e),
            }
        }
    }

    // 2. Blocking precondition.
    if !policy.blocking_command.is_empty() {
        let status = Command::new("sh")
            .arg("-c")
            .arg(&policy.blocking_command)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|e| GatewayError::ChildSpawnFailed(e.to_string()))?;
        let code = exit_code_of(&status);
        if code != 0 {
            return Ok(code);
        }
    }

    // 3. Environment.
    for (k, v) in &policy.environment {
        std::env::set_var(k, v);
    }

    // 4. Supervisory context.
    let scope = Arc::new(Scope::new());
    let signal_handle = signals::spawn(Arc::clone(&scope)).context("installing signal handler")?;

    // 5. Destination registration.
    let user_key = session.user_key(&policy.service);
    let mut update_path: Option<String> = None;
    let mut keepalive_handle = None;
    if let Some(client) = &client {
        if client.is_alive() {
            match client.set_destination(&user_key, sshd_hostport, dest, policy.etcd_keyttl) {
                Ok(reg) => {
                    update_path = Some(reg.path.clone());
                    let client = Arc::clone(client);
                    let scope = Arc::clone(&scope);
                    keepalive_handle = Some(thread::spawn(move || keepalive_loop(client, reg, scope)));
                }
                Err(e) => warn!("registering destination failed: {:#}", e),
            }
        }
    }

    // 6. Background command.
    let mut bg = BgCommand::spawn(policy)?;

    // 7. Parent-death watch.
    let pd_handle = {
        let scope = Arc::clone(&scope);
        thread::spawn(move || parent_death_watch(scope))
    };

    let teardown = |scope: Arc<Scope>| {
        scope.cancel();
        if let Some(h) = keepalive_handle {
            let _ = h.join();
        }
        let _ = pd_handle.join();
        let _ = signal_handle.join();
        bg.kill_and_join();
    };

    // 8. Command computation.
    let stdout_is_tty = tty::is_tty(io::stdout().as_raw_fd());
    let original_command = session.original_command.as_deref();
    let sshproxy_args = std::env::var(SSHPROXY_ARGS_VAR).ok();
    let computed = match command::compute(policy, original_command, sshproxy_args.as_deref(), dest, stdout_is_tty) {
        Ok(c) => c,
        Err(e) => {
            teardown(scope);
            return Err(e);
        }
    };

    // Recorder setup, shared by both child-launch paths.
    let header = Header {
        src_ip: session.src.ip(),
        src_port: session.src.port(),
        dst_ip: session.dst.ip(),
        dst_port: session.dst.port(),
        start_ns: session.start_time_ns,
        user: session.user.clone(),
        command: original_command.unwrap_or("").to_string(),
    };
    let rec_cfg = RecorderConfig {
        dump: computed.dump.clone(),
        etcd_stats_interval: policy.etcd_stats_interval,
        log_stats_interval: policy.log_stats_interval,
        dump_limit_size: policy.dump_limit_size,
        dump_limit_window: policy.dump_limit_window,
    };
    let (rec, stdin_s, stdout_s, stderr_s) =
        recorder::create(header, rec_cfg, Box::new(io::stdin()), Box::new(io::stdout()), Box::new(io::stderr()));
    let recorder_handle = {
        let scope = Arc::clone(&scope);
        let client = client.clone();
        thread::spawn(move || {
            let _ = rec.run(client, update_path, &scope);
        })
    };

    // 9/10. Child launch, wait.
    let mut ssh_cmd = Command::new(&policy.ssh_exe);
    ssh_cmd.args(&computed.argv);

    let result = if stdout_is_tty {
        run_pty_session(ssh_cmd, &scope, stdin_s, stdout_s, stderr_s)
    } else {
        run_piped_session(ssh_cmd, stdin_s, stdout_s, stderr_s)
    };

    // 11. Teardown.
    teardown(scope);
    let _ = recorder_handle.join();

    result
}

fn exit_code_of(status: &ExitStatus) -> i32 {
    status.code().unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

fn keepalive_loop(client: Arc<dyn Client>, reg: Registration, scope: Arc<Scope>) {
    let cancelled = scope.cancelled();
    loop {
        select! {
            recv(cancelled) -> _ => return,
            recv(reg.keepalive) -> msg => match msg {
                Ok(true) => continue,
                Ok(false) => {
                    client.disable();
                    match client.new_lease() {
                        Ok(_) => client.enable(),
                        Err(e) => warn!("re-creating lease after loss failed: {:#}", e),
                    }
                }
                Err(_) => {
                    client.disable();
                    match client.new_lease() {
                        Ok(_) => client.enable(),
                        Err(e) => warn!("re-creating lease after loss failed: {:#}", e),
                    }
                    return;
                }
            },
        }
    }
}

fn parent_death_watch(scope: Arc<Scope>) {
    let cancelled = scope.cancelled();
    loop {
        select! {
            recv(cancelled) -> _ => return,
            default(consts::PARENT_DEATH_POLL_INTERVAL) => {
                if nix::unistd::getppid().as_raw() == 1 {
                    info!("parent process exited, tearing down session");
                    scope.cancel();
                    return;
                }
            }
        }
    }
}

struct BgCommand {
    child: Option<Child>,
    tee_handles: Vec<thread::JoinHandle<()>>,
}

impl BgCommand {
    fn spawn(policy: &EffectivePolicy) -> anyhow::Result<Self> {
        if policy.bg_command.is_empty() {
            return Ok(BgCommand { child: None, tee_handles: Vec::new() });
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&policy.bg_command);
        cmd.stdin(Stdio::null());
        if policy.debug {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                warn!("starting background command failed: {:#}", e);
                return Ok(BgCommand { child: None, tee_handles: Vec::new() });
            }
        };

        let mut tee_handles = Vec::new();
        if policy.debug {
            if let Some(out) = child.stdout.take() {
                tee_handles.push(thread::spawn(move || tee_lines(out, "bg stdout")));
            }
            if let Some(err) = child.stderr.take() {
                tee_handles.push(thread::spawn(move || tee_lines(err, "bg stderr")));
            }
        }

        Ok(BgCommand { child: Some(child), tee_handles })
    }

    fn kill_and_join(&mut self) {
        if let Some(child) = &mut self.child {
            let _ = child.kill();
            let _ = child.wait();
        }
        for h in self.tee_handles.drain(..) {
            let _ = h.join();
        }
    }
}

fn tee_lines<R: Read>(r: R, prefix: &str) {
    let mut reader = io::BufReader::new(r);
    let mut line = String::new();
    use io::BufRead;
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {
                let trimmed = line.trim_end();
                if !trimmed.is_empty() {
                    info!("[{}] {}", prefix, trimmed);
                }
            }
        }
    }
}

fn run_pty_session(
    cmd: Command,
    scope: &Arc<Scope>,
    stdin_s: impl Read + Send + 'static,
    stdout_s: impl Write + Send + 'static,
    stderr_s: impl Write + Send + 'static,
) -> anyhow::Result<i32> {
    drop(stderr_s); // PTY sessions merge stdout/stderr onto the single pty stream.

    let raw_guard = match tty::set_raw_mode() {
        Ok(g) => Some(g),
        Err(e) => {
            warn!("putting host terminal into raw mode failed: {:#}", e);
            None
        }
    };
    let (mut child, master) = pty::spawn_attached(cmd)?;
    let master_fd = master.as_raw_fd();
    let winch_handle = pty::watch_winch(master_fd, Arc::clone(scope))?;
    let (to_pty, from_pty) = pty::splice(master, stdin_s, stdout_s)?;

    let status = child.wait().map_err(|e| GatewayError::ChildWaitFailed(e.to_string()))?;

    scope.cancel();
    let _ = winch_handle.join();
    let _ = to_pty.join();
    let _ = from_pty.join();
    drop(raw_guard);

    Ok(exit_code_of(&status))
}

fn run_piped_session(
    mut cmd: Command,
    stdin_s: impl Read + Send + 'static,
    stdout_s: impl Write + Send + 'static,
    stderr_s: impl Write + Send + 'static,
) -> anyhow::Result<i32> {
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| GatewayError::ChildSpawnFailed(e.to_string()))?;
    let child_stdin = child.stdin.take().expect("piped stdin");
    let child_stdout = child.stdout.take().expect("piped stdout");
    let child_stderr = child.stderr.take().expect("piped stderr");

    let t_in = thread::spawn(move || copy_loop(stdin_s, child_stdin));
    let t_out = thread::spawn(move || copy_loop(child_stdout, stdout_s));
    let t_err = thread::spawn(move || copy_loop(child_stderr, stderr_s));

    let status = child.wait().map_err(|e| GatewayError::ChildWaitFailed(e.to_string()))?;

    let _ = t_in.join();
    let _ = t_out.join();
    let _ = t_err.join();

    Ok(exit_code_of(&status))
}

fn copy_loop<R: Read, W: Write>(mut r: R, mut w: W) {
    let mut buf = [0u8; consts::BUF_SIZE];
    loop {
        match r.read(&mut buf) {
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
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::coord::mock::MockClient;
    use crate::selector::RouteSelect;
    use std::collections::HashMap;

    fn base_policy() -> EffectivePolicy {
        EffectivePolicy {
            debug: false,
            log: "stdout".into(),
            check_interval: std::time::Duration::from_secs(30),
            error_banner: String::new(),
            dump: String::new(),
            dump_limit_size: 0,
            dump_limit_window: std::time::Duration::ZERO,
            etcd_stats_interval: std::time::Duration::ZERO,
            log_stats_interval: std::time::Duration::ZERO,
            bg_command: String::new(),
            blocking_command: String::new(),
            ssh_exe: "true".into(),
            ssh_args: vec![],
            environment: HashMap::new(),
            translate_commands: HashMap::new(),
            service: "default".into(),
            dest: vec![],
            route_select: RouteSelect::Ordered,
            mode: crate::config::Mode::Balanced,
            force_command: None,
            command_must_match: false,
            etcd_keyttl: 0,
            max_connections_per_user: 1,
            etcd: None,
        }
    }

    #[test]
    fn admission_blocks_the_kplus1th_session() {
        let client: Arc<dyn Client> = Arc::new(MockClient::new());
        client.set_destination("alice@default", "gw:22", "host1:22", 0).unwrap();

        let policy = base_policy();
        let session = SessionContext {
            start_time_ns: 0,
            user: "alice".into(),
            groups: vec![],
            src: "10.0.0.1:1".parse().unwrap(),
            dst: "10.0.0.2:22".parse().unwrap(),
            session_id: "abc".into(),
            original_command: None,
        };

        let err = run(&policy, &session, "gw:22", "host2:22", Some(client)).unwrap_err();
        assert_eq!(err.downcast_ref::<GatewayError>(), Some(&GatewayError::TooManyConnections));
    }

    #[test]
    fn blocking_command_failure_skips_the_child_and_returns_its_code() {
        let mut policy = base_policy();
        policy.max_connections_per_user = 0;
        policy.blocking_command = "exit 7".into();

        let session = SessionContext {
            start_time_ns: 0,
            user: "alice".into(),
            groups: vec![],
            src: "10.0.0.1:1".parse().unwrap(),
            dst: "10.0.0.2:22".parse().unwrap(),
            session_id: "abc".into(),
            original_command: None,
        };

        let code = run(&policy, &session, "gw:22", "host2:22", None).unwrap();
        assert_eq!(code, 7);
    }
}
