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

/*! Pure computation of the child ssh argv and effective dump setting
(§4.G step 8), split out from the rest of the supervisor so it can be
tested without spawning anything. */

use crate::config::EffectivePolicy;
use crate::errors::GatewayError;

pub struct Computed {
    pub argv: Vec<String>,
    pub dump: String,
}

/// `dest` is a `host:port` pair as stored in policy/coordination state;
/// `stdout_is_tty` reflects the supervisor's own stdout, per step 8's
/// "-t" rule.
pub fn compute(
    policy: &EffectivePolicy,
    original_command: Option<&str>,
    sshproxy_args: Option<&str>,
    dest: &str,
    stdout_is_tty: bool,
) -> anyhow::Result<Computed> {
    let (host, port) = split_hostport(dest);

    let mut argv = policy.ssh_args.clone();
    if let Some(extra) = sshproxy_args {
        argv.extend(extra.split_whitespace().map(String::from));
    }
    if port != 22 {
        argv.push("-p".to_string());
        argv.push(port.to_string());
    }

    let requested = policy.force_command.clone().or_else(|| original_command.map(String::from));

    if policy.command_must_match {
        if let Some(forced) = &policy.force_command {
            if original_command.unwrap_or("") != forced {
                return Err(GatewayError::CommandRejected.into());
            }
        }
    }

    let mut dump = policy.dump.clone();

    if let Some(req) = &requested {
        if let Some(translation) = policy.translate_commands.get(req) {
            if let Some(extra_args) = &translation.ssh_args {
                argv.extend(extra_args.iter().cloned());
            }
            argv.push(host.to_string());
            argv.push("--".to_string());
            argv.push(translation.command.clone());
            if translation.disable_dump {
                dump = "etcd".to_string();
            }
            return Ok(Computed { argv, dump });
        }
    }

    match &requested {
        Some(cmd) if !cmd.is_empty() => {
            if stdout_is_tty {
                argv.push("-t".to_string());
            }
            argv.push(host.to_string());
            argv.push("--".to_string());
            argv.push(cmd.clone());
        }
        _ => argv.push(host.to_string()),
    }

    Ok(Computed { argv, dump })
}

fn split_hostport(dest: &str) -> (&str, u16) {
    match dest.rsplit_once(':') {
        Some((h, p)) => (h, p.parse::<u16>().unwrap_or(22)),
        None => (dest, 22),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Mode;
    use crate::selector::RouteSelect;
    use std::collections::HashMap;

    fn base_policy() -> EffectivePolicy {
        EffectivePolicy {
            debug: false,
            log: "stdout".into(),
            check_interval: std::time::Duration::from_secs(30),
            error_banner: String::new(),
            dump: "/var/log/sshproxy/{sid}.dump".into(),
            dump_limit_size: 0,
            dump_limit_window: std::time::Duration::ZERO,
            etcd_stats_interval: std::time::Duration::ZERO,
            log_stats_interval: std::time::Duration::ZERO,
            bg_command: String::new(),
            blocking_command: String::new(),
            ssh_exe: "ssh".into(),
            ssh_args: vec!["-q".into(), "-Y".into()],
            environment: HashMap::new(),
            translate_commands: HashMap::new(),
            service: "default".into(),
            dest: vec![],
            route_select: RouteSelect::Ordered,
            mode: Mode::Balanced,
            force_command: None,
            command_must_match: false,
            etcd_keyttl: 0,
            max_connections_per_user: 0,
            etcd: None,
        }
    }

    #[test]
    fn force_command_mismatch_is_rejected() {
        let mut p = base_policy();
        p.force_command = Some("sftp".into());
        p.command_must_match = true;
        let err = compute(&p, Some("ls"), None, "host3:22", false).unwrap_err();
        assert_eq!(err.downcast_ref::<GatewayError>(), Some(&GatewayError::CommandRejected));
    }

    #[test]
    fn translate_sftp_splices_args_and_downgrades_dump() {
        let mut p = base_policy();
        p.force_command = Some("internal-sftp".into());
        p.translate_commands.insert(
            "internal-sftp".into(),
            crate::config::TranslateCommand {
                ssh_args: Some(vec!["-s".into()]),
                command: "sftp".into(),
                disable_dump: true,
                environment: HashMap::new(),
            },
        );
        p.dump = "/x/y.dump".into();

        let got = compute(&p, None, None, "host:22", false).unwrap();
        assert_eq!(got.argv, vec!["-q", "-Y", "-s", "host", "--", "sftp"]);
        assert_eq!(got.dump, "etcd");
    }

    #[test]
    fn no_requested_command_appends_bare_host_even_on_a_tty() {
        let p = base_policy();
        let got = compute(&p, None, None, "host3:2222", true).unwrap();
        assert_eq!(got.argv, vec!["-q", "-Y", "-p", "2222", "host3"]);
    }

    #[test]
    fn explicit_command_appends_after_double_dash() {
        let p = base_policy();
        let got = compute(&p, Some("ls -la"), None, "host3:22", true).unwrap();
        assert_eq!(got.argv, vec!["-q", "-Y", "-t", "host3", "--", "ls -la"]);
    }

    #[test]
    fn sshproxy_args_env_is_space_split_and_appended_before_port() {
        let p = base_policy();
        let got = compute(&p, None, Some("-o StrictHostKeyChecking=no"), "host3:22", false).unwrap();
        assert_eq!(got.argv, vec!["-q", "-Y", "-o", "StrictHostKeyChecking=no", "host3"]);
    }
}
