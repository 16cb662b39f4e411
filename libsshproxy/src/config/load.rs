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

/*! Loads and collapses the policy document for one session. */

use std::{
    collections::HashMap,
    fs,
    net::{SocketAddr, ToSocketAddrs},
    sync::Mutex,
    time::SystemTime,
};

use anyhow::{bail, Context};
use lazy_static::lazy_static;
use tracing::{info, instrument, warn};

use crate::consts::{DEFAULT_SERVICE, DEFAULT_SSH_ARGS, DEFAULT_SSH_EXE};
use crate::duration;
use crate::errors::GatewayError;
use crate::nodeset::Expander;

use super::{collapse, EffectivePolicy, MatchAlt, OverrideClause, Policy, PolicyDoc};

/// Key under which a collapsed policy is cached: repeated loads within
/// one process short-circuit on (file mtime, user, groups, sshd address).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    mtime_secs: u64,
    user: String,
    groups: Vec<String>,
    sshd_addr: String,
}

lazy_static! {
    static ref CACHE: Mutex<HashMap<CacheKey, EffectivePolicyCached>> = Mutex::new(HashMap::new());
}

#[derive(Clone)]
struct EffectivePolicyCached(std::sync::Arc<EffectivePolicy>);

pub struct LoadArgs<'a> {
    pub path: &'a str,
    pub user: &'a str,
    pub groups: &'a [String],
    pub sshd_addr: SocketAddr,
    pub session_id: &'a str,
    pub time_rfc3339: &'a str,
    pub expander: &'a dyn Expander,
}

#[instrument(skip(args), fields(path = %args.path, user = %args.user))]
pub fn load(args: LoadArgs<'_>) -> anyhow::Result<std::sync::Arc<EffectivePolicy>> {
    let meta = fs::metadata(args.path)
        .with_context(|| format!("statting config file '{}'", args.path))?;
    let mtime_secs = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let key = CacheKey {
        mtime_secs,
        user: args.user.to_string(),
        groups: args.groups.to_vec(),
        sshd_addr: args.sshd_addr.to_string(),
    };

    if let Some(cached) = CACHE.lock().unwrap().get(&key) {
        info!("using cached effective policy");
        return Ok(cached.0.clone());
    }

    let content = fs::read_to_string(args.path)
        .with_context(|| format!("reading config file '{}'", args.path))?;
    let doc: PolicyDoc = serde_yaml::from_str(&content)
        .map_err(|e| GatewayError::BadConfig(format!("parsing yaml: {e}")))?;

    let effective = collapse_for_session(&doc, &args)?;
    let arc = std::sync::Arc::new(effective);
    CACHE.lock().unwrap().insert(key, EffectivePolicyCached(arc.clone()));
    Ok(arc)
}

fn collapse_for_session(doc: &PolicyDoc, args: &LoadArgs<'_>) -> anyhow::Result<EffectivePolicy> {
    let mut acc = doc.defaults.clone();
    if acc.ssh.is_none() {
        acc.ssh = Some(super::SshSection {
            exe: Some(DEFAULT_SSH_EXE.to_string()),
            args: Some(DEFAULT_SSH_ARGS.iter().map(|s| s.to_string()).collect()),
        });
    } else {
        let ssh = acc.ssh.as_mut().unwrap();
        if ssh.exe.is_none() {
            ssh.exe = Some(DEFAULT_SSH_EXE.to_string());
        }
        if ssh.args.is_none() {
            ssh.args = Some(DEFAULT_SSH_ARGS.iter().map(|s| s.to_string()).collect());
        }
    }

    for ov in &doc.overrides {
        if override_matches(ov, args)? {
            collapse::merge(&mut acc, &ov.policy);
        }
    }

    substitute_tokens(&mut acc, args.user, args.session_id, args.time_rfc3339);

    validate(&acc)?;

    let dest = expand_dest(acc.dest.clone().unwrap_or_default(), args.expander)?;

    Ok(EffectivePolicy {
        debug: acc.debug.unwrap_or(false),
        log: acc.log.unwrap_or_default(),
        check_interval: acc
            .check_interval
            .map(|s| duration::parse(&s))
            .transpose()
            .map_err(|e| GatewayError::BadConfig(format!("check_interval: {e}")))?
            .unwrap_or(std::time::Duration::from_secs(30)),
        error_banner: acc.error_banner.unwrap_or_default(),
        dump: acc.dump.unwrap_or_default(),
        dump_limit_size: acc.dump_limit_size.unwrap_or(0),
        dump_limit_window: acc
            .dump_limit_window
            .map(|s| duration::parse(&s))
            .transpose()
            .map_err(|e| GatewayError::BadConfig(format!("dump_limit_window: {e}")))?
            .unwrap_or(std::time::Duration::from_secs(0)),
        etcd_stats_interval: acc
            .etcd_stats_interval
            .map(|s| duration::parse(&s))
            .transpose()
            .map_err(|e| GatewayError::BadConfig(format!("etcd_stats_interval: {e}")))?
            .unwrap_or(std::time::Duration::from_secs(10)),
        log_stats_interval: acc
            .log_stats_interval
            .map(|s| duration::parse(&s))
            .transpose()
            .map_err(|e| GatewayError::BadConfig(format!("log_stats_interval: {e}")))?
            .unwrap_or(std::time::Duration::from_secs(0)),
        bg_command: acc.bg_command.unwrap_or_default(),
        blocking_command: acc.blocking_command.unwrap_or_default(),
        ssh_exe: acc.ssh.as_ref().and_then(|s| s.exe.clone()).unwrap_or_else(|| DEFAULT_SSH_EXE.to_string()),
        ssh_args: acc
            .ssh
            .as_ref()
            .and_then(|s| s.args.clone())
            .unwrap_or_else(|| DEFAULT_SSH_ARGS.iter().map(|s| s.to_string()).collect()),
        environment: acc.environment.unwrap_or_default(),
        translate_commands: acc.translate_commands.unwrap_or_default(),
        service: acc.service.unwrap_or_else(|| DEFAULT_SERVICE.to_string()),
        dest,
        route_select: acc.route_select.unwrap_or(crate::selector::RouteSelect::Ordered),
        mode: acc.mode.unwrap_or(super::Mode::Balanced),
        force_command: acc.force_command,
        command_must_match: acc.command_must_match.unwrap_or(false),
        etcd_keyttl: acc.etcd_keyttl.unwrap_or(0),
        max_connections_per_user: acc.max_connections_per_user.unwrap_or(0),
        etcd: acc.etcd,
    })
}

/// An override applies when any of its `match` alternatives matches;
/// the source iterates alternatives in order and short-circuits on the
/// first match (Design Notes open question: this spec preserves that).
fn override_matches(ov: &OverrideClause, args: &LoadArgs<'_>) -> anyhow::Result<bool> {
    for alt in &ov.match_ {
        if alt_matches(alt, args)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn alt_matches(alt: &MatchAlt, args: &LoadArgs<'_>) -> anyhow::Result<bool> {
    if let Some(users) = &alt.users {
        if !users.iter().any(|u| u == args.user) {
            return Ok(false);
        }
    }
    if let Some(groups) = &alt.groups {
        if !groups.iter().any(|g| args.groups.contains(g)) {
            return Ok(false);
        }
    }
    if let Some(sources) = &alt.sources {
        let mut matched = false;
        for s in sources {
            if source_matches(s, args.sshd_addr)? {
                matched = true;
                break;
            }
        }
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Compares the session's sshd listening address against one configured
/// source address: ports must be equal (defaulting to 22), and at
/// least one resolved IP must coincide. An unresolvable hostname is a
/// `BadConfig` error, not a non-match: spec.md §4.E/§7 treat an
/// unresolvable `sources` entry as fatal at load time.
fn source_matches(configured: &str, sshd_addr: SocketAddr) -> anyhow::Result<bool> {
    let (host, port) = match configured.rsplit_once(':') {
        Some((h, p)) => (h, p.parse::<u16>().unwrap_or(22)),
        None => (configured, 22),
    };

    if port != sshd_addr.port() {
        return Ok(false);
    }

    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(ip == sshd_addr.ip());
    }

    let resolved = (host, port)
        .to_socket_addrs()
        .map_err(|e| GatewayError::BadConfig(format!("resolving source address '{configured}': {e}")))?;
    Ok(resolved.into_iter().any(|a| a.ip() == sshd_addr.ip()))
}

fn substitute_tokens(policy: &mut Policy, user: &str, sid: &str, time: &str) {
    let sub = |s: &str| s.replace("{user}", user).replace("{sid}", sid).replace("{time}", time);

    if let Some(log) = &policy.log {
        policy.log = Some(sub(log));
    }
    if let Some(dump) = &policy.dump {
        policy.dump = Some(sub(dump));
    }
    if let Some(env) = &mut policy.environment {
        for v in env.values_mut() {
            *v = sub(v);
        }
    }
    if let Some(tcs) = &mut policy.translate_commands {
        for tc in tcs.values_mut() {
            for v in tc.environment.values_mut() {
                *v = sub(v);
            }
        }
    }
}

/// Expands every `dest` entry through the nodeset expander and
/// normalizes each result to `host:port` (default port 22).
fn expand_dest(entries: Vec<String>, expander: &dyn Expander) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::new();
    for entry in entries {
        let expanded = expander
            .expand(&entry)
            .map_err(|e| GatewayError::BadConfig(format!("invalid dest entry '{entry}': {e}")))?;
        for host in expanded {
            let normalized = if host.contains(':') { host } else { format!("{host}:22") };
            out.push(normalized);
        }
    }
    Ok(out)
}

fn validate(policy: &Policy) -> anyhow::Result<()> {
    if let Some(etcd) = &policy.etcd {
        if etcd.mandatory == Some(true) && etcd.endpoints.as_ref().map(|e| e.is_empty()).unwrap_or(true) {
            bail!(GatewayError::BadConfig("etcd.mandatory is set but etcd.endpoints is empty".into()));
        }
    }
    // dest non-emptiness is enforced by the resolver only once a session
    // actually reaches selection (step 4), not here at load time.
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nodeset::BracketExpander;
    use std::io::Write;

    fn write_tmp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{contents}").unwrap();
        f
    }

    #[test]
    fn loads_defaults_when_no_overrides_match() {
        let f = write_tmp("dest: [\"host1\"]\n");
        let expander = BracketExpander;
        let args = LoadArgs {
            path: f.path().to_str().unwrap(),
            user: "alice",
            groups: &[],
            sshd_addr: "10.0.0.1:22".parse().unwrap(),
            session_id: "abc0000000",
            time_rfc3339: "2024-01-01T00:00:00Z",
            expander: &expander,
        };
        let policy = load(args).unwrap();
        assert_eq!(policy.dest, vec!["host1:22".to_string()]);
        assert_eq!(policy.ssh_exe, "ssh");
        assert_eq!(policy.ssh_args, vec!["-q".to_string(), "-Y".to_string()]);
    }

    #[test]
    fn override_by_user_applies() {
        let f = write_tmp(
            "dest: [\"default1\"]\noverrides:\n  - match:\n      - users: [\"alice\"]\n    dest: [\"alice-host\"]\n",
        );
        let expander = BracketExpander;
        let args = LoadArgs {
            path: f.path().to_str().unwrap(),
            user: "alice",
            groups: &[],
            sshd_addr: "10.0.0.1:22".parse().unwrap(),
            session_id: "abc0000000",
            time_rfc3339: "2024-01-01T00:00:00Z",
            expander: &expander,
        };
        let policy = load(args).unwrap();
        assert_eq!(policy.dest, vec!["alice-host:22".to_string()]);
    }

    #[test]
    fn substitution_applies_to_dump_and_environment() {
        let f = write_tmp(
            "dest: [\"host1\"]\ndump: \"/var/log/{user}/{sid}.dump\"\nenvironment:\n  SID: \"{sid}\"\n",
        );
        let expander = BracketExpander;
        let args = LoadArgs {
            path: f.path().to_str().unwrap(),
            user: "alice",
            groups: &[],
            sshd_addr: "10.0.0.1:22".parse().unwrap(),
            session_id: "deadbeef00",
            time_rfc3339: "2024-01-01T00:00:00Z",
            expander: &expander,
        };
        let policy = load(args).unwrap();
        assert_eq!(policy.dump, "/var/log/alice/deadbeef00.dump");
        assert_eq!(policy.environment.get("SID"), Some(&"deadbeef00".to_string()));
    }

    #[test]
    fn nodeset_dest_expands() {
        let f = write_tmp("dest: [\"web[1-2]\"]\n");
        let expander = BracketExpander;
        let args = LoadArgs {
            path: f.path().to_str().unwrap(),
            user: "alice",
            groups: &[],
            sshd_addr: "10.0.0.1:22".parse().unwrap(),
            session_id: "abc0000000",
            time_rfc3339: "2024-01-01T00:00:00Z",
            expander: &expander,
        };
        let policy = load(args).unwrap();
        assert_eq!(policy.dest, vec!["web1:22".to_string(), "web2:22".to_string()]);
    }

    #[test]
    fn source_match_compares_ip_and_defaulted_port() {
        assert!(source_matches("10.0.0.1", "10.0.0.1:22".parse().unwrap()).unwrap());
        assert!(!source_matches("10.0.0.1:2222", "10.0.0.1:22".parse().unwrap()).unwrap());
        assert!(!source_matches("10.0.0.2", "10.0.0.1:22".parse().unwrap()).unwrap());
    }
}
