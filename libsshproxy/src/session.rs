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

/*! The per-invocation session context: identity, addresses, and the
derived session id. Built once at startup from the environment and
passed by reference through the rest of the gateway. */

use std::net::{IpAddr, SocketAddr};

use anyhow::{bail, Context};
use chrono::Utc;
use sha1::{Digest, Sha1};

use crate::errors::GatewayError;

#[derive(Debug, Clone)]
pub struct SessionContext {
    pub start_time_ns: u64,
    pub user: String,
    pub groups: Vec<String>,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub session_id: String,
    pub original_command: Option<String>,
}

impl SessionContext {
    /// Builds the session context from the process environment. Requires
    /// `SSH_CONNECTION` to be present and parseable; `SSH_ORIGINAL_COMMAND`
    /// is optional.
    pub fn from_env(user: String, groups: Vec<String>, now_ns: u64) -> anyhow::Result<Self> {
        let conn = std::env::var("SSH_CONNECTION")
            .map_err(|_| GatewayError::BadConfig("SSH_CONNECTION is not set".into()))?;
        let (src, dst) = parse_ssh_connection(&conn)?;

        let original_command = std::env::var("SSH_ORIGINAL_COMMAND").ok();

        let session_id = derive_session_id(&user, &src, now_ns);

        Ok(SessionContext { start_time_ns: now_ns, user, groups, src, dst, session_id, original_command })
    }

    pub fn user_key(&self, service: &str) -> String {
        format!("{}@{}", self.user, service)
    }

    /// RFC-3339 nanosecond timestamp of `start_time_ns`, used for
    /// `{time}` substitution and for connection key suffixes.
    pub fn start_time_rfc3339(&self) -> String {
        let secs = (self.start_time_ns / 1_000_000_000) as i64;
        let nanos = (self.start_time_ns % 1_000_000_000) as u32;
        chrono::DateTime::<Utc>::from_timestamp(secs, nanos)
            .unwrap_or_default()
            .to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
    }
}

/// `SSH_CONNECTION` is `srcip srcport dstip dstport`, both IPv4 and IPv6
/// accepted.
fn parse_ssh_connection(val: &str) -> anyhow::Result<(SocketAddr, SocketAddr)> {
    let parts: Vec<&str> = val.split_whitespace().collect();
    if parts.len() != 4 {
        bail!(GatewayError::BadConfig(format!(
            "SSH_CONNECTION must have 4 space separated fields, got '{}'",
            val
        )));
    }

    let src_ip: IpAddr = parts[0].parse().context("parsing SSH_CONNECTION src ip")?;
    let src_port: u16 = parts[1].parse().context("parsing SSH_CONNECTION src port")?;
    let dst_ip: IpAddr = parts[2].parse().context("parsing SSH_CONNECTION dst ip")?;
    let dst_port: u16 = parts[3].parse().context("parsing SSH_CONNECTION dst port")?;

    Ok((SocketAddr::new(src_ip, src_port), SocketAddr::new(dst_ip, dst_port)))
}

/// `session_id = first 10 hex chars of sha1(user@src@ns_ts)`.
fn derive_session_id(user: &str, src: &SocketAddr, now_ns: u64) -> String {
    let input = format!("{}@{}@{}", user, src, now_ns);
    let digest = Sha1::digest(input.as_bytes());
    let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    hex[..10].to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_ipv4_connection() {
        let (src, dst) = parse_ssh_connection("10.0.0.1 54321 10.0.0.2 22").unwrap();
        assert_eq!(src, "10.0.0.1:54321".parse().unwrap());
        assert_eq!(dst, "10.0.0.2:22".parse().unwrap());
    }

    #[test]
    fn parses_ipv6_connection() {
        let (src, dst) = parse_ssh_connection("::1 54321 fe80::1 22").unwrap();
        assert_eq!(src, "[::1]:54321".parse().unwrap());
        assert_eq!(dst, "[fe80::1]:22".parse().unwrap());
    }

    #[test]
    fn rejects_malformed_connection() {
        assert!(parse_ssh_connection("10.0.0.1 54321").is_err());
        assert!(parse_ssh_connection("not-an-ip 1 2.2.2.2 22").is_err());
    }

    #[test]
    fn session_id_is_ten_hex_chars_and_deterministic() {
        let src: SocketAddr = "10.0.0.1:54321".parse().unwrap();
        let a = derive_session_id("alice", &src, 42);
        let b = derive_session_id("alice", &src, 42);
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        let c = derive_session_id("bob", &src, 42);
        assert_ne!(a, c);
    }

    #[test]
    fn user_key_formats_service_scope() {
        let src: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let dst: SocketAddr = "10.0.0.2:22".parse().unwrap();
        let ctx = SessionContext {
            start_time_ns: 0,
            user: "alice".into(),
            groups: vec![],
            src,
            dst,
            session_id: "abc".into(),
            original_command: None,
        };
        assert_eq!(ctx.user_key("prod"), "alice@prod");
    }
}
