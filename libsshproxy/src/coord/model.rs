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

/*! JSON value types and key layouts for the coordination store. Keys and
shapes follow the data model: all values are JSON, and keys are
slash-delimited paths scanned by prefix. */

use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    Up,
    Down,
    Disabled,
    Unknown,
}

impl Default for HostState {
    fn default() -> Self {
        HostState::Unknown
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    #[serde(rename = "State")]
    pub state: HostState,
    #[serde(rename = "Ts")]
    pub ts: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Bandwidth {
    #[serde(rename = "In")]
    pub in_kbps: i64,
    #[serde(rename = "Out")]
    pub out_kbps: i64,
}

/// Aggregate view of a destination's active sessions for a user/service
/// scope, as returned by `get_user_hosts`.
#[derive(Debug, Clone, Default)]
pub struct DestUsage {
    pub dest: String,
    pub count: u64,
    pub bandwidth: Bandwidth,
}

impl DestUsage {
    /// `in² + out² + n`, the tie-break score the `bandwidth` route
    /// selector ranks ascending.
    pub fn bandwidth_score(&self) -> i128 {
        let i = self.bandwidth.in_kbps as i128;
        let o = self.bandwidth.out_kbps as i128;
        i * i + o * o + self.count as i128
    }
}

pub fn connection_prefix(user_key: &str, dest: Option<&str>) -> String {
    match dest {
        Some(d) => format!("/connections/{user_key}/{d}/"),
        None => format!("/connections/{user_key}/"),
    }
}

pub fn connection_key(user_key: &str, dest: &str, sshd_hostport: &str, ts_rfc3339_nano: &str) -> String {
    format!("/connections/{user_key}/{dest}/{sshd_hostport}/{ts_rfc3339_nano}")
}

pub fn history_prefix(user_key: &str) -> String {
    format!("/history/{user_key}/")
}

pub fn history_key(user_key: &str, lease_id: i64) -> String {
    format!("/history/{user_key}/{lease_id}")
}

pub fn host_key(hostport: &str) -> String {
    format!("/hosts/{hostport}")
}

pub fn all_connections_prefix() -> &'static str {
    "/connections/"
}

pub fn all_hosts_prefix() -> &'static str {
    "/hosts/"
}

pub const ERROR_BANNER_VALUE_KEY: &str = "/error_banner/value";
pub const ERROR_BANNER_EXPIRE_KEY: &str = "/error_banner/expire";

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bandwidth_score_squares_and_adds_count() {
        let u = DestUsage { dest: "h:22".into(), count: 3, bandwidth: Bandwidth { in_kbps: 2, out_kbps: 5 } };
        assert_eq!(u.bandwidth_score(), 4 + 25 + 3);
    }

    #[test]
    fn host_serializes_with_pascal_case_keys() {
        let h = Host { state: HostState::Up, ts: "2024-01-01T00:00:00Z".into() };
        let json = serde_json::to_string(&h).unwrap();
        assert!(json.contains("\"State\":\"up\""));
        assert!(json.contains("\"Ts\""));
    }

    #[test]
    fn keys_are_slash_delimited_as_specified() {
        assert_eq!(connection_prefix("alice@default", None), "/connections/alice@default/");
        assert_eq!(history_key("alice@default", 7), "/history/alice@default/7");
        assert_eq!(host_key("host1:22"), "/hosts/host1:22");
    }
}
