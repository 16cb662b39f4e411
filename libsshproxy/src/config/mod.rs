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

/*! The configuration engine: loads the YAML policy document, evaluates
overrides against the caller's identity, and collapses the result into
an [`EffectivePolicy`]. Every overridable field is modeled as
`Option<T>` — present vs absent, never a nullable pointer into a
mandatory type — so collapse is simply "present overwrites, absent
keeps", per the re-architecture notes. */

pub mod collapse;
pub mod legacy;
pub mod load;

use std::collections::HashMap;

use serde_derive::{Deserialize, Serialize};

use crate::selector::RouteSelect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Sticky,
    Balanced,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshSection {
    pub exe: Option<String>,
    pub args: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EtcdSection {
    pub endpoints: Option<Vec<String>>,
    #[serde(default)]
    pub tls: EtcdTlsSection,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keyttl: Option<u64>,
    pub mandatory: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EtcdTlsSection {
    pub cafile: Option<String>,
    pub certfile: Option<String>,
    pub keyfile: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranslateCommand {
    pub ssh_args: Option<Vec<String>>,
    pub command: String,
    #[serde(default)]
    pub disable_dump: bool,
    /// Extra environment for this translation, substituted the same way
    /// as the top-level `environment` map.
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

/// A partial policy: every field absent by default, present only where
/// the document (global section or one override clause) set it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    pub debug: Option<bool>,
    pub log: Option<String>,
    pub check_interval: Option<String>,
    pub error_banner: Option<String>,
    pub dump: Option<String>,
    pub dump_limit_size: Option<u64>,
    pub dump_limit_window: Option<String>,
    pub etcd_stats_interval: Option<String>,
    pub log_stats_interval: Option<String>,
    pub bg_command: Option<String>,
    pub blocking_command: Option<String>,
    pub ssh: Option<SshSection>,
    pub environment: Option<HashMap<String, String>>,
    pub translate_commands: Option<HashMap<String, TranslateCommand>>,
    pub service: Option<String>,
    pub dest: Option<Vec<String>>,
    pub route_select: Option<RouteSelect>,
    pub mode: Option<Mode>,
    pub force_command: Option<String>,
    pub command_must_match: Option<bool>,
    pub etcd_keyttl: Option<u64>,
    pub max_connections_per_user: Option<u64>,
    pub etcd: Option<EtcdSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchAlt {
    pub sources: Option<Vec<String>>,
    pub users: Option<Vec<String>>,
    pub groups: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverrideClause {
    #[serde(rename = "match")]
    pub match_: Vec<MatchAlt>,
    #[serde(flatten)]
    pub policy: Policy,
}

/// The raw document shape: global defaults plus an ordered override
/// list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyDoc {
    #[serde(flatten)]
    pub defaults: Policy,
    #[serde(default)]
    pub overrides: Vec<OverrideClause>,
}

/// The collapsed result: every field either filled from the document or
/// defaulted. This is what the rest of the gateway consumes.
#[derive(Debug, Clone)]
pub struct EffectivePolicy {
    pub debug: bool,
    pub log: String,
    pub check_interval: std::time::Duration,
    pub error_banner: String,
    pub dump: String,
    pub dump_limit_size: u64,
    pub dump_limit_window: std::time::Duration,
    pub etcd_stats_interval: std::time::Duration,
    pub log_stats_interval: std::time::Duration,
    pub bg_command: String,
    pub blocking_command: String,
    pub ssh_exe: String,
    pub ssh_args: Vec<String>,
    pub environment: HashMap<String, String>,
    pub translate_commands: HashMap<String, TranslateCommand>,
    pub service: String,
    pub dest: Vec<String>,
    pub route_select: RouteSelect,
    pub mode: Mode,
    pub force_command: Option<String>,
    pub command_must_match: bool,
    pub etcd_keyttl: u64,
    pub max_connections_per_user: u64,
    pub etcd: Option<EtcdSection>,
}
