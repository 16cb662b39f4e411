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

use std::time;

pub const BUF_SIZE: usize = 1024 * 16;

/// How often the parent-death watcher polls getppid().
pub const PARENT_DEATH_POLL_INTERVAL: time::Duration = time::Duration::from_secs(1);

/// Per-call deadline for every coordination store RPC.
pub const ETCD_CALL_TIMEOUT: time::Duration = time::Duration::from_secs(2);

/// Dial timeout for a host liveness probe.
pub const HOST_CHECK_TIMEOUT: time::Duration = time::Duration::from_secs(1);

pub const DEFAULT_SSH_PORT: u16 = 22;

pub const DEFAULT_SSH_EXE: &str = "ssh";
pub const DEFAULT_SSH_ARGS: &[&str] = &["-q", "-Y"];

pub const DEFAULT_SERVICE: &str = "default";

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sshproxy/sshproxy.yaml";

pub const STDIN_FD: i32 = 0;
pub const STDOUT_FD: i32 = 1;
pub const STDERR_FD: i32 = 2;

/// Optional env var consumed by the supervisor: a space-separated suffix
/// appended to the child ssh argv after the policy's own `ssh.args`.
pub const SSHPROXY_ARGS_VAR: &str = "SSHPROXY_ARGS";
