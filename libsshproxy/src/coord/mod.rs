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

/*! The coordination client: a narrow trait over a strongly-consistent
KV store with leases and prefix scans (etcd v3 semantics). Defined as a
trait, per the re-architecture notes, so tests can substitute
[`mock::MockClient`] for scripted errors and responses; [`etcd::EtcdClient`]
is the one production backend. */

pub mod etcd;
pub mod mock;
pub mod model;

use crossbeam_channel::Receiver;

use crate::coord::model::{Bandwidth, DestUsage, Host, HostState};

/// Fired whenever the lease keepalive loop either renews successfully or
/// observes the lease is gone. `false` means the lease was lost; the
/// receiver end closing also means the lease was lost.
pub type KeepaliveEvent = bool;

/// A destination registration returned by `set_destination`: the channel
/// to watch for keepalive events plus the connection key path that
/// `update_stats` should overwrite.
pub struct Registration {
    pub keepalive: Receiver<KeepaliveEvent>,
    pub path: String,
    pub lease_id: i64,
}

pub struct UpdatedStats {
    pub in_kbps: i64,
    pub out_stdout_kbps: i64,
    pub out_stderr_kbps: i64,
}

/// The coordination client contract. All methods return
/// [`crate::errors::GatewayError::NotFound`] for a clean missing key and
/// [`crate::errors::GatewayError::StoreUnavailable`] for anything else
/// that goes wrong (transport, decode, etc).
pub trait Client: Send + Sync {
    fn get_destination(&self, user_key: &str, allow_history: bool) -> anyhow::Result<String>;

    fn set_destination(
        &self,
        user_key: &str,
        sshd_hostport: &str,
        dest: &str,
        keyttl_secs: u64,
    ) -> anyhow::Result<Registration>;

    fn new_lease(&self) -> anyhow::Result<i64>;

    fn update_stats(&self, path: &str, stats: UpdatedStats) -> anyhow::Result<()>;

    fn get_host(&self, hostport: &str) -> anyhow::Result<Host>;
    fn set_host(&self, hostport: &str, state: HostState, ts: &str) -> anyhow::Result<()>;
    fn del_host(&self, hostport: &str) -> anyhow::Result<()>;

    fn get_user_connections_count(&self, user: &str) -> anyhow::Result<u64>;
    fn get_user_hosts(&self, user_key: &str) -> anyhow::Result<Vec<DestUsage>>;

    fn get_all_connections(&self) -> anyhow::Result<Vec<(String, Bandwidth)>>;
    fn get_all_hosts(&self) -> anyhow::Result<Vec<(String, Host)>>;
    fn get_all_users(&self) -> anyhow::Result<Vec<String>>;
    fn get_all_groups(&self) -> anyhow::Result<Vec<String>>;

    fn get_error_banner(&self) -> anyhow::Result<String>;
    fn set_error_banner(&self, text: &str, expire: &str) -> anyhow::Result<()>;
    fn del_error_banner(&self) -> anyhow::Result<()>;

    /// Local liveness flag: any operation error sets the client inactive.
    fn is_alive(&self) -> bool;
    fn enable(&self);
    fn disable(&self);
    fn close(&self);
}
