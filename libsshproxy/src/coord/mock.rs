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

/*! An in-memory coordination client for tests: a real (but
non-persistent, non-networked) KV store with the same prefix-scan and
lease semantics `etcd::EtcdClient` provides, plus knobs to script
`StoreUnavailable` failures and dead liveness. */

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Mutex,
    },
};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::coord::{
    model::{self, Bandwidth, DestUsage, Host, HostState},
    Client, Registration, UpdatedStats,
};
use crate::errors::GatewayError;

struct Entry {
    value: String,
}

pub struct MockClient {
    kv: Mutex<BTreeMap<String, Entry>>,
    alive: AtomicBool,
    next_lease: AtomicI64,
    fail_next_n: Mutex<usize>,
    keepalive_txs: Mutex<Vec<Sender<bool>>>,
}

impl Default for MockClient {
    fn default() -> Self {
        MockClient {
            kv: Mutex::new(BTreeMap::new()),
            alive: AtomicBool::new(true),
            next_lease: AtomicI64::new(1),
            fail_next_n: Mutex::new(0),
            keepalive_txs: Mutex::new(Vec::new()),
        }
    }
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` operations return `StoreUnavailable`, to
    /// exercise store-outage resilience.
    pub fn fail_next(&self, n: usize) {
        *self.fail_next_n.lock().unwrap() = n;
    }

    /// Drops the lease backing every outstanding registration, so tests
    /// can observe the keepalive channel close.
    pub fn kill_all_leases(&self) {
        let mut txs = self.keepalive_txs.lock().unwrap();
        txs.clear(); // dropping the senders closes the receivers
    }

    pub fn put_raw(&self, key: &str, value: &str) {
        self.kv.lock().unwrap().insert(key.to_string(), Entry { value: value.to_string() });
    }

    fn maybe_fail(&self) -> anyhow::Result<()> {
        let mut n = self.fail_next_n.lock().unwrap();
        if *n > 0 {
            *n -= 1;
            return Err(GatewayError::StoreUnavailable("scripted failure".into()).into());
        }
        Ok(())
    }
}

impl Client for MockClient {
    fn get_destination(&self, user_key: &str, allow_history: bool) -> anyhow::Result<String> {
        self.maybe_fail()?;
        let kv = self.kv.lock().unwrap();
        let prefix = model::connection_prefix(user_key, None);
        if let Some((_, entry)) = kv.range(prefix.clone()..).take_while(|(k, _)| k.starts_with(&prefix)).next_back() {
            // value is "<dest>" embedded via a marker prefix set by set_destination
            if let Some(dest) = entry.value.strip_prefix("dest:") {
                return Ok(dest.to_string());
            }
        }

        if allow_history {
            let hprefix = model::history_prefix(user_key);
            if let Some((_, entry)) = kv.range(hprefix.clone()..).take_while(|(k, _)| k.starts_with(&hprefix)).next_back() {
                return Ok(entry.value.clone());
            }
        }

        Err(GatewayError::NotFound.into())
    }

    fn set_destination(
        &self,
        user_key: &str,
        sshd_hostport: &str,
        dest: &str,
        keyttl_secs: u64,
    ) -> anyhow::Result<Registration> {
        self.maybe_fail()?;
        let lease_id = self.next_lease.fetch_add(1, Ordering::SeqCst);
        let ts = format!("{lease_id:020}");
        let key = model::connection_key(user_key, dest, sshd_hostport, &ts);
        self.kv.lock().unwrap().insert(key.clone(), Entry { value: format!("dest:{dest}") });

        if keyttl_secs > 0 {
            let hkey = model::history_key(user_key, lease_id);
            self.kv.lock().unwrap().insert(hkey, Entry { value: dest.to_string() });
        }

        let (tx, rx) = unbounded();
        self.keepalive_txs.lock().unwrap().push(tx);

        Ok(Registration { keepalive: rx, path: key, lease_id })
    }

    fn new_lease(&self) -> anyhow::Result<i64> {
        self.maybe_fail()?;
        Ok(self.next_lease.fetch_add(1, Ordering::SeqCst))
    }

    fn update_stats(&self, path: &str, stats: UpdatedStats) -> anyhow::Result<()> {
        self.maybe_fail()?;
        let bw = Bandwidth {
            in_kbps: stats.in_kbps,
            out_kbps: stats.out_stdout_kbps + stats.out_stderr_kbps,
        };
        let json = serde_json::to_string(&bw)?;
        self.kv.lock().unwrap().insert(path.to_string(), Entry { value: json });
        Ok(())
    }

    fn get_host(&self, hostport: &str) -> anyhow::Result<Host> {
        self.maybe_fail()?;
        let kv = self.kv.lock().unwrap();
        match kv.get(&model::host_key(hostport)) {
            Some(entry) => Ok(serde_json::from_str(&entry.value)?),
            None => Err(GatewayError::NotFound.into()),
        }
    }

    fn set_host(&self, hostport: &str, state: HostState, ts: &str) -> anyhow::Result<()> {
        self.maybe_fail()?;
        let host = Host { state, ts: ts.to_string() };
        let json = serde_json::to_string(&host)?;
        self.kv.lock().unwrap().insert(model::host_key(hostport), Entry { value: json });
        Ok(())
    }

    fn del_host(&self, hostport: &str) -> anyhow::Result<()> {
        self.maybe_fail()?;
        self.kv.lock().unwrap().remove(&model::host_key(hostport));
        Ok(())
    }

    fn get_user_connections_count(&self, user: &str) -> anyhow::Result<u64> {
        self.maybe_fail()?;
        let kv = self.kv.lock().unwrap();
        let prefix = "/connections/";
        let needle = format!("{user}@");
        Ok(kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(k, _)| k[prefix.len()..].starts_with(&needle))
            .count() as u64)
    }

    fn get_user_hosts(&self, user_key: &str) -> anyhow::Result<Vec<DestUsage>> {
        self.maybe_fail()?;
        let kv = self.kv.lock().unwrap();
        let prefix = model::connection_prefix(user_key, None);
        let mut by_dest: BTreeMap<String, DestUsage> = BTreeMap::new();
        for (k, entry) in kv.range(prefix.clone()..).take_while(|(k, _)| k.starts_with(&prefix)) {
            let rest = &k[prefix.len()..];
            let dest = rest.split('/').next().unwrap_or("").to_string();
            let usage = by_dest.entry(dest.clone()).or_insert_with(|| DestUsage { dest, ..Default::default() });
            usage.count += 1;
            if let Ok(bw) = serde_json::from_str::<Bandwidth>(&entry.value) {
                usage.bandwidth.in_kbps += bw.in_kbps;
                usage.bandwidth.out_kbps += bw.out_kbps;
            }
        }
        Ok(by_dest.into_values().collect())
    }

    fn get_all_connections(&self) -> anyhow::Result<Vec<(String, Bandwidth)>> {
        self.maybe_fail()?;
        let kv = self.kv.lock().unwrap();
        Ok(kv
            .range("/connections/".to_string()..)
            .take_while(|(k, _)| k.starts_with("/connections/"))
            .filter_map(|(k, e)| serde_json::from_str::<Bandwidth>(&e.value).ok().map(|bw| (k.clone(), bw)))
            .collect())
    }

    fn get_all_hosts(&self) -> anyhow::Result<Vec<(String, Host)>> {
        self.maybe_fail()?;
        let kv = self.kv.lock().unwrap();
        Ok(kv
            .range("/hosts/".to_string()..)
            .take_while(|(k, _)| k.starts_with("/hosts/"))
            .filter_map(|(k, e)| {
                serde_json::from_str::<Host>(&e.value)
                    .ok()
                    .map(|h| (k.trim_start_matches("/hosts/").to_string(), h))
            })
            .collect())
    }

    fn get_all_users(&self) -> anyhow::Result<Vec<String>> {
        self.maybe_fail()?;
        let kv = self.kv.lock().unwrap();
        let mut users: Vec<String> = kv
            .range("/connections/".to_string()..)
            .take_while(|(k, _)| k.starts_with("/connections/"))
            .filter_map(|(k, _)| {
                k.trim_start_matches("/connections/").split('/').next().and_then(|uk| uk.split('@').next()).map(String::from)
            })
            .collect();
        users.sort();
        users.dedup();
        Ok(users)
    }

    fn get_all_groups(&self) -> anyhow::Result<Vec<String>> {
        // The mock has no group membership data of its own; admin scans
        // of groups are derived from configuration, not the store.
        Ok(Vec::new())
    }

    fn get_error_banner(&self) -> anyhow::Result<String> {
        self.maybe_fail()?;
        let kv = self.kv.lock().unwrap();
        match kv.get(model::ERROR_BANNER_VALUE_KEY) {
            Some(entry) => Ok(entry.value.clone()),
            None => Err(GatewayError::NotFound.into()),
        }
    }

    fn set_error_banner(&self, text: &str, expire: &str) -> anyhow::Result<()> {
        self.maybe_fail()?;
        let mut kv = self.kv.lock().unwrap();
        kv.insert(model::ERROR_BANNER_VALUE_KEY.to_string(), Entry { value: text.to_string() });
        kv.insert(model::ERROR_BANNER_EXPIRE_KEY.to_string(), Entry { value: expire.to_string() });
        Ok(())
    }

    fn del_error_banner(&self) -> anyhow::Result<()> {
        self.maybe_fail()?;
        let mut kv = self.kv.lock().unwrap();
        kv.remove(model::ERROR_BANNER_VALUE_KEY);
        kv.remove(model::ERROR_BANNER_EXPIRE_KEY);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn enable(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    fn disable(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn close(&self) {
        self.disable();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_then_get_destination() {
        let c = MockClient::new();
        c.set_destination("alice@default", "gw:22", "host1:22", 60).unwrap();
        assert_eq!(c.get_destination("alice@default", false).unwrap(), "host1:22");
    }

    #[test]
    fn get_destination_not_found() {
        let c = MockClient::new();
        let err = c.get_destination("nobody@default", false).unwrap_err();
        assert!(err.downcast_ref::<GatewayError>().map(|e| *e == GatewayError::NotFound).unwrap_or(false));
    }

    #[test]
    fn scripted_failures_surface_as_store_unavailable() {
        let c = MockClient::new();
        c.fail_next(1);
        let err = c.get_destination("alice@default", false).unwrap_err();
        assert!(matches!(err.downcast_ref::<GatewayError>(), Some(GatewayError::StoreUnavailable(_))));
        // subsequent calls succeed again
        assert!(c.get_destination("alice@default", false).is_err()); // still NotFound this time
    }

    #[test]
    fn host_roundtrip() {
        let c = MockClient::new();
        c.set_host("host1:22", HostState::Disabled, "2024-01-01T00:00:00Z").unwrap();
        let h = c.get_host("host1:22").unwrap();
        assert_eq!(h.state, HostState::Disabled);
    }

    #[test]
    fn user_connection_count() {
        let c = MockClient::new();
        c.set_destination("alice@default", "gw:22", "host1:22", 0).unwrap();
        c.set_destination("alice@default", "gw:22", "host2:22", 0).unwrap();
        c.set_destination("bob@default", "gw:22", "host1:22", 0).unwrap();
        assert_eq!(c.get_user_connections_count("alice").unwrap(), 2);
    }
}
