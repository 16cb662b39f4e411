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

/*! The production coordination client, backed by etcd v3 over
`etcd-client` (itself built on `tonic`/`tokio`). The rest of the gateway
is thread/crossbeam based, so this module is the one pocket of async:
it owns a small dedicated current-thread `tokio::runtime::Runtime` and
exposes the same synchronous [`crate::coord::Client`] trait as the mock,
blocking on that runtime for every call. The lease keepalive is the one
exception — it has to keep running between calls, so it gets its own
dedicated thread and runtime rather than a bare `spawn` on `self.rt`,
which nothing would reliably poll while the session is otherwise idle. */

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{unbounded, Sender};
use etcd_client::{Client as Etcd, ConnectOptions, GetOptions, PutOptions};
use tokio::runtime::Runtime;
use tracing::{debug, warn};

use crate::coord::{
    model::{self, Bandwidth, DestUsage, Host, HostState},
    Client, Registration, UpdatedStats,
};
use crate::consts::ETCD_CALL_TIMEOUT;
use crate::errors::GatewayError;

pub struct TlsConfig {
    pub ca_file: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: Option<TlsConfig>,
    pub keyttl_secs: u64,
}

pub struct EtcdClient {
    rt: Runtime,
    inner: Mutex<Etcd>,
    alive: AtomicBool,
}

impl EtcdClient {
    pub fn connect(cfg: &EtcdConfig) -> anyhow::Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("building the coordination client's tokio runtime")?;

        let mut opts = ConnectOptions::new().with_connect_timeout(ETCD_CALL_TIMEOUT);
        if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
            opts = opts.with_user(user.clone(), pass.clone());
        }
        if let Some(tls) = &cfg.tls {
            let mut tls_opts = etcd_client::TlsOptions::new();
            if let Some(ca) = &tls.ca_file {
                let pem = std::fs::read(ca).context("reading etcd.tls.cafile")?;
                tls_opts = tls_opts.ca_certificate(etcd_client::Certificate::from_pem(pem));
            }
            if let (Some(cert), Some(key)) = (&tls.cert_file, &tls.key_file) {
                let cert_pem = std::fs::read(cert).context("reading etcd.tls.certfile")?;
                let key_pem = std::fs::read(key).context("reading etcd.tls.keyfile")?;
                tls_opts = tls_opts.identity(etcd_client::Identity::from_pem(cert_pem, key_pem));
            }
            opts = opts.with_tls(tls_opts);
        }

        let inner = rt
            .block_on(Etcd::connect(cfg.endpoints.clone(), Some(opts)))
            .context("connecting to the coordination store")?;

        Ok(EtcdClient { rt, inner: Mutex::new(inner), alive: AtomicBool::new(true) })
    }

    fn with_client<F, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: std::future::Future<Output = Result<T, etcd_client::Error>>,
    {
        match self.rt.block_on(f) {
            Ok(v) => Ok(v),
            Err(e) => {
                self.alive.store(false, Ordering::SeqCst);
                Err(GatewayError::StoreUnavailable(e.to_string()).into())
            }
        }
    }
}

impl Client for EtcdClient {
    fn get_destination(&self, user_key: &str, allow_history: bool) -> anyhow::Result<String> {
        let mut client = self.inner.lock().unwrap();
        let prefix = model::connection_prefix(user_key, None);
        let resp = self.with_client(client.get(prefix.clone(), Some(GetOptions::new().with_prefix().with_sort(
            etcd_client::SortTarget::Key,
            etcd_client::SortOrder::Descend,
        ).with_limit(1))))?;

        if let Some(kv) = resp.kvs().first() {
            let value = String::from_utf8_lossy(kv.value()).to_string();
            let _ = value; // the connection value is the bandwidth json, not the dest
            let key = String::from_utf8_lossy(kv.key()).to_string();
            if let Some(dest) = key.strip_prefix(&prefix).and_then(|rest| rest.split('/').next()) {
                return Ok(dest.to_string());
            }
        }

        if allow_history {
            let hprefix = model::history_prefix(user_key);
            let resp = self.with_client(client.get(hprefix, Some(GetOptions::new().with_prefix().with_sort(
                etcd_client::SortTarget::Key,
                etcd_client::SortOrder::Descend,
            ).with_limit(1))))?;
            if let Some(kv) = resp.kvs().first() {
                return Ok(String::from_utf8_lossy(kv.value()).to_string());
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
        let mut client = self.inner.lock().unwrap();

        let lease = self.with_client(client.lease_grant(10, None))?;
        let lease_id = lease.id();

        let ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
        let key = model::connection_key(user_key, dest, sshd_hostport, &ts);
        let bw = Bandwidth::default();
        let json = serde_json::to_string(&bw)?;
        self.with_client(client.put(key.clone(), json, Some(PutOptions::new().with_lease(lease_id))))?;

        if keyttl_secs > 0 {
            let hlease = self.with_client(client.lease_grant(keyttl_secs as i64, None))?;
            let hkey = model::history_key(user_key, hlease.id());
            self.with_client(client.put(hkey, dest.to_string(), Some(PutOptions::new().with_lease(hlease.id()))))?;
        }

        let keepalive_client = client.clone();
        drop(client);

        let (tx, rx): (Sender<bool>, _) = unbounded();
        spawn_keepalive(keepalive_client, lease_id, tx);

        Ok(Registration { keepalive: rx, path: key, lease_id })
    }

    fn new_lease(&self) -> anyhow::Result<i64> {
        let mut client = self.inner.lock().unwrap();
        let lease = self.with_client(client.lease_grant(10, None))?;
        self.alive.store(true, Ordering::SeqCst);
        Ok(lease.id())
    }

    fn update_stats(&self, path: &str, stats: UpdatedStats) -> anyhow::Result<()> {
        let mut client = self.inner.lock().unwrap();
        let bw = Bandwidth {
            in_kbps: stats.in_kbps,
            out_kbps: stats.out_stdout_kbps + stats.out_stderr_kbps,
        };
        let json = serde_json::to_string(&bw)?;
        self.with_client(client.put(path.to_string(), json, None))?;
        Ok(())
    }

    fn get_host(&self, hostport: &str) -> anyhow::Result<Host> {
        let mut client = self.inner.lock().unwrap();
        let resp = self.with_client(client.get(model::host_key(hostport), None))?;
        match resp.kvs().first() {
            Some(kv) => Ok(serde_json::from_slice(kv.value())?),
            None => Err(GatewayError::NotFound.into()),
        }
    }

    fn set_host(&self, hostport: &str, state: HostState, ts: &str) -> anyhow::Result<()> {
        let mut client = self.inner.lock().unwrap();
        let host = Host { state, ts: ts.to_string() };
        let json = serde_json::to_string(&host)?;
        self.with_client(client.put(model::host_key(hostport), json, None))?;
        Ok(())
    }

    fn del_host(&self, hostport: &str) -> anyhow::Result<()> {
        let mut client = self.inner.lock().unwrap();
        self.with_client(client.delete(model::host_key(hostport), None))?;
        Ok(())
    }

    fn get_user_connections_count(&self, user: &str) -> anyhow::Result<u64> {
        let mut client = self.inner.lock().unwrap();
        let resp = self.with_client(
            client.get("/connections/", Some(GetOptions::new().with_prefix().with_keys_only())),
        )?;
        let needle = format!("{user}@");
        Ok(resp
            .kvs()
            .iter()
            .filter(|kv| {
                String::from_utf8_lossy(kv.key())
                    .trim_start_matches("/connections/")
                    .starts_with(&needle)
            })
            .count() as u64)
    }

    fn get_user_hosts(&self, user_key: &str) -> anyhow::Result<Vec<DestUsage>> {
        let mut client = self.inner.lock().unwrap();
        let prefix = model::connection_prefix(user_key, None);
        let resp = self.with_client(client.get(prefix.clone(), Some(GetOptions::new().with_prefix())))?;

        use std::collections::BTreeMap;
        let mut by_dest: BTreeMap<String, DestUsage> = BTreeMap::new();
        for kv in resp.kvs() {
            let key = String::from_utf8_lossy(kv.key()).to_string();
            let Some(rest) = key.strip_prefix(&prefix) else { continue };
            let dest = rest.split('/').next().unwrap_or("").to_string();
            let usage = by_dest.entry(dest.clone()).or_insert_with(|| DestUsage { dest, ..Default::default() });
            usage.count += 1;
            if let Ok(bw) = serde_json::from_slice::<Bandwidth>(kv.value()) {
                usage.bandwidth.in_kbps += bw.in_kbps;
                usage.bandwidth.out_kbps += bw.out_kbps;
            }
        }
        Ok(by_dest.into_values().collect())
    }

    fn get_all_connections(&self) -> anyhow::Result<Vec<(String, Bandwidth)>> {
        let mut client = self.inner.lock().unwrap();
        let resp = self.with_client(
            client.get("/connections/", Some(GetOptions::new().with_prefix())),
        )?;
        Ok(resp
            .kvs()
            .iter()
            .filter_map(|kv| {
                serde_json::from_slice::<Bandwidth>(kv.value())
                    .ok()
                    .map(|bw| (String::from_utf8_lossy(kv.key()).to_string(), bw))
            })
            .collect())
    }

    fn get_all_hosts(&self) -> anyhow::Result<Vec<(String, Host)>> {
        let mut client = self.inner.lock().unwrap();
        let resp = self.with_client(client.get("/hosts/", Some(GetOptions::new().with_prefix())))?;
        Ok(resp
            .kvs()
            .iter()
            .filter_map(|kv| {
                serde_json::from_slice::<Host>(kv.value()).ok().map(|h| {
                    (String::from_utf8_lossy(kv.key()).trim_start_matches("/hosts/").to_string(), h)
                })
            })
            .collect())
    }

    fn get_all_users(&self) -> anyhow::Result<Vec<String>> {
        let mut client = self.inner.lock().unwrap();
        let resp = self.with_client(
            client.get("/connections/", Some(GetOptions::new().with_prefix().with_keys_only())),
        )?;
        let mut users: Vec<String> = resp
            .kvs()
            .iter()
            .filter_map(|kv| {
                String::from_utf8_lossy(kv.key())
                    .trim_start_matches("/connections/")
                    .split('/')
                    .next()
                    .and_then(|uk| uk.split('@').next())
                    .map(String::from)
            })
            .collect();
        users.sort();
        users.dedup();
        Ok(users)
    }

    fn get_all_groups(&self) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn get_error_banner(&self) -> anyhow::Result<String> {
        let mut client = self.inner.lock().unwrap();
        let resp = self.with_client(client.get(model::ERROR_BANNER_VALUE_KEY, None))?;
        match resp.kvs().first() {
            Some(kv) => Ok(String::from_utf8_lossy(kv.value()).to_string()),
            None => Err(GatewayError::NotFound.into()),
        }
    }

    fn set_error_banner(&self, text: &str, expire: &str) -> anyhow::Result<()> {
        let mut client = self.inner.lock().unwrap();
        self.with_client(client.put(model::ERROR_BANNER_VALUE_KEY, text.to_string(), None))?;
        self.with_client(client.put(model::ERROR_BANNER_EXPIRE_KEY, expire.to_string(), None))?;
        Ok(())
    }

    fn del_error_banner(&self) -> anyhow::Result<()> {
        let mut client = self.inner.lock().unwrap();
        self.with_client(client.delete(model::ERROR_BANNER_VALUE_KEY, None))?;
        self.with_client(client.delete(model::ERROR_BANNER_EXPIRE_KEY, None))?;
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

/// Spawns a dedicated OS thread, running its own single-purpose
/// current-thread runtime, that keeps the given lease alive: forwards a
/// `true` on every successful renewal and drops the sender (closing the
/// channel) the moment the lease is lost, matching the contract
/// `supervisor::mod` relies on.
///
/// This cannot piggyback on `EtcdClient::rt`: that runtime only makes
/// progress while some other `Client` call is inside `block_on` on it, and
/// an idle session (`etcd_stats_interval == 0`, no other coordination RPC
/// in flight) can go long enough between calls that the lease would expire
/// out from under it. Owning a runtime exclusively for this loop guarantees
/// it's always polled for as long as the lease is meant to live.
fn spawn_keepalive(mut client: Etcd, lease_id: i64, tx: Sender<bool>) {
    thread::Builder::new()
        .name(format!("etcd-keepalive-{lease_id}"))
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    warn!("failed to build keepalive runtime for lease {}: {}", lease_id, e);
                    return;
                }
            };

            rt.block_on(async move {
                let (mut keeper, mut stream) = match client.lease_keep_alive(lease_id).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("failed to start lease keepalive for {}: {}", lease_id, e);
                        return;
                    }
                };

                loop {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    if keeper.keep_alive().await.is_err() {
                        debug!("lease {} keepalive send failed, treating as lost", lease_id);
                        return;
                    }
                    match stream.message().await {
                        Ok(Some(_)) => {
                            if tx.send(true).is_err() {
                                return; // receiver gone, nothing left to report to
                            }
                        }
                        _ => {
                            debug!("lease {} keepalive response missing, lease lost", lease_id);
                            return;
                        }
                    }
                }
            });
        })
        .map(|_handle| ())
        .unwrap_or_else(|e| warn!("failed to spawn keepalive thread for lease {}: {}", lease_id, e));
}

impl std::fmt::Debug for EtcdClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EtcdClient {{ alive: {} }}", self.alive.load(Ordering::SeqCst))
    }
}

pub fn mandatory_error(cfg_mandatory: bool, err: anyhow::Error) -> anyhow::Result<()> {
    if cfg_mandatory {
        return Err(err).context("etcd.mandatory is set and the coordination store is unreachable at startup");
    }
    warn!("coordination store unreachable at startup, continuing without it: {:#}", err);
    Ok(())
}
