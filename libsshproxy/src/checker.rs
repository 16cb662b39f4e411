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

/*! TCP reachability probing with a coordination-store-backed cache. */

use std::{
    net::TcpStream,
    sync::{Arc, Mutex},
    time::SystemTime,
};

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::consts::HOST_CHECK_TIMEOUT;
use crate::coord::{
    model::{Host, HostState},
    Client,
};
use crate::errors::GatewayError;

/// The outcome of the most recent `check` call, readable for log
/// attribution without re-running the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastState {
    Up,
    Down,
    Disabled,
    CachedUp,
    CachedDown,
}

pub struct Checker {
    client: Option<Arc<dyn Client>>,
    check_interval: std::time::Duration,
    last_state: Mutex<Option<LastState>>,
}

impl Checker {
    pub fn new(client: Option<Arc<dyn Client>>, check_interval: std::time::Duration) -> Self {
        Checker { client, check_interval, last_state: Mutex::new(None) }
    }

    pub fn last_state(&self) -> Option<LastState> {
        *self.last_state.lock().unwrap()
    }

    #[instrument(skip(self), fields(hostport = %hostport))]
    pub fn check(&self, hostport: &str) -> bool {
        let result = self.check_inner(hostport);
        *self.last_state.lock().unwrap() = Some(result);
        matches!(result, LastState::Up | LastState::CachedUp)
    }

    fn check_inner(&self, hostport: &str) -> LastState {
        if let Some(client) = &self.client {
            if client.is_alive() {
                match client.get_host(hostport) {
                    Ok(host) => {
                        if host.state == HostState::Disabled {
                            debug!("host {} administratively disabled", hostport);
                            return LastState::Disabled;
                        }
                        if let Some(age) = age_of(&host) {
                            if age < self.check_interval {
                                return match host.state {
                                    HostState::Up => LastState::CachedUp,
                                    _ => LastState::CachedDown,
                                };
                            }
                        }
                    }
                    Err(e) if e.downcast_ref::<GatewayError>() == Some(&GatewayError::NotFound) => {}
                    Err(e) => warn!("get_host({}) failed, probing live: {:#}", hostport, e),
                }
            }
        }

        let up = probe(hostport);
        if let Some(client) = &self.client {
            if client.is_alive() {
                let ts = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
                let state = if up { HostState::Up } else { HostState::Down };
                if let Err(e) = client.set_host(hostport, state, &ts) {
                    warn!("set_host({}) failed: {:#}", hostport, e);
                }
            }
        }

        if up {
            LastState::Up
        } else {
            LastState::Down
        }
    }
}

fn probe(hostport: &str) -> bool {
    use std::net::ToSocketAddrs;
    match hostport.to_socket_addrs() {
        Ok(addrs) => addrs
            .into_iter()
            .any(|addr| TcpStream::connect_timeout(&addr, HOST_CHECK_TIMEOUT).is_ok()),
        Err(_) => false,
    }
}

fn age_of(host: &Host) -> Option<std::time::Duration> {
    let ts: DateTime<Utc> = host.ts.parse().ok()?;
    let now: DateTime<Utc> = SystemTime::now().into();
    (now - ts).to_std().ok()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::coord::mock::MockClient;
    use std::time::Duration;

    #[test]
    fn disabled_host_short_circuits_without_probe() {
        let client = Arc::new(MockClient::new());
        client.set_host("host1:1", HostState::Disabled, &Utc::now().to_rfc3339()).unwrap();
        let checker = Checker::new(Some(client), Duration::from_secs(30));
        assert!(!checker.check("host1:1"));
        assert_eq!(checker.last_state(), Some(LastState::Disabled));
    }

    #[test]
    fn cached_down_within_interval_skips_probe() {
        let client = Arc::new(MockClient::new());
        let ts = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
        client.set_host("host1:1", HostState::Down, &ts).unwrap();
        let checker = Checker::new(Some(client), Duration::from_secs(300));
        assert!(!checker.check("host1:1"));
        assert_eq!(checker.last_state(), Some(LastState::CachedDown));
    }

    #[test]
    fn no_client_falls_back_to_live_probe() {
        // port 0 on localhost should fail to connect quickly
        let checker = Checker::new(None, Duration::from_secs(30));
        assert!(!checker.check("127.0.0.1:0"));
    }
}
