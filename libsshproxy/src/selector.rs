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

/*! The four route selection algorithms. All are deterministic given
their tie-break RNG, and all return the empty string (never an error)
when no candidate destination passes the checker. */

use std::sync::Arc;

use rand::{rngs::StdRng, seq::SliceRandom, Rng};
use serde_derive::{Deserialize, Serialize};
use tracing::instrument;

use crate::checker::Checker;
use crate::coord::Client;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteSelect {
    Ordered,
    Random,
    Connections,
    Bandwidth,
}

/// Selects a destination from `destinations` using `algo`. `rng` supplies
/// the tie-break randomness for `random`/`connections`/`bandwidth`; tests
/// pass a seeded `StdRng` for reproducibility.
#[instrument(skip(checker, client, rng, destinations), fields(algo = ?algo))]
pub fn select(
    algo: RouteSelect,
    destinations: &[String],
    checker: &Checker,
    client: Option<&Arc<dyn Client>>,
    user_key: &str,
    rng: &mut StdRng,
) -> String {
    match algo {
        RouteSelect::Ordered => ordered(destinations, checker),
        RouteSelect::Random => random(destinations, checker, rng),
        RouteSelect::Connections => connections(destinations, checker, client, user_key, rng),
        RouteSelect::Bandwidth => bandwidth(destinations, checker, client, user_key, rng),
    }
}

fn ordered(destinations: &[String], checker: &Checker) -> String {
    for dest in destinations {
        if checker.check(dest) {
            return dest.clone();
        }
    }
    String::new()
}

fn random(destinations: &[String], checker: &Checker, rng: &mut StdRng) -> String {
    let mut shuffled: Vec<String> = destinations.to_vec();
    shuffled.shuffle(rng);
    ordered(&shuffled, checker)
}

fn connections(
    destinations: &[String],
    checker: &Checker,
    client: Option<&Arc<dyn Client>>,
    user_key: &str,
    rng: &mut StdRng,
) -> String {
    let Some(client) = client.filter(|c| c.is_alive()) else {
        return random(destinations, checker, rng);
    };

    let per_user = client.get_user_hosts(user_key).unwrap_or_default();
    let global = client.get_all_connections().unwrap_or_default();

    let mut ranked: Vec<(String, u64, usize, u32)> = destinations
        .iter()
        .map(|d| {
            let per_user_count = per_user.iter().find(|u| &u.dest == d).map(|u| u.count).unwrap_or(0);
            let global_count =
                global.iter().filter(|(k, _)| k.contains(&format!("/{d}/"))).count();
            (d.clone(), per_user_count, global_count, rng.gen::<u32>())
        })
        .collect();

    ranked.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)).then(a.3.cmp(&b.3)));

    let ordered_dests: Vec<String> = ranked.into_iter().map(|(d, ..)| d).collect();
    ordered(&ordered_dests, checker)
}

fn bandwidth(
    destinations: &[String],
    checker: &Checker,
    client: Option<&Arc<dyn Client>>,
    user_key: &str,
    rng: &mut StdRng,
) -> String {
    let Some(client) = client.filter(|c| c.is_alive()) else {
        return random(destinations, checker, rng);
    };

    let per_user = client.get_user_hosts(user_key).unwrap_or_default();

    let mut ranked: Vec<(String, i128, u32)> = destinations
        .iter()
        .map(|d| {
            let usage = per_user.iter().find(|u| &u.dest == d);
            let score = usage.map(|u| u.bandwidth_score()).unwrap_or(0);
            (d.clone(), score, rng.gen::<u32>())
        })
        .collect();

    ranked.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

    let ordered_dests: Vec<String> = ranked.into_iter().map(|(d, ..)| d).collect();
    ordered(&ordered_dests, checker)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::coord::mock::MockClient;
    use rand::SeedableRng;

    fn seeded_rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn ordered_returns_first_reachable() {
        let client: Arc<dyn Client> = Arc::new(MockClient::new());
        client.set_host("downhost:22", crate::coord::model::HostState::Disabled, "2024-01-01T00:00:00Z").unwrap();
        let checker = Checker::new(Some(client), std::time::Duration::from_secs(30));
        let dests = vec!["downhost:22".to_string(), "host3:22".to_string()];
        let mut rng = seeded_rng();
        assert_eq!(select(RouteSelect::Ordered, &dests, &checker, None, "u@s", &mut rng), "host3:22");
    }

    #[test]
    fn totality_empty_when_nothing_reachable() {
        let checker = Checker::new(None, std::time::Duration::from_secs(30));
        let dests = vec!["127.0.0.1:0".to_string()];
        let mut rng = seeded_rng();
        assert_eq!(select(RouteSelect::Ordered, &dests, &checker, None, "u@s", &mut rng), "");
        assert_eq!(select(RouteSelect::Random, &dests, &checker, None, "u@s", &mut rng), "");
    }

    #[test]
    fn connections_degrades_to_random_without_live_client() {
        let checker = Checker::new(None, std::time::Duration::from_secs(30));
        let dests = vec!["127.0.0.1:0".to_string()];
        let mut rng = seeded_rng();
        // degrading to random must not panic and must preserve totality
        assert_eq!(select(RouteSelect::Connections, &dests, &checker, None, "u@s", &mut rng), "");
    }

    #[test]
    fn bandwidth_prefers_lower_score() {
        let client: Arc<dyn Client> = Arc::new(MockClient::new());
        // host_a has heavy bandwidth, host_b is idle
        client.set_destination("alice@default", "gw:1", "host_a:22", 0).unwrap();
        let reg = client.set_destination("alice@default", "gw:1", "host_a:22", 0).unwrap();
        client
            .update_stats(
                &reg.path,
                crate::coord::UpdatedStats { in_kbps: 100, out_stdout_kbps: 100, out_stderr_kbps: 0 },
            )
            .unwrap();

        let checker = Checker::new(Some(Arc::clone(&client)), std::time::Duration::from_secs(30));
        let dests = vec!["host_a:22".to_string(), "host_b:22".to_string()];
        let mut rng = seeded_rng();
        let picked = select(RouteSelect::Bandwidth, &dests, &checker, Some(&client), "alice@default", &mut rng);
        assert_eq!(picked, "host_b:22");
    }
}
