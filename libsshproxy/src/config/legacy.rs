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

/*! Converts a legacy v1 document (flat `routes`/`users`/`groups`
tables) into the override form the current engine understands. This is
a CLI concern, exposed for a future migration tool — it is never called
from the session path. */

use serde_derive::Deserialize;

use super::{MatchAlt, OverrideClause, Policy, PolicyDoc};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LegacyRoute {
    pub name: String,
    pub dest: Vec<String>,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LegacyDoc {
    #[serde(default)]
    pub routes: Vec<LegacyRoute>,
}

/// Rewrites each legacy route into one override clause whose `match`
/// matches on the route's users/groups (when either is non-empty) and
/// whose partial policy replaces `dest`.
pub fn convert_v1(doc: &LegacyDoc) -> PolicyDoc {
    let overrides = doc
        .routes
        .iter()
        .map(|route| {
            let mut alt = MatchAlt::default();
            if !route.users.is_empty() {
                alt.users = Some(route.users.clone());
            }
            if !route.groups.is_empty() {
                alt.groups = Some(route.groups.clone());
            }

            OverrideClause {
                match_: vec![alt],
                policy: Policy { dest: Some(route.dest.clone()), ..Default::default() },
            }
        })
        .collect();

    PolicyDoc { defaults: Policy::default(), overrides }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn converts_one_route_per_override() {
        let legacy = LegacyDoc {
            routes: vec![LegacyRoute {
                name: "web".into(),
                dest: vec!["web1:22".into(), "web2:22".into()],
                users: vec!["alice".into()],
                groups: vec![],
            }],
        };

        let doc = convert_v1(&legacy);
        assert_eq!(doc.overrides.len(), 1);
        assert_eq!(doc.overrides[0].policy.dest, Some(vec!["web1:22".into(), "web2:22".into()]));
        assert_eq!(doc.overrides[0].match_[0].users, Some(vec!["alice".into()]));
        assert_eq!(doc.overrides[0].match_[0].groups, None);
    }

    #[test]
    fn route_with_no_predicates_still_converts() {
        let legacy = LegacyDoc {
            routes: vec![LegacyRoute { name: "catchall".into(), dest: vec!["any:22".into()], ..Default::default() }],
        };
        let doc = convert_v1(&legacy);
        assert_eq!(doc.overrides[0].match_[0].users, None);
        assert_eq!(doc.overrides[0].match_[0].groups, None);
    }
}
