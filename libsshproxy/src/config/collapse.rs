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

/*! Merges a partial [`Policy`] on top of an accumulating one: scalars
are overwritten when present, map fields are merged per key with the
new value winning, `dest` is replaced wholesale. Applying two overrides
that touch disjoint scalar keys in either order yields the same result;
applying two that touch the same key is order-sensitive, with the later
one (by override list order) winning — both are exercised in `load`'s
tests since collapse is pure and order is the caller's concern. */

use super::Policy;

pub fn merge(base: &mut Policy, overlay: &Policy) {
    macro_rules! overwrite {
        ($field:ident) => {
            if overlay.$field.is_some() {
                base.$field = overlay.$field.clone();
            }
        };
    }

    overwrite!(debug);
    overwrite!(log);
    overwrite!(check_interval);
    overwrite!(error_banner);
    overwrite!(dump);
    overwrite!(dump_limit_size);
    overwrite!(dump_limit_window);
    overwrite!(etcd_stats_interval);
    overwrite!(log_stats_interval);
    overwrite!(bg_command);
    overwrite!(blocking_command);
    overwrite!(ssh);
    overwrite!(service);
    overwrite!(route_select);
    overwrite!(mode);
    overwrite!(force_command);
    overwrite!(command_must_match);
    overwrite!(etcd_keyttl);
    overwrite!(max_connections_per_user);
    overwrite!(etcd);

    // dest is replaced, not merged.
    overwrite!(dest);

    // environment and translate_commands merge per key, new value wins.
    if let Some(env) = &overlay.environment {
        let entry = base.environment.get_or_insert_with(Default::default);
        for (k, v) in env {
            entry.insert(k.clone(), v.clone());
        }
    }
    if let Some(tc) = &overlay.translate_commands {
        let entry = base.translate_commands.get_or_insert_with(Default::default);
        for (k, v) in tc {
            entry.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn disjoint_scalar_fields_are_order_independent() {
        let mut a = Policy { debug: Some(true), ..Default::default() };
        let b = Policy { service: Some("prod".into()), ..Default::default() };

        let mut forward = a.clone();
        merge(&mut forward, &b);

        let mut backward = b.clone();
        merge(&mut backward, &a);

        assert_eq!(forward.debug, backward.debug);
        assert_eq!(forward.service, backward.service);

        merge(&mut a, &b);
        assert_eq!(a.debug, Some(true));
        assert_eq!(a.service, Some("prod".into()));
    }

    #[test]
    fn shared_scalar_key_later_wins() {
        let mut base = Policy { service: Some("a".into()), ..Default::default() };
        merge(&mut base, &Policy { service: Some("b".into()), ..Default::default() });
        assert_eq!(base.service, Some("b".into()));
    }

    #[test]
    fn environment_merges_per_key() {
        let mut base = Policy::default();
        base.environment = Some(HashMap::from([("A".to_string(), "1".to_string())]));
        merge(
            &mut base,
            &Policy {
                environment: Some(HashMap::from([("B".to_string(), "2".to_string())])),
                ..Default::default()
            },
        );
        let env = base.environment.unwrap();
        assert_eq!(env.get("A"), Some(&"1".to_string()));
        assert_eq!(env.get("B"), Some(&"2".to_string()));
    }

    #[test]
    fn environment_key_overwritten_by_later_override() {
        let mut base = Policy::default();
        base.environment = Some(HashMap::from([("A".to_string(), "1".to_string())]));
        merge(
            &mut base,
            &Policy {
                environment: Some(HashMap::from([("A".to_string(), "2".to_string())])),
                ..Default::default()
            },
        );
        assert_eq!(base.environment.unwrap().get("A"), Some(&"2".to_string()));
    }

    #[test]
    fn dest_is_replaced_not_merged() {
        let mut base = Policy { dest: Some(vec!["a".into()]), ..Default::default() };
        merge(&mut base, &Policy { dest: Some(vec!["b".into()]), ..Default::default() });
        assert_eq!(base.dest, Some(vec!["b".into()]));
    }
}
