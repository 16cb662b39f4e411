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

/*! Nodeset range expansion (`"server[1-3,5]"` -> `server1, server2,
server3, server5`), modeled as an injected `Expander` capability per the
configuration engine's re-architecture notes: production uses the pure
fallback implementation here, but a future build could swap in a real
clustershell-style native library behind the same trait without
touching the configuration engine. */

use anyhow::{anyhow, bail};

pub trait Expander {
    /// Expands a single nodeset expression into the literal names it
    /// denotes. Rejects expressions containing `@`, which are reserved
    /// for a different grouping syntax this gateway doesn't support.
    fn expand(&self, expr: &str) -> anyhow::Result<Vec<String>>;
}

/// A pure bracket-expansion implementation with no external
/// dependencies: `prefix[a-b,c,d-e]suffix` expands each comma-separated
/// range or literal within the brackets. Numeric ranges preserve
/// zero-padding width from the lower bound.
#[derive(Debug, Default, Clone, Copy)]
pub struct BracketExpander;

impl Expander for BracketExpander {
    fn expand(&self, expr: &str) -> anyhow::Result<Vec<String>> {
        if expr.contains('@') {
            bail!("nodeset expression '{}' must not contain '@'", expr);
        }

        let Some(open) = expr.find('[') else {
            return Ok(vec![expr.to_string()]);
        };
        let close = expr[open..]
            .find(']')
            .map(|i| i + open)
            .ok_or_else(|| anyhow!("nodeset expression '{}' has an unmatched '['", expr))?;

        let prefix = &expr[..open];
        let body = &expr[open + 1..close];
        let suffix = &expr[close + 1..];

        if suffix.contains('[') {
            bail!("nodeset expression '{}' has more than one bracket group", expr);
        }

        let mut out = Vec::new();
        for part in body.split(',') {
            let part = part.trim();
            if part.is_empty() {
                bail!("nodeset expression '{}' has an empty range element", expr);
            }
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let width = lo.len();
                    let lo_n: u64 = lo
                        .parse()
                        .map_err(|_| anyhow!("nodeset range '{}' has a non-numeric start", part))?;
                    let hi_n: u64 = hi
                        .parse()
                        .map_err(|_| anyhow!("nodeset range '{}' has a non-numeric end", part))?;
                    if hi_n < lo_n {
                        bail!("nodeset range '{}' is inverted", part);
                    }
                    for n in lo_n..=hi_n {
                        out.push(format!("{prefix}{:0width$}{suffix}", n, width = width));
                    }
                }
                None => out.push(format!("{prefix}{part}{suffix}")),
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_literal_passes_through() {
        assert_eq!(BracketExpander.expand("host1").unwrap(), vec!["host1"]);
    }

    #[test]
    fn expands_range() {
        assert_eq!(
            BracketExpander.expand("server[1-3]").unwrap(),
            vec!["server1", "server2", "server3"]
        );
    }

    #[test]
    fn expands_mixed_list() {
        assert_eq!(
            BracketExpander.expand("server[1-3,5]").unwrap(),
            vec!["server1", "server2", "server3", "server5"]
        );
    }

    #[test]
    fn preserves_zero_padding_width() {
        assert_eq!(
            BracketExpander.expand("node[01-03]").unwrap(),
            vec!["node01", "node02", "node03"]
        );
    }

    #[test]
    fn rejects_at_sign() {
        assert!(BracketExpander.expand("server[1-3]@region").is_err());
    }

    #[test]
    fn rejects_unmatched_bracket() {
        assert!(BracketExpander.expand("server[1-3").is_err());
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(BracketExpander.expand("server[5-1]").is_err());
    }

    #[test]
    fn applies_prefix_and_suffix() {
        assert_eq!(
            BracketExpander.expand("web[1-2].example.com").unwrap(),
            vec!["web1.example.com", "web2.example.com"]
        );
    }
}
