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

/*! The error kinds the gateway distinguishes, plus the exit code each one
maps to. Everywhere else in the crate errors are plain `anyhow::Result`;
`GatewayError` only exists for the handful of places that need to branch
on *which* failure happened (exit code selection in `main`, banner
selection in the resolver's caller) and is pulled back out of an
`anyhow::Error` with `downcast_ref`/`downcast`, the same idiom the
teacher uses for its own marker errors. */

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Malformed YAML, unknown enum value, unresolvable source, invalid
    /// destination, invalid nodeset, missing `SSH_CONNECTION`. Fatal at
    /// startup.
    BadConfig(String),
    /// Any coordination-store operation error other than a clean missing
    /// key. Non-fatal unless `etcd.mandatory`.
    StoreUnavailable(String),
    /// Clean missing-key from the store. An expected, silent outcome;
    /// callers match on this to distinguish "absent" from "broken."
    NotFound,
    /// The resolver produced an empty destination string. Fatal; prints
    /// the banner to the user.
    NoDestination,
    /// The admission-control limit was hit.
    TooManyConnections,
    /// `command_must_match` was violated.
    CommandRejected,
    /// The precondition command exited non-zero; carries its exit code.
    BlockingFailed(i32),
    ChildSpawnFailed(String),
    ChildWaitFailed(String),
}

impl GatewayError {
    /// The process exit code this error maps to, per the invocation
    /// contract: the child ssh process's exit code normally, except for
    /// the fatal conditions enumerated here.
    pub fn exit_code(&self) -> i32 {
        match self {
            GatewayError::CommandRejected => 1,
            GatewayError::BlockingFailed(code) => *code,
            GatewayError::ChildSpawnFailed(_) | GatewayError::ChildWaitFailed(_) => -1,
            _ => 1,
        }
    }

    pub fn is_fatal(&self) -> bool {
        !matches!(self, GatewayError::NotFound | GatewayError::StoreUnavailable(_))
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::BadConfig(msg) => write!(f, "bad config: {msg}"),
            GatewayError::StoreUnavailable(msg) => write!(f, "coordination store unavailable: {msg}"),
            GatewayError::NotFound => write!(f, "not found"),
            GatewayError::NoDestination => write!(f, "no destination selectable"),
            GatewayError::TooManyConnections => write!(f, "too many connections for this user"),
            GatewayError::CommandRejected => write!(f, "requested command does not match the forced command"),
            GatewayError::BlockingFailed(code) => write!(f, "blocking precondition command exited {code}"),
            GatewayError::ChildSpawnFailed(msg) => write!(f, "failed to spawn child ssh process: {msg}"),
            GatewayError::ChildWaitFailed(msg) => write!(f, "failed to wait on child ssh process: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(GatewayError::CommandRejected.exit_code(), 1);
        assert_eq!(GatewayError::BlockingFailed(7).exit_code(), 7);
        assert_eq!(GatewayError::ChildSpawnFailed("boom".into()).exit_code(), -1);
        assert_eq!(GatewayError::NoDestination.exit_code(), 1);
    }

    #[test]
    fn fatality() {
        assert!(!GatewayError::NotFound.is_fatal());
        assert!(!GatewayError::StoreUnavailable("timeout".into()).is_fatal());
        assert!(GatewayError::BadConfig("bad yaml".into()).is_fatal());
    }

    #[test]
    fn downcast_from_anyhow() {
        let err: anyhow::Error = GatewayError::NoDestination.into();
        let got = err.downcast_ref::<GatewayError>();
        assert_eq!(got, Some(&GatewayError::NoDestination));
    }
}
