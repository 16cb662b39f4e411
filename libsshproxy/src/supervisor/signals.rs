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

/*! SIGINT/SIGHUP/SIGTERM cancel the session's scope; SIGWINCH is
handled separately by the pty path, scoped to its own lifetime. */

use std::sync::Arc;
use std::thread;

use anyhow::Context;
use signal_hook::iterator::Signals;
use tracing::info;

use crate::scope::Scope;

const HANDLED: &[i32] = &[
    signal_hook::consts::SIGINT,
    signal_hook::consts::SIGHUP,
    signal_hook::consts::SIGTERM,
];

/// Spawns the signal-handling thread and returns its join handle. The
/// thread exits on its own once the scope is cancelled by any means
/// (including a caught signal), so callers don't need to signal it.
pub fn spawn(scope: Arc<Scope>) -> anyhow::Result<thread::JoinHandle<()>> {
    let mut signals = Signals::new(HANDLED).context("registering session signal handler")?;
    let cancelled = scope.cancelled();

    Ok(thread::spawn(move || loop {
        crossbeam_channel::select! {
            recv(cancelled) -> _ => return,
            default(std::time::Duration::from_millis(200)) => {
                if let Some(sig) = signals.pending().next() {
                    info!(signal = sig, "caught signal, cancelling session scope");
                    scope.cancel();
                    return;
                }
            }
        }
    }))
}
