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

/*! A cancellable scope, replacing a "done channel": every long-lived
session activity (lease keepalive, background command, parent-death
watch, recorder) holds a clone of the same [`Scope`] and selects on
[`Scope::cancelled`] alongside its own work. The supervisor cancels the
scope once and every activity observes it within one tick of its own
select loop; there is no separate per-activity shutdown signal to wire
up. */

use std::sync::Mutex;

use crossbeam_channel::{bounded, Receiver, Sender};

pub struct Scope {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl Scope {
    pub fn new() -> Scope {
        let (tx, rx) = bounded(0);
        Scope { tx: Mutex::new(Some(tx)), rx }
    }

    /// Cancels the scope. Idempotent; safe to call from any thread,
    /// including from inside one of the activities it governs.
    pub fn cancel(&self) {
        self.tx.lock().unwrap().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.lock().unwrap().is_none()
    }

    /// A receiver that becomes ready (selectable, returning a `RecvError`)
    /// the instant the scope cancels. Cloning is cheap; every activity
    /// keeps its own clone.
    pub fn cancelled(&self) -> Receiver<()> {
        self.rx.clone()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Scope::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cancel_is_observed_by_every_clone() {
        let scope = Scope::new();
        let a = scope.cancelled();
        let b = scope.cancelled();
        assert!(!scope.is_cancelled());

        scope.cancel();
        assert!(scope.is_cancelled());
        assert!(a.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(b.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn cancel_is_idempotent() {
        let scope = Scope::new();
        scope.cancel();
        scope.cancel();
        assert!(scope.is_cancelled());
    }

    #[test]
    fn select_fires_immediately_on_cancel() {
        let scope = Scope::new();
        let rx = scope.cancelled();
        scope.cancel();

        let mut fired = false;
        crossbeam_channel::select! {
            recv(rx) -> _ => fired = true,
            default(Duration::from_millis(200)) => {}
        }
        assert!(fired);
    }
}
