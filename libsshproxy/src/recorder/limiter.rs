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

/*! The dump sink's sliding-window byte rate limiter.

State machine: `open -> (bytes in window <= limit) open`, `open ->
(limit exceeded, no window) closed` (terminal), `open -> (window tick)
open` (accumulator reset). A zero limit means unlimited; a zero window
means there is no recovery tick, so exceeding the limit closes the
dump permanently. */

use std::time::Duration;

pub struct Limiter {
    limit: u64,
    has_window: bool,
    prev_window_bytes: u64,
    cur_window_bytes: u64,
    closed: bool,
}

impl Limiter {
    pub fn new(limit: u64, window: Duration) -> Self {
        Limiter { limit, has_window: !window.is_zero(), prev_window_bytes: 0, cur_window_bytes: 0, closed: false }
    }

    /// Must be called once per record, before the write decision is
    /// acted on. Returns whether this record may still be written to
    /// the dump sink. Window bytes accumulate regardless of the
    /// outcome.
    pub fn admit(&mut self, len: u64) -> bool {
        if self.closed {
            self.cur_window_bytes += len;
            return false;
        }

        let prospective = self.cur_window_bytes + len;
        let admit = self.limit == 0 || (self.prev_window_bytes < self.limit && prospective <= self.limit);
        self.cur_window_bytes = prospective;
        if !admit && !self.has_window {
            self.closed = true;
        }
        admit
    }

    /// Promotes the accumulator to "previous window rate" and resets it.
    pub fn tick(&mut self) {
        self.prev_window_bytes = self.cur_window_bytes;
        self.cur_window_bytes = 0;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unlimited_always_admits() {
        let mut l = Limiter::new(0, Duration::from_secs(1));
        assert!(l.admit(1_000_000));
        assert!(l.admit(1_000_000));
    }

    #[test]
    fn exceeding_without_window_closes_permanently() {
        let mut l = Limiter::new(100, Duration::ZERO);
        assert!(l.admit(50));
        assert!(!l.admit(100)); // 50+100 > 100, over limit
        assert!(l.is_closed());
        assert!(!l.admit(1)); // stays closed even for tiny records
    }

    #[test]
    fn window_tick_reopens_admission() {
        let mut l = Limiter::new(100, Duration::from_secs(1));
        assert!(l.admit(80));
        assert!(!l.admit(80)); // 80+80 over 100 in the current window
        assert!(!l.is_closed()); // has a window, so not permanently closed

        l.tick();
        // previous window was 160 (>limit), so still throttled this window
        assert!(!l.admit(10));

        l.tick();
        // previous window now 10 (<limit); fresh window is also empty
        assert!(l.admit(10));
    }

    #[test]
    fn bytes_accumulate_even_when_not_admitted() {
        let mut l = Limiter::new(10, Duration::from_secs(1));
        assert!(l.admit(5));
        assert!(!l.admit(50));
        l.tick();
        // the rejected 50 bytes were still counted into the window that
        // just closed, so the new window starts throttled too
        assert!(!l.admit(1));
    }
}
