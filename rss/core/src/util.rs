// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current time as epoch millis. Deadlines and heartbeats use this clock.
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Bounded exponential backoff: `base << attempt`, capped.
///
/// `attempt` is zero-based; retry loops sleep this long before attempt
/// `attempt + 1`.
pub fn backoff_delay(attempt: usize, base_ms: u64, cap_ms: u64) -> Duration {
    let exp = attempt.min(16) as u32;
    let delay = base_ms.saturating_mul(1u64 << exp).min(cap_ms);
    Duration::from_millis(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(0, 100, 5000), Duration::from_millis(100));
        assert_eq!(backoff_delay(1, 100, 5000), Duration::from_millis(200));
        assert_eq!(backoff_delay(3, 100, 5000), Duration::from_millis(800));
        assert_eq!(backoff_delay(10, 100, 5000), Duration::from_millis(5000));
        // Huge attempt numbers must not overflow.
        assert_eq!(backoff_delay(usize::MAX, 100, 5000), Duration::from_millis(5000));
    }
}
