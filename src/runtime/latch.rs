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
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Countdown whose initial value encodes the expected first-page
/// population. The event listener can force it to zero.
pub(crate) struct CountDownLatch {
    count: Mutex<u64>,
    cv: Condvar,
}

impl CountDownLatch {
    pub(crate) fn new(count: u64) -> Self {
        Self {
            count: Mutex::new(count),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn count(&self) -> u64 {
        *self.count.lock().expect("latch lock")
    }

    pub(crate) fn count_down(&self) {
        let mut count = self.count.lock().expect("latch lock");
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.cv.notify_all();
            }
        }
    }

    /// Drops the count straight to zero, waking every waiter.
    pub(crate) fn force_release(&self) {
        let mut count = self.count.lock().expect("latch lock");
        *count = 0;
        self.cv.notify_all();
    }

    /// True when the latch reached zero within `timeout`.
    pub(crate) fn await_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock().expect("latch lock");
        loop {
            if *count == 0 {
                return true;
            }
            let (next, res) = self
                .cv
                .wait_timeout(count, timeout)
                .expect("latch wait");
            count = next;
            if *count == 0 {
                return true;
            }
            if res.timed_out() {
                return false;
            }
        }
    }
}
