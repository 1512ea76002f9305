// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use std::{
    thread,
    time::{Duration, Instant},
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_TICK: Duration = Duration::from_millis(100);

/// Wait for the given predicate to return true or fail.
pub fn eventually<F>(predicate: F, error_msg: &str)
where
    F: Fn() -> bool,
{
    eventually_within(DEFAULT_TIMEOUT, predicate, error_msg)
}

/// Wait up to `timeout` for the given predicate to return true or fail. Polls with a
/// doubling interval.
pub fn eventually_within<F>(timeout: Duration, predicate: F, error_msg: &str)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    let mut tick = Duration::from_millis(5);

    loop {
        if predicate() {
            return;
        }
        if Instant::now() > deadline {
            panic!("{}", error_msg);
        }

        thread::sleep(tick);
        tick = std::cmp::min(tick * 2, MAX_TICK);
    }
}
