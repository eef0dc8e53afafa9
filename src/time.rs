/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Nanosecond clock reads. All scheduling decisions in the receiver are made
//! against CLOCK_MONOTONIC_RAW; the PTP offset published by the external
//! daemon localizes network time onto the same timeline.

use crate::error::{SystemClockError, SystemClockResult};
use libc::{CLOCK_MONOTONIC_RAW, CLOCK_REALTIME, clock_gettime, clockid_t, timespec};

pub type Nanos = i64;

pub const NANOS_PER_SEC: i64 = 1_000_000_000;
pub const NANOS_PER_MILLI: i64 = 1_000_000;

pub fn monotonic_ns() -> SystemClockResult<Nanos> {
    let tp = system_time_for_clock_id(CLOCK_MONOTONIC_RAW)?;
    Ok(tp.tv_sec as i64 * NANOS_PER_SEC + tp.tv_nsec as i64)
}

pub fn realtime_ns() -> SystemClockResult<Nanos> {
    let tp = system_time_for_clock_id(CLOCK_REALTIME)?;
    Ok(tp.tv_sec as i64 * NANOS_PER_SEC + tp.tv_nsec as i64)
}

fn system_time_for_clock_id(clock_id: clockid_t) -> SystemClockResult<timespec> {
    let mut tp = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { clock_gettime(clock_id, &mut tp) } == -1 {
        Err(SystemClockError("could not get system time".to_owned()))
    } else {
        Ok(tp)
    }
}

pub fn seconds_to_ns(seconds: f64) -> Nanos {
    (seconds * NANOS_PER_SEC as f64) as Nanos
}
