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

//! The receiver does not run PTP itself. An external daemon elects the
//! master clock on the LAN and publishes its findings through a named shared
//! memory region; this module is the read side of that contract plus the
//! single-datagram control channel used to tell the daemon which peers to
//! time against.

pub mod control;
pub mod shm;

use crate::{
    error::ClockResult,
    time::{Nanos, NANOS_PER_MILLI, NANOS_PER_SEC},
};
use std::fmt;

/// Minimum mastership age before a clock may seed an anchor.
pub const AGE_MIN: Nanos = 1_500 * NANOS_PER_MILLI;
/// Mastership age after which a new master may replace the anchor clock.
pub const AGE_STABLE: Nanos = 5 * NANOS_PER_SEC;
/// Samples older than this are rejected outright.
pub const AGE_MAX: Nanos = 10 * NANOS_PER_SEC;

/// A snapshot of the externally published PTP state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockInfo {
    pub clock_id: u64,
    pub master_ip: String,
    /// Local monotonic time at which the offset was measured.
    pub sample_time: Nanos,
    /// local monotonic + raw_offset ≈ network time.
    pub raw_offset: i64,
    pub mastership_start: Nanos,
}

impl ClockInfo {
    pub fn ok(&self) -> bool {
        self.clock_id != 0
    }

    pub fn master_for(&self, now: Nanos) -> Nanos {
        now - self.mastership_start
    }

    pub fn sample_age(&self, now: Nanos) -> Nanos {
        now - self.sample_time
    }

    pub fn is_minimum_age(&self, now: Nanos) -> bool {
        self.master_for(now) >= AGE_MIN
    }

    pub fn is_stable(&self, now: Nanos) -> bool {
        self.master_for(now) >= AGE_STABLE
    }

    pub fn too_old(&self, now: Nanos) -> bool {
        self.sample_age(now) >= AGE_MAX
    }
}

impl fmt::Display for ClockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "clock {:#018x} at {} (sampled {} ms ago at write)",
            self.clock_id,
            self.master_ip,
            self.sample_time / NANOS_PER_MILLI
        )
    }
}

/// What a clock info lookup produced. `Ok` still requires age checks before
/// the snapshot may be used for anchoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClockLookup {
    Ok(ClockInfo),
    /// The region exists but does not carry usable data yet.
    NotReady,
    /// The region reports no elected master.
    NoMaster,
    /// The region cannot be opened at all.
    ServiceUnavailable,
    VersionMismatch { expected: u16, actual: u16 },
}

impl ClockLookup {
    pub fn kind(&self) -> &'static str {
        match self {
            ClockLookup::Ok(_) => "ok",
            ClockLookup::NotReady => "not_ready",
            ClockLookup::NoMaster => "no_master",
            ClockLookup::ServiceUnavailable => "service_unavailable",
            ClockLookup::VersionMismatch { .. } => "version_mismatch",
        }
    }
}

/// The seam between the timing plane and everything else. The production
/// implementation reads shared memory; tests script the sequence of
/// snapshots directly.
pub trait ClockSource: Send + Sync + 'static {
    fn get_clock_info(&self) -> ClockResult<ClockLookup>;
}

/// Wraps a clock source and logs once whenever the lookup outcome changes
/// kind, so transient failures show up exactly once per transition.
pub struct LoggedClockSource<C> {
    inner: C,
    last_kind: std::sync::Mutex<&'static str>,
}

impl<C: ClockSource> LoggedClockSource<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            last_kind: std::sync::Mutex::new(""),
        }
    }
}

impl<C: ClockSource> ClockSource for LoggedClockSource<C> {
    fn get_clock_info(&self) -> crate::error::ClockResult<ClockLookup> {
        let lookup = self.inner.get_clock_info()?;
        let kind = lookup.kind();
        let mut last = self.last_kind.lock().expect("clock log mutex poisoned");
        if *last != kind {
            if last.is_empty() {
                tracing::info!("PTP clock state: {kind}");
            } else {
                tracing::info!("PTP clock state changed: {} -> {kind}", *last);
            }
            *last = kind;
        }
        Ok(lookup)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn info(mastership_start: Nanos, sample_time: Nanos) -> ClockInfo {
        ClockInfo {
            clock_id: 0xfeed,
            master_ip: "10.0.0.2".to_owned(),
            sample_time,
            raw_offset: 0,
            mastership_start,
        }
    }

    #[test]
    fn age_classification() {
        let now = 20 * NANOS_PER_SEC;
        let young = info(now - AGE_MIN / 2, now);
        assert!(!young.is_minimum_age(now));
        assert!(!young.is_stable(now));

        let seeded = info(now - 2 * NANOS_PER_SEC, now);
        assert!(seeded.is_minimum_age(now));
        assert!(!seeded.is_stable(now));

        let stable = info(now - 6 * NANOS_PER_SEC, now);
        assert!(stable.is_stable(now));
    }

    #[test]
    fn stale_sample_is_too_old() {
        let now = 60 * NANOS_PER_SEC;
        let stale = info(0, now - AGE_MAX);
        assert!(stale.too_old(now));
        let fresh = info(0, now - NANOS_PER_SEC);
        assert!(!fresh.too_old(now));
    }

    #[test]
    fn zero_clock_id_is_unusable() {
        let mut i = info(0, 0);
        i.clock_id = 0;
        assert!(!i.ok());
    }
}
