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

//! The anchor model maps RTP frame numbers onto local monotonic nanoseconds.
//! The source declares `(clock_id, rtp_time, network_ns)` anchors over RTSP
//! or the control channel; the PTP clock source supplies the offset that
//! localizes them. The validated result, [`AnchorLast`], is the single
//! authority the player and the resend engine consult.

use crate::{
    ptp::{AGE_MIN, AGE_STABLE, ClockInfo, ClockLookup},
    time::{NANOS_PER_SEC, Nanos},
};
use tracing::{debug, info, warn};

/// Anchor parameters as declared by the source. An all-zero value tears the
/// anchor state down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AnchorData {
    pub clock_id: u64,
    pub rtp_time: u32,
    /// On the network timeline.
    pub anchor_time: Nanos,
    pub flags: u64,
}

impl AnchorData {
    pub fn is_empty(&self) -> bool {
        self.clock_id == 0 && self.rtp_time == 0 && self.anchor_time == 0
    }

    fn match_details(&self, other: &AnchorData) -> bool {
        self.rtp_time == other.rtp_time && self.anchor_time == other.anchor_time
    }
}

/// The validated anchor the player actually uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorLast {
    pub clock_id: u64,
    pub rtp_time: u32,
    pub anchor_time: Nanos,
    /// anchor_time − raw_offset: the anchor instant on the local monotonic
    /// timeline.
    pub localized: Nanos,
    /// Mastership age of the clock at adoption.
    pub master_at: Nanos,
    pub updated_at: Nanos,
}

impl AnchorLast {
    /// The one conversion routine. The RTP difference is taken modulo 2^32
    /// and sign-extended so wrap-around frames land on the right side.
    pub fn frame_to_local_ns(&self, rtp: u32, input_rate: usize) -> Nanos {
        let frame_diff = rtp.wrapping_sub(self.rtp_time) as i32 as i64;
        self.localized + (frame_diff * NANOS_PER_SEC) / input_rate as i64
    }

    pub fn local_ns_to_frame(&self, local: Nanos, input_rate: usize) -> u32 {
        let frame_diff = ((local - self.localized) * input_rate as i64) / NANOS_PER_SEC;
        self.rtp_time.wrapping_add(frame_diff as u32)
    }
}

/// Outcome of an anchor lookup: either a usable anchor or the reason there
/// is none right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorStatus {
    Ok(AnchorLast),
    /// The source never declared an anchor.
    NoAnchorInfo,
    /// A master exists but has not been master long enough.
    ClockNotReady,
    /// No usable clock at all.
    ClockNotValid,
}

impl AnchorStatus {
    pub fn anchor(self) -> Option<AnchorLast> {
        match self {
            AnchorStatus::Ok(last) => Some(last),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct Anchor {
    /// Anchor as first declared by the source for this session. When the
    /// original master returns we snap back to these values.
    source: Option<AnchorData>,
    /// Latest declaration, possibly rebased onto a different master clock.
    live: Option<AnchorData>,
    last: Option<AnchorLast>,
    clock_is_new: bool,
    mismatch_reports: u64,
}

impl Anchor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a source-declared anchor.
    pub fn save(&mut self, data: AnchorData) {
        if data.is_empty() {
            debug!("Empty anchor declared, clearing anchor state.");
            self.reset();
            return;
        }

        if let Some(live) = &self.live {
            let clock_changed = live.clock_id != data.clock_id;
            if !clock_changed && !live.match_details(&data) {
                // parameters moved under the same clock before it stabilized
                if let Some(last) = &self.last {
                    if last.master_at < AGE_STABLE {
                        info!(
                            "Anchor parameters changed before clock {:#018x} stabilized, dropping validated anchor.",
                            last.clock_id
                        );
                        self.last = None;
                    }
                }
            }
            if clock_changed {
                self.clock_is_new = true;
            }
        }

        if self.source.is_none() {
            self.source = Some(data);
        }
        self.live = Some(data);
    }

    pub fn reset(&mut self) {
        self.source = None;
        self.live = None;
        self.last = None;
        self.clock_is_new = false;
    }

    pub fn has_source_data(&self) -> bool {
        self.live.is_some()
    }

    /// Resolve the current anchor against a clock lookup, per the decision
    /// table: adopt on minimum age, refresh on stability, rebase when the
    /// master moves, and hold the previous answer through transients.
    pub fn get_data(&mut self, lookup: &ClockLookup, now: Nanos) -> AnchorStatus {
        let Some(live) = self.live else {
            return AnchorStatus::NoAnchorInfo;
        };

        match lookup {
            ClockLookup::Ok(clock) if clock.too_old(now) => self.hold_or(AnchorStatus::ClockNotValid),
            ClockLookup::Ok(clock) if clock.clock_id == live.clock_id => {
                self.same_clock(live, clock, now)
            }
            ClockLookup::Ok(clock) => self.master_changed(live, clock, now),
            ClockLookup::NotReady => self.hold_or(AnchorStatus::ClockNotReady),
            _ => self.hold_or(AnchorStatus::ClockNotValid),
        }
    }

    fn same_clock(&mut self, live: AnchorData, clock: &ClockInfo, now: Nanos) -> AnchorStatus {
        self.mismatch_reports = 0;

        if !clock.is_minimum_age(now) {
            debug!(
                "Master clock {:#018x} not old enough yet: {} ms of mastership.",
                clock.clock_id,
                clock.master_for(now) / 1_000_000
            );
            return self.hold_or(AnchorStatus::ClockNotReady);
        }

        if clock.is_stable(now) || self.last.is_none() {
            let first_adoption = self.last.is_none();
            self.last = Some(AnchorLast {
                clock_id: live.clock_id,
                rtp_time: live.rtp_time,
                anchor_time: live.anchor_time,
                localized: live.anchor_time - clock.raw_offset,
                master_at: clock.master_for(now),
                updated_at: now,
            });
            if first_adoption || self.clock_is_new {
                info!(
                    "Clock {:#018x} is now the anchor clock and master clock, mastership {} ms.",
                    live.clock_id,
                    clock.master_for(now) / 1_000_000
                );
                self.clock_is_new = false;
            }
        }

        self.hold_or(AnchorStatus::ClockNotReady)
    }

    /// The master clock and the anchor clock differ. Once the previous
    /// answer has aged past stability, rebase the anchor onto the new master
    /// using its offset; if the returning master is the original source
    /// clock, snap back to the source-declared times.
    fn master_changed(&mut self, live: AnchorData, clock: &ClockInfo, now: Nanos) -> AnchorStatus {
        let Some(last) = self.last else {
            self.report_mismatch(live.clock_id, clock.clock_id);
            return AnchorStatus::ClockNotValid;
        };

        if self.clock_is_new || now - last.updated_at <= AGE_STABLE {
            self.report_mismatch(live.clock_id, clock.clock_id);
            return AnchorStatus::Ok(last);
        }

        let mut rebased = live;
        rebased.anchor_time = last.localized + clock.raw_offset;

        if let Some(source) = self.source.filter(|s| s.clock_id == clock.clock_id) {
            let cumulative_deviation = rebased.anchor_time - source.anchor_time;
            info!(
                "Master clock has become equal to the anchor clock again; the estimated clock time was {:.3} ms ahead(+)/behind(−) the real clock time.",
                cumulative_deviation as f64 / 1e6
            );
            rebased = source;
        } else {
            info!(
                "Master clock has changed to {:#018x}, rebasing anchor.",
                clock.clock_id
            );
            rebased.clock_id = clock.clock_id;
        }

        self.live = Some(rebased);
        self.last = Some(AnchorLast {
            clock_id: rebased.clock_id,
            rtp_time: rebased.rtp_time,
            anchor_time: rebased.anchor_time,
            localized: rebased.anchor_time - clock.raw_offset,
            master_at: clock.master_for(now),
            updated_at: now,
        });

        self.hold_or(AnchorStatus::ClockNotValid)
    }

    fn hold_or(&self, fallback: AnchorStatus) -> AnchorStatus {
        match self.last {
            Some(last) => AnchorStatus::Ok(last),
            None => fallback,
        }
    }

    fn report_mismatch(&mut self, live_clock: u64, master_clock: u64) {
        self.mismatch_reports += 1;
        // one line when the mismatch first appears, then throttled
        if self.mismatch_reports == 1 || self.mismatch_reports.is_multiple_of(64) {
            warn!(
                "Anchor not usable, clocks differ: live={live_clock:#018x} master={master_clock:#018x}"
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::INPUT_RATE;
    use crate::time::NANOS_PER_SEC;

    const T0: Nanos = 100 * NANOS_PER_SEC;

    fn clock(clock_id: u64, mastership: Nanos, offset: i64, now: Nanos) -> ClockLookup {
        ClockLookup::Ok(ClockInfo {
            clock_id,
            master_ip: "10.0.0.9".to_owned(),
            sample_time: now,
            raw_offset: offset,
            mastership_start: now - mastership,
        })
    }

    fn declared(clock_id: u64) -> AnchorData {
        AnchorData {
            clock_id,
            rtp_time: 10_000,
            anchor_time: T0 + 2 * NANOS_PER_SEC,
            flags: 0,
        }
    }

    #[test]
    fn no_anchor_without_source_data() {
        let mut anchor = Anchor::new();
        let lookup = clock(1, AGE_STABLE + 1, 0, T0);
        assert_eq!(anchor.get_data(&lookup, T0), AnchorStatus::NoAnchorInfo);
    }

    #[test]
    fn young_master_does_not_seed() {
        let mut anchor = Anchor::new();
        anchor.save(declared(1));
        let lookup = clock(1, AGE_MIN / 2, 0, T0);
        assert_eq!(anchor.get_data(&lookup, T0), AnchorStatus::ClockNotReady);
    }

    #[test]
    fn minimum_age_master_seeds_anchor() {
        let mut anchor = Anchor::new();
        anchor.save(declared(1));
        let lookup = clock(1, AGE_MIN + 1, 500, T0);
        let status = anchor.get_data(&lookup, T0);
        let last = status.anchor().expect("anchor should be adopted");
        assert_eq!(last.clock_id, 1);
        assert_eq!(last.localized, declared(1).anchor_time - 500);
    }

    #[test]
    fn save_is_idempotent() {
        let mut anchor = Anchor::new();
        anchor.save(declared(1));
        let lookup = clock(1, AGE_STABLE + 1, 500, T0);
        let first = anchor.get_data(&lookup, T0);
        anchor.save(declared(1));
        let second = anchor.get_data(&lookup, T0);
        assert_eq!(first, second);
    }

    #[test]
    fn empty_anchor_tears_down() {
        let mut anchor = Anchor::new();
        anchor.save(declared(1));
        let lookup = clock(1, AGE_STABLE + 1, 0, T0);
        assert!(anchor.get_data(&lookup, T0).anchor().is_some());
        anchor.save(AnchorData::default());
        assert_eq!(anchor.get_data(&lookup, T0), AnchorStatus::NoAnchorInfo);
    }

    #[test]
    fn master_change_rebases_after_stability() {
        let mut anchor = Anchor::new();
        anchor.save(declared(1));
        let lookup = clock(1, AGE_STABLE + 1, 1_000, T0);
        let original = anchor.get_data(&lookup, T0).anchor().unwrap();

        // master moves to clock 2 with a different offset; within the
        // stability window the old answer holds
        let moved = clock(2, AGE_STABLE + 1, 4_000, T0 + NANOS_PER_SEC);
        let held = anchor.get_data(&moved, T0 + NANOS_PER_SEC).anchor().unwrap();
        assert_eq!(held.clock_id, 1);
        assert_eq!(held.localized, original.localized);

        // after the window the anchor is rebased onto clock 2, preserving
        // the localized instant
        let later = T0 + 2 * AGE_STABLE;
        let moved = clock(2, AGE_STABLE + 1, 4_000, later);
        let rebased = anchor.get_data(&moved, later).anchor().unwrap();
        assert_eq!(rebased.clock_id, 2);
        assert_eq!(rebased.localized, original.localized);
    }

    #[test]
    fn returning_source_clock_snaps_back() {
        let mut anchor = Anchor::new();
        anchor.save(declared(1));
        let lookup = clock(1, AGE_STABLE + 1, 1_000, T0);
        anchor.get_data(&lookup, T0).anchor().unwrap();

        // rebase onto clock 2
        let t1 = T0 + 2 * AGE_STABLE;
        anchor.get_data(&clock(2, AGE_STABLE + 1, 9_000, t1), t1);

        // clock 1 returns; the source-declared anchor times win again
        let t2 = t1 + 2 * AGE_STABLE;
        let back = anchor.get_data(&clock(1, AGE_STABLE + 1, 1_200, t2), t2);
        let last = back.anchor().unwrap();
        assert_eq!(last.clock_id, 1);
        assert_eq!(last.anchor_time, declared(1).anchor_time);
    }

    #[test]
    fn conversion_is_one_second_per_input_rate() {
        let last = AnchorLast {
            clock_id: 1,
            rtp_time: 44_100,
            anchor_time: T0,
            localized: T0,
            master_at: AGE_STABLE,
            updated_at: T0,
        };
        let diff = last.frame_to_local_ns(2 * INPUT_RATE as u32, INPUT_RATE)
            - last.frame_to_local_ns(INPUT_RATE as u32, INPUT_RATE);
        assert!((diff - NANOS_PER_SEC).abs() <= NANOS_PER_SEC / INPUT_RATE as i64);
    }

    #[test]
    fn conversion_handles_rtp_wrap() {
        let last = AnchorLast {
            clock_id: 1,
            rtp_time: u32::MAX - 100,
            anchor_time: T0,
            localized: T0,
            master_at: AGE_STABLE,
            updated_at: T0,
        };
        // 200 frames after the anchor, across the 2^32 boundary
        let t = last.frame_to_local_ns(99, INPUT_RATE);
        let expected = T0 + (201 * NANOS_PER_SEC) / INPUT_RATE as i64;
        assert_eq!(t, expected);
        // and 100 frames before it
        let earlier = last.frame_to_local_ns(u32::MAX - 200, INPUT_RATE);
        assert!(earlier < T0);
    }
}
