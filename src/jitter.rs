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

//! Fixed-size jitter buffer: 1024 slots of decoded audio keyed by the low
//! bits of the 16-bit RTP sequence number. Cursor ordering is defined by
//! signed 16-bit subtraction so the sequence space wraps cleanly at 65 536.

use crate::time::Nanos;
use tracing::{debug, warn};

pub const BUFFER_FRAMES: usize = 1024;

const fn buf_idx(seq: u16) -> usize {
    (seq as usize) & (BUFFER_FRAMES - 1)
}

/// `b` strictly after `a` in sequence space.
pub const fn seq_after(a: u16, b: u16) -> bool {
    (b.wrapping_sub(a) as i16) > 0
}

/// Slot status bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStatus(pub u8);

impl FrameStatus {
    pub const MISSING: u8 = 1 << 0;
    pub const BAD: u8 = 1 << 1;
    pub const TOO_LATE: u8 = 1 << 2;
    pub const TOO_EARLY: u8 = 1 << 3;
    pub const RECENTLY_REQUESTED: u8 = 1 << 4;

    pub fn set(&mut self, bit: u8) {
        self.0 |= bit;
    }

    pub fn clear(&mut self, bit: u8) {
        self.0 &= !bit;
    }

    pub fn has(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

/// One slot of the ring.
#[derive(Debug, Clone, Default)]
pub struct AudioFrame {
    pub sequence_number: u16,
    /// RTP frame number of the first sample.
    pub given_timestamp: u32,
    /// PCM frames in `data`.
    pub length: u32,
    pub ready: bool,
    pub status: FrameStatus,
    pub resend_request_count: u32,
    /// When the slot was filled, or when the gap was first observed.
    pub initialisation_time: Nanos,
    /// Zero, or when the last resend was requested.
    pub resend_time: Nanos,
    pub data: Vec<u8>,
}

impl AudioFrame {
    fn mark_missing(&mut self, now: Nanos) {
        self.ready = false;
        self.resend_request_count = 0;
        self.initialisation_time = now;
        self.status = FrameStatus(FrameStatus::MISSING);
        self.resend_time = 0;
        self.given_timestamp = 0;
        self.sequence_number = 0;
        self.data.clear();
    }

    fn consume(&mut self) {
        self.ready = false;
        self.status = FrameStatus::default();
        self.resend_request_count = 0;
        self.initialisation_time = 0;
        self.resend_time = 0;
        self.given_timestamp = 0;
        self.sequence_number = 0;
        self.length = 0;
        self.data = Vec::new();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    FirstPacket,
    InSequence,
    /// Slots were newly marked missing before this packet was placed.
    GapFilled(u16),
    Late,
    TooLate,
    Bad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDisposition {
    /// Flush the whole buffer, request satisfied.
    Needed { drop_request: bool },
    /// Flush frame is past the end of the buffer: flush all, keep waiting.
    Pending,
    /// Flush frame precedes the buffer, nothing to do.
    Expired,
    /// Flush frame is implausibly far in the future.
    Discarded,
    /// Not synced or nothing buffered; request withdrawn.
    NotApplicable,
}

/// The frame handed to the player. A `silent` frame stands in for a slot
/// that never became ready.
#[derive(Debug)]
pub struct TakenFrame {
    pub sequence_number: u16,
    pub given_timestamp: u32,
    pub length: u32,
    pub status: FrameStatus,
    pub resend_request_count: u32,
    pub silent: bool,
    pub data: Vec<u8>,
}

pub struct JitterBuffer {
    frames: Vec<AudioFrame>,
    pub ab_read: u16,
    pub ab_write: u16,
    pub ab_synced: bool,
    pub ab_buffering: bool,
    pub missing_packets: u64,
    pub late_packets: u64,
    pub too_late_packets: u64,
    pub packet_count: u64,
    pub packet_count_since_flush: u64,
    pub time_of_last_audio_packet: Nanos,
    pub flush_requested: bool,
    pub flush_rtp_timestamp: u32,
    pub flush_output_flushed: bool,
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl JitterBuffer {
    pub fn new() -> Self {
        Self {
            frames: vec![AudioFrame::default(); BUFFER_FRAMES],
            ab_read: 0,
            ab_write: 0,
            ab_synced: false,
            ab_buffering: true,
            missing_packets: 0,
            late_packets: 0,
            too_late_packets: 0,
            packet_count: 0,
            packet_count_since_flush: 0,
            time_of_last_audio_packet: 0,
            flush_requested: false,
            flush_rtp_timestamp: 0,
            flush_output_flushed: false,
        }
    }

    /// Empty all slots and return to the pre-sync state.
    pub fn resync(&mut self) {
        for frame in &mut self.frames {
            frame.consume();
        }
        self.ab_synced = false;
        self.ab_buffering = true;
        self.packet_count_since_flush = 0;
    }

    /// Signed occupancy `ab_write − ab_read`.
    pub fn occupancy(&self) -> i16 {
        self.ab_write.wrapping_sub(self.ab_read) as i16
    }

    pub fn request_flush(&mut self, rtp_timestamp: u32) {
        self.flush_requested = true;
        self.flush_rtp_timestamp = rtp_timestamp;
    }

    /// Place a decoded packet. `None` for `pcm` records a bad (undecodable)
    /// packet so the slot substitutes silence instead of waiting forever.
    pub fn put_packet(
        &mut self,
        seq: u16,
        rtp_time: u32,
        pcm: Option<Vec<u8>>,
        n_frames: u32,
        now: Nanos,
    ) -> PutOutcome {
        self.packet_count += 1;
        self.packet_count_since_flush += 1;
        self.time_of_last_audio_packet = now;

        // a flush to frame 0 requested before any packet arrived is void
        if self.packet_count == 1 && self.flush_requested && self.flush_rtp_timestamp == 0 {
            self.flush_requested = false;
        }

        let mut outcome;
        let slot;

        if !self.ab_synced {
            self.ab_write = seq;
            self.ab_read = seq;
            self.ab_synced = true;
            debug!("Jitter buffer synced by first packet, seqno {seq}.");
            outcome = PutOutcome::FirstPacket;
            slot = Some(seq);
        } else if self.ab_write == seq {
            outcome = PutOutcome::InSequence;
            slot = Some(seq);
            self.ab_write = seq.wrapping_add(1);
        } else if seq_after(self.ab_write, seq) {
            // every skipped slot is marked missing so the player substitutes
            // exactly one silent frame per sequence number; a gap wider than
            // the ring aliases onto it and overwrites unplayed slots
            let gap = seq.wrapping_sub(self.ab_write);
            for i in 0..gap {
                let idx = buf_idx(self.ab_write.wrapping_add(i));
                self.frames[idx].mark_missing(now);
            }
            outcome = PutOutcome::GapFilled(gap);
            slot = Some(seq);
            self.ab_write = seq.wrapping_add(1);
        } else if seq_after(self.ab_read, seq) {
            // before the write cursor but still ahead of the read cursor
            self.late_packets += 1;
            outcome = PutOutcome::Late;
            slot = Some(seq);
        } else {
            self.too_late_packets += 1;
            return PutOutcome::TooLate;
        }

        if let Some(seq) = slot {
            let frame = &mut self.frames[buf_idx(seq)];
            frame.initialisation_time = now;
            frame.resend_time = 0;
            match pcm {
                Some(data) => {
                    frame.ready = true;
                    frame.status = FrameStatus::default();
                    frame.length = n_frames;
                    frame.given_timestamp = rtp_time;
                    frame.sequence_number = seq;
                    frame.data = data;
                }
                None => {
                    debug!("Bad audio packet {seq} detected and discarded.");
                    frame.ready = false;
                    frame.status = FrameStatus(FrameStatus::BAD);
                    frame.resend_request_count = 0;
                    frame.given_timestamp = 0;
                    frame.sequence_number = 0;
                    outcome = PutOutcome::Bad;
                }
            }
        }

        outcome
    }

    /// Decide what a flush to `flush_rtp_timestamp` means for the current
    /// buffer contents. Flushes more than 10 s ahead of the first buffered
    /// frame are treated as bogus.
    pub fn flush_triage(&self, input_rate: usize) -> FlushDisposition {
        if self.flush_rtp_timestamp == 0 {
            return FlushDisposition::Needed { drop_request: true };
        }

        if !self.ab_synced || self.occupancy() <= 0 {
            return FlushDisposition::NotApplicable;
        }

        let first = &self.frames[buf_idx(self.ab_read)];
        if !first.ready {
            return FlushDisposition::NotApplicable;
        }

        let first_frame = first.given_timestamp;
        let offset_from_first = self.flush_rtp_timestamp.wrapping_sub(first_frame) as i32;
        if offset_from_first > (input_rate * 10) as i32 {
            warn!(
                "Flush frame {} is too far ahead of the first buffered frame {first_frame}, discarded.",
                self.flush_rtp_timestamp
            );
            return FlushDisposition::Discarded;
        }

        if offset_from_first <= 0 {
            return FlushDisposition::Expired;
        }

        let last = &self.frames[buf_idx(self.ab_write.wrapping_sub(1))];
        if !last.ready {
            return FlushDisposition::NotApplicable;
        }
        let last_frame = last
            .given_timestamp
            .wrapping_add(last.length)
            .wrapping_sub(1);
        let offset_to_last = last_frame.wrapping_sub(self.flush_rtp_timestamp) as i32;

        if offset_to_last >= 0 {
            FlushDisposition::Needed { drop_request: true }
        } else {
            FlushDisposition::Pending
        }
    }

    /// Readiness and timestamp of the frame under the read cursor, with
    /// aliasing recovery: if an incoming frame landed in this slot under a
    /// different sequence number, jump the cursor to it.
    pub fn next_frame_info(&mut self) -> Option<(bool, u32)> {
        if !self.ab_synced {
            return None;
        }
        let idx = buf_idx(self.ab_read);
        if self.ab_read != self.ab_write && self.frames[idx].ready {
            let found = self.frames[idx].sequence_number;
            if found != self.ab_read {
                if buf_idx(found) == idx {
                    warn!("Aliasing of buffer index, read cursor reset to {found}.");
                    self.ab_read = found;
                } else {
                    warn!(
                        "Inconsistent sequence numbers detected: slot holds {found}, cursor at {}.",
                        self.ab_read
                    );
                }
            }
        }
        let frame = &self.frames[buf_idx(self.ab_read)];
        Some((
            frame.ready && self.ab_read != self.ab_write,
            frame.given_timestamp,
        ))
    }

    pub fn is_empty(&self) -> bool {
        self.ab_synced && self.ab_read == self.ab_write
    }

    /// Take the frame under the read cursor and advance. A slot that never
    /// became ready yields a silent placeholder and counts as missing.
    pub fn take_next(&mut self) -> TakenFrame {
        let idx = buf_idx(self.ab_read);
        let frame = &mut self.frames[idx];
        let taken = if frame.ready {
            TakenFrame {
                sequence_number: frame.sequence_number,
                given_timestamp: frame.given_timestamp,
                length: frame.length,
                status: frame.status,
                resend_request_count: frame.resend_request_count,
                silent: false,
                data: std::mem::take(&mut frame.data),
            }
        } else {
            self.missing_packets += 1;
            TakenFrame {
                sequence_number: self.ab_read,
                given_timestamp: 0,
                length: 0,
                status: frame.status,
                resend_request_count: frame.resend_request_count,
                silent: true,
                data: Vec::new(),
            }
        };
        frame.consume();
        self.ab_read = self.ab_read.wrapping_add(1);
        taken
    }

    /// Immutable view of a slot by sequence number, for the resend scan.
    pub(crate) fn frame_at(&self, seq: u16) -> &AudioFrame {
        &self.frames[buf_idx(seq)]
    }

    pub(crate) fn frame_at_mut(&mut self, seq: u16) -> &mut AudioFrame {
        &mut self.frames[buf_idx(seq)]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pcm(n: usize) -> Option<Vec<u8>> {
        Some(vec![0u8; n * 4])
    }

    #[test]
    fn seq_ordering_wraps() {
        assert!(seq_after(65_535, 0));
        assert!(seq_after(0, 1));
        assert!(!seq_after(1, 0));
        assert!(!seq_after(0, 65_535));
    }

    #[test]
    fn first_packet_syncs_cursors() {
        let mut buffer = JitterBuffer::new();
        assert_eq!(
            buffer.put_packet(1000, 35_200, pcm(352), 352, 1),
            PutOutcome::FirstPacket
        );
        assert!(buffer.ab_synced);
        assert_eq!(buffer.ab_read, 1000);
        assert_eq!(buffer.ab_write, 1001);
        assert_eq!(buffer.occupancy(), 1);
    }

    #[test]
    fn gap_marks_intervening_slots_missing() {
        let mut buffer = JitterBuffer::new();
        buffer.put_packet(1000, 0, pcm(352), 352, 1);
        assert_eq!(
            buffer.put_packet(1004, 4 * 352, pcm(352), 352, 2),
            PutOutcome::GapFilled(3)
        );
        assert_eq!(buffer.ab_write, 1005);
        for seq in 1001..=1003u16 {
            let frame = buffer.frame_at(seq);
            assert!(!frame.ready);
            assert!(frame.status.has(FrameStatus::MISSING));
            assert_eq!(frame.initialisation_time, 2);
        }
    }

    #[test]
    fn late_packet_fills_its_slot() {
        let mut buffer = JitterBuffer::new();
        buffer.put_packet(1000, 0, pcm(352), 352, 1);
        buffer.put_packet(1004, 4 * 352, pcm(352), 352, 2);
        assert_eq!(
            buffer.put_packet(1002, 2 * 352, pcm(352), 352, 3),
            PutOutcome::Late
        );
        assert_eq!(buffer.late_packets, 1);
        assert!(buffer.frame_at(1002).ready);
    }

    #[test]
    fn packet_behind_read_cursor_is_too_late() {
        let mut buffer = JitterBuffer::new();
        buffer.put_packet(1000, 0, pcm(352), 352, 1);
        assert_eq!(
            buffer.put_packet(999, 0, pcm(352), 352, 2),
            PutOutcome::TooLate
        );
        assert_eq!(buffer.too_late_packets, 1);
    }

    #[test]
    fn bad_packet_marks_slot_bad() {
        let mut buffer = JitterBuffer::new();
        assert_eq!(buffer.put_packet(7, 0, None, 352, 1), PutOutcome::Bad);
        let frame = buffer.frame_at(7);
        assert!(!frame.ready);
        assert!(frame.status.has(FrameStatus::BAD));
    }

    #[test]
    fn every_unfilled_slot_substitutes_exactly_one_silent_frame() {
        let mut buffer = JitterBuffer::new();
        buffer.put_packet(1000, 0, pcm(352), 352, 1);
        buffer.put_packet(1003, 3 * 352, pcm(352), 352, 2);

        let mut silent = 0;
        let mut played = Vec::new();
        for _ in 0..4 {
            let taken = buffer.take_next();
            if taken.silent {
                silent += 1;
            } else {
                played.push(taken.given_timestamp);
            }
        }
        assert_eq!(silent, 2);
        assert_eq!(buffer.missing_packets, 2);
        assert_eq!(played, vec![0, 3 * 352]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn flush_to_zero_is_cleared_by_first_packet() {
        let mut buffer = JitterBuffer::new();
        buffer.request_flush(0);
        buffer.put_packet(5, 0, pcm(352), 352, 1);
        assert!(!buffer.flush_requested);
    }

    #[test]
    fn flush_triage_in_buffer() {
        let mut buffer = JitterBuffer::new();
        buffer.put_packet(10, 10_000, pcm(352), 352, 1);
        buffer.put_packet(11, 10_352, pcm(352), 352, 1);
        buffer.request_flush(10_352);
        assert_eq!(
            buffer.flush_triage(44_100),
            FlushDisposition::Needed { drop_request: true }
        );
    }

    #[test]
    fn flush_triage_pending_past_buffer() {
        let mut buffer = JitterBuffer::new();
        buffer.put_packet(10, 10_000, pcm(352), 352, 1);
        buffer.request_flush(10_000 + 44_100);
        assert_eq!(buffer.flush_triage(44_100), FlushDisposition::Pending);
    }

    #[test]
    fn flush_triage_expired_before_buffer() {
        let mut buffer = JitterBuffer::new();
        buffer.put_packet(10, 10_000, pcm(352), 352, 1);
        buffer.request_flush(9_000);
        assert_eq!(buffer.flush_triage(44_100), FlushDisposition::Expired);
    }

    #[test]
    fn flush_triage_discards_bogus_future_flush() {
        let mut buffer = JitterBuffer::new();
        buffer.put_packet(10, 10_000, pcm(352), 352, 1);
        buffer.request_flush(10_000 + 11 * 44_100);
        assert_eq!(buffer.flush_triage(44_100), FlushDisposition::Discarded);
    }

    #[test]
    fn gap_larger_than_the_ring_marks_every_slot_missing() {
        let mut buffer = JitterBuffer::new();
        buffer.put_packet(0, 0, pcm(352), 352, 1);
        assert_eq!(
            buffer.put_packet(2000, 2000 * 352, pcm(352), 352, 2),
            PutOutcome::GapFilled(1999)
        );
        // cursors are untouched; the whole gap is accounted for
        assert_eq!(buffer.ab_read, 0);
        assert_eq!(buffer.occupancy(), 2001);
        // marking wrapped the ring, overwriting the unplayed first packet
        let first = buffer.frame_at(0);
        assert!(!first.ready);
        assert!(first.status.has(FrameStatus::MISSING));
        let last_missing = buffer.frame_at(1999);
        assert!(!last_missing.ready);
        assert!(last_missing.status.has(FrameStatus::MISSING));
        assert!(buffer.frame_at(2000).ready);
        assert_eq!(buffer.frame_at(2000).sequence_number, 2000);
    }

    /// Draining a wide gap substitutes one silent frame per sequence number
    /// until the read cursor meets the surviving audio.
    #[test]
    fn wide_gap_drain_substitutes_one_silence_per_slot() {
        let mut buffer = JitterBuffer::new();
        buffer.put_packet(0, 0, pcm(352), 352, 1);
        buffer.put_packet(800, 800 * 352, pcm(352), 352, 2);
        assert_eq!(buffer.occupancy(), 801);

        let mut silent = 0;
        let mut real = Vec::new();
        while !buffer.is_empty() {
            let taken = buffer.take_next();
            if taken.silent {
                silent += 1;
            } else {
                real.push(taken.given_timestamp);
            }
        }
        assert_eq!(silent, 799);
        assert_eq!(buffer.missing_packets, 799);
        assert_eq!(real, vec![0, 800 * 352]);
    }
}
