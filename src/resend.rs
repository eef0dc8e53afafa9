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

//! Resend engine: scans the jitter buffer for runs of missing frames that
//! are neither too fresh nor already beyond saving and asks the source to
//! retransmit them over the AP2 control socket.

use crate::{
    config::ReceiverParams,
    jitter::{FrameStatus, JitterBuffer, seq_after},
    time::{Nanos, seconds_to_ns},
};
use std::{
    io,
    net::{SocketAddr, UdpSocket},
    time::Duration,
};
use tracing::{debug, warn};

const RESEND_ERROR_BACKOFF: Nanos = 300_000_000;
const SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// A coalesced run of missing frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResendRun {
    pub first: u16,
    pub count: u16,
}

pub struct ResendScanner {
    first_check: Nanos,
    check_interval: Nanos,
    /// Remaining useful lifetime below which a frame is written off.
    minimum_remaining: Nanos,
    /// Resume point so repeated scans skip the known-good prefix.
    first_possibly_missing: Option<u16>,
}

impl ResendScanner {
    pub fn new(params: &ReceiverParams) -> Self {
        Self {
            first_check: seconds_to_ns(params.resend_control_first_check_time),
            check_interval: seconds_to_ns(params.resend_control_check_interval_time),
            minimum_remaining: seconds_to_ns(
                params.resend_control_last_check_time + params.desired_buffer_length,
            ),
            first_possibly_missing: None,
        }
    }

    /// Walk `[ab_read, ab_write)`, flag each missing slot, and coalesce the
    /// eligible ones into request runs. `latency_frames` bounds how long a
    /// missing frame can still arrive in time.
    pub fn scan(
        &mut self,
        buffer: &mut JitterBuffer,
        latency_frames: i64,
        input_rate: usize,
        now: Nanos,
    ) -> Vec<ResendRun> {
        let latency_time = latency_frames * 1_000_000_000 / input_rate as i64;

        let mut x = buffer.ab_read;
        if let Some(first) = self.first_possibly_missing {
            let occupancy = buffer.occupancy();
            let position = first.wrapping_sub(buffer.ab_read) as i16;
            if occupancy >= 0 && (0..occupancy).contains(&position) {
                x = first;
            }
        }
        self.first_possibly_missing = None;

        let mut runs = Vec::new();
        let mut run_start: Option<u16> = None;
        let mut run_count: u16 = 0;
        let mut any_missing = false;

        while x != buffer.ab_write {
            let frame = buffer.frame_at_mut(x);
            let mut extends_run = false;
            if !frame.ready {
                if self.first_possibly_missing.is_none() {
                    self.first_possibly_missing = Some(x);
                }
                any_missing = true;

                let due_at = frame.initialisation_time + latency_time;
                let too_late = now > due_at - self.minimum_remaining;
                let too_early = now - frame.initialisation_time < self.first_check;
                let recently_requested =
                    frame.resend_time != 0 && now - frame.resend_time < self.check_interval;

                set_bit(&mut frame.status, FrameStatus::TOO_LATE, too_late);
                set_bit(&mut frame.status, FrameStatus::TOO_EARLY, too_early);
                set_bit(
                    &mut frame.status,
                    FrameStatus::RECENTLY_REQUESTED,
                    recently_requested,
                );

                if !too_late && !too_early && !recently_requested {
                    extends_run = true;
                    match run_start {
                        None => {
                            run_start = Some(x);
                            run_count = 1;
                        }
                        Some(_) => run_count += 1,
                    }
                    frame.resend_time = now;
                    frame.resend_request_count += 1;
                }
            }

            x = x.wrapping_add(1);

            // a ready or ineligible slot ends the current run, as does the
            // end of the window
            if (!extends_run || x == buffer.ab_write) && run_count > 0 {
                runs.push(ResendRun {
                    first: run_start.take().expect("open run has a start"),
                    count: run_count,
                });
                run_count = 0;
            }
        }

        if !any_missing {
            self.first_possibly_missing = Some(buffer.ab_write);
        }

        debug_assert!(
            runs.iter()
                .all(|r| !seq_after(buffer.ab_write, r.first.wrapping_add(r.count))),
        );

        runs
    }
}

fn set_bit(status: &mut FrameStatus, bit: u8, value: bool) {
    if value {
        status.set(bit);
    } else {
        status.clear(bit);
    }
}

/// Sends the 8-byte resend requests over a clone of the AP2 control socket.
/// The destination is the address the first control datagram arrived from.
pub struct ResendRequester {
    socket: UdpSocket,
    destination: Option<SocketAddr>,
    last_send_error: Nanos,
    pub resend_requests: u64,
}

impl ResendRequester {
    pub fn new(socket: UdpSocket) -> io::Result<Self> {
        socket.set_write_timeout(Some(SEND_TIMEOUT))?;
        Ok(Self {
            socket,
            destination: None,
            last_send_error: 0,
            resend_requests: 0,
        })
    }

    pub fn set_destination(&mut self, addr: SocketAddr) {
        self.destination = Some(addr);
    }

    pub fn request(&mut self, run: ResendRun, now: Nanos) {
        let Some(destination) = self.destination else {
            debug!("No remote control socket yet, skipping the resend.");
            return;
        };

        if self.last_send_error != 0 && now - self.last_send_error <= RESEND_ERROR_BACKOFF {
            debug!("Suppressing a resend request due to a send error in the last 0.3 seconds.");
            return;
        }

        let mut req = [0u8; 8];
        req[0] = 0x80;
        req[1] = 0xD5;
        req[2..4].copy_from_slice(&1u16.to_be_bytes());
        req[4..6].copy_from_slice(&run.first.to_be_bytes());
        req[6..8].copy_from_slice(&run.count.to_be_bytes());

        match self.socket.send_to(&req, destination) {
            Ok(_) => {
                self.last_send_error = 0;
                self.resend_requests += 1;
                if run.count > 1 {
                    debug!(
                        "Requested resend of {} packets starting at seqno {}.",
                        run.count, run.first
                    );
                }
            }
            Err(e) => {
                warn!("Error requesting a resend: {e}");
                self.last_send_error = now;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::time::NANOS_PER_MILLI;

    fn params() -> ReceiverParams {
        ReceiverParams::default()
    }

    fn pcm() -> Option<Vec<u8>> {
        Some(vec![0u8; 352 * 4])
    }

    /// Frames 1000..=1003 arrive, 1004..=1007 are missing, 1008 arrives.
    /// 150 ms after the gap appeared, one coalesced request for the run.
    #[test]
    fn missing_run_is_coalesced_into_one_request() {
        let mut buffer = JitterBuffer::new();
        let t0 = 1_000_000_000i64;
        for i in 0..4u16 {
            buffer.put_packet(1000 + i, (i as u32) * 352, pcm(), 352, t0);
        }
        buffer.put_packet(1008, 8 * 352, pcm(), 352, t0);

        let mut scanner = ResendScanner::new(&params());
        let now = t0 + 150 * NANOS_PER_MILLI;
        let runs = scanner.scan(&mut buffer, 88_200, 44_100, now);
        assert_eq!(
            runs,
            vec![ResendRun {
                first: 1004,
                count: 4
            }]
        );
        for seq in 1004..=1007u16 {
            assert_eq!(buffer.frame_at(seq).resend_request_count, 1);
            assert_eq!(buffer.frame_at(seq).resend_time, now);
        }
    }

    #[test]
    fn fresh_gaps_are_too_early() {
        let mut buffer = JitterBuffer::new();
        let t0 = 1_000_000_000i64;
        buffer.put_packet(10, 0, pcm(), 352, t0);
        buffer.put_packet(12, 2 * 352, pcm(), 352, t0);

        let mut scanner = ResendScanner::new(&params());
        let runs = scanner.scan(&mut buffer, 88_200, 44_100, t0 + 50 * NANOS_PER_MILLI);
        assert!(runs.is_empty());
        assert!(buffer.frame_at(11).status.has(FrameStatus::TOO_EARLY));
    }

    #[test]
    fn recently_requested_frames_are_not_rerequested() {
        let mut buffer = JitterBuffer::new();
        let t0 = 1_000_000_000i64;
        buffer.put_packet(10, 0, pcm(), 352, t0);
        buffer.put_packet(12, 2 * 352, pcm(), 352, t0);

        let mut scanner = ResendScanner::new(&params());
        let t1 = t0 + 150 * NANOS_PER_MILLI;
        assert_eq!(scanner.scan(&mut buffer, 88_200, 44_100, t1).len(), 1);
        // well within the 250 ms repeat interval
        let t2 = t1 + 100 * NANOS_PER_MILLI;
        assert!(scanner.scan(&mut buffer, 88_200, 44_100, t2).is_empty());
        assert!(
            buffer
                .frame_at(11)
                .status
                .has(FrameStatus::RECENTLY_REQUESTED)
        );
        // and again once the interval has passed
        let t3 = t1 + 300 * NANOS_PER_MILLI;
        assert_eq!(scanner.scan(&mut buffer, 88_200, 44_100, t3).len(), 1);
        assert_eq!(buffer.frame_at(11).resend_request_count, 2);
    }

    #[test]
    fn hopeless_frames_are_marked_too_late() {
        let mut buffer = JitterBuffer::new();
        let t0 = 1_000_000_000i64;
        buffer.put_packet(10, 0, pcm(), 352, t0);
        buffer.put_packet(12, 2 * 352, pcm(), 352, t0);

        // with 2 s of latency the frame is due at t0 + 2 s; past that less
        // the reserve, it is not worth asking for
        let mut scanner = ResendScanner::new(&params());
        let runs = scanner.scan(&mut buffer, 2 * 44_100, 44_100, t0 + 1_900 * NANOS_PER_MILLI);
        assert!(runs.is_empty());
        assert!(buffer.frame_at(11).status.has(FrameStatus::TOO_LATE));
    }

    #[test]
    fn wire_format_of_request() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut requester = ResendRequester::new(socket).unwrap();
        requester.set_destination(receiver.local_addr().unwrap());
        requester.request(
            ResendRun {
                first: 1004,
                count: 4,
            },
            1,
        );
        let mut buf = [0u8; 16];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[0x80, 0xD5, 0x00, 0x01, 0x03, 0xEC, 0x00, 0x04]);
        assert_eq!(requester.resend_requests, 1);
    }
}
