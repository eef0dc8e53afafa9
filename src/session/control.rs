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

//! AP2 control channel (UDP): anchor/latency announcements (0xD7) and
//! encrypted audio resend responses (0xD6). The address of the first
//! datagram becomes the destination for outgoing resend requests.

use super::SessionShared;
use crate::{
    anchor::AnchorData,
    config::INPUT_RATE,
    resend::ResendRequester,
    time::monotonic_ns,
};
use std::{
    io,
    sync::{Arc, Mutex, atomic::Ordering},
    thread,
};
use tokio::{net::UdpSocket, runtime, select, sync::mpsc};
use tracing::{debug, warn};

const SENTINEL_WINDOW_NS: i64 = 2_000_000;

pub fn spawn_control_receiver(
    shared: Arc<SessionShared>,
    socket: std::net::UdpSocket,
    requester: Arc<Mutex<ResendRequester>>,
    resend_tx: mpsc::Sender<Vec<u8>>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("ap2-control-{}", shared.connection_number))
        .spawn(move || {
            let Ok(runtime) = runtime::Builder::new_current_thread().enable_all().build() else {
                warn!("Could not build control receiver runtime.");
                return;
            };
            runtime.block_on(run(shared, socket, requester, resend_tx));
        })
}

async fn run(
    shared: Arc<SessionShared>,
    socket: std::net::UdpSocket,
    requester: Arc<Mutex<ResendRequester>>,
    resend_tx: mpsc::Sender<Vec<u8>>,
) {
    let connection_number = shared.connection_number;
    if socket.set_nonblocking(true).is_err() {
        return;
    }
    let Ok(socket) = UdpSocket::from_std(socket) else {
        return;
    };

    debug!("Connection {connection_number}: AP2 control receiver started.");

    let started_at = monotonic_ns().unwrap_or(0);
    let mut packet_number = 0u64;
    let mut have_remote = false;
    let mut packet = [0u8; 4096];
    let mut stop = shared.stop_rx.clone();

    loop {
        let (nread, from) = select! {
            received = socket.recv_from(&mut packet) => match received {
                Ok(it) => it,
                Err(e) => {
                    warn!("Connection {connection_number}: control receiver error: {e}");
                    continue;
                }
            },
            _ = stop.changed() => break,
        };

        if nread == 0 {
            continue;
        }

        let now = monotonic_ns().unwrap_or(started_at);
        if now - started_at < SENTINEL_WINDOW_NS && packet[0] & 0x10 == 0 {
            debug!(
                "Connection {connection_number}: dropping a non-sentinel packet left over from a previous session."
            );
            continue;
        }

        packet_number += 1;
        if packet_number == 1 {
            if packet[0] & 0x10 != 0 {
                debug!("Connection {connection_number}: first control packet is a sentinel.");
            } else {
                debug!("Connection {connection_number}: first control packet is not a sentinel!");
            }
        }

        if !have_remote {
            requester
                .lock()
                .expect("resend requester mutex poisoned")
                .set_destination(from);
            have_remote = true;
        }

        match packet[1] {
            0xD7 => handle_anchor_announce(&shared, &packet[..nread]),
            0xD6 => {
                // six bytes of preamble, then a ciphertext packet shaped
                // like a data-channel packet
                if nread > 6 {
                    resend_tx.send(packet[6..nread].to_vec()).await.ok();
                }
            }
            other => debug!(
                "Connection {connection_number}: control packet of type 0x{other:02X}, {nread} bytes."
            ),
        }
    }

    debug!("Connection {connection_number}: AP2 control receiver stopped.");
}

/// 0xD7 anchor/latency announcement: `(frame_1, remote_ns, frame_2,
/// clock_id)`. `frame_2 − frame_1` is the notified latency; the effective
/// anchor frame backs the fixed addend and the configured offset out of
/// `frame_1`.
fn handle_anchor_announce(shared: &SessionShared, packet: &[u8]) {
    if packet.len() < 28 {
        debug!("Short anchor announcement of {} bytes.", packet.len());
        return;
    }

    let frame_1 = u32::from_be_bytes(packet[4..8].try_into().expect("4 bytes"));
    let remote_ns = u64::from_be_bytes(packet[8..16].try_into().expect("8 bytes"));
    let frame_2 = u32::from_be_bytes(packet[16..20].try_into().expect("4 bytes"));
    let clock_id = u64::from_be_bytes(packet[20..28].try_into().expect("8 bytes"));

    let params = &shared.params;
    let notified_latency = frame_2.wrapping_sub(frame_1) as i32;
    if notified_latency != params.expected_notified_latency_frames {
        debug!("Notified latency is {notified_latency} frames.");
    }

    let fixed = params.latency_fixed_addend_frames;
    let added = params.latency_offset_frames();
    let net_latency =
        notified_latency + fixed + added - params.desired_buffer_frames() as i32;

    let latency = if net_latency <= 0 {
        warn!(
            "The stream latency ({:.3} s) is too short for an offset of {:.3} s and a backend buffer of {:.3} s.",
            (notified_latency + fixed) as f64 / INPUT_RATE as f64,
            params.latency_offset,
            params.desired_buffer_length
        );
        notified_latency + fixed
    } else {
        notified_latency + fixed + added
    };
    shared.latency_frames.store(latency as i64, Ordering::Relaxed);

    let anchor_rtp = frame_1.wrapping_sub(fixed as u32).wrapping_sub(added as u32);
    shared
        .anchor
        .lock()
        .expect("anchor mutex poisoned")
        .save(AnchorData {
            clock_id,
            rtp_time: anchor_rtp,
            anchor_time: remote_ns as i64,
            flags: 0,
        });
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ReceiverParams;

    fn announce(frame_1: u32, frame_2: u32, clock_id: u64, remote_ns: u64) -> Vec<u8> {
        let mut packet = vec![0u8; 28];
        packet[0] = 0x90;
        packet[1] = 0xD7;
        packet[4..8].copy_from_slice(&frame_1.to_be_bytes());
        packet[8..16].copy_from_slice(&remote_ns.to_be_bytes());
        packet[16..20].copy_from_slice(&frame_2.to_be_bytes());
        packet[20..28].copy_from_slice(&clock_id.to_be_bytes());
        packet
    }

    #[test]
    fn announcement_updates_latency_and_anchor() {
        let shared = SessionShared::new(ReceiverParams::default(), 1);
        let frame_1 = 500_000u32;
        let frame_2 = frame_1 + 77_175;
        handle_anchor_announce(&shared, &announce(frame_1, frame_2, 0xFEED, 123_456_789));

        // default params: no extra offset, desired buffer 0.15 s
        let expected_latency = 77_175 + 11_035;
        assert_eq!(
            shared.latency_frames.load(Ordering::Relaxed),
            expected_latency
        );

        let anchor = shared.anchor.lock().unwrap();
        assert!(anchor.has_source_data());
    }

    #[test]
    fn short_announcement_is_ignored() {
        let shared = SessionShared::new(ReceiverParams::default(), 1);
        handle_anchor_announce(&shared, &[0x90, 0xD7, 0, 0]);
        assert!(!shared.anchor.lock().unwrap().has_source_data());
    }
}
