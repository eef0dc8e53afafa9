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

//! Audio receivers. Realtime streams arrive as UDP datagrams (ALAC,
//! optionally AES-CBC); buffered streams arrive over TCP as length-prefixed
//! ChaCha20-Poly1305 packets (AAC) fed through a bounded ring into the
//! decode pipeline.

use super::SessionShared;
use crate::{
    codec::{FmtpParams, INPUT_BYTES_PER_FRAME, PcmStager, aac::AacDecoder, alac::AlacDecoder, adts, samples_to_bytes},
    crypto::{BufferedPacketCipher, RealtimeAudioCipher},
    jitter::BUFFER_FRAMES,
    monitoring::{Monitoring, RxStats},
    resend::ResendRequester,
    time::monotonic_ns,
    utils::Welford,
};
use crossbeam::channel;
use rtp_rs::RtpReader;
use std::{
    io,
    sync::{Arc, Mutex, atomic::Ordering},
    thread,
    time::Duration,
};
use tokio::{net::UdpSocket, runtime, select, sync::mpsc};
use tracing::{debug, info, warn};

const ARRIVAL_STATS_WINDOW: u64 = 2500;
/// Rough upper bound for one buffered packet on the wire.
const RING_PACKET_SIZE_ESTIMATE: usize = 2048;

/// Stream parameters fixed at SETUP time for the realtime path.
pub struct RealtimeStreamConfig {
    pub fmtp: FmtpParams,
    pub cipher: Option<RealtimeAudioCipher>,
}

pub fn spawn_realtime_receiver(
    shared: Arc<SessionShared>,
    socket: std::net::UdpSocket,
    config: RealtimeStreamConfig,
    requester: Arc<Mutex<ResendRequester>>,
    mut resend_rx: mpsc::Receiver<Vec<u8>>,
    monitoring: Monitoring,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("rt-audio-{}", shared.connection_number))
        .spawn(move || {
            let Ok(runtime) = runtime::Builder::new_current_thread().enable_all().build() else {
                warn!("Could not build realtime audio runtime.");
                return;
            };
            runtime.block_on(async move {
                let decoder = match AlacDecoder::new(&config.fmtp) {
                    Ok(it) => it,
                    Err(e) => {
                        warn!("Could not create ALAC decoder: {e}");
                        return;
                    }
                };
                let scanner = crate::resend::ResendScanner::new(&shared.params);
                let mut receiver = RealtimeReceiver {
                    shared,
                    config,
                    decoder,
                    requester,
                    scanner,
                    monitoring,
                    intervals: Welford::default(),
                    previous_packet_at: 0,
                };
                receiver.run(socket, &mut resend_rx).await;
            });
        })
}

struct RealtimeReceiver {
    shared: Arc<SessionShared>,
    config: RealtimeStreamConfig,
    decoder: AlacDecoder,
    requester: Arc<Mutex<ResendRequester>>,
    scanner: crate::resend::ResendScanner,
    monitoring: Monitoring,
    intervals: Welford,
    previous_packet_at: i64,
}

impl RealtimeReceiver {
    async fn run(&mut self, socket: std::net::UdpSocket, resend_rx: &mut mpsc::Receiver<Vec<u8>>) {
        let connection_number = self.shared.connection_number;
        if socket.set_nonblocking(true).is_err() {
            return;
        }
        let Ok(socket) = UdpSocket::from_std(socket) else {
            return;
        };

        info!("Connection {connection_number}: realtime audio receiver started.");

        let mut packet = [0u8; 4096];
        let mut stop = self.shared.stop_rx.clone();
        loop {
            select! {
                received = socket.recv_from(&mut packet) => match received {
                    Ok((nread, _)) => {
                        self.track_arrival_interval();
                        self.process_datagram(&packet[..nread]);
                    }
                    Err(e) => {
                        warn!("Connection {connection_number}: error receiving an audio packet: {e}");
                    }
                },
                resent = resend_rx.recv() => match resent {
                    // resend responses arrive via the control channel and
                    // are placed as late arrivals
                    Some(payload) => self.process_datagram(&payload),
                    None => tokio::time::sleep(Duration::from_secs(1)).await,
                },
                _ = stop.changed() => break,
            }
        }

        info!("Connection {connection_number}: realtime audio receiver stopped.");
    }

    fn track_arrival_interval(&mut self) {
        let now = monotonic_ns().unwrap_or(0);
        if self.previous_packet_at != 0 {
            self.intervals
                .update((now - self.previous_packet_at) as f64 / 1000.0);
            if self.intervals.count() >= ARRIVAL_STATS_WINDOW {
                self.monitoring.rx_stats(RxStats::ArrivalInterval {
                    mean_us: self.intervals.mean(),
                    stddev_us: self.intervals.stddev(),
                    max_us: self.intervals.max(),
                });
                self.intervals.reset();
            }
        }
        self.previous_packet_at = now;
    }

    fn process_datagram(&mut self, datagram: &[u8]) {
        if datagram.len() < 12 {
            self.monitoring
                .rx_stats(RxStats::MalformedPacket(format!(
                    "{} byte audio datagram",
                    datagram.len()
                )));
            return;
        }

        let packet_type = datagram[1] & !0x80;
        let body = match packet_type {
            0x60 => datagram,
            0x56 => {
                // retransmitted packet: four bytes of resend preamble
                if datagram.len() < 16 {
                    return;
                }
                &datagram[4..]
            }
            other => {
                debug!("Unknown realtime packet of type 0x{other:02X}.");
                return;
            }
        };

        let rtp = match RtpReader::new(body) {
            Ok(it) => it,
            Err(e) => {
                self.monitoring
                    .rx_stats(RxStats::MalformedPacket(format!("{e:?}")));
                return;
            }
        };
        let seq = u16::from(rtp.sequence_number());
        let rtp_time = rtp.timestamp();
        let mut payload = rtp.payload().to_vec();

        if payload.len() < 16 {
            return;
        }

        if let Some(cipher) = &self.config.cipher {
            if cipher.decrypt_in_place(&mut payload).is_err() {
                let total = self.shared.record_decrypt_failure();
                self.monitoring.rx_stats(RxStats::DecryptFailed { total });
                return;
            }
        }

        let now = monotonic_ns().unwrap_or(0);
        let decoded = self.decoder.decode(&payload);
        let (pcm, n_frames) = match decoded {
            Ok(samples) => {
                let n_frames = (samples.len() / 2) as u32;
                (Some(samples_to_bytes(&samples)), n_frames)
            }
            Err(e) => {
                debug!("ALAC decode failed for packet {seq}: {e}");
                (None, self.decoder.frames_per_packet())
            }
        };

        let runs = {
            let mut buffer = self
                .shared
                .buffer
                .lock()
                .expect("jitter buffer mutex poisoned");
            buffer.put_packet(seq, rtp_time, pcm, n_frames, now);

            if self.shared.params.disable_resend_requests {
                Vec::new()
            } else {
                let latency = self.shared.latency_frames.load(Ordering::Relaxed);
                self.scanner
                    .scan(&mut buffer, latency, crate::config::INPUT_RATE, now)
            }
        };

        if !runs.is_empty() {
            let mut requester = self
                .requester
                .lock()
                .expect("resend requester mutex poisoned");
            for run in runs {
                requester.request(run, now);
            }
            self.shared
                .resend_requests
                .store(requester.resend_requests, Ordering::Relaxed);
        }

        self.shared.signal_arrival();
    }
}

// ---------------------------------------------------------------------------
// buffered path

pub struct BufferedStreamConfig {
    pub session_key: [u8; 32],
    pub audio_buffer_size: usize,
}

/// Spawn the length-prefixed TCP framer and the decode pipeline behind it.
/// Returns both join handles.
pub fn spawn_buffered_receiver(
    shared: Arc<SessionShared>,
    listener: std::net::TcpListener,
    config: BufferedStreamConfig,
    mut resend_rx: mpsc::Receiver<Vec<u8>>,
    monitoring: Monitoring,
) -> io::Result<Vec<thread::JoinHandle<()>>> {
    let ring_capacity =
        (config.audio_buffer_size / RING_PACKET_SIZE_ESTIMATE).clamp(64, 4096);
    let (ring_tx, ring_rx) = channel::bounded::<Vec<u8>>(ring_capacity);

    let framer = {
        let shared = Arc::clone(&shared);
        let monitoring = monitoring.clone();
        thread::Builder::new()
            .name(format!("buffered-framer-{}", shared.connection_number))
            .spawn(move || buffered_framer(shared, listener, ring_tx, ring_capacity, monitoring))?
    };

    let processor = {
        let shared = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("buffered-audio-{}", shared.connection_number))
            .spawn(move || {
                let mut processor = match BufferedProcessor::new(shared, config, monitoring) {
                    Ok(it) => it,
                    Err(e) => {
                        warn!("Could not create buffered audio processor: {e}");
                        return;
                    }
                };
                processor.run(ring_rx, &mut resend_rx);
            })?
    };

    Ok(vec![framer, processor])
}

/// Reads `u16` length-prefixed packets off the TCP data connection into the
/// bounded ring, tracking the minimum observed free space.
fn buffered_framer(
    shared: Arc<SessionShared>,
    listener: std::net::TcpListener,
    ring_tx: channel::Sender<Vec<u8>>,
    ring_capacity: usize,
    monitoring: Monitoring,
) {
    let connection_number = shared.connection_number;
    if listener.set_nonblocking(true).is_err() {
        return;
    }

    // poll for the source's connection so a teardown can still get through
    let mut stream = loop {
        if shared.stop_requested() {
            return;
        }
        match listener.accept() {
            Ok((stream, remote)) => {
                info!("Connection {connection_number}: buffered audio connected from {remote}.");
                break stream;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                warn!("Connection {connection_number}: buffered audio accept failed: {e}");
                return;
            }
        }
    };
    stream.set_nonblocking(false).ok();
    stream
        .set_read_timeout(Some(Duration::from_millis(250)))
        .ok();

    let mut minimum_free = ring_capacity;
    let mut blocks_read = 0u64;

    loop {
        let mut len_bytes = [0u8; 2];
        if !read_full(&shared, &mut stream, &mut len_bytes) {
            break;
        }

        let data_len = u16::from_be_bytes(len_bytes) as usize;
        if data_len < 2 {
            continue;
        }
        let mut packet = vec![0u8; data_len - 2];
        if !read_full(&shared, &mut stream, &mut packet) {
            break;
        }

        let free = ring_capacity - ring_tx.len();
        if free < minimum_free {
            minimum_free = free;
        }
        blocks_read += 1;
        if blocks_read.is_multiple_of(1000) {
            monitoring.rx_stats(RxStats::RingMinimumFree {
                bytes: minimum_free * RING_PACKET_SIZE_ESTIMATE,
            });
        }

        // blocking push: backpressure onto the TCP connection
        if ring_tx.send(packet).is_err() {
            break;
        }
    }

    debug!("Connection {connection_number}: buffered framer stopped.");
}

/// Fill `buf` completely, surviving read timeouts without losing stream
/// position. False means the stream ended or the session is stopping.
fn read_full(
    shared: &SessionShared,
    stream: &mut std::net::TcpStream,
    buf: &mut [u8],
) -> bool {
    use std::io::Read;

    let mut filled = 0;
    while filled < buf.len() {
        if shared.stop_requested() {
            return false;
        }
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                info!(
                    "Connection {}: buffered audio port closed.",
                    shared.connection_number
                );
                return false;
            }
            Ok(n) => filled += n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                continue;
            }
            Err(e) => {
                warn!(
                    "Connection {}: buffered framer read error: {e}",
                    shared.connection_number
                );
                return false;
            }
        }
    }
    true
}

struct BufferedProcessor {
    shared: Arc<SessionShared>,
    cipher: BufferedPacketCipher,
    decoder: AacDecoder,
    stager: PcmStager,
    monitoring: Monitoring,
    blocks_read: u64,
}

impl BufferedProcessor {
    fn new(
        shared: Arc<SessionShared>,
        config: BufferedStreamConfig,
        monitoring: Monitoring,
    ) -> Result<Self, crate::error::DecodeError> {
        Ok(Self {
            cipher: BufferedPacketCipher::new(&config.session_key),
            decoder: AacDecoder::new()?,
            stager: PcmStager::new(),
            monitoring,
            shared,
            blocks_read: 0,
        })
    }

    fn run(&mut self, ring_rx: channel::Receiver<Vec<u8>>, resend_rx: &mut mpsc::Receiver<Vec<u8>>) {
        let connection_number = self.shared.connection_number;
        info!("Connection {connection_number}: buffered audio processor started.");

        loop {
            if self.shared.stop_requested() {
                break;
            }

            // opportunistically drain control-channel resend responses
            while let Ok(payload) = resend_rx.try_recv() {
                self.process_block(&payload, true);
            }

            match ring_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(packet) => self.process_block(&packet, false),
                Err(channel::RecvTimeoutError::Timeout) => continue,
                Err(channel::RecvTimeoutError::Disconnected) => break,
            }
        }

        info!("Connection {connection_number}: buffered audio processor stopped.");
    }

    /// One data-channel packet: 12-byte header with a 24-bit block number
    /// and the RTP timestamp, then the AEAD ciphertext.
    fn process_block(&mut self, packet: &[u8], is_resend: bool) {
        if packet.len() < 12 + 16 + 8 {
            self.monitoring.rx_stats(RxStats::MalformedPacket(format!(
                "{} byte buffered packet",
                packet.len()
            )));
            return;
        }

        let block_seq = u32::from_be_bytes([0, packet[1], packet[2], packet[3]]);
        let rtp_time = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
        self.blocks_read += 1;

        // flushes can be honored without deciphering
        let pending_flush = *self.shared.flush.lock().expect("flush mutex poisoned");
        if let Some(flush) = pending_flush {
            if flush.covers(block_seq) {
                if flush.is_immediate() {
                    self.stager.clear();
                }
                return;
            }
            if (block_seq.wrapping_sub(flush.until_seq) as i32) >= 0 {
                debug!(
                    "Flush completed at block {block_seq}, rtptime {rtp_time} (untilSeq {}).",
                    flush.until_seq
                );
                self.stager.discard_until(flush.until_ts);
                *self.shared.flush.lock().expect("flush mutex poisoned") = None;
                self.shared.set_state(crate::session::SessionState::Running);
            }
        }

        if is_resend {
            // the TCP channel is lossless, so a late control-channel copy
            // of a block it already delivered is only noise
            debug!("Dropping control-channel copy of block {block_seq}.");
            return;
        }

        let payload = match self.cipher.decrypt_packet(packet) {
            Ok(it) => it,
            Err(_) => {
                let total = self.shared.record_decrypt_failure();
                self.monitoring.rx_stats(RxStats::DecryptFailed { total });
                return;
            }
        };

        let adts_frame = adts::add_adts_header(&payload);
        let samples = match self.decoder.decode(&adts_frame) {
            Ok(it) => it,
            Err(e) => {
                debug!("AAC decode failed for block {block_seq}: {e}");
                return;
            }
        };

        self.stager.push_block(rtp_time, &samples_to_bytes(&samples));
        self.drain_stager();
    }

    /// Move staged 352-frame packets into the jitter buffer, pacing against
    /// the configured free-slot headroom so the ring, not the buffer,
    /// absorbs the source's burstiness.
    fn drain_stager(&mut self) {
        let headroom = self.shared.params.minimum_free_buffer_headroom as i16;
        loop {
            let now = monotonic_ns().unwrap_or(0);
            {
                let buffer = self
                    .shared
                    .buffer
                    .lock()
                    .expect("jitter buffer mutex poisoned");
                if buffer.ab_synced && buffer.occupancy() >= BUFFER_FRAMES as i16 - headroom {
                    break;
                }
            }
            let Some((rtp_time, pcm)) = self.stager.take_packet() else {
                break;
            };
            let n_frames = (pcm.len() / INPUT_BYTES_PER_FRAME) as u32;
            {
                let mut buffer = self
                    .shared
                    .buffer
                    .lock()
                    .expect("jitter buffer mutex poisoned");
                let seq = buffer.ab_write;
                buffer.put_packet(seq, rtp_time, Some(pcm), n_frames, now);
            }
            self.shared.signal_arrival();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ReceiverParams;
    use crate::session::FlushRequest;

    /// The processor must be able to skip flushed blocks without the
    /// session key: coverage is decided from the plaintext header alone.
    #[test]
    fn flush_coverage_uses_plaintext_header_fields() {
        let flush = FlushRequest {
            from_seq: Some(100),
            from_ts: Some(35_200),
            until_seq: 200,
            until_ts: 70_400,
        };
        let mut header = vec![0u8; 12];
        header[1..4].copy_from_slice(&[0, 0, 150]);
        let block_seq = u32::from_be_bytes([0, header[1], header[2], header[3]]);
        assert!(flush.covers(block_seq));
    }

    #[test]
    fn stager_packets_land_in_jitter_buffer_in_order() {
        let shared = SessionShared::new(ReceiverParams::default(), 1);
        let monitoring = crate::monitoring::test_monitoring();
        let mut processor = BufferedProcessor::new(
            Arc::clone(&shared),
            BufferedStreamConfig {
                session_key: [0u8; 32],
                audio_buffer_size: 8 * 1024 * 1024,
            },
            monitoring,
        )
        .unwrap();

        // bypass decrypt/decode and feed the stager directly
        processor
            .stager
            .push_block(10_000, &vec![0u8; 1024 * INPUT_BYTES_PER_FRAME]);
        processor.drain_stager();

        let buffer = shared.buffer.lock().unwrap();
        assert!(buffer.ab_synced);
        assert_eq!(buffer.occupancy(), 2);
    }
}
