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

//! The player loop. Pulls ordered frames from the jitter buffer, keeps the
//! DAC topped up to the desired latency with dithered silence while waiting
//! for the first frame, then releases each 352-frame packet at the instant
//! the anchor model dictates, correcting residual clock drift by stuffing or
//! resampling one frame per packet.

use crate::{
    anchor::Anchor,
    config::{FRAMES_PER_PACKET, INPUT_RATE, PlaybackMode, ReceiverParams, StuffingMode},
    error::{PlayerInternalError, PlayerInternalResult},
    formats::{OUTPUT_CHANNELS, TpdfDither, pack_lanes, silence_frames},
    jitter::{FlushDisposition, JitterBuffer, TakenFrame},
    monitoring::{Monitoring, PlayerStats, StatsWindow},
    output::AudioBackend,
    ptp::ClockSource,
    time::{NANOS_PER_SEC, Nanos, monotonic_ns},
};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};
use tokio::{runtime, sync::watch};
use tracing::{debug, info, warn};

/// Everything the player needs from the session: an immutable parameter
/// copy plus shared handles. There is no backpointer to the session.
pub struct PlayerHandles {
    pub buffer: Arc<Mutex<JitterBuffer>>,
    pub anchor: Arc<Mutex<Anchor>>,
    pub clock: Arc<dyn ClockSource>,
    pub arrival: watch::Receiver<u64>,
    pub play_enabled: Arc<AtomicBool>,
    pub resend_requests: Arc<AtomicU64>,
    /// Raised when the player hits an unrecoverable condition, so the
    /// session unwinds without a backpointer.
    pub session_stop: watch::Sender<bool>,
}

pub struct PlayerApi {
    stop_tx: watch::Sender<bool>,
    join: Option<thread::JoinHandle<()>>,
}

impl PlayerApi {
    pub fn stop(&self) {
        self.stop_tx.send(true).ok();
    }

    pub fn stop_and_join(mut self) {
        self.stop();
        if let Some(join) = self.join.take() {
            join.join().ok();
        }
    }
}

pub fn start_player(
    connection_number: u64,
    params: ReceiverParams,
    handles: PlayerHandles,
    backend: Box<dyn AudioBackend>,
    monitoring: Monitoring,
) -> PlayerInternalResult<PlayerApi> {
    let (stop_tx, stop_rx) = watch::channel(false);
    let (result_tx, result_rx) = std::sync::mpsc::channel();

    let join = thread::Builder::new()
        .name(format!("player-{connection_number}"))
        .spawn(move || {
            crate::utils::set_realtime_priority();
            let runtime = match runtime::Builder::new_current_thread().enable_all().build() {
                Ok(it) => it,
                Err(e) => {
                    result_tx.send(Err(PlayerInternalError::from(e))).ok();
                    return;
                }
            };
            result_tx.send(Ok(())).ok();
            runtime.block_on(async move {
                let session_stop = handles.session_stop.clone();
                let mut player = PlayerLoop::new(params, handles, backend, monitoring, stop_rx);
                if let Err(e) = player.run().await {
                    warn!("Player for connection {connection_number} exited with error: {e}");
                    session_stop.send(true).ok();
                }
            });
        })?;

    // propagate runtime construction failure synchronously
    match result_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(PlayerInternalError::IoError(std::io::Error::other(
                "player thread exited before reporting readiness",
            )));
        }
    }

    info!("Player for connection {connection_number} started.");

    Ok(PlayerApi {
        stop_tx,
        join: Some(join),
    })
}

struct PlayerLoop {
    params: ReceiverParams,
    handles: PlayerHandles,
    backend: Box<dyn AudioBackend>,
    monitoring: Monitoring,
    stop_rx: watch::Receiver<bool>,

    ratio: usize,
    sign_bit: u32,
    packet_out: i64,
    first_frame_early_bias: i64,
    desired_out: i64,

    dither: Mutex<TpdfDither>,
    enable_dither: bool,
    rng: StdRng,

    first_packet_timestamp: u32,
    first_packet_time_to_play: Nanos,
    have_sent_prefiller: bool,
    first_frame_seen: bool,
    play_started_at: Nanos,

    last_seqno_read: Option<u16>,
    sync_error_out_of_bounds: u32,
    play_number: u64,
    timing_lost_since: Option<Nanos>,

    fix_volume: f64,
    loudness: Option<(Biquad, Biquad)>,

    stats: WindowAccumulator,
}

#[derive(Default)]
struct WindowAccumulator {
    sum_sync_errors: i64,
    sum_corrections: i64,
    sum_insertions_deletions: i64,
    count: u64,
    min_dac_queue: u64,
    min_occupancy: i32,
    max_occupancy: i32,
}

impl WindowAccumulator {
    fn reset(&mut self) {
        *self = Self {
            min_dac_queue: u64::MAX,
            min_occupancy: i32::MAX,
            max_occupancy: i32::MIN,
            ..Self::default()
        }
    }
}

enum Fetched {
    Frame(TakenFrame),
    Stopped,
}

impl PlayerLoop {
    fn new(
        params: ReceiverParams,
        handles: PlayerHandles,
        backend: Box<dyn AudioBackend>,
        monitoring: Monitoring,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        let ratio = params.output_sample_ratio();
        let sign_bit = match ratio {
            2 => 32,
            4 => 33,
            8 => 34,
            _ => 31,
        };
        let seed = monotonic_ns().unwrap_or(1) as u64;
        let fix_volume = 10f64.powf(params.volume_db / 20.0);
        let loudness = params
            .loudness
            .then(|| (Biquad::low_shelf(params.volume_db), Biquad::low_shelf(params.volume_db)));
        let desired_out = (params.desired_buffer_length * params.output_rate as f64) as i64;
        let mut stats = WindowAccumulator::default();
        stats.reset();
        Self {
            ratio,
            sign_bit,
            packet_out: (FRAMES_PER_PACKET * ratio) as i64,
            first_frame_early_bias: (params.output_rate / 4) as i64,
            desired_out,
            dither: Mutex::new(TpdfDither::new(seed)),
            enable_dither: true,
            rng: StdRng::seed_from_u64(seed ^ 0x9E37_79B9_7F4A_7C15),
            first_packet_timestamp: 0,
            first_packet_time_to_play: 0,
            have_sent_prefiller: false,
            first_frame_seen: false,
            play_started_at: 0,
            last_seqno_read: None,
            sync_error_out_of_bounds: 0,
            play_number: 0,
            timing_lost_since: None,
            fix_volume,
            loudness,
            stats,
            params,
            handles,
            backend,
            monitoring,
            stop_rx,
        }
    }

    async fn run(&mut self) -> PlayerInternalResult<()> {
        self.backend.prepare()?;
        self.backend
            .start(self.params.output_rate, self.params.output_format)?;
        self.backend.volume(self.params.volume_db);

        loop {
            match self.get_frame().await? {
                Fetched::Stopped => break,
                Fetched::Frame(frame) => self.play_frame(frame)?,
            }
        }

        self.backend.stop()?;
        debug!("Player loop finished.");
        Ok(())
    }

    /// The buffer fetcher: waits until the next frame is due, emitting
    /// lead-in silence while the session is still buffering. Timing loss is
    /// tolerated with held (silent) playback until `active_state_timeout`.
    async fn get_frame(&mut self) -> PlayerInternalResult<Fetched> {
        loop {
            if *self.stop_rx.borrow() {
                return Ok(Fetched::Stopped);
            }

            let now = monotonic_ns()?;
            let anchor = self.resolve_anchor(now)?;

            if let Some(anchor) = anchor {
                let buffer = Arc::clone(&self.handles.buffer);
                let mut buffer = buffer.lock().expect("jitter buffer mutex poisoned");

                self.handle_flush(&mut buffer)?;

                if buffer.ab_synced && self.handles.play_enabled.load(Ordering::Acquire) {
                    let Some((frame_ready, frame_ts)) = buffer.next_frame_info() else {
                        continue;
                    };

                    if frame_ready && buffer.ab_buffering {
                        self.pre_play(&mut buffer, &anchor, frame_ts, now)?;
                    }

                    if !buffer.ab_buffering {
                        let mut do_wait = false;
                        if frame_ready && frame_ts != 0 {
                            do_wait = true;
                            let release_frame = frame_ts
                                .wrapping_sub(self.params.desired_buffer_frames() as u32);
                            let time_to_play =
                                anchor.frame_to_local_ns(release_frame, INPUT_RATE);
                            if now >= time_to_play {
                                do_wait = false;
                            } else {
                                // a frame scheduled many seconds away is not
                                // meant to be there; let it go
                                let difference = now - time_to_play;
                                if !(-10 * NANOS_PER_SEC..=10 * NANOS_PER_SEC)
                                    .contains(&difference)
                                {
                                    debug!(
                                        "Crazy time interval of {:.3} s for frame {frame_ts}, releasing it.",
                                        difference as f64 / 1e9
                                    );
                                    do_wait = false;
                                }
                            }
                        }
                        if buffer.is_empty() {
                            do_wait = true;
                        }
                        if !do_wait && !buffer.is_empty() {
                            return Ok(Fetched::Frame(buffer.take_next()));
                        }
                    }
                }
            }

            // about two thirds of a packet period
            let wait = Duration::from_nanos(
                (2 * FRAMES_PER_PACKET as u64 * 1_000_000_000 / INPUT_RATE as u64) / 3,
            );
            let mut arrival = self.handles.arrival.clone();
            let mut stop = self.stop_rx.clone();
            tokio::select! {
                _ = stop.changed() => {}
                _ = arrival.changed() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Look up the clock and resolve the anchor. While timing is lost the
    /// DAC is fed dithered silence; a timeout makes the loss fatal to the
    /// session.
    fn resolve_anchor(
        &mut self,
        now: Nanos,
    ) -> PlayerInternalResult<Option<crate::anchor::AnchorLast>> {
        let lookup = self.handles.clock.get_clock_info()?;
        let status = {
            let mut anchor = self.handles.anchor.lock().expect("anchor mutex poisoned");
            anchor.get_data(&lookup, now)
        };
        match status.anchor() {
            Some(last) => {
                if self.timing_lost_since.take().is_some() {
                    info!("PTP timing is available again.");
                }
                Ok(Some(last))
            }
            None => {
                let since = *self.timing_lost_since.get_or_insert(now);
                if let Some(timeout) = self.params.active_state_timeout {
                    if now - since > timeout.as_nanos() as i64 && self.first_frame_seen {
                        warn!(
                            "PTP timing lost for more than {} s, giving up on the session.",
                            timeout.as_secs()
                        );
                        return Err(PlayerInternalError::ClockError(
                            crate::error::ClockError::ServiceTimeout(timeout.as_secs()),
                        ));
                    }
                }
                if self.first_frame_seen {
                    // hold playback audibly silent rather than stalling the DAC
                    self.emit_silence(self.packet_out)?;
                }
                Ok(None)
            }
        }
    }

    fn handle_flush(&mut self, buffer: &mut JitterBuffer) -> PlayerInternalResult<()> {
        if !buffer.flush_requested {
            return Ok(());
        }
        if !buffer.flush_output_flushed {
            self.backend.flush()?;
            buffer.flush_output_flushed = true;
        }
        let disposition = buffer.flush_triage(INPUT_RATE);
        let (flush_buffer, drop_request) = match disposition {
            FlushDisposition::Needed { drop_request } => (true, drop_request),
            FlushDisposition::Pending => (true, false),
            FlushDisposition::Expired | FlushDisposition::Discarded => (false, true),
            FlushDisposition::NotApplicable => (false, true),
        };
        if flush_buffer {
            debug!("Flush request: flushing the buffer.");
            buffer.resync();
            self.first_packet_timestamp = 0;
            self.first_packet_time_to_play = 0;
            self.have_sent_prefiller = false;
        }
        if drop_request {
            buffer.flush_requested = false;
            buffer.flush_rtp_timestamp = 0;
            buffer.flush_output_flushed = false;
        }
        Ok(())
    }

    /// Pre-play: figure out when the first frame is due, emit silence to
    /// keep the DAC at the desired fill, and stop buffering once the start
    /// is within two packet durations (minus the early bias).
    fn pre_play(
        &mut self,
        buffer: &mut JitterBuffer,
        anchor: &crate::anchor::AnchorLast,
        frame_ts: u32,
        now: Nanos,
    ) -> PlayerInternalResult<()> {
        if self.first_packet_timestamp == 0 {
            self.first_packet_timestamp = frame_ts;
            let time_to_play = anchor.frame_to_local_ns(frame_ts, INPUT_RATE);
            self.first_packet_time_to_play = time_to_play;
            let lead = time_to_play - now;
            if lead < 100 * 1_000_000 {
                info!(
                    "Short lead time of {:.3} s for the first frame, flushing 0.5 s to resynchronize.",
                    lead as f64 / 1e9
                );
                buffer.request_flush(frame_ts.wrapping_add(5 * 4410));
                return Ok(());
            }
            debug!("Lead time for the first frame: {:.3} s.", lead as f64 / 1e9);
        }

        // the anchor may have been refined since the estimate was made
        self.first_packet_time_to_play = anchor.frame_to_local_ns(self.first_packet_timestamp, INPUT_RATE);

        let lead = self.first_packet_time_to_play - now;
        if lead < 0 {
            debug!("Gone past the starting time by {} ns.", -lead);
            buffer.ab_buffering = false;
            return Ok(());
        }

        let dac_delay = if self.have_sent_prefiller {
            self.backend.delay()? as i64
        } else {
            0
        };
        let lead_frames = lead * self.params.output_rate as i64 / NANOS_PER_SEC;
        let (fs, done) = prefill_chunk(
            lead_frames,
            dac_delay,
            self.desired_out,
            self.packet_out,
            self.first_frame_early_bias,
        );
        if done {
            buffer.ab_buffering = false;
            self.play_started_at = now;
        }
        if fs > 0 {
            self.emit_silence(fs)?;
            self.have_sent_prefiller = true;
            self.monitoring
                .player_stats(PlayerStats::Prefill { silence_frames: fs });
        }
        Ok(())
    }

    fn emit_silence(&mut self, frames: i64) -> PlayerInternalResult<()> {
        let mut bytes =
            Vec::with_capacity(frames as usize * self.params.output_format.bytes_per_frame());
        {
            let mut dither = self.dither.lock().expect("dither mutex poisoned");
            silence_frames(
                frames as usize,
                self.params.output_format,
                self.enable_dither.then_some(&mut *dither),
                &mut bytes,
            );
        }
        self.backend.play(&bytes, frames as usize)?;
        Ok(())
    }

    /// Steady-state handling of one 352-frame packet.
    fn play_frame(&mut self, frame: TakenFrame) -> PlayerInternalResult<()> {
        let now = monotonic_ns()?;
        self.play_number += 1;

        self.enable_dither = self.backend.parameters().is_none()
            || self.params.output_format.bit_depth() < 16
            || self.params.playback_mode == PlaybackMode::Mono;

        if frame.silent || frame.given_timestamp == 0 {
            // substituted for a missing packet; the timeline must not compress
            self.advance_seqno(frame.sequence_number);
            self.emit_silence(self.packet_out)?;
            self.maybe_report(now)?;
            return Ok(());
        }

        self.advance_seqno(frame.sequence_number);

        let mut lanes = expand_frame(&frame.data, self.params.playback_mode, self.ratio);
        let n_out_frames = lanes.len() / OUTPUT_CHANNELS;

        // sync error against the DAC head
        let dac_delay = self.backend.delay()? as i64;
        let anchor = {
            let lookup = self.handles.clock.get_clock_info()?;
            let mut anchor = self.handles.anchor.lock().expect("anchor mutex poisoned");
            anchor.get_data(&lookup, now).anchor()
        };
        let Some(anchor) = anchor else {
            // timing disappeared mid-packet; hold with silence
            self.emit_silence(self.packet_out)?;
            return Ok(());
        };

        let should_be_frame = anchor.local_ns_to_frame(now, INPUT_RATE) as i64 * self.ratio as i64;
        let will_be_frame = frame.given_timestamp as i64 * self.ratio as i64 - dac_delay;
        let mut sync_error = sign_extended_difference(should_be_frame, will_be_frame, self.sign_bit);

        if !self.first_frame_seen {
            self.first_frame_seen = true;
            debug!(
                "First frame sync error (positive means late): {} frames ({:.3} ms).",
                sync_error + self.first_frame_early_bias,
                1000.0 * (sync_error + self.first_frame_early_bias) as f64
                    / self.params.output_rate as f64
            );
            // the first packet was deliberately scheduled early; pad the
            // residue with silence so it lands exactly on time
            if sync_error < 0 {
                self.emit_silence(-sync_error)?;
                sync_error = 0;
            }
        }

        let resync_frames = (self.params.resync_threshold * self.params.output_rate as f64) as i64;
        if self.params.resync_threshold > 0.0 && sync_error.abs() > resync_frames {
            self.sync_error_out_of_bounds += 1;
        } else {
            self.sync_error_out_of_bounds = 0;
        }

        if self.sync_error_out_of_bounds > 3 {
            self.sync_error_out_of_bounds = 0;
            self.monitoring.player_stats(PlayerStats::Resync {
                sync_error_frames: sync_error,
            });
            self.resync(sync_error, resync_frames, frame.given_timestamp)?;
            self.stats.reset();
            return Ok(());
        }

        let mut amount_to_stuff = self.stuffing_decision(sync_error, now);

        // volume and loudness are applied in float, after which the lanes go
        // back to fixed point for output conversion
        if self.loudness.is_some() || self.fix_volume != 1.0 {
            self.apply_dsp(&mut lanes);
        }

        let corrected = match self.params.stuffing_mode {
            StuffingMode::Basic => stuff_basic(lanes, amount_to_stuff, &mut self.rng),
            StuffingMode::Soxr => match stuff_resample(&lanes, amount_to_stuff) {
                Ok(resampled) => resampled,
                Err(e) => {
                    debug!("Resampler failed ({e}), falling back to basic stuffing.");
                    stuff_basic(lanes, amount_to_stuff, &mut self.rng)
                }
            },
        };
        if corrected.len() / OUTPUT_CHANNELS == n_out_frames {
            amount_to_stuff = 0;
        }

        let mut bytes =
            Vec::with_capacity(corrected.len() * self.params.output_format.bytes_per_sample());
        {
            let mut dither = self.dither.lock().expect("dither mutex poisoned");
            pack_lanes(
                &corrected,
                self.params.output_format,
                self.enable_dither.then_some(&mut *dither),
                &mut bytes,
            );
        }
        let frames_to_play = corrected.len() / OUTPUT_CHANNELS;
        self.backend.play(&bytes, frames_to_play)?;

        self.stats.sum_sync_errors += sync_error;
        self.stats.sum_corrections += amount_to_stuff as i64;
        self.stats.sum_insertions_deletions += amount_to_stuff.unsigned_abs() as i64;
        self.stats.count += 1;
        self.stats.min_dac_queue = self.stats.min_dac_queue.min(dac_delay as u64);
        {
            let buffer = self.handles.buffer.lock().expect("jitter buffer mutex poisoned");
            let occupancy = buffer.occupancy() as i32;
            self.stats.min_occupancy = self.stats.min_occupancy.min(occupancy);
            self.stats.max_occupancy = self.stats.max_occupancy.max(occupancy);
        }

        self.maybe_report(now)?;
        Ok(())
    }

    fn advance_seqno(&mut self, sequence_number: u16) {
        match self.last_seqno_read {
            None => self.last_seqno_read = Some(sequence_number),
            Some(last) => {
                let expected = last.wrapping_add(1);
                if sequence_number != expected {
                    debug!(
                        "Packets out of sequence: expected {expected}, got {sequence_number}."
                    );
                }
                self.last_seqno_read = Some(sequence_number);
            }
        }
    }

    /// Sync lost for more than three consecutive packets: drop source
    /// frames (late) or pad silence (early), then start over.
    fn resync(
        &mut self,
        sync_error: i64,
        resync_frames: i64,
        given_timestamp: u32,
    ) -> PlayerInternalResult<()> {
        if sync_error > 0 {
            let mut source_frames_to_drop = sync_error / self.ratio as i64;
            // extra 0.1 s to give the pipeline room to recover
            source_frames_to_drop += INPUT_RATE as i64 / 10;
            let flush_to = given_timestamp.wrapping_add(source_frames_to_drop as u32);
            info!(
                "Large positive sync error of {sync_error} frames at frame {given_timestamp}, flushing to {flush_to}."
            );
            let mut buffer = self.handles.buffer.lock().expect("jitter buffer mutex poisoned");
            buffer.request_flush(flush_to);
        } else {
            let silence_length = (-sync_error).min(resync_frames * 5);
            info!(
                "Large negative sync error of {sync_error} frames, padding {silence_length} frames of silence."
            );
            self.emit_silence(silence_length)?;
        }
        Ok(())
    }

    /// Probabilistic V-shaped stuffing decision, suppressed for the first
    /// five seconds of a session.
    fn stuffing_decision(&mut self, sync_error: i64, now: Nanos) -> i8 {
        let tolerance = (self.params.drift_tolerance * self.params.output_rate as f64) as i64;
        if tolerance == 0 {
            return 0;
        }
        if self.play_started_at != 0 && now - self.play_started_at < 5 * NANOS_PER_SEC {
            return 0;
        }
        let s: i64 = {
            let r: i64 = self.rng.random();
            ((r >> 31) * tolerance) >> 32
        } + tolerance;
        if sync_error > 0 && sync_error > s {
            -1
        } else if sync_error < 0 && sync_error < -s {
            1
        } else {
            0
        }
    }

    fn apply_dsp(&mut self, lanes: &mut [i32]) {
        let gain = self.fix_volume as f32;
        match &mut self.loudness {
            Some((left, right)) => {
                for pair in lanes.chunks_mut(2) {
                    pair[0] = left.process(pair[0] as f32 * gain) as i32;
                    pair[1] = right.process(pair[1] as f32 * gain) as i32;
                }
            }
            None => {
                for lane in lanes.iter_mut() {
                    *lane = (*lane as f32 * gain) as i32;
                }
            }
        }
    }

    fn maybe_report(&mut self, _now: Nanos) -> PlayerInternalResult<()> {
        if self.play_number == 0 || !self.play_number.is_multiple_of(self.params.print_interval) {
            return Ok(());
        }
        let n = self.stats.count.max(1) as f64;
        let packet_out = self.packet_out as f64;
        let window = {
            let buffer = self.handles.buffer.lock().expect("jitter buffer mutex poisoned");
            StatsWindow {
                sync_error_ms: 1000.0 * (self.stats.sum_sync_errors as f64 / n)
                    / self.params.output_rate as f64,
                net_sync_ppm: (self.stats.sum_corrections as f64 / n) * 1_000_000.0 / packet_out,
                all_sync_ppm: (self.stats.sum_insertions_deletions as f64 / n) * 1_000_000.0
                    / packet_out,
                packets: self.play_number,
                missing: buffer.missing_packets,
                late: buffer.late_packets,
                too_late: buffer.too_late_packets,
                resend_requests: self.handles.resend_requests.load(Ordering::Relaxed),
                min_dac_queue: if self.stats.min_dac_queue == u64::MAX {
                    0
                } else {
                    self.stats.min_dac_queue
                },
                min_buffer_occupancy: if self.stats.min_occupancy == i32::MAX {
                    0
                } else {
                    self.stats.min_occupancy
                },
                max_buffer_occupancy: if self.stats.max_occupancy == i32::MIN {
                    0
                } else {
                    self.stats.max_occupancy
                },
            }
        };
        self.monitoring.player_stats(PlayerStats::Window(window));
        self.stats.reset();
        Ok(())
    }
}

/// One pre-play silence chunk: how much to send now and whether buffering
/// is finished. All quantities in output frames.
pub fn prefill_chunk(
    lead_frames: i64,
    dac_delay: i64,
    desired_out: i64,
    packet_out: i64,
    early_bias: i64,
) -> (i64, bool) {
    let exact_frame_gap = lead_frames - dac_delay;
    // within reach of the start: send the remaining gap, biased early
    if exact_frame_gap <= 2 * packet_out + early_bias {
        let mut fs = exact_frame_gap;
        if fs > early_bias {
            fs -= early_bias;
        }
        return (fs.max(0), true);
    }
    let frames_needed = desired_out - dac_delay;
    let fs = if exact_frame_gap <= frames_needed {
        2 * packet_out
    } else {
        frames_needed
    };
    (fs.max(0), false)
}

/// Difference of two frame counters in modulo 2^(sign_bit+1) arithmetic,
/// sign-extended to i64.
pub fn sign_extended_difference(should_be: i64, will_be: i64, sign_bit: u32) -> i64 {
    let mask = (1i64 << (sign_bit + 1)) - 1;
    let sign_mask = 1i64 << sign_bit;
    let raw = (should_be - will_be) & mask;
    if raw & sign_mask != 0 {
        raw | !mask
    } else {
        raw
    }
}

/// Expand 16-bit stereo input to 32-bit lanes, applying the playback mode
/// and replicating frames by the output sample ratio.
pub fn expand_frame(data: &[u8], mode: PlaybackMode, ratio: usize) -> Vec<i32> {
    let n_frames = data.len() / 4;
    let mut lanes = Vec::with_capacity(n_frames * ratio * OUTPUT_CHANNELS);
    for frame in data.chunks_exact(4) {
        let ls = i16::from_le_bytes([frame[0], frame[1]]) as i32;
        let rs = i16::from_le_bytes([frame[2], frame[3]]) as i32;
        let (ll, rl) = match mode {
            PlaybackMode::Stereo => (ls << 16, rs << 16),
            PlaybackMode::Mono => {
                // keep all 17 bits of the sum; the extra bit feeds dithering
                let both = (ls + rs) << 15;
                (both, both)
            }
            PlaybackMode::ReverseStereo => (rs << 16, ls << 16),
            PlaybackMode::LeftOnly => (ls << 16, ls << 16),
            PlaybackMode::RightOnly => (rs << 16, rs << 16),
        };
        for _ in 0..ratio {
            lanes.push(ll);
            lanes.push(rl);
        }
    }
    lanes
}

/// Basic stuffing: duplicate or delete one frame at a random position.
pub fn stuff_basic(mut lanes: Vec<i32>, amount: i8, rng: &mut StdRng) -> Vec<i32> {
    let n_frames = lanes.len() / OUTPUT_CHANNELS;
    if amount == 0 || n_frames < 3 {
        return lanes;
    }
    let position = rng.random_range(1..n_frames - 1) * OUTPUT_CHANNELS;
    if amount > 0 {
        let l = lanes[position];
        let r = lanes[position + 1];
        lanes.splice(position..position, [l, r]);
    } else {
        lanes.drain(position..position + OUTPUT_CHANNELS);
    }
    lanes
}

/// Resampling stuffing: stretch or squeeze the packet to n ± 1 frames.
pub fn stuff_resample(lanes: &[i32], amount: i8) -> Result<Vec<i32>, String> {
    let n_in = lanes.len() / OUTPUT_CHANNELS;
    if amount == 0 || n_in < 16 {
        return Ok(lanes.to_vec());
    }
    let n_out = (n_in as i64 + amount as i64) as usize;

    let mut planar = vec![Vec::with_capacity(n_in); OUTPUT_CHANNELS];
    for frame in lanes.chunks_exact(OUTPUT_CHANNELS) {
        for (ch, &sample) in frame.iter().enumerate() {
            planar[ch].push(sample as f32);
        }
    }

    let mut resampler = FastFixedIn::<f32>::new(
        n_out as f64 / n_in as f64,
        1.01,
        PolynomialDegree::Septic,
        n_in,
        OUTPUT_CHANNELS,
    )
    .map_err(|e| e.to_string())?;
    let mut out = resampler
        .process_partial(Some(&planar), None)
        .map_err(|e| e.to_string())?;
    let tail = resampler
        .process_partial::<Vec<f32>>(None, None)
        .map_err(|e| e.to_string())?;
    for (ch, tail_ch) in tail.into_iter().enumerate() {
        out[ch].extend(tail_ch);
    }

    // pin the result to exactly n_out frames
    for ch in out.iter_mut() {
        ch.resize(n_out, *ch.last().unwrap_or(&0.0));
    }

    let mut interleaved = Vec::with_capacity(n_out * OUTPUT_CHANNELS);
    for i in 0..n_out {
        for ch in &out {
            interleaved.push(ch[i] as i32);
        }
    }
    Ok(interleaved)
}

/// Single biquad low shelf used by the loudness filter; boost scales down
/// as the volume comes up.
pub struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl Biquad {
    pub fn low_shelf(volume_db: f64) -> Self {
        let gain_db = (-volume_db / 2.0).clamp(0.0, 20.0);
        let a = 10f64.powf(gain_db / 40.0);
        let w0 = 2.0 * std::f64::consts::PI * 120.0 / 44_100.0;
        let alpha = w0.sin() / (2.0 * 0.707);
        let cos_w0 = w0.cos();
        let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;

        let b0 = a * ((a + 1.0) - (a - 1.0) * cos_w0 + two_sqrt_a_alpha);
        let b1 = 2.0 * a * ((a - 1.0) - (a + 1.0) * cos_w0);
        let b2 = a * ((a + 1.0) - (a - 1.0) * cos_w0 - two_sqrt_a_alpha);
        let a0 = (a + 1.0) + (a - 1.0) * cos_w0 + two_sqrt_a_alpha;
        let a1 = -2.0 * ((a - 1.0) + (a + 1.0) * cos_w0);
        let a2 = (a + 1.0) + (a - 1.0) * cos_w0 - two_sqrt_a_alpha;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        }
    }

    pub fn process(&mut self, x: f32) -> f32 {
        let x = x as f64;
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y as f32
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sign_extension_tracks_ratio() {
        // plain case, ratio 1
        assert_eq!(sign_extended_difference(100, 50, 31), 50);
        assert_eq!(sign_extended_difference(50, 100, 31), -50);
        // wrap at 2^32: should_be just past zero, will_be just before it
        let should_be = 5i64;
        let will_be = (1i64 << 32) - 5;
        assert_eq!(sign_extended_difference(should_be, will_be, 31), 10);
        // same at ratio 2 (33-bit space)
        let will_be = (1i64 << 33) - 5;
        assert_eq!(sign_extended_difference(5, will_be, 32), 10);
    }

    #[test]
    fn prefill_tops_up_to_desired_length() {
        // far from the start, empty DAC: fill to the desired length
        let (fs, done) = prefill_chunk(44_100, 0, 6_615, 352, 11_025);
        assert_eq!(fs, 6_615);
        assert!(!done);
        // far from the start, DAC nearly full: small top-up
        let (fs, done) = prefill_chunk(44_100, 6_000, 6_615, 352, 11_025);
        assert_eq!(fs, 615);
        assert!(!done);
    }

    #[test]
    fn prefill_final_chunk_is_biased_early() {
        let (fs, done) = prefill_chunk(12_000, 100, 6_615, 352, 11_025);
        assert!(done);
        assert_eq!(fs, 12_000 - 100 - 11_025);
    }

    /// First frame scheduled 1 s out: the prefill loop sends exactly
    /// lead − bias frames of silence in total.
    #[test]
    fn prefill_totals_lead_minus_bias() {
        let lead_total = 44_100i64;
        let desired = 6_615i64;
        let bias = 11_025i64;
        let mut elapsed = 0i64;
        let mut sent = 0i64;
        loop {
            let dac = (sent - elapsed).max(0);
            let lead = lead_total - elapsed;
            let (fs, done) = prefill_chunk(lead, dac, desired, 352, bias);
            sent += fs;
            if done {
                break;
            }
            // DAC drains in real time while the player waits a packet period
            elapsed += 352;
        }
        assert_eq!(sent, lead_total - bias);
    }

    #[test]
    fn expand_stereo_ratio_one() {
        let mut data = Vec::new();
        data.extend_from_slice(&1000i16.to_le_bytes());
        data.extend_from_slice(&(-2000i16).to_le_bytes());
        let lanes = expand_frame(&data, PlaybackMode::Stereo, 1);
        assert_eq!(lanes, vec![1000 << 16, -2000 << 16]);
    }

    #[test]
    fn expand_mono_averages_channels() {
        let mut data = Vec::new();
        data.extend_from_slice(&1000i16.to_le_bytes());
        data.extend_from_slice(&3000i16.to_le_bytes());
        let lanes = expand_frame(&data, PlaybackMode::Mono, 1);
        // (l + r) << 15 == ((l + r) / 2) << 16
        assert_eq!(lanes, vec![4000 << 15, 4000 << 15]);
    }

    #[test]
    fn expand_replicates_for_upsampling() {
        let mut data = Vec::new();
        data.extend_from_slice(&7i16.to_le_bytes());
        data.extend_from_slice(&8i16.to_le_bytes());
        let lanes = expand_frame(&data, PlaybackMode::Stereo, 4);
        assert_eq!(lanes.len(), 8);
        assert!(lanes.chunks(2).all(|c| c == [7 << 16, 8 << 16]));
    }

    #[test]
    fn basic_stuffing_changes_length_by_one_frame() {
        let mut rng = StdRng::seed_from_u64(42);
        let lanes: Vec<i32> = (0..352 * 2).collect();
        assert_eq!(stuff_basic(lanes.clone(), 0, &mut rng).len(), 352 * 2);
        assert_eq!(stuff_basic(lanes.clone(), 1, &mut rng).len(), 353 * 2);
        assert_eq!(stuff_basic(lanes, -1, &mut rng).len(), 351 * 2);
    }

    #[test]
    fn resample_stuffing_changes_length_by_one_frame() {
        let lanes: Vec<i32> = (0..352)
            .flat_map(|i| {
                let s = ((i as f32 / 10.0).sin() * 1e8) as i32;
                [s, s]
            })
            .collect();
        let longer = stuff_resample(&lanes, 1).unwrap();
        assert_eq!(longer.len(), 353 * 2);
        let shorter = stuff_resample(&lanes, -1).unwrap();
        assert_eq!(shorter.len(), 351 * 2);
    }
}
