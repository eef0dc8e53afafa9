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

//! Per-connection session state: the stream lifecycle from the second SETUP
//! to TEARDOWN, the shared structures the receivers and the player
//! communicate through, the global play lock, and the watchdog.

pub mod audio;
pub mod control;
pub mod event;

use crate::{
    anchor::Anchor,
    config::ReceiverParams,
    error::{SessionInternalError, SessionInternalResult},
    jitter::JitterBuffer,
    player::PlayerApi,
    time::{NANOS_PER_SEC, Nanos, monotonic_ns},
};
use std::{
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};
use tokio::{runtime, sync::watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Running,
    Flushing,
    TearingDown,
}

/// Determined by the `timingProtocol` field of the first SETUP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamCategory {
    #[default]
    Unspecified,
    Ptp,
    Ntp,
    RemoteControl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    /// Type 96: UDP, ALAC, AES-CBC.
    Realtime,
    /// Type 103: TCP, AAC, ChaCha20-Poly1305.
    Buffered,
}

impl StreamType {
    pub fn label(&self) -> &'static str {
        match self {
            StreamType::Realtime => "realtime",
            StreamType::Buffered => "buffered",
        }
    }
}

/// A flush carried by FLUSHBUFFERED: immediate (no `from`) or deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushRequest {
    pub from_seq: Option<u32>,
    pub from_ts: Option<u32>,
    pub until_seq: u32,
    pub until_ts: u32,
}

impl FlushRequest {
    pub fn is_immediate(&self) -> bool {
        self.from_seq.is_none()
    }

    /// Merge a newer request into this one. For two deferred flushes only
    /// the `until` bound moves; the original `from` is preserved.
    pub fn merge(&mut self, newer: FlushRequest) {
        if let (Some(existing_from), Some(new_from)) = (self.from_seq, newer.from_seq) {
            self.until_seq = newer.until_seq;
            self.until_ts = newer.until_ts;
            if new_from < existing_from {
                self.from_seq = newer.from_seq;
                self.from_ts = newer.from_ts;
            }
        } else {
            *self = newer;
        }
    }

    /// Does the flush cover this (block) sequence number?
    pub fn covers(&self, seq: u32) -> bool {
        let before_until = (self.until_seq.wrapping_sub(seq) as i32) > 0;
        match self.from_seq {
            Some(from) => before_until && (seq.wrapping_sub(from) as i32) >= 0,
            None => before_until,
        }
    }
}

/// State shared between the RTSP conversation, the stream receivers and
/// the player.
pub struct SessionShared {
    pub params: ReceiverParams,
    pub connection_number: u64,
    pub state: Mutex<SessionState>,
    pub buffer: Arc<Mutex<JitterBuffer>>,
    pub anchor: Arc<Mutex<Anchor>>,
    pub arrival_tx: watch::Sender<u64>,
    pub arrival_rx: watch::Receiver<u64>,
    pub play_enabled: Arc<AtomicBool>,
    /// Total source-to-DAC latency in input frames, updated by the control
    /// channel's announcements.
    pub latency_frames: AtomicI64,
    pub resend_requests: Arc<AtomicU64>,
    pub decrypt_failures: AtomicU64,
    pub flush: Mutex<Option<FlushRequest>>,
    pub stop_tx: watch::Sender<bool>,
    pub stop_rx: watch::Receiver<bool>,
}

impl SessionShared {
    pub fn new(params: ReceiverParams, connection_number: u64) -> Arc<Self> {
        let (arrival_tx, arrival_rx) = watch::channel(0);
        let (stop_tx, stop_rx) = watch::channel(false);
        let default_latency = params.expected_notified_latency_frames as i64
            + params.latency_fixed_addend_frames as i64;
        Arc::new(Self {
            params,
            connection_number,
            state: Mutex::new(SessionState::Initializing),
            buffer: Arc::new(Mutex::new(JitterBuffer::new())),
            anchor: Arc::new(Mutex::new(Anchor::new())),
            arrival_tx,
            arrival_rx,
            play_enabled: Arc::new(AtomicBool::new(false)),
            latency_frames: AtomicI64::new(default_latency),
            resend_requests: Arc::new(AtomicU64::new(0)),
            decrypt_failures: AtomicU64::new(0),
            flush: Mutex::new(None),
            stop_tx,
            stop_rx,
        })
    }

    pub fn signal_arrival(&self) {
        self.arrival_tx.send_modify(|count| *count += 1);
    }

    pub fn set_state(&self, new_state: SessionState) {
        let mut state = self.state.lock().expect("session state mutex poisoned");
        if *state != new_state {
            debug!(
                "Connection {}: session state {:?} -> {new_state:?}.",
                self.connection_number, *state
            );
            *state = new_state;
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state mutex poisoned")
    }

    pub fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    pub fn request_stop(&self) {
        self.stop_tx.send(true).ok();
    }

    /// Merge a FLUSHBUFFERED request into the pending one and, for an
    /// immediate flush, propagate it to the player straight away.
    pub fn apply_flush(&self, request: FlushRequest) {
        let mut pending = self.flush.lock().expect("flush mutex poisoned");
        match pending.as_mut() {
            Some(existing) => existing.merge(request),
            None => *pending = Some(request),
        }
        let merged = (*pending).expect("flush request was just stored");
        drop(pending);

        self.set_state(SessionState::Flushing);
        if merged.is_immediate() {
            let mut buffer = self.buffer.lock().expect("jitter buffer mutex poisoned");
            buffer.request_flush(merged.until_ts);
        }
        debug!(
            "Connection {}: flush request now {merged:?}.",
            self.connection_number
        );
    }

    pub fn record_decrypt_failure(&self) -> u64 {
        self.decrypt_failures.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// The holder side of the global play lock.
pub struct PlayLockHolder {
    pub connection_number: u64,
    pub stop_tx: watch::Sender<bool>,
}

#[derive(Default)]
pub struct PlayLock {
    holder: Mutex<Option<PlayLockHolder>>,
}

impl PlayLock {
    /// Try to take the lock for `connection_number`. If another session
    /// holds it, that session is asked to stop and the caller polls every
    /// 100 ms for up to 3 s.
    pub fn acquire(
        &self,
        connection_number: u64,
        stop_tx: watch::Sender<bool>,
    ) -> SessionInternalResult<()> {
        {
            let mut holder = self.holder.lock().expect("play lock mutex poisoned");
            match holder.as_ref() {
                None => {
                    *holder = Some(PlayLockHolder {
                        connection_number,
                        stop_tx,
                    });
                    return Ok(());
                }
                Some(existing) if existing.connection_number == connection_number => {
                    return Ok(());
                }
                Some(existing) => {
                    info!(
                        "Connection {connection_number}: play lock held by connection {}, asking it to stop.",
                        existing.connection_number
                    );
                    existing.stop_tx.send(true).ok();
                }
            }
        }

        for _ in 0..30 {
            thread::sleep(Duration::from_millis(100));
            let mut holder = self.holder.lock().expect("play lock mutex poisoned");
            if holder.is_none() {
                *holder = Some(PlayLockHolder {
                    connection_number,
                    stop_tx,
                });
                return Ok(());
            }
        }

        let holder = self.holder.lock().expect("play lock mutex poisoned");
        let busy = holder
            .as_ref()
            .map(|h| h.connection_number)
            .unwrap_or_default();
        Err(SessionInternalError::PlayLockBusy(busy))
    }

    pub fn release(&self, connection_number: u64) {
        let mut holder = self.holder.lock().expect("play lock mutex poisoned");
        if holder
            .as_ref()
            .is_some_and(|h| h.connection_number == connection_number)
        {
            *holder = None;
            debug!("Connection {connection_number}: play lock released.");
        }
    }

    pub fn held_by(&self) -> Option<u64> {
        self.holder
            .lock()
            .expect("play lock mutex poisoned")
            .as_ref()
            .map(|h| h.connection_number)
    }
}

/// Everything a running stream owns; dropped in two phases by TEARDOWN.
pub struct StreamSession {
    pub stream_type: StreamType,
    pub session_key: [u8; 32],
    pub player: Option<PlayerApi>,
    pub tasks: Vec<thread::JoinHandle<()>>,
    pub data_port: u16,
    pub control_port: u16,
    pub dacp_id: Option<String>,
    pub active_remote: Option<String>,
}

impl StreamSession {
    /// Phase one: stop the player and forget the session key.
    pub fn teardown_stream(&mut self) {
        if let Some(player) = self.player.take() {
            player.stop_and_join();
        }
        self.session_key = [0u8; 32];
    }

    /// Phase two: join the receiver threads (their sockets are closed by
    /// the stop signal having been raised).
    pub fn teardown_session(&mut self) {
        for task in self.tasks.drain(..) {
            task.join().ok();
        }
    }
}

/// Watchdog: ticks every two seconds. AP2 sessions are governed by
/// rate/anchor messages, so the watchdog only reports; a configured
/// `session_timeout` is honored for AP1-style sessions, which this receiver
/// does not host.
pub fn spawn_watchdog(shared: Arc<SessionShared>) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("watchdog-{}", shared.connection_number))
        .spawn(move || {
            let Ok(runtime) = runtime::Builder::new_current_thread().enable_all().build() else {
                warn!("Could not build watchdog runtime.");
                return;
            };
            runtime.block_on(async move {
                let mut stop = shared.stop_rx.clone();
                loop {
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                    }
                    let Some(timeout) = shared.params.session_timeout else {
                        continue;
                    };
                    let last = shared
                        .buffer
                        .lock()
                        .expect("jitter buffer mutex poisoned")
                        .time_of_last_audio_packet;
                    if last == 0 {
                        continue;
                    }
                    let Ok(now) = monotonic_ns() else { continue };
                    let silent_for: Nanos = now - last;
                    if silent_for > timeout.as_nanos() as i64 {
                        // AP2: log only, never auto-cancel
                        debug!(
                            "Connection {}: no audio for {} s (session timeout {} s), rate/anchor messages govern.",
                            shared.connection_number,
                            silent_for / NANOS_PER_SEC,
                            timeout.as_secs()
                        );
                    }
                }
            });
        })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deferred_flush_merge_keeps_original_from() {
        // S2: fromSeq=100 .. untilSeq=200, then fromSeq=150 .. untilSeq=250
        let mut flush = FlushRequest {
            from_seq: Some(100),
            from_ts: Some(35_200),
            until_seq: 200,
            until_ts: 70_400,
        };
        flush.merge(FlushRequest {
            from_seq: Some(150),
            from_ts: Some(52_800),
            until_seq: 250,
            until_ts: 88_000,
        });
        assert_eq!(
            flush,
            FlushRequest {
                from_seq: Some(100),
                from_ts: Some(35_200),
                until_seq: 250,
                until_ts: 88_000,
            }
        );
    }

    #[test]
    fn earlier_from_wins_on_merge() {
        let mut flush = FlushRequest {
            from_seq: Some(100),
            from_ts: Some(35_200),
            until_seq: 200,
            until_ts: 70_400,
        };
        flush.merge(FlushRequest {
            from_seq: Some(50),
            from_ts: Some(17_600),
            until_seq: 210,
            until_ts: 73_920,
        });
        assert_eq!(flush.from_seq, Some(50));
        assert_eq!(flush.until_seq, 210);
    }

    #[test]
    fn immediate_flush_replaces_pending() {
        let mut flush = FlushRequest {
            from_seq: Some(100),
            from_ts: Some(35_200),
            until_seq: 200,
            until_ts: 70_400,
        };
        flush.merge(FlushRequest {
            from_seq: None,
            from_ts: None,
            until_seq: 300,
            until_ts: 105_600,
        });
        assert!(flush.is_immediate());
        assert_eq!(flush.until_seq, 300);
    }

    #[test]
    fn flush_coverage() {
        let deferred = FlushRequest {
            from_seq: Some(100),
            from_ts: Some(0),
            until_seq: 200,
            until_ts: 0,
        };
        assert!(!deferred.covers(99));
        assert!(deferred.covers(100));
        assert!(deferred.covers(199));
        assert!(!deferred.covers(200));

        let immediate = FlushRequest {
            from_seq: None,
            from_ts: None,
            until_seq: 200,
            until_ts: 0,
        };
        assert!(immediate.covers(0));
        assert!(immediate.covers(199));
        assert!(!immediate.covers(200));
    }

    #[test]
    fn play_lock_is_exclusive_then_transferable() {
        let lock = Arc::new(PlayLock::default());
        let (stop_a, stop_a_rx) = watch::channel(false);
        lock.acquire(1, stop_a).unwrap();
        assert_eq!(lock.held_by(), Some(1));

        // contender asks A to stop; simulate A releasing promptly
        let contender = Arc::clone(&lock);
        let waiter = thread::spawn(move || {
            let (stop_b, _stop_b_rx) = watch::channel(false);
            contender.acquire(2, stop_b)
        });
        // wait until B has signalled A, then release as A would
        while !*stop_a_rx.borrow() {
            thread::sleep(Duration::from_millis(10));
        }
        lock.release(1);
        waiter.join().unwrap().unwrap();
        assert_eq!(lock.held_by(), Some(2));
    }
}
