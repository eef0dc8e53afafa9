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

//! Monitoring side channel. Subsystems push state changes and statistics
//! into a handle; a single fan-in task renders them. Statistics use a
//! non-blocking send and are dropped rather than ever stalling audio.

use std::net::SocketAddr;
use tokio::{
    spawn,
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub enum MonitoringEvent {
    State(StateEvent),
    Stats(Stats),
}

#[derive(Debug, Clone)]
pub enum StateEvent {
    ConnectionAccepted {
        connection_number: u64,
        remote: SocketAddr,
    },
    StreamSelected {
        connection_number: u64,
        stream_type: &'static str,
    },
    PlayLockAcquired {
        connection_number: u64,
    },
    TeardownPhase {
        connection_number: u64,
        phase: u8,
    },
    ConnectionClosed {
        connection_number: u64,
    },
}

#[derive(Debug, Clone)]
pub enum Stats {
    Rx(RxStats),
    Player(PlayerStats),
}

#[derive(Debug, Clone)]
pub enum RxStats {
    MalformedPacket(String),
    DecryptFailed { total: u64 },
    /// Inter-arrival timing of the realtime stream over a 2500 packet window.
    ArrivalInterval {
        mean_us: f64,
        stddev_us: f64,
        max_us: f64,
    },
    /// High-water mark of the buffered ring's free space.
    RingMinimumFree { bytes: usize },
}

#[derive(Debug, Clone)]
pub enum PlayerStats {
    /// One row per print interval (~1003 packets).
    Window(StatsWindow),
    Resync {
        sync_error_frames: i64,
    },
    Prefill {
        silence_frames: i64,
    },
}

#[derive(Debug, Clone, Default)]
pub struct StatsWindow {
    pub sync_error_ms: f64,
    pub net_sync_ppm: f64,
    pub all_sync_ppm: f64,
    pub packets: u64,
    pub missing: u64,
    pub late: u64,
    pub too_late: u64,
    pub resend_requests: u64,
    pub min_dac_queue: u64,
    pub min_buffer_occupancy: i32,
    pub max_buffer_occupancy: i32,
}

#[derive(Debug, Clone)]
pub struct Monitoring {
    tx: mpsc::Sender<MonitoringEvent>,
}

impl Monitoring {
    pub async fn state(&self, event: StateEvent) {
        self.tx.send(MonitoringEvent::State(event)).await.ok();
    }

    pub fn rx_stats(&self, stats: RxStats) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(MonitoringEvent::Stats(Stats::Rx(stats)))
        {
            warn!("Dropping receiver stats, buffer is full!");
        }
    }

    pub fn player_stats(&self, stats: PlayerStats) {
        if let Err(TrySendError::Full(_)) = self
            .tx
            .try_send(MonitoringEvent::Stats(Stats::Player(stats)))
        {
            warn!("Dropping player stats, buffer is full!");
        }
    }
}

/// Start the fan-in task. Keep the returned handle alive for the process
/// lifetime; monitoring ends when the last `Monitoring` clone is dropped.
pub fn start_monitoring() -> (Monitoring, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(1024);
    let handle = spawn(async move {
        while let Some(event) = rx.recv().await {
            render(event);
        }
    });
    (Monitoring { tx }, handle)
}

/// A handle whose events go nowhere, for tests without a runtime.
#[cfg(test)]
pub fn test_monitoring() -> Monitoring {
    let (tx, _rx) = mpsc::channel(1024);
    Monitoring { tx }
}

fn render(event: MonitoringEvent) {
    match event {
        MonitoringEvent::State(state) => match state {
            StateEvent::ConnectionAccepted {
                connection_number,
                remote,
            } => info!("Connection {connection_number}: accepted from {remote}."),
            StateEvent::StreamSelected {
                connection_number,
                stream_type,
            } => info!("Connection {connection_number}: {stream_type} stream selected."),
            StateEvent::PlayLockAcquired { connection_number } => {
                info!("Connection {connection_number}: play lock acquired.")
            }
            StateEvent::TeardownPhase {
                connection_number,
                phase,
            } => info!("Connection {connection_number}: teardown phase {phase}."),
            StateEvent::ConnectionClosed { connection_number } => {
                info!("Connection {connection_number}: closed.")
            }
        },
        MonitoringEvent::Stats(stats) => match stats {
            Stats::Rx(RxStats::MalformedPacket(reason)) => {
                debug!("Malformed packet: {reason}")
            }
            Stats::Rx(RxStats::DecryptFailed { total }) => {
                debug!("Audio packet decrypt failure ({total} so far).")
            }
            Stats::Rx(RxStats::ArrivalInterval {
                mean_us,
                stddev_us,
                max_us,
            }) => info!(
                "Realtime packet inter-arrival: mean {mean_us:.1} µs, stddev {stddev_us:.1} µs, max {max_us:.1} µs."
            ),
            Stats::Rx(RxStats::RingMinimumFree { bytes }) => {
                debug!("Buffered ring minimum free space: {bytes} bytes.")
            }
            Stats::Player(PlayerStats::Window(w)) => info!(
                "sync error ms {:8.2}, net sync ppm {:8.1}, all sync ppm {:8.1}, packets {:8}, missing {:6}, late {:6}, too late {:6}, resend reqs {:6}, min DAC queue {:8}, min buffers {:5}, max buffers {:5}",
                w.sync_error_ms,
                w.net_sync_ppm,
                w.all_sync_ppm,
                w.packets,
                w.missing,
                w.late,
                w.too_late,
                w.resend_requests,
                w.min_dac_queue,
                w.min_buffer_occupancy,
                w.max_buffer_occupancy
            ),
            Stats::Player(PlayerStats::Resync { sync_error_frames }) => info!(
                "Lost sync with the source, resynchronizing; sync error {sync_error_frames} frames."
            ),
            Stats::Player(PlayerStats::Prefill { silence_frames }) => {
                debug!("Sent {silence_frames} frames of lead-in silence.")
            }
        },
    }
}
