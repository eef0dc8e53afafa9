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

//! The seam to the output device. The player is the only caller of any of
//! these methods. Backends without a hardware queue model their delay in
//! software from frames written versus wall time.

use crate::{
    formats::OutputFormat,
    time::{NANOS_PER_SEC, Nanos, monotonic_ns},
};
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::PathBuf,
};
use tracing::info;

#[derive(Debug, Clone, Copy, Default)]
pub struct BackendStats {
    pub raw_time: Nanos,
    pub corrected_time: Nanos,
    pub actual_delay: u64,
    pub frames_sent: u64,
}

pub trait AudioBackend: Send {
    fn prepare(&mut self) -> io::Result<()>;
    fn start(&mut self, rate: usize, format: OutputFormat) -> io::Result<()>;
    fn play(&mut self, bytes: &[u8], n_frames: usize) -> io::Result<()>;
    /// Frames written but not yet through the DAC.
    fn delay(&mut self) -> io::Result<u64>;
    fn stats(&mut self) -> io::Result<BackendStats>;
    fn flush(&mut self) -> io::Result<()>;
    fn stop(&mut self) -> io::Result<()>;
    fn volume(&mut self, db: f64);
    fn mute(&mut self, muted: bool);
    fn is_running(&self) -> bool;
    /// Hardware attenuator range `(min_db, max_db)`, if there is one.
    fn parameters(&self) -> Option<(f64, f64)>;
}

/// Writes raw PCM to a file or FIFO, pacing accounted for by a software
/// delay model.
pub struct PipeBackend {
    path: PathBuf,
    file: Option<File>,
    rate: usize,
    started_at: Nanos,
    frames_sent: u64,
    running: bool,
}

impl PipeBackend {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            rate: 0,
            started_at: 0,
            frames_sent: 0,
            running: false,
        }
    }

    fn modelled_delay(&self, now: Nanos) -> u64 {
        if self.rate == 0 || self.started_at == 0 {
            return 0;
        }
        let elapsed_frames = ((now - self.started_at) as i128 * self.rate as i128
            / NANOS_PER_SEC as i128) as i64;
        (self.frames_sent as i64 - elapsed_frames).max(0) as u64
    }
}

impl AudioBackend for PipeBackend {
    fn prepare(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn start(&mut self, rate: usize, format: OutputFormat) -> io::Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        info!(
            "Pipe backend started at {rate} Hz, {format:?}, writing to {}.",
            self.path.display()
        );
        self.file = Some(file);
        self.rate = rate;
        self.started_at = 0;
        self.frames_sent = 0;
        self.running = true;
        Ok(())
    }

    fn play(&mut self, bytes: &[u8], n_frames: usize) -> io::Result<()> {
        let Some(file) = &mut self.file else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "not started"));
        };
        if self.started_at == 0 {
            self.started_at = monotonic_ns().map_err(io::Error::other)?;
        }
        file.write_all(bytes)?;
        self.frames_sent += n_frames as u64;
        Ok(())
    }

    fn delay(&mut self) -> io::Result<u64> {
        let now = monotonic_ns().map_err(io::Error::other)?;
        Ok(self.modelled_delay(now))
    }

    fn stats(&mut self) -> io::Result<BackendStats> {
        let now = monotonic_ns().map_err(io::Error::other)?;
        Ok(BackendStats {
            raw_time: now,
            corrected_time: now,
            actual_delay: self.modelled_delay(now),
            frames_sent: self.frames_sent,
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        self.frames_sent = 0;
        self.started_at = 0;
        Ok(())
    }

    fn stop(&mut self) -> io::Result<()> {
        self.file = None;
        self.running = false;
        Ok(())
    }

    fn volume(&mut self, _db: f64) {}

    fn mute(&mut self, _muted: bool) {}

    fn is_running(&self) -> bool {
        self.running
    }

    fn parameters(&self) -> Option<(f64, f64)> {
        None
    }
}

/// Discards audio; used by tests and as a last-resort backend. The delay
/// model pretends the DAC drains perfectly on schedule.
pub struct NullBackend {
    rate: usize,
    started_at: Nanos,
    frames_sent: u64,
    running: bool,
    /// Test hook: every `play` call as `(n_frames, silent_leading_bytes)`.
    pub plays: Vec<(usize, Vec<u8>)>,
    pub capture: bool,
}

impl NullBackend {
    pub fn new() -> Self {
        Self {
            rate: 0,
            started_at: 0,
            frames_sent: 0,
            running: false,
            plays: Vec::new(),
            capture: false,
        }
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for NullBackend {
    fn prepare(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn start(&mut self, rate: usize, _format: OutputFormat) -> io::Result<()> {
        self.rate = rate;
        self.started_at = 0;
        self.frames_sent = 0;
        self.running = true;
        Ok(())
    }

    fn play(&mut self, bytes: &[u8], n_frames: usize) -> io::Result<()> {
        if self.started_at == 0 {
            self.started_at = monotonic_ns().map_err(io::Error::other)?;
        }
        self.frames_sent += n_frames as u64;
        if self.capture {
            self.plays.push((n_frames, bytes.to_vec()));
        }
        Ok(())
    }

    fn delay(&mut self) -> io::Result<u64> {
        if self.rate == 0 || self.started_at == 0 {
            return Ok(0);
        }
        let now = monotonic_ns().map_err(io::Error::other)?;
        let elapsed_frames =
            ((now - self.started_at) as i128 * self.rate as i128 / NANOS_PER_SEC as i128) as i64;
        Ok((self.frames_sent as i64 - elapsed_frames).max(0) as u64)
    }

    fn stats(&mut self) -> io::Result<BackendStats> {
        let now = monotonic_ns().map_err(io::Error::other)?;
        let actual_delay = self.delay()?;
        Ok(BackendStats {
            raw_time: now,
            corrected_time: now,
            actual_delay,
            frames_sent: self.frames_sent,
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        self.frames_sent = 0;
        self.started_at = 0;
        Ok(())
    }

    fn stop(&mut self) -> io::Result<()> {
        self.running = false;
        Ok(())
    }

    fn volume(&mut self, _db: f64) {}

    fn mute(&mut self, _muted: bool) {}

    fn is_running(&self) -> bool {
        self.running
    }

    fn parameters(&self) -> Option<(f64, f64)> {
        None
    }
}
