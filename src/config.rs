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

//! Tuned parameters of the receiver. There is deliberately no config file
//! handling in here: the library takes this struct as-is and the binary may
//! deserialize it from wherever it likes.

use crate::{
    error::{ConfigError, ConfigResult},
    formats::OutputFormat,
};
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    time::Duration,
};

pub const INPUT_RATE: usize = 44_100;
pub const FRAMES_PER_PACKET: usize = 352;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StuffingMode {
    /// Duplicate or delete a single frame per packet.
    Basic,
    /// Resample the packet to 352 ± 1 frames.
    Soxr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PlaybackMode {
    Stereo,
    Mono,
    ReverseStereo,
    LeftOnly,
    RightOnly,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverParams {
    pub name: String,
    /// Hex device id, also used to derive the PTP shared memory name.
    pub device_id: String,
    pub bind_address: IpAddr,
    pub rtsp_port: u16,
    pub udp_port_base: u16,
    pub udp_port_range: u16,
    pub output_rate: usize,
    pub output_format: OutputFormat,
    pub playback_mode: PlaybackMode,
    pub stuffing_mode: StuffingMode,
    /// Target occupancy of the DAC buffer, in seconds.
    pub desired_buffer_length: f64,
    /// Absolute sync error beyond which the player resynchronizes, seconds.
    pub resync_threshold: f64,
    /// Sync error magnitude tolerated without stuffing, seconds.
    pub drift_tolerance: f64,
    /// Extra latency requested on top of the source-defined value, seconds.
    pub latency_offset: f64,
    pub resend_control_first_check_time: f64,
    pub resend_control_check_interval_time: f64,
    pub resend_control_last_check_time: f64,
    pub disable_resend_requests: bool,
    /// Fixed addend applied to announced anchor frames. Not documented by the
    /// source; see the params validation for the accepted range.
    pub latency_fixed_addend_frames: i32,
    pub expected_notified_latency_frames: i32,
    pub minimum_free_buffer_headroom: usize,
    /// Player statistics window, in packets.
    pub print_interval: u64,
    #[serde(default, with = "serde_millis")]
    pub session_timeout: Option<Duration>,
    #[serde(default, with = "serde_millis")]
    pub active_state_timeout: Option<Duration>,
    pub ptp_control_port: u16,
    /// Explicit shared memory interface name; derived from name + device id
    /// when absent.
    pub smi_name: Option<String>,
    /// Where the pipe backend writes PCM; ignored by other backends.
    pub output_path: Option<PathBuf>,
    pub loudness: bool,
    pub volume_db: f64,
}

impl Default for ReceiverParams {
    fn default() -> Self {
        Self {
            name: "airplay2-rx".to_owned(),
            device_id: "000000000000".to_owned(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            rtsp_port: 7000,
            udp_port_base: 6001,
            udp_port_range: 10,
            output_rate: 44_100,
            output_format: OutputFormat::S16LE,
            playback_mode: PlaybackMode::Stereo,
            stuffing_mode: StuffingMode::Basic,
            desired_buffer_length: 0.15,
            resync_threshold: 0.05,
            drift_tolerance: 0.002,
            latency_offset: 0.0,
            resend_control_first_check_time: 0.10,
            resend_control_check_interval_time: 0.25,
            resend_control_last_check_time: 0.10,
            disable_resend_requests: false,
            latency_fixed_addend_frames: 11_035,
            expected_notified_latency_frames: 77_175,
            minimum_free_buffer_headroom: 125,
            print_interval: 1003,
            session_timeout: None,
            active_state_timeout: Some(Duration::from_secs(10)),
            ptp_control_port: 9000,
            smi_name: None,
            output_path: None,
            loudness: false,
            volume_db: 0.0,
        }
    }
}

impl ReceiverParams {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.output_sample_ratio() == 0 {
            return Err(ConfigError::UnsupportedOutputRate(self.output_rate));
        }
        if !(0..INPUT_RATE as i32).contains(&self.latency_fixed_addend_frames) {
            return Err(ConfigError::LatencyAddendOutOfRange(
                self.latency_fixed_addend_frames,
            ));
        }
        // ± 20 % of the value every known source announces
        let expected = 77_175;
        let window = expected / 5;
        if (self.expected_notified_latency_frames - expected).abs() > window {
            return Err(ConfigError::NotifiedLatencyOutOfRange(
                self.expected_notified_latency_frames,
            ));
        }
        Ok(())
    }

    /// Integer upsampling factor from the 44.1 kHz input to the DAC rate.
    /// Zero means the output rate is unsupported.
    pub fn output_sample_ratio(&self) -> usize {
        match self.output_rate {
            44_100 => 1,
            88_200 => 2,
            176_400 => 4,
            352_800 => 8,
            _ => 0,
        }
    }

    pub fn smi_name(&self) -> String {
        self.smi_name
            .clone()
            .unwrap_or_else(|| format!("/{}-{}", self.name, self.device_id))
    }

    pub fn latency_offset_frames(&self) -> i32 {
        (self.latency_offset * INPUT_RATE as f64) as i32
    }

    pub fn desired_buffer_frames(&self) -> i64 {
        (self.desired_buffer_length * INPUT_RATE as f64) as i64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        assert!(ReceiverParams::default().validate().is_ok());
    }

    #[test]
    fn wild_latency_addend_is_rejected() {
        let params = ReceiverParams {
            latency_fixed_addend_frames: 50_000,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(ConfigError::LatencyAddendOutOfRange(_))
        ));
    }

    #[test]
    fn unsupported_output_rate_is_rejected() {
        let params = ReceiverParams {
            output_rate: 48_000,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(ConfigError::UnsupportedOutputRate(48_000))
        ));
    }
}
