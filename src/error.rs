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

use miette::Diagnostic;
use std::io;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

#[derive(Error, Debug, Diagnostic)]
#[error("System clock error: {0}")]
pub struct SystemClockError(pub String);

pub type SystemClockResult<T> = Result<T, SystemClockError>;

#[derive(Error, Debug, Diagnostic)]
pub enum ClockError {
    #[error("System clock error: {0}")]
    SystemClockError(#[from] SystemClockError),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Shared memory region '{0}' is not available")]
    ShmUnavailable(String),
    #[error("PTP shared memory version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u16, actual: u16 },
    #[error("PTP service unavailable for longer than {0} seconds")]
    ServiceTimeout(u64),
}

pub type ClockResult<T> = Result<T, ClockError>;

#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Unsupported output format: {0}")]
    UnsupportedOutputFormat(String),
    #[error("Unsupported output rate: {0} (must be 44100 x {{1,2,4,8}})")]
    UnsupportedOutputRate(usize),
    #[error("Latency addend {0} frames is out of range (0..44100)")]
    LatencyAddendOutOfRange(i32),
    #[error("Expected notified latency {0} frames is out of range")]
    NotifiedLatencyOutOfRange(i32),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Error, Debug, Diagnostic)]
pub enum CryptoError {
    #[error("Decryption failed")]
    DecryptFailed,
    #[error("Encryption failed")]
    EncryptFailed,
    #[error("Ciphertext too short: {0} bytes")]
    TruncatedCiphertext(usize),
    #[error("Pairing state error: {0}")]
    PairingState(String),
    #[error("Signature verification failed")]
    BadSignature,
}

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Error, Debug, Diagnostic)]
pub enum DecodeError {
    #[error("Malformed ADTS header")]
    BadAdtsHeader,
    #[error("Codec error: {0}")]
    CodecError(String),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
    #[error("Packet too short: {0} bytes")]
    TruncatedPacket(usize),
}

pub type DecodeResult<T> = Result<T, DecodeError>;

#[derive(Error, Debug, Diagnostic)]
pub enum PlistError {
    #[error("Not a binary plist")]
    BadMagic,
    #[error("Malformed binary plist: {0}")]
    Malformed(String),
    #[error("Unsupported object type: 0x{0:02x}")]
    UnsupportedType(u8),
}

pub type PlistResult<T> = Result<T, PlistError>;

#[derive(Error, Debug, Diagnostic)]
pub enum RtspError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Malformed RTSP message: {0}")]
    Malformed(String),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
    #[error("Plist error: {0}")]
    PlistError(#[from] PlistError),
    #[error("Connection closed by peer")]
    ConnectionClosed,
}

pub type RtspResult<T> = Result<T, RtspError>;

#[derive(Error, Debug, Diagnostic)]
pub enum PlayerInternalError {
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Clock error: {0}")]
    ClockError(#[from] ClockError),
    #[error("System clock error: {0}")]
    SystemClockError(#[from] SystemClockError),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Output device stalled")]
    OutputStalled,
    #[error("Channel error.")]
    ChannelError(#[from] oneshot::error::RecvError),
    #[error("Watch error.")]
    WatchError(#[from] watch::error::RecvError),
}

pub type PlayerInternalResult<T> = Result<T, PlayerInternalError>;

#[derive(Error, Debug, Diagnostic)]
pub enum SessionInternalError {
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Clock error: {0}")]
    ClockError(#[from] ClockError),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("RTSP error: {0}")]
    RtspError(#[from] RtspError),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
    #[error("Decode error: {0}")]
    DecodeError(#[from] DecodeError),
    #[error("Player error: {0}")]
    PlayerError(#[from] Box<PlayerInternalError>),
    #[error("Channel error.")]
    ChannelError(#[from] oneshot::error::RecvError),
    #[error("Play lock is held by connection {0} and could not be acquired")]
    PlayLockBusy(u64),
    #[error("Shutdown triggered.")]
    ShutdownTriggered,
}

pub type SessionInternalResult<T> = Result<T, SessionInternalError>;

#[derive(Error, Debug, Diagnostic)]
pub enum Airplay2RxError {
    #[error("I/O error: {0}")]
    IoError(#[from] Box<io::Error>),
    #[error("Config error: {0}")]
    ConfigError(#[from] Box<ConfigError>),
    #[error("Clock error: {0}")]
    ClockError(#[from] Box<ClockError>),
    #[error("Session error: {0}")]
    SessionInternalError(#[from] Box<SessionInternalError>),
    #[error("Player error: {0}")]
    PlayerInternalError(#[from] Box<PlayerInternalError>),
}

pub type Airplay2RxResult<T> = Result<T, Airplay2RxError>;

pub trait ToBoxed {
    fn boxed(self) -> Box<Self>;
}

impl<T: std::error::Error> ToBoxed for T {
    fn boxed(self) -> Box<Self> {
        Box::new(self)
    }
}

pub trait ToBoxedResult<T, E: ToBoxed> {
    fn boxed(self) -> Result<T, Box<E>>;
}

impl<T, E: ToBoxed + std::error::Error> ToBoxedResult<T, E> for std::result::Result<T, E> {
    fn boxed(self) -> Result<T, Box<E>> {
        match self {
            Ok(it) => Ok(it),
            Err(err) => Err(err.boxed()),
        }
    }
}

impl From<SessionInternalError> for Airplay2RxError {
    fn from(value: SessionInternalError) -> Self {
        Airplay2RxError::SessionInternalError(value.boxed())
    }
}

impl From<PlayerInternalError> for Airplay2RxError {
    fn from(value: PlayerInternalError) -> Self {
        Airplay2RxError::PlayerInternalError(value.boxed())
    }
}
