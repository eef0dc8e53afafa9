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

//! Read side of the PTP daemon's shared memory record. The region carries a
//! process-shared mutex in front of a fixed-layout struct; readers lock,
//! copy, unlock, and never write anything else.

use super::{ClockInfo, ClockLookup, ClockSource};
use crate::error::{ClockError, ClockResult};
use libc::{
    MAP_SHARED, O_RDWR, PROT_READ, PROT_WRITE, c_void, close, mmap, munmap, pthread_mutex_lock,
    pthread_mutex_t, pthread_mutex_unlock, shm_open,
};
use std::{ffi::CString, io, ptr, sync::Mutex};
use tracing::{debug, warn};

/// Protocol version this reader understands.
pub const SHM_VERSION: u16 = 7;

/// Fixed layout of the published record. Field order and the leading mutex
/// are part of the cross-process contract.
#[repr(C)]
struct ShmRecord {
    mutex: pthread_mutex_t,
    version: u16,
    master_clock_id: u64,
    master_ip: [u8; 64],
    sample_time: u64,
    offset: u64,
    mastership_start: u64,
}

struct Mapping {
    ptr: *mut ShmRecord,
}

// The raw pointer is only dereferenced under the region's own mutex.
unsafe impl Send for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            munmap(self.ptr as *mut c_void, size_of::<ShmRecord>());
        }
    }
}

/// Clock source backed by the daemon's shared memory region. The mapping is
/// established lazily so that the receiver can start before the daemon does.
pub struct ShmClockSource {
    name: String,
    mapping: Mutex<Option<Mapping>>,
}

impl ShmClockSource {
    pub fn new(smi_name: impl Into<String>) -> Self {
        Self {
            name: smi_name.into(),
            mapping: Mutex::new(None),
        }
    }

    fn open(&self) -> ClockResult<Mapping> {
        let c_name = CString::new(self.name.as_str())
            .map_err(|_| ClockError::ShmUnavailable(self.name.clone()))?;

        let fd = unsafe { shm_open(c_name.as_ptr(), O_RDWR, 0) };
        if fd < 0 {
            return Err(ClockError::ShmUnavailable(self.name.clone()));
        }

        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                size_of::<ShmRecord>(),
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(ClockError::IoError(io::Error::last_os_error()));
        }

        debug!("Mapped PTP shared memory region '{}'.", self.name);

        Ok(Mapping {
            ptr: ptr as *mut ShmRecord,
        })
    }

    fn read_record(&self, mapping: &Mapping) -> (u16, u64, [u8; 64], u64, u64, u64) {
        unsafe {
            let record = mapping.ptr;
            pthread_mutex_lock(&mut (*record).mutex);
            let version = (*record).version;
            let clock_id = (*record).master_clock_id;
            let ip = (*record).master_ip;
            let sample_time = (*record).sample_time;
            let offset = (*record).offset;
            let mastership_start = (*record).mastership_start;
            pthread_mutex_unlock(&mut (*record).mutex);
            (version, clock_id, ip, sample_time, offset, mastership_start)
        }
    }
}

impl ClockSource for ShmClockSource {
    fn get_clock_info(&self) -> ClockResult<ClockLookup> {
        let mut guard = self
            .mapping
            .lock()
            .expect("PTP shm mapping mutex poisoned");

        if guard.is_none() {
            match self.open() {
                Ok(mapping) => *guard = Some(mapping),
                Err(ClockError::ShmUnavailable(_)) => return Ok(ClockLookup::ServiceUnavailable),
                Err(e) => return Err(e),
            }
        }

        let mapping = guard.as_ref().expect("mapping was just established");
        let (version, clock_id, ip, sample_time, offset, mastership_start) =
            self.read_record(mapping);

        if version != SHM_VERSION {
            warn!(
                "PTP shared memory region '{}' has version {version}, expected {SHM_VERSION}.",
                self.name
            );
            return Ok(ClockLookup::VersionMismatch {
                expected: SHM_VERSION,
                actual: version,
            });
        }

        if clock_id == 0 {
            return Ok(ClockLookup::NoMaster);
        }

        if sample_time == 0 {
            return Ok(ClockLookup::NotReady);
        }

        let nul = ip.iter().position(|&b| b == 0).unwrap_or(ip.len());
        let master_ip = String::from_utf8_lossy(&ip[..nul]).into_owned();

        Ok(ClockLookup::Ok(ClockInfo {
            clock_id,
            master_ip,
            sample_time: sample_time as i64,
            raw_offset: offset as i64,
            mastership_start: mastership_start as i64,
        }))
    }
}
