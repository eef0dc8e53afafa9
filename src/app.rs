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

//! Wires the receiver together: parameter validation, the clock source
//! probe, monitoring, advertising, and the RTSP server.

use crate::{
    error::{Airplay2RxResult, ClockError, ToBoxedResult},
    mdns::{Advertiser, NullAdvertiser},
    monitoring::start_monitoring,
    ptp::{ClockLookup, ClockSource, LoggedClockSource, shm::ShmClockSource},
    config::ReceiverParams,
    rtsp::RtspServer,
};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

/// The clock source gets this long to become reachable before the process
/// gives up.
const CLOCK_STARTUP_GRACE: Duration = Duration::from_secs(2);

pub async fn run(params: ReceiverParams) -> Airplay2RxResult<()> {
    run_with(
        params.clone(),
        Arc::new(LoggedClockSource::new(ShmClockSource::new(params.smi_name()))),
        Arc::new(NullAdvertiser),
    )
    .await
}

pub async fn run_with(
    params: ReceiverParams,
    clock: Arc<dyn ClockSource>,
    advertiser: Arc<dyn Advertiser>,
) -> Airplay2RxResult<()> {
    params.validate().boxed()?;

    probe_clock(&*clock).await.boxed()?;

    let (monitoring, _monitoring_task) = start_monitoring();
    let server = RtspServer::new(params, clock, advertiser, monitoring);
    server.run().await?;
    Ok(())
}

/// `not_ready` is fine at startup; a region that stays unreachable past the
/// grace period is fatal.
async fn probe_clock(clock: &dyn ClockSource) -> Result<(), ClockError> {
    let deadline = tokio::time::Instant::now() + CLOCK_STARTUP_GRACE;
    loop {
        match clock.get_clock_info()? {
            ClockLookup::ServiceUnavailable => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(ClockError::ServiceTimeout(CLOCK_STARTUP_GRACE.as_secs()));
                }
                warn!("PTP shared memory not available yet, retrying.");
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            lookup => {
                info!("PTP clock source reachable ({}).", lookup.kind());
                return Ok(());
            }
        }
    }
}
