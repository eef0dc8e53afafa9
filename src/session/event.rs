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

//! Event channel: a TCP port the source connects back to. Only the time
//! announce (0xD7) is recognized; everything else is logged. The channel
//! must stay open for the life of the session.

use super::SessionShared;
use std::{io, sync::Arc, thread};
use tokio::{net::TcpListener, runtime, select};
use tracing::{debug, warn};

pub fn spawn_event_receiver(
    shared: Arc<SessionShared>,
    listener: std::net::TcpListener,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("event-{}", shared.connection_number))
        .spawn(move || {
            let Ok(runtime) = runtime::Builder::new_current_thread().enable_all().build() else {
                warn!("Could not build event receiver runtime.");
                return;
            };
            runtime.block_on(run(shared, listener));
        })
}

async fn run(shared: Arc<SessionShared>, listener: std::net::TcpListener) {
    let connection_number = shared.connection_number;
    if listener.set_nonblocking(true).is_err() {
        return;
    }
    let Ok(listener) = TcpListener::from_std(listener) else {
        return;
    };

    debug!("Connection {connection_number}: event receiver started.");

    let mut stop = shared.stop_rx.clone();
    let mut stream = select! {
        accepted = listener.accept() => match accepted {
            Ok((stream, remote)) => {
                debug!("Connection {connection_number}: event channel accepted from {remote}.");
                stream
            }
            Err(e) => {
                warn!("Connection {connection_number}: event channel accept failed: {e}");
                return;
            }
        },
        _ = stop.changed() => return,
    };

    use tokio::io::AsyncReadExt;

    let mut packet = [0u8; 4096];
    loop {
        select! {
            read = stream.read(&mut packet) => match read {
                Ok(0) => {
                    debug!("Connection {connection_number}: event channel closed by peer.");
                    break;
                }
                Ok(nread) if nread >= 2 && packet[1] == 0xD7 => {
                    debug!(
                        "Connection {connection_number}: event channel time announce, {nread} bytes."
                    );
                }
                Ok(nread) => {
                    debug!(
                        "Connection {connection_number}: unknown event packet of type 0x{:02X}, {nread} bytes.",
                        if nread >= 2 { packet[1] } else { 0 }
                    );
                }
                Err(e) => {
                    warn!("Connection {connection_number}: event channel read error: {e}");
                    break;
                }
            },
            _ = stop.changed() => break,
        }
    }

    debug!("Connection {connection_number}: event receiver stopped.");
}
