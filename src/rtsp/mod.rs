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

//! The RTSP server: accepts source connections on port 7000, gives each one
//! its own conversation thread and drives the per-connection state machine
//! in `handlers`.

pub mod handlers;
pub mod message;
pub mod pairing;
pub mod plist;

use crate::{
    config::ReceiverParams,
    error::{RtspError, SessionInternalResult},
    mdns::{Advertiser, AdvertisingState},
    monitoring::{Monitoring, StateEvent},
    output::{AudioBackend, NullBackend, PipeBackend},
    ptp::{ClockSource, control::PtpControl},
    rtsp::{
        message::RtspCodec,
        pairing::{PairingRegistry, PairingSession, SessionKeys},
    },
    session::{PlayLock, SessionShared, StreamCategory, StreamSession},
};
use ed25519_dalek::SigningKey;
use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    thread,
};
use tokio::{net::TcpListener, net::TcpStream, runtime, select};
use tracing::{debug, info, instrument, warn};

pub type BackendFactory = Box<dyn Fn() -> Box<dyn AudioBackend> + Send + Sync>;

/// Process-wide state shared by all RTSP connections.
pub struct ServerShared {
    pub params: ReceiverParams,
    pub clock: Arc<dyn ClockSource>,
    pub advertiser: Arc<dyn Advertiser>,
    pub monitoring: Monitoring,
    pub play_lock: PlayLock,
    pub pairings: Mutex<PairingRegistry>,
    pub identity: SigningKey,
    pub status_flags: AtomicU32,
    pub group: Mutex<(Option<String>, bool)>,
    pub ptp_control: PtpControl,
    pub backend_factory: BackendFactory,
    next_connection_number: AtomicU64,
}

impl ServerShared {
    pub fn advertising_state(&self) -> AdvertisingState {
        let (group_uuid, group_contains_group_leader) =
            self.group.lock().expect("group mutex poisoned").clone();
        AdvertisingState {
            device_id: self.params.device_id.clone(),
            public_key_hex: hex::encode(self.identity.verifying_key().to_bytes()),
            pi_uuid: format!("2e388006-13ba-4041-9a67-{}", self.params.device_id),
            model: self.params.name.clone(),
            firmware_version: env!("CARGO_PKG_VERSION").to_owned(),
            features: 0x0001_C340_405F_4A00,
            status_flags: self.status_flags.load(Ordering::Relaxed),
            group_uuid,
            group_contains_group_leader,
        }
    }

    pub fn update_advertising(&self) {
        let state = self.advertising_state();
        self.advertiser
            .update(&state.primary_records(), &state.secondary_records());
    }
}

pub struct RtspServer {
    shared: Arc<ServerShared>,
}

impl RtspServer {
    pub fn new(
        params: ReceiverParams,
        clock: Arc<dyn ClockSource>,
        advertiser: Arc<dyn Advertiser>,
        monitoring: Monitoring,
    ) -> Self {
        let identity = PairingSession::generate_identity();
        let ptp_control = PtpControl::new(params.smi_name(), params.ptp_control_port);
        let backend_factory: BackendFactory = match params.output_path.clone() {
            Some(path) => Box::new(move || Box::new(PipeBackend::new(path.clone()))),
            None => Box::new(|| Box::new(NullBackend::new())),
        };
        Self {
            shared: Arc::new(ServerShared {
                params,
                clock,
                advertiser,
                monitoring,
                play_lock: PlayLock::default(),
                pairings: Mutex::new(PairingRegistry::default()),
                identity,
                status_flags: AtomicU32::new(0x4),
                group: Mutex::new((None, false)),
                ptp_control,
                backend_factory,
                next_connection_number: AtomicU64::new(1),
            }),
        }
    }

    pub fn shared(&self) -> Arc<ServerShared> {
        Arc::clone(&self.shared)
    }

    /// Accept loop. Runs until the enclosing runtime is torn down.
    #[instrument(skip(self))]
    pub async fn run(&self) -> SessionInternalResult<()> {
        let address = SocketAddr::new(self.shared.params.bind_address, self.shared.params.rtsp_port);
        let listener = TcpListener::bind(address).await?;
        info!("RTSP server listening on {address}.");

        let state = self.shared.advertising_state();
        self.shared
            .advertiser
            .register(&state.primary_records(), &state.secondary_records());

        loop {
            let (stream, remote) = listener.accept().await?;
            let connection_number = self
                .shared
                .next_connection_number
                .fetch_add(1, Ordering::Relaxed);
            self.shared
                .monitoring
                .state(StateEvent::ConnectionAccepted {
                    connection_number,
                    remote,
                })
                .await;

            let shared = Arc::clone(&self.shared);
            let stream = stream.into_std()?;
            if let Err(e) = thread::Builder::new()
                .name(format!("rtsp-{connection_number}"))
                .spawn(move || serve_connection(shared, connection_number, stream))
            {
                warn!("Could not spawn a conversation thread: {e}");
            }
        }
    }
}

fn serve_connection(
    shared: Arc<ServerShared>,
    connection_number: u64,
    stream: std::net::TcpStream,
) {
    let Ok(runtime) = runtime::Builder::new_current_thread().enable_all().build() else {
        warn!("Could not build conversation runtime.");
        return;
    };
    runtime.block_on(async move {
        if stream.set_nonblocking(true).is_err() {
            return;
        }
        let Ok(mut stream) = TcpStream::from_std(stream) else {
            return;
        };
        let local_ip = stream
            .local_addr()
            .map(|a| a.ip())
            .unwrap_or_else(|_| shared.params.bind_address);

        let mut connection = Connection::new(shared, connection_number, local_ip);
        connection.serve(&mut stream).await;
        connection.finish().await;
    });
}

/// One RTSP conversation and the session state hanging off it.
pub struct Connection {
    pub shared: Arc<ServerShared>,
    pub connection_number: u64,
    pub local_ip: IpAddr,
    pub codec: RtspCodec,
    pub pairing: PairingSession,
    pub stream_category: StreamCategory,
    pub session: Arc<SessionShared>,
    pub stream_session: Option<StreamSession>,
    pub event_port: u16,
    pub watchdog: Option<thread::JoinHandle<()>>,
    pub event_task: Option<thread::JoinHandle<()>>,
    pub pending_session_keys: Option<SessionKeys>,
}

impl Connection {
    fn new(shared: Arc<ServerShared>, connection_number: u64, local_ip: IpAddr) -> Self {
        let session = SessionShared::new(shared.params.clone(), connection_number);
        let pairing = PairingSession::new(shared.identity.clone());
        Self {
            shared,
            connection_number,
            local_ip,
            codec: RtspCodec::new(),
            pairing,
            stream_category: StreamCategory::Unspecified,
            session,
            stream_session: None,
            event_port: 0,
            watchdog: None,
            event_task: None,
            pending_session_keys: None,
        }
    }

    async fn serve(&mut self, stream: &mut TcpStream) {
        loop {
            let mut stop = self.session.stop_rx.clone();
            let request = select! {
                request = self.codec.read_request(stream) => request,
                _ = stop.changed() => {
                    info!(
                        "Connection {}: asked to stop, closing the conversation.",
                        self.connection_number
                    );
                    break;
                }
            };

            let request = match request {
                Ok(it) => it,
                Err(RtspError::ConnectionClosed) => {
                    debug!("Connection {}: closed by peer.", self.connection_number);
                    break;
                }
                Err(RtspError::Malformed(reason)) => {
                    debug!(
                        "Connection {}: malformed request ({reason}), answering 400.",
                        self.connection_number
                    );
                    let response = message::RtspResponse::with_status(400);
                    if self.codec.write_response(stream, &response, None).await.is_err() {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!("Connection {}: read error: {e}", self.connection_number);
                    break;
                }
            };

            let cseq = request.cseq().map(str::to_owned);
            let outcome = self.dispatch(&request).await;
            let response = match outcome {
                Ok(it) => it,
                Err(e) => {
                    warn!(
                        "Connection {}: {} handler failed: {e}",
                        self.connection_number, request.method
                    );
                    message::RtspResponse::with_status(400)
                }
            };

            if self
                .codec
                .write_response(stream, &response, cseq.as_deref())
                .await
                .is_err()
            {
                break;
            }

            // pairing completed: all further traffic is encrypted
            if let Some(keys) = self.pending_session_keys.take() {
                self.codec.enable_encryption(keys.channel_cipher());
                debug!(
                    "Connection {}: channel encryption enabled.",
                    self.connection_number
                );
            }
        }
    }

    /// Final cleanup when the conversation ends for any reason.
    async fn finish(&mut self) {
        self.teardown_session().await;
        self.shared
            .monitoring
            .state(StateEvent::ConnectionClosed {
                connection_number: self.connection_number,
            })
            .await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        error::ClockResult,
        mdns::{NullAdvertiser, STATUS_FLAG_DEVICE_SUPPORTS_RELAY},
        monitoring::test_monitoring,
        ptp::ClockLookup,
        rtsp::{message::RtspRequest, plist, plist::Value},
    };
    use std::net::Ipv4Addr;

    struct TestClock;

    impl ClockSource for TestClock {
        fn get_clock_info(&self) -> ClockResult<ClockLookup> {
            Ok(ClockLookup::NotReady)
        }
    }

    fn test_server() -> RtspServer {
        let params = ReceiverParams {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            udp_port_base: 41_001,
            ..Default::default()
        };
        RtspServer::new(
            params,
            Arc::new(TestClock),
            Arc::new(NullAdvertiser),
            test_monitoring(),
        )
    }

    fn setup_request(body: &Value) -> RtspRequest {
        RtspRequest {
            method: "SETUP".to_owned(),
            uri: "rtsp://127.0.0.1/4433243".to_owned(),
            headers: vec![
                ("CSeq".to_owned(), "3".to_owned()),
                ("DACP-ID".to_owned(), "4A1B2C3D4E5F".to_owned()),
                ("Active-Remote".to_owned(), "386144578".to_owned()),
            ],
            body: plist::serialize(body),
        }
    }

    /// Scenario: a buffered session from first SETUP to TEARDOWN. The first
    /// SETUP yields the event port and flips the relay status bit; the
    /// second yields data/control ports and the 8 MiB audio buffer size.
    #[tokio::test]
    async fn buffered_session_setup_flow() {
        let server = test_server();
        let mut connection =
            Connection::new(server.shared(), 1, IpAddr::V4(Ipv4Addr::LOCALHOST));

        // first SETUP: timing protocol and peers
        let mut peer_info = Value::dict();
        peer_info.insert(
            "Addresses",
            Value::Array(vec![Value::String("10.0.0.5".to_owned())]),
        );
        let mut body = Value::dict();
        body.insert("timingProtocol", Value::String("PTP".to_owned()))
            .insert("groupUUID", Value::String("f1e2d3c4".to_owned()))
            .insert("timingPeerInfo", peer_info);

        let response = connection.dispatch(&setup_request(&body)).await.unwrap();
        assert_eq!(response.status, 200);
        let response = plist::parse(&response.body).unwrap();
        let event_port = response.get("eventPort").and_then(Value::as_u64).unwrap();
        assert_ne!(event_port, 0);
        assert_eq!(response.get("timingPort").and_then(Value::as_u64), Some(0));
        assert!(
            server.shared().status_flags.load(Ordering::Relaxed)
                & STATUS_FLAG_DEVICE_SUPPORTS_RELAY
                != 0
        );

        // second SETUP: the buffered stream itself
        let mut stream0 = Value::dict();
        stream0
            .insert("type", Value::Integer(103))
            .insert("shk", Value::Data(vec![0x42; 32]));
        let mut body = Value::dict();
        body.insert("streams", Value::Array(vec![stream0]));

        let response = connection.dispatch(&setup_request(&body)).await.unwrap();
        assert_eq!(response.status, 200);
        let response = plist::parse(&response.body).unwrap();
        let streams = response.get("streams").and_then(Value::as_array).unwrap();
        assert_eq!(streams[0].get("type").and_then(Value::as_u64), Some(103));
        assert!(streams[0].get("dataPort").and_then(Value::as_u64).is_some());
        assert!(streams[0].get("controlPort").and_then(Value::as_u64).is_some());
        assert_eq!(
            streams[0].get("audioBufferSize").and_then(Value::as_u64),
            Some(8 * 1024 * 1024)
        );
        assert_eq!(
            connection.stream_session.as_ref().unwrap().dacp_id.as_deref(),
            Some("4A1B2C3D4E5F")
        );

        // full teardown unwinds everything and frees the play lock
        let teardown = RtspRequest {
            method: "TEARDOWN".to_owned(),
            uri: "rtsp://127.0.0.1/4433243".to_owned(),
            headers: vec![("CSeq".to_owned(), "9".to_owned())],
            body: Vec::new(),
        };
        let response = connection.dispatch(&teardown).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(server.shared().play_lock.held_by(), None);
    }

    #[tokio::test]
    async fn stream_setup_without_session_is_rejected() {
        let server = test_server();
        let mut connection =
            Connection::new(server.shared(), 2, IpAddr::V4(Ipv4Addr::LOCALHOST));

        let mut stream0 = Value::dict();
        stream0.insert("type", Value::Integer(103));
        let mut body = Value::dict();
        body.insert("streams", Value::Array(vec![stream0]));

        let response = connection.dispatch(&setup_request(&body)).await.unwrap();
        assert_eq!(response.status, 451);
    }

    #[tokio::test]
    async fn ntp_sessions_are_unsupported() {
        let server = test_server();
        let mut connection =
            Connection::new(server.shared(), 3, IpAddr::V4(Ipv4Addr::LOCALHOST));

        let mut body = Value::dict();
        body.insert("timingProtocol", Value::String("NTP".to_owned()));
        let response = connection.dispatch(&setup_request(&body)).await.unwrap();
        assert_eq!(response.status, 501);
    }

    #[tokio::test]
    async fn unknown_method_gets_501() {
        let server = test_server();
        let mut connection =
            Connection::new(server.shared(), 4, IpAddr::V4(Ipv4Addr::LOCALHOST));
        let request = RtspRequest {
            method: "DESCRIBE".to_owned(),
            uri: "*".to_owned(),
            headers: Vec::new(),
            body: Vec::new(),
        };
        let response = connection.dispatch(&request).await.unwrap();
        assert_eq!(response.status, 501);
    }
}
