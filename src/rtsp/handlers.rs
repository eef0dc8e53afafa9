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

//! Request handlers for the AP2 method set. Responses follow the error
//! envelope: 200 on success, 400 on malformed plists, 451 on session
//! mismatch, 470 on pairing failure, 501 for anything not implemented.

use super::{Connection, message::RtspRequest, message::RtspResponse, plist, plist::Value};
use crate::{
    anchor::AnchorData,
    codec::FmtpParams,
    crypto::RealtimeAudioCipher,
    error::SessionInternalResult,
    mdns::STATUS_FLAG_DEVICE_SUPPORTS_RELAY,
    monitoring::StateEvent,
    player::{PlayerHandles, start_player},
    resend::ResendRequester,
    session::{
        self, FlushRequest, StreamCategory, StreamSession, StreamType,
        audio::{
            BufferedStreamConfig, RealtimeStreamConfig, spawn_buffered_receiver,
            spawn_realtime_receiver,
        },
        control::spawn_control_receiver,
        event::spawn_event_receiver,
    },
};
use socket2::{Domain, Protocol as SockProto, SockAddr, Socket, Type};
use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::{Arc, atomic::Ordering},
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const AUDIO_BUFFER_SIZE: usize = 8 * 1024 * 1024;

impl Connection {
    pub(super) async fn dispatch(
        &mut self,
        request: &RtspRequest,
    ) -> SessionInternalResult<RtspResponse> {
        debug!(
            "Connection {}: {} {}, {} byte body.",
            self.connection_number,
            request.method,
            request.uri,
            request.body.len()
        );

        let path = request
            .uri
            .rsplit_once('/')
            .map(|(_, tail)| tail)
            .unwrap_or(request.uri.as_str());

        match (request.method.as_str(), path) {
            ("OPTIONS", _) => Ok(self.handle_options()),
            ("POST", "pair-setup") => Ok(self.handle_pair_setup(request)),
            ("POST", "pair-verify") => Ok(self.handle_pair_verify(request)),
            ("POST", "pair-add") => Ok(self.handle_pair_add(request)),
            ("POST", "pair-list") => Ok(self.handle_pair_list()),
            ("POST", "pair-remove") => Ok(self.handle_pair_remove(request)),
            ("POST", "fp-setup") => Ok(self.handle_fp_setup(request)),
            ("POST", "configure") => Ok(RtspResponse::ok().plist_body(&Value::dict())),
            ("POST", "feedback") => Ok(RtspResponse::ok()),
            ("POST", "command") => Ok(self.handle_command(request)),
            ("POST", "audioMode") => Ok(RtspResponse::ok()),
            ("GET", "info") => Ok(self.handle_get_info()),
            ("SETUP", _) => self.handle_setup(request).await,
            ("RECORD", _) => Ok(RtspResponse::ok().header("Audio-Latency", "0")),
            ("SETRATEANCHORTIME", _) => Ok(self.handle_setrateanchortime(request)),
            // rate control rides on SETRATEANCHORTIME's rate flag; a bare
            // SETRATE stays unimplemented
            ("SETRATE", _) => Ok(RtspResponse::with_status(501)),
            ("FLUSHBUFFERED", _) => Ok(self.handle_flushbuffered(request)),
            ("FLUSH", _) => Ok(self.handle_flush()),
            ("SETPEERS", _) => self.handle_setpeers(request).await,
            ("GET_PARAMETER", _) => Ok(self.handle_get_parameter(request)),
            ("SET_PARAMETER", _) => Ok(self.handle_set_parameter(request)),
            ("TEARDOWN", _) => self.handle_teardown(request).await,
            (method, _) => {
                warn!(
                    "Connection {}: unknown method {method}, answering 501.",
                    self.connection_number
                );
                Ok(RtspResponse::with_status(501))
            }
        }
    }

    fn handle_options(&self) -> RtspResponse {
        RtspResponse::ok().header(
            "Public",
            "ANNOUNCE, SETUP, RECORD, PAUSE, FLUSH, FLUSHBUFFERED, TEARDOWN, OPTIONS, \
             POST, GET, PUT, SETPEERS, SETRATEANCHORTIME, GET_PARAMETER, SET_PARAMETER",
        )
    }

    // -- pairing ----------------------------------------------------------

    fn handle_pair_setup(&mut self, request: &RtspRequest) -> RtspResponse {
        match self.pairing.pair_setup(&request.body) {
            Ok(body) => RtspResponse::ok().data_body("application/octet-stream", body),
            Err(e) => {
                warn!("Connection {}: pair-setup failed: {e}", self.connection_number);
                RtspResponse::with_status(470)
            }
        }
    }

    fn handle_pair_verify(&mut self, request: &RtspRequest) -> RtspResponse {
        match self.pairing.pair_verify(&request.body) {
            Ok((body, keys)) => {
                // encryption switches on after this response goes out
                self.pending_session_keys = keys;
                RtspResponse::ok().data_body("application/octet-stream", body)
            }
            Err(e) => {
                warn!(
                    "Connection {}: pair-verify failed: {e}",
                    self.connection_number
                );
                RtspResponse::with_status(470)
            }
        }
    }

    fn handle_pair_add(&mut self, request: &RtspRequest) -> RtspResponse {
        let Ok(body) = plist::parse(&request.body) else {
            return RtspResponse::with_status(451);
        };
        let (Some(device_id), Some(pk)) = (
            body.get("deviceID").and_then(Value::as_str),
            body.get("pk").and_then(Value::as_data),
        ) else {
            return RtspResponse::with_status(451);
        };
        let Ok(pk) = <[u8; 32]>::try_from(pk) else {
            return RtspResponse::with_status(451);
        };
        self.shared
            .pairings
            .lock()
            .expect("pairings mutex poisoned")
            .add(device_id.to_owned(), pk);
        RtspResponse::ok()
    }

    fn handle_pair_list(&self) -> RtspResponse {
        let pairings = self.shared.pairings.lock().expect("pairings mutex poisoned");
        let mut devices = Vec::new();
        for (device_id, pk) in pairings.list() {
            let mut entry = Value::dict();
            entry
                .insert("deviceID", Value::String(device_id.clone()))
                .insert("pk", Value::Data(pk.to_vec()));
            devices.push(entry);
        }
        let mut root = Value::dict();
        root.insert("devices", Value::Array(devices));
        RtspResponse::ok().plist_body(&root)
    }

    fn handle_pair_remove(&mut self, request: &RtspRequest) -> RtspResponse {
        let Ok(body) = plist::parse(&request.body) else {
            return RtspResponse::with_status(451);
        };
        let Some(device_id) = body.get("deviceID").and_then(Value::as_str) else {
            return RtspResponse::with_status(451);
        };
        self.shared
            .pairings
            .lock()
            .expect("pairings mutex poisoned")
            .remove(device_id);
        RtspResponse::ok()
    }

    fn handle_fp_setup(&self, request: &RtspRequest) -> RtspResponse {
        // FairPlay is negotiated by an external collaborator; acknowledge
        // the message so the source proceeds to pair-verify
        debug!(
            "Connection {}: fp-setup message of {} bytes.",
            self.connection_number,
            request.body.len()
        );
        RtspResponse::ok().data_body("application/octet-stream", Vec::new())
    }

    fn handle_command(&self, request: &RtspRequest) -> RtspResponse {
        if let Ok(body) = plist::parse(&request.body) {
            if let Some(command_type) = body.get("type").and_then(Value::as_str) {
                debug!(
                    "Connection {}: command \"{command_type}\".",
                    self.connection_number
                );
            }
        }
        RtspResponse::ok()
    }

    // -- info -------------------------------------------------------------

    fn handle_get_info(&self) -> RtspResponse {
        let state = self.shared.advertising_state();
        let mut root = Value::dict();
        root.insert("deviceID", Value::String(state.device_id.clone()))
            .insert("features", Value::Integer(state.features as i64))
            .insert("protocolVersion", Value::String("1.1".to_owned()))
            .insert("srcvers", Value::String("366.0".to_owned()))
            .insert("model", Value::String(state.model.clone()))
            .insert("manufacturer", Value::String(String::new()))
            .insert("name", Value::String(self.shared.params.name.clone()))
            .insert("pi", Value::String(state.pi_uuid.clone()))
            .insert(
                "pk",
                Value::Data(self.shared.identity.verifying_key().to_bytes().to_vec()),
            )
            .insert(
                "statusFlags",
                Value::Integer(self.shared.status_flags.load(Ordering::Relaxed) as i64),
            )
            .insert("keepAliveLowPower", Value::Integer(1))
            .insert("keepAliveSendStatsAsBody", Value::Integer(1));
        RtspResponse::ok().plist_body(&root)
    }

    // -- setup ------------------------------------------------------------

    async fn handle_setup(
        &mut self,
        request: &RtspRequest,
    ) -> SessionInternalResult<RtspResponse> {
        let Ok(body) = plist::parse(&request.body) else {
            return Ok(RtspResponse::with_status(400));
        };

        match body.get("streams") {
            None => self.setup_session(request, &body).await,
            Some(streams) => self.setup_stream(request, streams).await,
        }
    }

    /// First SETUP: establishes the session category, the timing peers and
    /// the event channel.
    async fn setup_session(
        &mut self,
        _request: &RtspRequest,
        body: &Value,
    ) -> SessionInternalResult<RtspResponse> {
        let timing_protocol = body.get("timingProtocol").and_then(Value::as_str);

        self.stream_category = match timing_protocol {
            Some("PTP") => StreamCategory::Ptp,
            Some("NTP") => StreamCategory::Ntp,
            Some("None") => {
                if body
                    .get("isRemoteControlOnly")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                {
                    StreamCategory::RemoteControl
                } else {
                    StreamCategory::Unspecified
                }
            }
            _ => StreamCategory::Unspecified,
        };

        match self.stream_category {
            StreamCategory::Ptp => {}
            StreamCategory::Ntp => {
                warn!(
                    "Connection {}: NTP timing is not supported.",
                    self.connection_number
                );
                return Ok(RtspResponse::with_status(501));
            }
            StreamCategory::RemoteControl => {
                let (listener, event_port) = bind_tcp_listener(self.local_ip)?;
                self.event_port = event_port;
                self.event_task = Some(spawn_event_receiver(Arc::clone(&self.session), listener)?);
                let mut response = Value::dict();
                response
                    .insert("eventPort", Value::Integer(event_port as i64))
                    .insert("timingPort", Value::Integer(0));
                return Ok(RtspResponse::ok().plist_body(&response));
            }
            _ => return Ok(RtspResponse::with_status(400)),
        }

        // a PTP session owns the player; contenders preempt the holder
        match self
            .shared
            .play_lock
            .acquire(self.connection_number, self.session.stop_tx.clone())
        {
            Ok(()) => {
                self.shared
                    .monitoring
                    .state(StateEvent::PlayLockAcquired {
                        connection_number: self.connection_number,
                    })
                    .await;
            }
            Err(e) => {
                warn!(
                    "Connection {}: could not acquire the play lock: {e}",
                    self.connection_number
                );
                return Ok(RtspResponse::with_status(451));
            }
        }

        // forget any previous peer list, then forward the announced one
        self.shared.ptp_control.clear_peers().await.ok();
        let mut peers = Vec::new();
        if let Some(addresses) = body
            .get("timingPeerInfo")
            .and_then(|info| info.get("Addresses"))
            .and_then(Value::as_array)
        {
            for address in addresses {
                if let Some(ip) = address.as_str() {
                    peers.push(ip.to_owned());
                }
            }
        }
        if !peers.is_empty() {
            self.shared.ptp_control.set_peers(&peers).await.ok();
        }

        {
            let mut group = self.shared.group.lock().expect("group mutex poisoned");
            group.0 = body
                .get("groupUUID")
                .and_then(Value::as_str)
                .map(str::to_owned);
            group.1 = body
                .get("groupContainsGroupLeader")
                .and_then(Value::as_bool)
                .unwrap_or(false);
        }

        let (listener, event_port) = bind_tcp_listener(self.local_ip)?;
        self.event_port = event_port;
        self.event_task = Some(spawn_event_receiver(Arc::clone(&self.session), listener)?);
        self.watchdog = Some(session::spawn_watchdog(Arc::clone(&self.session))?);

        self.shared
            .status_flags
            .fetch_or(STATUS_FLAG_DEVICE_SUPPORTS_RELAY, Ordering::Relaxed);
        self.shared.update_advertising();

        let mut timing_peer_info = Value::dict();
        timing_peer_info
            .insert(
                "Addresses",
                Value::Array(vec![Value::String(self.local_ip.to_string())]),
            )
            .insert("ID", Value::String(self.local_ip.to_string()));
        let mut response = Value::dict();
        response
            .insert("eventPort", Value::Integer(event_port as i64))
            .insert("timingPort", Value::Integer(0))
            .insert("timingPeerInfo", timing_peer_info);

        info!(
            "Connection {}: PTP session established, event port {event_port}.",
            self.connection_number
        );
        Ok(RtspResponse::ok().plist_body(&response))
    }

    /// Second SETUP: binds the stream's data and control ports and starts
    /// the receivers and the player.
    async fn setup_stream(
        &mut self,
        request: &RtspRequest,
        streams: &Value,
    ) -> SessionInternalResult<RtspResponse> {
        if self.stream_category != StreamCategory::Ptp {
            return Ok(RtspResponse::with_status(451));
        }
        let Some(stream0) = streams.as_array().and_then(<[Value]>::first) else {
            return Ok(RtspResponse::with_status(400));
        };

        let stream_type = match stream0.get("type").and_then(Value::as_u64) {
            Some(96) => StreamType::Realtime,
            Some(103) => StreamType::Buffered,
            other => {
                warn!(
                    "Connection {}: unhandled stream type {other:?}.",
                    self.connection_number
                );
                return Ok(RtspResponse::with_status(400));
            }
        };

        let mut session_key = [0u8; 32];
        if let Some(shk) = stream0.get("shk").and_then(Value::as_data) {
            if shk.len() == 32 {
                session_key.copy_from_slice(shk);
            }
        }

        let params = &self.shared.params;
        let (control_socket, control_port) =
            bind_udp_in_range(self.local_ip, params.udp_port_base, params.udp_port_range)?;
        let requester = Arc::new(std::sync::Mutex::new(ResendRequester::new(
            control_socket.try_clone()?,
        )?));
        let (resend_tx, resend_rx) = mpsc::channel(64);

        let mut tasks = Vec::new();
        tasks.push(spawn_control_receiver(
            Arc::clone(&self.session),
            control_socket,
            Arc::clone(&requester),
            resend_tx,
        )?);

        let data_port;
        match stream_type {
            StreamType::Realtime => {
                let (data_socket, port) = bind_udp_in_range(
                    self.local_ip,
                    params.udp_port_base,
                    params.udp_port_range,
                )?;
                data_port = port;
                let cipher = stream0
                    .get("shiv")
                    .and_then(Value::as_data)
                    .and_then(|iv| <[u8; 16]>::try_from(iv).ok())
                    .map(|iv| {
                        let mut key = [0u8; 16];
                        key.copy_from_slice(&session_key[..16]);
                        RealtimeAudioCipher::new(key, iv)
                    });
                tasks.push(spawn_realtime_receiver(
                    Arc::clone(&self.session),
                    data_socket,
                    RealtimeStreamConfig {
                        fmtp: FmtpParams::default(),
                        cipher,
                    },
                    requester,
                    resend_rx,
                    self.shared.monitoring.clone(),
                )?);
            }
            StreamType::Buffered => {
                let (listener, port) = bind_tcp_listener(self.local_ip)?;
                data_port = port;
                tasks.extend(spawn_buffered_receiver(
                    Arc::clone(&self.session),
                    listener,
                    BufferedStreamConfig {
                        session_key,
                        audio_buffer_size: AUDIO_BUFFER_SIZE,
                    },
                    resend_rx,
                    self.shared.monitoring.clone(),
                )?);
            }
        }

        let handles = PlayerHandles {
            buffer: Arc::clone(&self.session.buffer),
            anchor: Arc::clone(&self.session.anchor),
            clock: Arc::clone(&self.shared.clock),
            arrival: self.session.arrival_rx.clone(),
            play_enabled: Arc::clone(&self.session.play_enabled),
            resend_requests: Arc::clone(&self.session.resend_requests),
            session_stop: self.session.stop_tx.clone(),
        };
        let backend = (self.shared.backend_factory)();
        let player = start_player(
            self.connection_number,
            self.shared.params.clone(),
            handles,
            backend,
            self.shared.monitoring.clone(),
        )
        .map_err(Box::new)?;

        self.stream_session = Some(StreamSession {
            stream_type,
            session_key,
            player: Some(player),
            tasks,
            data_port,
            control_port,
            dacp_id: request.header("DACP-ID").map(str::to_owned),
            active_remote: request.header("Active-Remote").map(str::to_owned),
        });

        self.session.set_state(session::SessionState::Running);
        self.shared
            .monitoring
            .state(StateEvent::StreamSelected {
                connection_number: self.connection_number,
                stream_type: stream_type.label(),
            })
            .await;

        let mut stream0_response = Value::dict();
        stream0_response
            .insert("type", Value::Integer(if stream_type == StreamType::Buffered { 103 } else { 96 }))
            .insert("dataPort", Value::Integer(data_port as i64))
            .insert("controlPort", Value::Integer(control_port as i64));
        if stream_type == StreamType::Buffered {
            stream0_response.insert("audioBufferSize", Value::Integer(AUDIO_BUFFER_SIZE as i64));
        }

        let mut response = Value::dict();
        response
            .insert("eventPort", Value::Integer(self.event_port as i64))
            .insert("timingPort", Value::Integer(0))
            .insert("streams", Value::Array(vec![stream0_response]));

        info!(
            "Connection {}: {} stream set up, data port {data_port}, control port {control_port}.",
            self.connection_number,
            stream_type.label()
        );
        Ok(RtspResponse::ok().plist_body(&response))
    }

    // -- anchoring and flushing -------------------------------------------

    fn handle_setrateanchortime(&mut self, request: &RtspRequest) -> RtspResponse {
        if self.stream_session.is_none() {
            return RtspResponse::with_status(451);
        }
        let Ok(body) = plist::parse(&request.body) else {
            return RtspResponse::with_status(400);
        };

        if let Some(network_time_secs) = body.get("networkTimeSecs").and_then(Value::as_u64) {
            let clock_id = body
                .get("networkTimeTimelineID")
                .and_then(Value::as_u64)
                .unwrap_or_else(|| {
                    debug!("Can't identify the clock ID of the player.");
                    0
                });
            // the fraction's msb is worth half a second
            let frac = body
                .get("networkTimeFrac")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let frac_ns = ((frac >> 32) * 1_000_000_000) >> 32;
            let anchor_ns = (network_time_secs * 1_000_000_000 + frac_ns) as i64;

            let rtp_time = body.get("rtpTime").and_then(Value::as_u64).unwrap_or(0) as u32;
            let effective_rtp =
                rtp_time.wrapping_sub(self.shared.params.latency_offset_frames() as u32);

            self.session
                .anchor
                .lock()
                .expect("anchor mutex poisoned")
                .save(AnchorData {
                    clock_id,
                    rtp_time: effective_rtp,
                    anchor_time: anchor_ns,
                    flags: 0,
                });
        }

        if let Some(rate) = body.get("rate").and_then(Value::as_u64) {
            let playing = rate & 1 != 0;
            if playing {
                debug!("Connection {}: start playing.", self.connection_number);
            } else {
                debug!("Connection {}: stop playing.", self.connection_number);
            }
            self.session.play_enabled.store(playing, Ordering::Release);
            if playing {
                self.session.signal_arrival();
            }
        }

        RtspResponse::ok()
    }

    fn handle_flushbuffered(&mut self, request: &RtspRequest) -> RtspResponse {
        if self.stream_session.is_none() {
            return RtspResponse::with_status(451);
        }
        let Ok(body) = plist::parse(&request.body) else {
            return RtspResponse::with_status(400);
        };

        let Some(until_seq) = body.get("flushUntilSeq").and_then(Value::as_u64) else {
            debug!("FLUSHBUFFERED without a flushUntilSeq.");
            return RtspResponse::with_status(400);
        };
        let until_ts = body
            .get("flushUntilTS")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let from_seq = body.get("flushFromSeq").and_then(Value::as_u64);
        let from_ts = body.get("flushFromTS").and_then(Value::as_u64);
        if from_seq.is_some() != from_ts.is_some() {
            debug!("flushFromSeq and flushFromTS must come together, ignoring the partial pair.");
        }
        let (from_seq, from_ts) = match (from_seq, from_ts) {
            (Some(seq), Some(ts)) => (Some(seq as u32), Some(ts as u32)),
            _ => (None, None),
        };

        self.session.apply_flush(FlushRequest {
            from_seq,
            from_ts,
            until_seq: until_seq as u32,
            until_ts: until_ts as u32,
        });
        self.session.signal_arrival();
        RtspResponse::ok()
    }

    /// AP1-style FLUSH: drop everything immediately.
    fn handle_flush(&mut self) -> RtspResponse {
        if self.stream_session.is_none() {
            return RtspResponse::with_status(451);
        }
        self.session
            .buffer
            .lock()
            .expect("jitter buffer mutex poisoned")
            .request_flush(0);
        self.session.signal_arrival();
        RtspResponse::ok()
    }

    async fn handle_setpeers(
        &mut self,
        request: &RtspRequest,
    ) -> SessionInternalResult<RtspResponse> {
        let Ok(body) = plist::parse(&request.body) else {
            return Ok(RtspResponse::with_status(400));
        };
        let mut peers = Vec::new();
        if let Some(addresses) = body.as_array() {
            for address in addresses {
                if let Some(ip) = address.as_str() {
                    peers.push(ip.to_owned());
                }
            }
        }
        debug!(
            "Connection {}: SETPEERS with {} addresses.",
            self.connection_number,
            peers.len()
        );
        self.shared.ptp_control.set_peers(&peers).await.ok();
        Ok(RtspResponse::ok())
    }

    // -- parameters -------------------------------------------------------

    fn handle_get_parameter(&self, request: &RtspRequest) -> RtspResponse {
        let body = String::from_utf8_lossy(&request.body);
        if body.trim() == "volume" {
            let text = format!("volume: {:.6}\r\n", self.shared.params.volume_db);
            return RtspResponse::ok().data_body("text/parameters", text.into_bytes());
        }
        RtspResponse::ok()
    }

    fn handle_set_parameter(&mut self, request: &RtspRequest) -> RtspResponse {
        if request.content_type() == Some("text/parameters") {
            let body = String::from_utf8_lossy(&request.body);
            for line in body.lines() {
                if let Some((key, value)) = line.split_once(':') {
                    debug!(
                        "Connection {}: SET_PARAMETER {}: {}.",
                        self.connection_number,
                        key.trim(),
                        value.trim()
                    );
                }
            }
        }
        RtspResponse::ok()
    }

    // -- teardown ---------------------------------------------------------

    async fn handle_teardown(
        &mut self,
        request: &RtspRequest,
    ) -> SessionInternalResult<RtspResponse> {
        let stream_only = plist::parse(&request.body)
            .ok()
            .is_some_and(|body| body.get("streams").is_some());

        if stream_only {
            self.teardown_stream().await;
        } else {
            self.teardown_session().await;
        }

        Ok(RtspResponse::ok())
    }

    /// Phase one: the stream goes away but the session stays.
    pub(super) async fn teardown_stream(&mut self) {
        self.session.set_state(session::SessionState::TearingDown);
        self.shared
            .monitoring
            .state(StateEvent::TeardownPhase {
                connection_number: self.connection_number,
                phase: 1,
            })
            .await;
        self.session.play_enabled.store(false, Ordering::Release);
        if let Some(stream) = self.stream_session.as_mut() {
            stream.teardown_stream();
        }
        self.session
            .anchor
            .lock()
            .expect("anchor mutex poisoned")
            .reset();
    }

    /// Phase two: the whole session is dismantled and the play lock freed.
    pub(super) async fn teardown_session(&mut self) {
        self.teardown_stream().await;
        self.shared
            .monitoring
            .state(StateEvent::TeardownPhase {
                connection_number: self.connection_number,
                phase: 2,
            })
            .await;

        self.session.request_stop();
        if let Some(mut stream) = self.stream_session.take() {
            stream.teardown_session();
        }
        if let Some(event_task) = self.event_task.take() {
            event_task.join().ok();
        }
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.join().ok();
        }
        self.shared.play_lock.release(self.connection_number);

        if self.stream_category == StreamCategory::Ptp {
            self.shared
                .status_flags
                .fetch_and(!STATUS_FLAG_DEVICE_SUPPORTS_RELAY, Ordering::Relaxed);
            {
                let mut group = self.shared.group.lock().expect("group mutex poisoned");
                *group = (None, false);
            }
            self.shared.update_advertising();
            self.stream_category = StreamCategory::Unspecified;
        }
    }
}

// ---------------------------------------------------------------------------
// socket helpers

fn bind_udp_in_range(
    ip: IpAddr,
    base: u16,
    range: u16,
) -> io::Result<(std::net::UdpSocket, u16)> {
    for port in base..base + range {
        match try_bind_udp(ip, port) {
            Ok(socket) => return Ok((socket, port)),
            Err(_) => continue,
        }
    }
    // range exhausted: let the kernel pick
    let socket = try_bind_udp(ip, 0)?;
    let port = socket.local_addr()?.port();
    Ok((socket, port))
}

fn try_bind_udp(ip: IpAddr, port: u16) -> io::Result<std::net::UdpSocket> {
    let domain = match ip {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(SockProto::UDP))?;
    socket.bind(&SockAddr::from(SocketAddr::new(ip, port)))?;
    Ok(socket.into())
}

fn bind_tcp_listener(ip: IpAddr) -> io::Result<(std::net::TcpListener, u16)> {
    let domain = match ip {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(SockProto::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(SocketAddr::new(ip, 0)))?;
    socket.listen(5)?;
    let listener: std::net::TcpListener = socket.into();
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn udp_range_binding_prefers_the_configured_range() {
        let ip = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);
        let (first, port_a) = bind_udp_in_range(ip, 36_001, 10).unwrap();
        assert!((36_001..36_011).contains(&port_a));
        // keep the first socket alive so the next call takes another port
        let (_second, port_b) = bind_udp_in_range(ip, 36_001, 10).unwrap();
        assert_ne!(port_a, port_b);
        drop(first);
    }

    #[test]
    fn tcp_listener_gets_an_ephemeral_port() {
        let ip = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);
        let (_listener, port) = bind_tcp_listener(ip).unwrap();
        assert_ne!(port, 0);
    }
}
