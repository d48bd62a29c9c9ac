//! Process-wide gateway service: owns the room registry, the fan-out,
//! per-peer transports and state machines, and the video sender.
//!
//! Formerly-global singletons live here as one explicit service with an
//! `init()`/`stop()` lifecycle; everything is reached by handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use huddle_protocol::{GatewayConfig, JoinPayload, SignalEnvelope, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fanout::{Fanout, QueueDepths, spawn_pump};
use crate::input_router::{InputRouter, RouteOutcome};
use crate::peer::{PeerDeadlines, PeerEffect, PeerEvent, PeerMachine};
use crate::registry::{GuestDefaults, RoomRegistry};
use crate::room::{Room, RoomLimits};
use crate::rtp::Packetizer;
use crate::sender::{EncodedPacket, SenderConfig, VideoSender};
use crate::sink::{InputSink, RumbleEvent};
use crate::stats::{VideoParams, VideoStats};
use crate::transport::{PeerTransport, TransportEvent, webrtc::WebRtcTransport};

struct PeerEntry {
    machine: PeerMachine,
    transport: Arc<dyn PeerTransport>,
    room_code: String,
}

pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<RoomRegistry>,
    fanout: Arc<Fanout>,
    sink: Arc<dyn InputSink>,
    stats: Arc<VideoStats>,
    /// Set when any peer needs an IDR; the encoder integration polls
    /// (or wraps) this flag.
    force_keyframe: Arc<AtomicBool>,
    peers: Mutex<HashMap<Uuid, PeerEntry>>,
    routers: Mutex<HashMap<String, Arc<InputRouter>>>,
    sender: Mutex<Option<VideoSender>>,
    video_params: Mutex<Option<VideoParams>>,
    outbound_signals: Mutex<Option<mpsc::Sender<SignalEnvelope>>>,
    watchdog: Mutex<Option<tokio::task::JoinHandle<()>>>,
    stopping: AtomicBool,
}

impl Gateway {
    pub fn new(config: GatewayConfig, sink: Arc<dyn InputSink>) -> Arc<Self> {
        let limits = RoomLimits {
            max_players: config.webrtc.max_players,
            max_spectators: config.room.max_spectators,
        };
        let defaults = GuestDefaults {
            keyboard: config.room.default_guest_keyboard,
            mouse: config.room.default_guest_mouse,
        };
        let depths = QueueDepths {
            video: config.fanout.video_queue_depth,
            audio: config.fanout.audio_queue_depth,
        };
        Arc::new(Self {
            config,
            registry: Arc::new(RoomRegistry::new(limits, defaults)),
            fanout: Arc::new(Fanout::new(depths)),
            sink,
            stats: Arc::new(VideoStats::default()),
            force_keyframe: Arc::new(AtomicBool::new(false)),
            peers: Mutex::new(HashMap::new()),
            routers: Mutex::new(HashMap::new()),
            sender: Mutex::new(None),
            video_params: Mutex::new(None),
            outbound_signals: Mutex::new(None),
            watchdog: Mutex::new(None),
            stopping: AtomicBool::new(false),
        })
    }

    /// Start background duties (peer deadline watchdog, rumble relay).
    /// Must run inside a tokio runtime.
    pub fn init(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                let Some(gateway) = weak.upgrade() else { break };
                if gateway.stopping.load(Ordering::Relaxed) {
                    break;
                }
                gateway.check_peer_deadlines();
            }
        });
        *self.watchdog.lock().unwrap() = Some(handle);

        // Rumble events from the input backend travel back to whichever
        // room owns the server slot.
        let weak = Arc::downgrade(self);
        self.sink.set_rumble_handler(Arc::new(move |server_slot, event: RumbleEvent| {
            let Some(gateway) = weak.upgrade() else { return };
            gateway.relay_rumble(server_slot, event);
        }));
        info!("Gateway service initialized");
    }

    pub fn stats(&self) -> Arc<VideoStats> {
        Arc::clone(&self.stats)
    }

    /// Keyframe-request flag for the encoder integration. Cleared by
    /// the caller once an IDR is scheduled.
    pub fn keyframe_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.force_keyframe)
    }

    pub fn registry(&self) -> Arc<RoomRegistry> {
        Arc::clone(&self.registry)
    }

    /// Record the parameters the encoder negotiated; surfaced alongside
    /// the send counters for the host UI.
    pub fn set_video_params(&self, params: VideoParams) {
        *self.video_params.lock().unwrap() = Some(params);
    }

    pub fn video_params(&self) -> Option<VideoParams> {
        *self.video_params.lock().unwrap()
    }

    /// Sender for outbound signaling envelopes (answers, candidates).
    pub fn set_signal_sender(&self, tx: mpsc::Sender<SignalEnvelope>) {
        *self.outbound_signals.lock().unwrap() = Some(tx);
    }

    /// Attach the encoder queue and start the sender thread.
    pub fn start_video(self: &Arc<Self>, packet_rx: Receiver<EncodedPacket>) {
        let packetizer = Packetizer::new(
            self.config.video.codec,
            rand::random(),
            self.config.video.payload_type,
        );
        let force_keyframe = Arc::clone(&self.force_keyframe);
        let weak = Arc::downgrade(self);
        let sender = VideoSender::spawn(
            packet_rx,
            Arc::clone(&self.fanout),
            packetizer,
            Arc::clone(&self.stats),
            SenderConfig::default(),
            Arc::new(move || {
                force_keyframe.store(true, Ordering::Relaxed);
            }),
            Arc::new(move |peers| {
                let Some(gateway) = weak.upgrade() else { return };
                for peer_id in peers {
                    gateway.drive_peer(peer_id, PeerEvent::TransportFailed);
                }
            }),
        );
        *self.sender.lock().unwrap() = Some(sender);
    }

    /// Create a room hosted by `host_peer` and attach its transport.
    pub fn create_room_with_transport(
        self: &Arc<Self>,
        host_peer: Uuid,
        host_name: &str,
        transport: Arc<dyn PeerTransport>,
    ) -> anyhow::Result<Arc<Room>> {
        let room = self
            .registry
            .create_room(host_peer, host_name)
            .context("Failed to create room")?;
        self.routers.lock().unwrap().insert(
            room.code().to_string(),
            Arc::new(InputRouter::new(
                Arc::clone(&room),
                Arc::clone(&self.sink),
                Arc::clone(&self.fanout),
            )),
        );
        self.attach_peer(host_peer, room.code(), transport);
        self.drive_peer(host_peer, PeerEvent::Admitted);
        Ok(room)
    }

    /// Create a room with a freshly built WebRTC transport.
    pub async fn create_room(
        self: &Arc<Self>,
        host_peer: Uuid,
        host_name: &str,
    ) -> anyhow::Result<Arc<Room>> {
        let transport = self.new_transport().await?;
        self.create_room_with_transport(host_peer, host_name, transport)
    }

    /// Admit a guest into an existing room and attach its transport.
    pub fn admit_with_transport(
        self: &Arc<Self>,
        room_code: &str,
        peer_id: Uuid,
        join: &JoinPayload,
        transport: Arc<dyn PeerTransport>,
    ) -> anyhow::Result<()> {
        let room = self
            .registry
            .get(room_code)
            .with_context(|| format!("Unknown room {room_code}"))?;
        room.add_spectator(peer_id, &join.name)
            .with_context(|| format!("Admission to {room_code} failed"))?;
        if !join.spectator {
            // No free slot leaves the guest spectating; they can retry
            // after someone leaves.
            if let Err(e) = room.promote_to_player(peer_id) {
                info!(%peer_id, "Joined as spectator: {e}");
            }
        }
        self.attach_peer(peer_id, room_code, transport);
        self.drive_peer(peer_id, PeerEvent::Admitted);
        Ok(())
    }

    pub async fn admit(
        self: &Arc<Self>,
        room_code: &str,
        peer_id: Uuid,
        join: &JoinPayload,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.registry.get(room_code).is_some(),
            "Unknown room {room_code}"
        );
        let transport = self.new_transport().await?;
        self.admit_with_transport(room_code, peer_id, join, transport)
    }

    async fn new_transport(&self) -> anyhow::Result<Arc<dyn PeerTransport>> {
        if !self.config.webrtc.enabled {
            anyhow::bail!("WebRTC streaming is disabled in the configuration");
        }
        let transport = WebRtcTransport::new(&self.config)
            .await
            .context("Failed to create WebRTC transport")?;
        Ok(transport)
    }

    fn attach_peer(
        self: &Arc<Self>,
        peer_id: Uuid,
        room_code: &str,
        transport: Arc<dyn PeerTransport>,
    ) {
        let machine = PeerMachine::new(
            peer_id,
            PeerDeadlines {
                ice_gathering: Duration::from_secs(self.config.room.ice_gathering_deadline_secs),
                dtls: Duration::from_secs(self.config.room.dtls_deadline_secs),
                reconnect: Duration::from_secs(self.config.room.reconnect_window_secs),
            },
        );
        self.peers.lock().unwrap().insert(
            peer_id,
            PeerEntry {
                machine,
                transport: Arc::clone(&transport),
                room_code: room_code.to_string(),
            },
        );
        self.wire_transport(peer_id, room_code, &transport);
        info!(%peer_id, room_code, "Peer attached");
    }

    fn wire_transport(
        self: &Arc<Self>,
        peer_id: Uuid,
        room_code: &str,
        transport: &Arc<dyn PeerTransport>,
    ) {
        let weak = Arc::downgrade(self);
        transport.on_event(Arc::new(move |event| {
            let Some(gateway) = weak.upgrade() else { return };
            gateway.on_transport_event(peer_id, event);
        }));

        let weak = Arc::downgrade(self);
        transport.on_input(Arc::new(move |data| {
            let Some(gateway) = weak.upgrade() else { return };
            gateway.on_input(peer_id, &data);
        }));

        let force_keyframe = Arc::clone(&self.force_keyframe);
        transport.on_keyframe_request(Arc::new(move || {
            force_keyframe.store(true, Ordering::Relaxed);
        }));

        let weak = Arc::downgrade(self);
        let code = room_code.to_string();
        transport.on_local_candidate(Arc::new(move |candidate, sdp_mid, sdp_mline_index| {
            let Some(gateway) = weak.upgrade() else { return };
            gateway.send_signal(SignalEnvelope::new(
                SignalKind::Candidate,
                &code,
                peer_id,
                huddle_protocol::CandidatePayload {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                },
            ));
        }));
    }

    fn send_signal(&self, envelope: SignalEnvelope) {
        let tx = self.outbound_signals.lock().unwrap().clone();
        if let Some(tx) = tx
            && let Err(e) = tx.try_send(envelope)
        {
            warn!("Dropping outbound signal: {e}");
        }
    }

    /// Apply a remote offer for `peer_id` and return the SDP answer.
    pub async fn handle_offer(self: &Arc<Self>, peer_id: Uuid, sdp: String) -> anyhow::Result<String> {
        let transport = self.transport_of(peer_id)?;
        let answer = transport.handle_offer(sdp).await?;
        self.drive_peer(peer_id, PeerEvent::LocalDescriptionReady);
        Ok(answer)
    }

    pub async fn add_ice_candidate(
        &self,
        peer_id: Uuid,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> anyhow::Result<()> {
        let transport = self.transport_of(peer_id)?;
        transport
            .add_remote_candidate(candidate, sdp_mid, sdp_mline_index)
            .await
    }

    /// Swap in a replacement transport for a reconnecting peer. Peer
    /// id, slot, and gamepad claims are preserved.
    pub fn update_peer(
        self: &Arc<Self>,
        peer_id: Uuid,
        transport: Arc<dyn PeerTransport>,
    ) -> anyhow::Result<()> {
        let room_code = {
            let mut peers = self.peers.lock().unwrap();
            let entry = peers
                .get_mut(&peer_id)
                .with_context(|| format!("Unknown peer {peer_id}"))?;
            entry.transport = Arc::clone(&transport);
            entry.room_code.clone()
        };
        self.wire_transport(peer_id, &room_code, &transport);
        self.drive_peer(peer_id, PeerEvent::TransportReplaced);
        Ok(())
    }

    /// Close a peer explicitly (leave, protocol violations, admin kick).
    pub fn close_peer(self: &Arc<Self>, peer_id: Uuid) {
        self.drive_peer(peer_id, PeerEvent::TransportClosed);
    }

    fn transport_of(&self, peer_id: Uuid) -> anyhow::Result<Arc<dyn PeerTransport>> {
        let peers = self.peers.lock().unwrap();
        peers
            .get(&peer_id)
            .map(|e| Arc::clone(&e.transport))
            .with_context(|| format!("Unknown peer {peer_id}"))
    }

    fn on_transport_event(self: &Arc<Self>, peer_id: Uuid, event: TransportEvent) {
        let peer_event = match event {
            TransportEvent::IceChecking => PeerEvent::IceChecking,
            TransportEvent::Connected => PeerEvent::DtlsEstablished,
            TransportEvent::Disconnected | TransportEvent::Failed => PeerEvent::TransportFailed,
            TransportEvent::Closed => PeerEvent::TransportClosed,
            TransportEvent::InputChannelOpen => PeerEvent::InputChannelOpen,
            TransportEvent::InputChannelClosed => PeerEvent::InputChannelClosed,
        };
        self.drive_peer(peer_id, peer_event);
    }

    /// Feed one event through a peer's state machine and apply the
    /// resulting effects.
    fn drive_peer(self: &Arc<Self>, peer_id: Uuid, event: PeerEvent) {
        let (effects, transport, room_code, closed) = {
            let mut peers = self.peers.lock().unwrap();
            let Some(entry) = peers.get_mut(&peer_id) else {
                return;
            };
            let effects = entry.machine.on_event(event);
            let closed = entry.machine.is_closed();
            let transport = Arc::clone(&entry.transport);
            let room_code = entry.room_code.clone();
            if closed {
                peers.remove(&peer_id);
            }
            (effects, transport, room_code, closed)
        };
        self.apply_effects(peer_id, &room_code, &transport, &effects);
        if closed {
            self.finalize_peer(peer_id, &room_code);
        }
    }

    fn apply_effects(
        self: &Arc<Self>,
        peer_id: Uuid,
        room_code: &str,
        transport: &Arc<dyn PeerTransport>,
        effects: &[PeerEffect],
    ) {
        for effect in effects {
            match effect {
                PeerEffect::RegisterFanout => {
                    let outlet = self.fanout.register(peer_id);
                    // Start the stream on an IDR.
                    outlet.await_keyframe();
                    spawn_pump(outlet, Arc::clone(transport));
                }
                PeerEffect::UnregisterFanout => self.fanout.unregister(peer_id),
                PeerEffect::RequestKeyframe => {
                    self.force_keyframe.store(true, Ordering::Relaxed);
                }
                PeerEffect::ReleaseGamepads => {
                    if let Some(room) = self.registry.get(room_code) {
                        room.release_peer_gamepads(peer_id);
                    }
                }
                PeerEffect::CloseTransport => {
                    let transport = Arc::clone(transport);
                    tokio::spawn(async move {
                        if let Err(e) = transport.close().await {
                            debug!("Transport close: {e:#}");
                        }
                    });
                }
            }
        }
    }

    /// Room bookkeeping after a peer reached `Closed`.
    fn finalize_peer(self: &Arc<Self>, peer_id: Uuid, room_code: &str) {
        if let Some(router) = self.routers.lock().unwrap().get(room_code) {
            router.forget_peer(peer_id);
        }
        let Some(room) = self.registry.get(room_code) else {
            return; // room already closing
        };
        let outcome = room.remove_peer(peer_id);
        if !outcome.should_close {
            return;
        }
        // Host left: promote the lowest-slot player, close otherwise.
        let successor = room
            .snapshot()
            .players
            .iter()
            .filter(|p| !p.is_spectator)
            .min_by_key(|p| p.slot.unwrap_or(u8::MAX))
            .map(|p| p.peer_id);
        match successor {
            Some(peer) => {
                if room.promote_to_host(peer).is_ok() {
                    info!(room_code, %peer, "Host left, promoted successor");
                } else {
                    self.close_room(room_code);
                }
            }
            None => self.close_room(room_code),
        }
    }

    /// Tear down a room and every peer still in it.
    pub fn close_room(self: &Arc<Self>, room_code: &str) {
        let Some(room) = self.registry.remove_room(room_code) else {
            return;
        };
        self.routers.lock().unwrap().remove(room_code);
        for peer_id in room.peer_ids() {
            self.close_peer(peer_id);
        }
    }

    fn on_input(self: &Arc<Self>, peer_id: Uuid, data: &[u8]) {
        let room_code = {
            let peers = self.peers.lock().unwrap();
            let Some(entry) = peers.get(&peer_id) else {
                return;
            };
            entry.room_code.clone()
        };
        let router = self.routers.lock().unwrap().get(&room_code).cloned();
        let Some(router) = router else { return };
        if router.handle_frame(peer_id, data) == RouteOutcome::ClosePeer {
            warn!(%peer_id, "Closing peer after repeated protocol violations");
            self.close_peer(peer_id);
        }
    }

    fn relay_rumble(self: &Arc<Self>, server_slot: u8, event: RumbleEvent) {
        let routers: Vec<Arc<InputRouter>> =
            self.routers.lock().unwrap().values().cloned().collect();
        tokio::spawn(async move {
            for router in routers {
                match router
                    .send_rumble(
                        server_slot,
                        event.low_freq,
                        event.high_freq,
                        event.duration_ms,
                    )
                    .await
                {
                    Ok(()) => return,
                    Err(e) => debug!(server_slot, "Rumble relay: {e}"),
                }
            }
        });
    }

    fn check_peer_deadlines(self: &Arc<Self>) {
        let now = Instant::now();
        let expired: Vec<(Uuid, Vec<PeerEffect>, Arc<dyn PeerTransport>, String, bool)> = {
            let mut peers = self.peers.lock().unwrap();
            let mut out = Vec::new();
            for (peer_id, entry) in peers.iter_mut() {
                let effects = entry.machine.check_deadlines(now);
                if !effects.is_empty() || entry.machine.is_closed() {
                    out.push((
                        *peer_id,
                        effects,
                        Arc::clone(&entry.transport),
                        entry.room_code.clone(),
                        entry.machine.is_closed(),
                    ));
                }
            }
            for (peer_id, _, _, _, closed) in &out {
                if *closed {
                    peers.remove(peer_id);
                }
            }
            out
        };
        for (peer_id, effects, transport, room_code, closed) in expired {
            self.apply_effects(peer_id, &room_code, &transport, &effects);
            if closed {
                self.finalize_peer(peer_id, &room_code);
            }
        }
    }

    /// Stop the gateway: halt the sender, drain the fan-out, tear down
    /// every peer and room.
    pub async fn stop(self: &Arc<Self>) {
        if self.stopping.swap(true, Ordering::Relaxed) {
            return;
        }
        info!("Gateway stopping");

        if let Some(mut sender) = self.sender.lock().unwrap().take() {
            sender.stop();
        }
        self.fanout.drain(Duration::from_secs(1)).await;

        let peer_ids: Vec<Uuid> = self.peers.lock().unwrap().keys().copied().collect();
        for peer_id in peer_ids {
            self.close_peer(peer_id);
        }
        self.fanout.shutdown();

        if let Some(handle) = self.watchdog.lock().unwrap().take() {
            handle.abort();
        }
        info!("Gateway stopped");
    }
}
