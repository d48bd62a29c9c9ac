//! webrtc-rs implementation of `PeerTransport`.
//!
//! Media goes out through `TrackLocalStaticRTP`: the gateway runs its
//! own packetizer, so tracks receive finished RTP packets rather than
//! samples. The browser opens the reliable "input" data channel.

use std::sync::{Arc, Mutex};

use anyhow::Context;
use bytes::Bytes;
use huddle_protocol::{GatewayConfig, VideoCodec};
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use super::{
    BoxFuture, CandidateHandler, InputDataHandler, KeyframeRequestHandler, PeerTransport,
    TransportEvent, TransportEventHandler,
};
use crate::fanout::PacketKind;

const MIME_TYPE_HEVC: &str = "video/H265";
const MIME_TYPE_AV1: &str = "video/AV1";

const INPUT_CHANNEL_LABEL: &str = "input";

type Slot<T> = Arc<Mutex<Option<T>>>;

pub struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    video_track: Arc<TrackLocalStaticRTP>,
    audio_track: Arc<TrackLocalStaticRTP>,
    video_sender: Arc<RTCRtpSender>,
    data_channel: Slot<Arc<RTCDataChannel>>,
    event_handler: Slot<TransportEventHandler>,
    input_handler: Slot<InputDataHandler>,
    candidate_handler: Slot<CandidateHandler>,
    keyframe_handler: Slot<KeyframeRequestHandler>,
}

fn video_feedback() -> Vec<RTCPFeedback> {
    vec![
        RTCPFeedback {
            typ: "goog-remb".into(),
            parameter: "".into(),
        },
        RTCPFeedback {
            typ: "ccm".into(),
            parameter: "fir".into(),
        },
        RTCPFeedback {
            typ: "nack".into(),
            parameter: "".into(),
        },
        RTCPFeedback {
            typ: "nack".into(),
            parameter: "pli".into(),
        },
        RTCPFeedback {
            typ: "transport-cc".into(),
            parameter: "".into(),
        },
    ]
}

/// Mime type and fmtp line for the configured codec.
fn video_codec_capability(codec: VideoCodec) -> (&'static str, &'static str) {
    match codec {
        // Constrained Baseline, packetization-mode=1: what browsers
        // reliably offer and decode.
        VideoCodec::H264 => (
            MIME_TYPE_H264,
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
        ),
        VideoCodec::Hevc => (MIME_TYPE_HEVC, ""),
        VideoCodec::Av1 => (MIME_TYPE_AV1, "profile=0"),
    }
}

fn ice_servers(config: &GatewayConfig) -> Vec<RTCIceServer> {
    let mut servers = vec![RTCIceServer {
        urls: config.webrtc.stun_servers.clone(),
        ..Default::default()
    }];
    if let Some(turn) = &config.webrtc.turn_server {
        servers.push(RTCIceServer {
            urls: vec![turn.clone()],
            username: config.webrtc.turn_username.clone().unwrap_or_default(),
            credential: config.webrtc.turn_password.clone().unwrap_or_default(),
        });
    }
    servers
}

impl WebRtcTransport {
    pub async fn new(config: &GatewayConfig) -> anyhow::Result<Arc<Self>> {
        let mut media_engine = MediaEngine::default();

        // Register only the codec the encoder produces. Offering more
        // invites the browser to negotiate something we cannot send.
        let (mime, fmtp) = video_codec_capability(config.video.codec);
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: mime.to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: fmtp.to_string(),
                    rtcp_feedback: video_feedback(),
                },
                payload_type: config.video.payload_type,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        if config.webrtc.port_range_min != 0 && config.webrtc.port_range_max != 0 {
            let udp = EphemeralUDP::new(config.webrtc.port_range_min, config.webrtc.port_range_max)
                .context("Invalid WebRTC port range")?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(udp));
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_setting_engine(setting_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(config),
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await?);

        let video_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: mime.to_string(),
                clock_rate: 90000,
                sdp_fmtp_line: fmtp.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            "huddle".to_string(),
        ));
        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            "huddle".to_string(),
        ));

        let video_sender = peer_connection
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add video track")?;
        peer_connection
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add audio track")?;

        let transport = Arc::new(Self {
            peer_connection,
            video_track,
            audio_track,
            video_sender,
            data_channel: Arc::new(Mutex::new(None)),
            event_handler: Arc::new(Mutex::new(None)),
            input_handler: Arc::new(Mutex::new(None)),
            candidate_handler: Arc::new(Mutex::new(None)),
            keyframe_handler: Arc::new(Mutex::new(None)),
        });
        transport.wire_callbacks();
        transport.start_rtcp_reader();
        info!("WebRTC transport created");
        Ok(transport)
    }

    fn emit(handler: &Slot<TransportEventHandler>, event: TransportEvent) {
        let handler = handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    fn wire_callbacks(self: &Arc<Self>) {
        let events = Arc::clone(&self.event_handler);
        self.peer_connection
            .on_ice_connection_state_change(Box::new(move |state| {
                if state == RTCIceConnectionState::Checking {
                    Self::emit(&events, TransportEvent::IceChecking);
                }
                Box::pin(async {})
            }));

        let events = Arc::clone(&self.event_handler);
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state| {
                debug!(?state, "Peer connection state changed");
                let event = match state {
                    RTCPeerConnectionState::Connected => Some(TransportEvent::Connected),
                    RTCPeerConnectionState::Disconnected => Some(TransportEvent::Disconnected),
                    RTCPeerConnectionState::Failed => Some(TransportEvent::Failed),
                    RTCPeerConnectionState::Closed => Some(TransportEvent::Closed),
                    _ => None,
                };
                if let Some(event) = event {
                    Self::emit(&events, event);
                }
                Box::pin(async {})
            }));

        let candidates = Arc::clone(&self.candidate_handler);
        self.peer_connection.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(json) => {
                        let handler = candidates.lock().unwrap().clone();
                        if let Some(handler) = handler {
                            handler(json.candidate, json.sdp_mid, json.sdp_mline_index);
                        }
                    }
                    Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
                }
            }
            Box::pin(async {})
        }));

        let dc_slot = Arc::clone(&self.data_channel);
        let events = Arc::clone(&self.event_handler);
        let inputs = Arc::clone(&self.input_handler);
        self.peer_connection.on_data_channel(Box::new(move |dc| {
            let dc_slot = Arc::clone(&dc_slot);
            let events = Arc::clone(&events);
            let inputs = Arc::clone(&inputs);
            Box::pin(async move {
                if dc.label() != INPUT_CHANNEL_LABEL {
                    debug!(label = dc.label(), "Ignoring unexpected data channel");
                    return;
                }
                *dc_slot.lock().unwrap() = Some(Arc::clone(&dc));

                let open_events = Arc::clone(&events);
                dc.on_open(Box::new(move || {
                    Self::emit(&open_events, TransportEvent::InputChannelOpen);
                    Box::pin(async {})
                }));

                let close_events = Arc::clone(&events);
                dc.on_close(Box::new(move || {
                    Self::emit(&close_events, TransportEvent::InputChannelClosed);
                    Box::pin(async {})
                }));

                dc.on_message(Box::new(move |msg| {
                    let handler = inputs.lock().unwrap().clone();
                    if let Some(handler) = handler {
                        handler(msg.data);
                    }
                    Box::pin(async {})
                }));
            })
        }));
    }

    /// Watch RTCP from the video sender for PLI/FIR keyframe requests.
    /// Without this, packet loss leaves the browser on a corrupted
    /// frame until the next periodic IDR.
    fn start_rtcp_reader(self: &Arc<Self>) {
        let sender = Arc::clone(&self.video_sender);
        let keyframe = Arc::clone(&self.keyframe_handler);
        tokio::spawn(async move {
            while let Ok((packets, _)) = sender.read_rtcp().await {
                for pkt in &packets {
                    let pkt_any = pkt.as_any();
                    if pkt_any
                        .is::<rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>()
                        || pkt_any
                            .is::<rtcp::payload_feedbacks::full_intra_request::FullIntraRequest>()
                    {
                        debug!("PLI/FIR received from browser");
                        let handler = keyframe.lock().unwrap().clone();
                        if let Some(handler) = handler {
                            handler();
                        }
                    }
                }
            }
        });
    }
}

impl PeerTransport for WebRtcTransport {
    fn send_media(&self, kind: PacketKind, packet: Bytes) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let track = match kind {
                PacketKind::Video => &self.video_track,
                PacketKind::Audio => &self.audio_track,
                PacketKind::Control => anyhow::bail!("control packets use send_control"),
            };
            track
                .write(&packet)
                .await
                .context("Failed to write RTP packet")?;
            Ok(())
        })
    }

    fn send_control(&self, data: Bytes) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let dc = self.data_channel.lock().unwrap().clone();
            let dc = dc.context("Input channel not open")?;
            dc.send(&data)
                .await
                .context("Failed to send on input channel")?;
            Ok(())
        })
    }

    fn handle_offer(&self, sdp: String) -> BoxFuture<'_, anyhow::Result<String>> {
        Box::pin(async move {
            let offer = RTCSessionDescription::offer(sdp).context("Failed to parse SDP offer")?;
            self.peer_connection
                .set_remote_description(offer)
                .await
                .context("Failed to set remote description")?;

            let answer = self
                .peer_connection
                .create_answer(None)
                .await
                .context("Failed to create answer")?;
            self.peer_connection
                .set_local_description(answer.clone())
                .await
                .context("Failed to set local description")?;
            Ok(answer.sdp)
        })
    }

    fn add_remote_candidate(
        &self,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let init = RTCIceCandidateInit {
                candidate,
                sdp_mid,
                sdp_mline_index,
                ..Default::default()
            };
            self.peer_connection
                .add_ice_candidate(init)
                .await
                .context("Failed to add ICE candidate")?;
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.peer_connection
                .close()
                .await
                .context("Failed to close peer connection")?;
            Ok(())
        })
    }

    fn on_event(&self, handler: TransportEventHandler) {
        *self.event_handler.lock().unwrap() = Some(handler);
    }

    fn on_input(&self, handler: InputDataHandler) {
        *self.input_handler.lock().unwrap() = Some(handler);
    }

    fn on_local_candidate(&self, handler: CandidateHandler) {
        *self.candidate_handler.lock().unwrap() = Some(handler);
    }

    fn on_keyframe_request(&self, handler: KeyframeRequestHandler) {
        *self.keyframe_handler.lock().unwrap() = Some(handler);
    }
}
