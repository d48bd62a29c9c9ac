//! Dedicated video sender thread.
//!
//! Pulls encoded access units from the encoder queue, packetizes them,
//! and hands RTP packets to the fan-out. Never blocks on a peer: slow
//! consumers are handled by the per-peer queue policy. When a peer
//! flags a resync the encoder is asked for an IDR; if none arrives in
//! time the affected peers are reported for reconnection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use huddle_protocol::VideoCodec;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::fanout::Fanout;
use crate::rtp::{Packetizer, h264, hevc};
use crate::stats::VideoStats;

/// One encoded access unit pulled from the encoder queue.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub codec: VideoCodec,
    /// Presentation timestamp on the 90 kHz RTP clock.
    pub pts: u64,
    pub keyframe: bool,
    /// Annex B stream for H.264/HEVC, OBU stream for AV1.
    pub data: Bytes,
}

pub type IdrRequestFn = Arc<dyn Fn() + Send + Sync>;
pub type DesyncFn = Arc<dyn Fn(Vec<Uuid>) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct SenderConfig {
    /// How long to wait for the encoder to answer an IDR request
    /// before escalating the affected peers.
    pub idr_escalation: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            idr_escalation: Duration::from_secs(2),
        }
    }
}

/// Handle to the sender thread.
pub struct VideoSender {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl VideoSender {
    /// Spawn the sender thread. `request_idr` is invoked when any peer
    /// needs a keyframe; `on_desync` receives peers the encoder failed
    /// to rescue within the escalation window.
    pub fn spawn(
        packet_rx: Receiver<EncodedPacket>,
        fanout: Arc<Fanout>,
        mut packetizer: Packetizer,
        stats: Arc<VideoStats>,
        config: SenderConfig,
        request_idr: IdrRequestFn,
        on_desync: DesyncFn,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("huddle-video-sender".to_string())
            .spawn(move || {
                run_send_loop(
                    &packet_rx,
                    &fanout,
                    &mut packetizer,
                    &stats,
                    config,
                    &request_idr,
                    &on_desync,
                    &stop_flag,
                );
            })
            .expect("failed to spawn sender thread");

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal the thread and wait for it to exit. The thread wakes
    /// from its bounded queue wait within one poll interval.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for VideoSender {
    fn drop(&mut self) {
        self.stop();
    }
}

const QUEUE_POLL: Duration = Duration::from_millis(100);

#[allow(clippy::too_many_arguments)]
fn run_send_loop(
    packet_rx: &Receiver<EncodedPacket>,
    fanout: &Fanout,
    packetizer: &mut Packetizer,
    stats: &VideoStats,
    config: SenderConfig,
    request_idr: &IdrRequestFn,
    on_desync: &DesyncFn,
    stop: &AtomicBool,
) {
    info!("Video sender started");
    let mut idr_requested_at: Option<Instant> = None;

    loop {
        match packet_rx.recv_timeout(QUEUE_POLL) {
            Ok(packet) => {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                // Some encoders misreport the keyframe flag after a
                // forced IDR; trust the bitstream when it says more.
                let keyframe = packet.keyframe
                    || match packet.codec {
                        VideoCodec::H264 => h264::contains_idr(&packet.data),
                        VideoCodec::Hevc => hevc::contains_irap(&packet.data),
                        VideoCodec::Av1 => false,
                    };
                match packetizer.packetize(&packet.data, packet.pts as u32, keyframe) {
                    Ok(packets) => {
                        stats.record_frame(packet.data.len(), keyframe);
                        for pkt in &packets {
                            fanout.broadcast_video(pkt);
                        }
                        if keyframe {
                            idr_requested_at = None;
                        }
                    }
                    Err(e) => {
                        // Malformed encoder output is dropped, never fatal.
                        warn!(pts = packet.pts, "Dropping unpacketizable access unit: {e}");
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                error!("Encoder packet queue closed, stopping video sender");
                break;
            }
        }

        if fanout.take_resync_needed() && idr_requested_at.is_none() {
            debug!("Peer resync needed, requesting IDR");
            request_idr();
            idr_requested_at = Some(Instant::now());
        }

        if let Some(t0) = idr_requested_at
            && t0.elapsed() > config.idr_escalation
        {
            let stuck = fanout.peers_awaiting_keyframe();
            if !stuck.is_empty() {
                warn!(
                    peers = stuck.len(),
                    "Encoder did not deliver an IDR in time, escalating"
                );
                on_desync(stuck);
            }
            idr_requested_at = None;
        }
    }
    info!("Video sender stopped");
}
