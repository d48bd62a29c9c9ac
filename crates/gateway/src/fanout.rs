//! Per-peer packet fan-out with bounded queues.
//!
//! The packetizer thread calls `broadcast_*` without ever blocking on a
//! slow peer: each peer owns a bounded queue drained by its own pump
//! task. Overflow policy per kind:
//!
//! - video: drop the oldest non-keyframe packet plus the rest of its
//!   access unit, flag the peer as needing a resync, and skip further
//!   non-key packets until the next keyframe arrives;
//! - audio: drop oldest;
//! - control (reliable channel): never drop — senders await queue space.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::rtp::RtpPacket;
use crate::transport::PeerTransport;

/// Media/control kinds carried by the fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Video,
    Audio,
    Control,
}

/// Reliable-channel queue bound. Hitting it stalls the sender instead
/// of dropping.
const CONTROL_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct QueueDepths {
    pub video: usize,
    pub audio: usize,
}

impl Default for QueueDepths {
    fn default() -> Self {
        Self {
            video: 256,
            audio: 256,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    #[error("peer {0} is not registered")]
    UnknownPeer(Uuid),
    #[error("peer {0} closed while sending")]
    PeerClosed(Uuid),
}

enum Outbound {
    Video(RtpPacket),
    Audio(Bytes),
    Control(Bytes),
}

struct OutletQueue {
    video: VecDeque<RtpPacket>,
    audio: VecDeque<Bytes>,
    control: VecDeque<Bytes>,
    /// Timestamp of the access unit we started dropping; the rest of
    /// that AU is discarded on arrival.
    dropped_au: Option<u32>,
}

/// One registered peer's outbound state.
pub struct PeerOutlet {
    peer_id: Uuid,
    depths: QueueDepths,
    queue: Mutex<OutletQueue>,
    /// Wakes the pump when packets arrive or the outlet closes.
    ready: Notify,
    /// Wakes control senders when queue space frees up.
    space: Notify,
    closed: AtomicBool,
    /// The encoder should be asked for an IDR on this peer's behalf.
    resync_needed: AtomicBool,
    /// Drop non-key video until a keyframe arrives.
    awaiting_keyframe: AtomicBool,
    dropped_video: AtomicU64,
}

impl PeerOutlet {
    fn new(peer_id: Uuid, depths: QueueDepths) -> Self {
        Self {
            peer_id,
            depths,
            queue: Mutex::new(OutletQueue {
                video: VecDeque::with_capacity(depths.video),
                audio: VecDeque::with_capacity(depths.audio),
                control: VecDeque::new(),
                dropped_au: None,
            }),
            ready: Notify::new(),
            space: Notify::new(),
            closed: AtomicBool::new(false),
            resync_needed: AtomicBool::new(false),
            awaiting_keyframe: AtomicBool::new(false),
            dropped_video: AtomicU64::new(0),
        }
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn resync_needed(&self) -> bool {
        self.resync_needed.load(Ordering::Relaxed)
    }

    pub fn awaiting_keyframe(&self) -> bool {
        self.awaiting_keyframe.load(Ordering::Relaxed)
    }

    pub fn dropped_video(&self) -> u64 {
        self.dropped_video.load(Ordering::Relaxed)
    }

    /// Skip non-key video until the next keyframe. Set on entry to
    /// streaming so a fresh decoder starts on an IDR.
    pub fn await_keyframe(&self) {
        self.awaiting_keyframe.store(true, Ordering::Relaxed);
    }

    pub(crate) fn queue_len(&self) -> usize {
        let q = self.queue.lock().unwrap();
        q.video.len() + q.audio.len() + q.control.len()
    }

    fn enqueue_video(&self, pkt: &RtpPacket) {
        if self.awaiting_keyframe.load(Ordering::Relaxed) {
            if pkt.keyframe {
                self.awaiting_keyframe.store(false, Ordering::Relaxed);
                // The backlog of pre-resync non-key packets is useless
                // now that the reference chain restarts.
                let mut q = self.queue.lock().unwrap();
                let before = q.video.len();
                q.video.retain(|p| p.keyframe);
                let purged = before - q.video.len();
                if purged > 0 {
                    self.dropped_video
                        .fetch_add(purged as u64, Ordering::Relaxed);
                }
                q.dropped_au = None;
                q.video.push_back(pkt.clone());
                drop(q);
                self.ready.notify_one();
                return;
            }
            self.dropped_video.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut q = self.queue.lock().unwrap();

        // Remainder of an access unit we already started dropping.
        if q.dropped_au == Some(pkt.timestamp) && !pkt.keyframe {
            drop(q);
            self.dropped_video.fetch_add(1, Ordering::Relaxed);
            self.resync_needed.store(true, Ordering::Relaxed);
            return;
        }

        if q.video.len() >= self.depths.video {
            let victim_ts = q
                .video
                .iter()
                .find(|p| !p.keyframe)
                .map(|p| p.timestamp);
            match victim_ts {
                Some(ts) => {
                    let before = q.video.len();
                    q.video.retain(|p| p.timestamp != ts || p.keyframe);
                    let dropped = before - q.video.len();
                    q.dropped_au = Some(ts);
                    self.dropped_video
                        .fetch_add(dropped as u64, Ordering::Relaxed);
                    self.resync_needed.store(true, Ordering::Relaxed);
                    if !pkt.keyframe {
                        // Everything after the victim references it;
                        // skip until the encoder answers with an IDR.
                        self.awaiting_keyframe.store(true, Ordering::Relaxed);
                        self.dropped_video.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
                None => {
                    // Queue is all keyframe packets; drop the oldest.
                    q.video.pop_front();
                    self.dropped_video.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        q.video.push_back(pkt.clone());
        drop(q);
        self.ready.notify_one();
    }

    fn enqueue_audio(&self, data: &Bytes) {
        let mut q = self.queue.lock().unwrap();
        if q.audio.len() >= self.depths.audio {
            q.audio.pop_front();
        }
        q.audio.push_back(data.clone());
        drop(q);
        self.ready.notify_one();
    }

    /// Enqueue on the reliable channel, waiting for space if the queue
    /// is at its bound.
    async fn enqueue_control(&self, data: Bytes) -> Result<(), FanoutError> {
        loop {
            if self.closed.load(Ordering::Relaxed) {
                return Err(FanoutError::PeerClosed(self.peer_id));
            }
            {
                let mut q = self.queue.lock().unwrap();
                if q.control.len() < CONTROL_DEPTH {
                    q.control.push_back(data);
                    drop(q);
                    self.ready.notify_one();
                    return Ok(());
                }
            }
            self.space.notified().await;
        }
    }

    fn pop(&self) -> Option<Outbound> {
        let mut q = self.queue.lock().unwrap();
        if let Some(data) = q.control.pop_front() {
            drop(q);
            self.space.notify_waiters();
            return Some(Outbound::Control(data));
        }
        if let Some(data) = q.audio.pop_front() {
            return Some(Outbound::Audio(data));
        }
        q.video.pop_front().map(Outbound::Video)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.ready.notify_waiters();
        self.space.notify_waiters();
    }
}

/// Registry of live peer outlets. Read-mostly: broadcasting takes the
/// read lock, only register/unregister take the write lock.
pub struct Fanout {
    peers: RwLock<HashMap<Uuid, Arc<PeerOutlet>>>,
    depths: QueueDepths,
}

impl Fanout {
    pub fn new(depths: QueueDepths) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            depths,
        }
    }

    /// Register a peer and return its outlet. The caller decides
    /// whether to attach a pump (`spawn_pump`) or drain manually.
    pub fn register(&self, peer_id: Uuid) -> Arc<PeerOutlet> {
        let outlet = Arc::new(PeerOutlet::new(peer_id, self.depths));
        let prev = self
            .peers
            .write()
            .unwrap()
            .insert(peer_id, Arc::clone(&outlet));
        if let Some(prev) = prev {
            warn!(%peer_id, "Replacing existing fan-out outlet");
            prev.close();
        }
        info!(%peer_id, "Peer registered with fan-out");
        outlet
    }

    pub fn unregister(&self, peer_id: Uuid) {
        if let Some(outlet) = self.peers.write().unwrap().remove(&peer_id) {
            outlet.close();
            info!(%peer_id, "Peer unregistered from fan-out");
        }
    }

    pub fn outlet(&self, peer_id: Uuid) -> Option<Arc<PeerOutlet>> {
        self.peers.read().unwrap().get(&peer_id).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap().len()
    }

    pub fn broadcast_video(&self, pkt: &RtpPacket) {
        for outlet in self.peers.read().unwrap().values() {
            outlet.enqueue_video(pkt);
        }
    }

    pub fn broadcast_audio(&self, data: &Bytes) {
        for outlet in self.peers.read().unwrap().values() {
            outlet.enqueue_audio(data);
        }
    }

    /// Broadcast video to the peers selected by `predicate`.
    pub fn broadcast_video_filtered(&self, pkt: &RtpPacket, predicate: impl Fn(&Uuid) -> bool) {
        for (peer_id, outlet) in self.peers.read().unwrap().iter() {
            if predicate(peer_id) {
                outlet.enqueue_video(pkt);
            }
        }
    }

    /// Send on one peer's reliable channel, applying backpressure.
    pub async fn send_control(&self, peer_id: Uuid, data: Bytes) -> Result<(), FanoutError> {
        let outlet = self
            .outlet(peer_id)
            .ok_or(FanoutError::UnknownPeer(peer_id))?;
        outlet.enqueue_control(data).await
    }

    /// True if any peer has flagged a resync since the last call;
    /// clears the flags.
    pub fn take_resync_needed(&self) -> bool {
        let mut any = false;
        for outlet in self.peers.read().unwrap().values() {
            if outlet.resync_needed.swap(false, Ordering::Relaxed) {
                any = true;
            }
        }
        any
    }

    /// Peers still waiting for a keyframe (used to escalate when the
    /// encoder ignores an IDR request).
    pub fn peers_awaiting_keyframe(&self) -> Vec<Uuid> {
        self.peers
            .read()
            .unwrap()
            .iter()
            .filter(|(_, o)| o.awaiting_keyframe.load(Ordering::Relaxed))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Wait until all queues are empty or the deadline passes.
    pub async fn drain(&self, deadline: std::time::Duration) {
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            let all_empty = self
                .peers
                .read()
                .unwrap()
                .values()
                .all(|o| o.queue_len() == 0);
            if all_empty {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        debug!("Fan-out drain deadline reached with packets still queued");
    }

    /// Close all outlets. Pumps exit on their next wakeup.
    pub fn shutdown(&self) {
        let mut peers = self.peers.write().unwrap();
        for outlet in peers.values() {
            outlet.close();
        }
        peers.clear();
    }
}

/// Pump one outlet into its transport until the outlet closes.
pub fn spawn_pump(outlet: Arc<PeerOutlet>, transport: Arc<dyn PeerTransport>) {
    tokio::spawn(async move {
        loop {
            match outlet.pop() {
                Some(Outbound::Video(pkt)) => {
                    if let Err(e) = transport.send_media(PacketKind::Video, pkt.data).await {
                        debug!(peer_id = %outlet.peer_id, "Video send failed: {e:#}");
                    }
                }
                Some(Outbound::Audio(data)) => {
                    if let Err(e) = transport.send_media(PacketKind::Audio, data).await {
                        debug!(peer_id = %outlet.peer_id, "Audio send failed: {e:#}");
                    }
                }
                Some(Outbound::Control(data)) => {
                    if let Err(e) = transport.send_control(data).await {
                        debug!(peer_id = %outlet.peer_id, "Control send failed: {e:#}");
                    }
                }
                None => {
                    if outlet.closed.load(Ordering::Relaxed) {
                        break;
                    }
                    outlet.ready.notified().await;
                }
            }
            if outlet.closed.load(Ordering::Relaxed) && outlet.queue_len() == 0 {
                break;
            }
        }
        debug!(peer_id = %outlet.peer_id, "Fan-out pump exited");
    });
}
