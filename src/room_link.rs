use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::bridge::Bridge;
use crate::rate_limiter::RateLimiter;

/// One live (Matrix room, Gitter room) pair. Owns the streaming subscription
/// and forwards in both directions (spec.md §4.5).
///
/// Holds a `Weak<Bridge>`, never an `Arc`, so that Bridge → RoomLink →
/// Bridge never forms a reference cycle (spec.md §9).
pub struct RoomLink {
    bridge: Weak<Bridge>,
    pub user: String,
    pub matrix_room: String,
    pub gitter_room_name: String,
    pub gitter_room_id: String,
    limiter: Arc<RateLimiter>,
    destroyed: AtomicBool,
    generation: AtomicU64,
    buffer: Mutex<Vec<u8>>,
}

impl RoomLink {
    /// Constructs a RoomLink and schedules its first stream attempt through
    /// the shared limiter — construction never opens the stream
    /// synchronously (spec.md §4.5).
    pub fn new(
        bridge: Weak<Bridge>,
        user: String,
        matrix_room: String,
        gitter_room_name: String,
        gitter_room_id: String,
        limiter: Arc<RateLimiter>,
    ) -> Arc<Self> {
        let link = Arc::new(RoomLink {
            bridge,
            user,
            matrix_room,
            gitter_room_name,
            gitter_room_id,
            limiter,
            destroyed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            buffer: Mutex::new(Vec::new()),
        });
        link.clone().schedule_start();
        link
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn schedule_start(self: Arc<Self>) {
        let limiter = self.limiter.clone();
        tokio::spawn(async move {
            limiter
                .schedule(move || {
                    let this = self.clone();
                    tokio::spawn(async move { this.start_stream().await });
                })
                .await;
        });
    }

    async fn start_stream(self: Arc<Self>) {
        if self.is_destroyed() {
            return;
        }
        self.buffer.lock().await.clear();

        let Some(bridge) = self.bridge.upgrade() else {
            return;
        };
        let user = match bridge.store().get_user_by_matrix_username(&self.user) {
            Ok(Some(user)) => user,
            _ => {
                self.limiter.fail().await;
                self.clone().schedule_start();
                return;
            }
        };
        let Some(token) = user.gitter_access_token else {
            self.limiter.fail().await;
            self.clone().schedule_start();
            return;
        };

        match bridge.gitter().open_stream(&token, &self.gitter_room_id).await {
            Ok(stream) => {
                self.limiter.success().await;
                let generation = self.generation.load(Ordering::SeqCst);
                tokio::spawn(self.clone().read_stream(stream, generation));
            }
            Err(e) => {
                warn!(error = %e, room = %self.matrix_room, "failed to open Gitter stream");
                self.limiter.fail().await;
                self.clone().schedule_start();
            }
        }
    }

    async fn read_stream(
        self: Arc<Self>,
        mut stream: impl Stream<Item = reqwest::Result<Bytes>> + Unpin,
        generation: u64,
    ) {
        while let Some(chunk) = stream.next().await {
            if self.generation.load(Ordering::SeqCst) != generation || self.is_destroyed() {
                return;
            }
            match chunk {
                Ok(bytes) => self.on_data(&bytes).await,
                Err(e) => {
                    warn!(error = %e, room = %self.matrix_room, "Gitter stream read error");
                    break;
                }
            }
        }
        if self.generation.load(Ordering::SeqCst) == generation {
            self.on_disconnect().await;
        }
    }

    /// Appends `bytes` to the buffer and processes every complete newline-
    /// terminated frame. Whitespace-only frames are keep-alives and are
    /// discarded; malformed JSON is logged and does not close the stream
    /// (spec.md §8 "Boundary behaviors").
    pub async fn on_data(self: &Arc<Self>, bytes: &[u8]) {
        if self.is_destroyed() {
            return;
        }
        let frames = {
            let mut buf = self.buffer.lock().await;
            buf.extend_from_slice(bytes);
            split_frames(&mut buf)
        };
        for frame in frames {
            let text = String::from_utf8_lossy(&frame);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<serde_json::Value>(trimmed) {
                Ok(value) => self.handle_gitter_message(value).await,
                Err(e) => debug!(error = %e, room = %self.matrix_room, "malformed Gitter frame, ignoring"),
            }
        }
    }

    async fn handle_gitter_message(self: &Arc<Self>, value: serde_json::Value) {
        if self.is_destroyed() {
            return;
        }
        let Some(bridge) = self.bridge.upgrade() else {
            return;
        };
        let from_username = value
            .get("fromUser")
            .and_then(|u| u.get("username"))
            .and_then(|v| v.as_str());
        let text = value.get("text").and_then(|v| v.as_str());
        let (Some(from_username), Some(text)) = (from_username, text) else {
            return;
        };

        let owner = match bridge.store().get_user_by_matrix_username(&self.user) {
            Ok(Some(u)) => u,
            _ => return,
        };
        // Loop suppression: never forward the owning user's own messages
        // back into Matrix (spec.md §4.5, §8).
        if owner.github_username.as_deref() == Some(from_username) {
            return;
        }
        self.to_matrix(from_username, text).await;
    }

    pub async fn to_gitter(self: &Arc<Self>, text: &str) {
        let Some(bridge) = self.bridge.upgrade() else {
            return;
        };
        let user = match bridge.store().get_user_by_matrix_username(&self.user) {
            Ok(Some(u)) => u,
            _ => return,
        };
        let Some(token) = user.gitter_access_token else {
            return;
        };
        if let Err(e) = bridge
            .gitter()
            .post_message(&token, &self.gitter_room_id, text)
            .await
        {
            warn!(error = %e, room = %self.matrix_room, "failed to post message to Gitter");
        }
    }

    async fn to_matrix(self: &Arc<Self>, gitter_username: &str, text: &str) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge
                .forward_to_matrix(&self.matrix_room, gitter_username, text)
                .await;
        }
    }

    async fn on_disconnect(self: Arc<Self>) {
        if self.is_destroyed() {
            return;
        }
        self.schedule_start();
    }

    /// Idempotent: marks destroyed, invalidates the in-flight reader,
    /// removes this link from the bridge's index, and deletes the
    /// persisted row, all in one operation (spec.md §3 invariant 3, §4.5).
    pub async fn destroy(self: &Arc<Self>) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.remove_room_link(&self.matrix_room).await;
            if let Err(e) = bridge.store().delete_bridged_room(&self.user, &self.matrix_room) {
                warn!(error = %e, room = %self.matrix_room, "failed to delete bridged room row");
            }
        }
    }
}

/// Drains every complete `\n`-terminated frame (newline excluded) from
/// `buf`, leaving any trailing partial frame in place.
fn split_frames(buf: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    loop {
        let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
            break;
        };
        let frame: Vec<u8> = buf.drain(..pos).collect();
        buf.remove(0); // the newline itself
        frames.push(frame);
    }
    frames
}
