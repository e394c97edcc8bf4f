use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::BridgeError;
use crate::gitter::GitterClient;
use crate::matrix::{MatrixClient, MatrixEvent};
use crate::models::User;
use crate::oauth_state::build_state;
use crate::rate_limiter::RateLimiter;
use crate::room_link::RoomLink;
use crate::store::Store;

/// Central coordinator (spec.md §4.6). Owns the Store, both clients, and
/// the live RoomLink index; mediates every cross-component call. All index
/// mutations go through `&self` methods guarded by `tokio::sync::Mutex`,
/// realizing the single-writer dispatch model of spec.md §5.
pub struct Bridge {
    config: Config,
    store: Arc<Store>,
    matrix: MatrixClient,
    gitter: GitterClient,
    stream_limiter: Arc<RateLimiter>,
    by_matrix_room: Mutex<HashMap<String, Arc<RoomLink>>>,
    by_user_then_gitter_name: Mutex<HashMap<String, HashMap<String, Arc<RoomLink>>>>,
    self_weak: OnceLock<Weak<Bridge>>,
}

impl Bridge {
    pub fn new(
        config: Config,
        store: Store,
        matrix: MatrixClient,
        gitter: GitterClient,
        stream_limiter: Arc<RateLimiter>,
    ) -> Arc<Self> {
        let bridge = Arc::new(Bridge {
            config,
            store: Arc::new(store),
            matrix,
            gitter,
            stream_limiter,
            by_matrix_room: Mutex::new(HashMap::new()),
            by_user_then_gitter_name: Mutex::new(HashMap::new()),
            self_weak: OnceLock::new(),
        });
        let _ = bridge.self_weak.set(Arc::downgrade(&bridge));
        bridge
    }

    fn weak_self(&self) -> Weak<Bridge> {
        self.self_weak.get().cloned().unwrap_or_default()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn matrix(&self) -> &MatrixClient {
        &self.matrix
    }

    pub fn gitter(&self) -> &GitterClient {
        &self.gitter
    }

    pub fn bot_fullname(&self) -> String {
        self.config.bot_fullname()
    }

    /// Rebuilds the RoomLink index from every persisted BridgedRoom, each
    /// of which immediately schedules its first stream open (spec.md §4.6
    /// "Startup").
    pub async fn startup(self: &Arc<Self>) -> Result<(), BridgeError> {
        let rooms = self.store.list_bridged_rooms()?;
        info!(count = rooms.len(), "rebuilding room links at startup");
        for (room, user) in rooms {
            self.insert_room_link(
                user.matrix_username,
                room.matrix_room,
                room.gitter_room_name,
                room.gitter_room_id,
            )
            .await;
        }
        Ok(())
    }

    async fn insert_room_link(
        self: &Arc<Self>,
        user: String,
        matrix_room: String,
        gitter_name: String,
        gitter_id: String,
    ) -> Arc<RoomLink> {
        let link = RoomLink::new(
            self.weak_self(),
            user.clone(),
            matrix_room.clone(),
            gitter_name.clone(),
            gitter_id,
            self.stream_limiter.clone(),
        );
        self.by_matrix_room
            .lock()
            .await
            .insert(matrix_room, link.clone());
        self.by_user_then_gitter_name
            .lock()
            .await
            .entry(user)
            .or_default()
            .insert(gitter_name, link.clone());
        link
    }

    /// Removes a RoomLink from both indices. Called from `RoomLink::destroy`
    /// as part of its single idempotent operation (spec.md §3 invariant 3).
    pub async fn remove_room_link(&self, matrix_room: &str) {
        let mut by_room = self.by_matrix_room.lock().await;
        if let Some(link) = by_room.remove(matrix_room) {
            let mut by_user = self.by_user_then_gitter_name.lock().await;
            if let Some(map) = by_user.get_mut(&link.user) {
                map.remove(&link.gitter_room_name);
            }
        }
    }

    async fn room_link_for(&self, matrix_room: &str) -> Option<Arc<RoomLink>> {
        self.by_matrix_room.lock().await.get(matrix_room).cloned()
    }

    async fn is_bridged_room(&self, matrix_room: &str) -> bool {
        self.by_matrix_room.lock().await.contains_key(matrix_room)
    }

    async fn find_room_link_by_name(&self, user: &str, gitter_name: &str) -> Option<Arc<RoomLink>> {
        self.by_user_then_gitter_name
            .lock()
            .await
            .get(user)
            .and_then(|m| m.get(gitter_name))
            .cloned()
    }

    /// Dispatches one pushed event (spec.md §4.6 "Event dispatch state
    /// machine"). Handlers may fire-and-forget outbound calls; ordering
    /// guarantees are only that this call completes before the next event
    /// in the same transaction begins (spec.md §5).
    pub async fn dispatch_event(self: &Arc<Self>, event: MatrixEvent) {
        match event.event_type.as_str() {
            "m.room.member" => self.handle_member_event(event).await,
            "m.room.message" => self.handle_message_event(event).await,
            _ => {}
        }
    }

    async fn handle_member_event(self: &Arc<Self>, event: MatrixEvent) {
        let bot = self.bot_fullname();
        let membership = event
            .content
            .get("membership")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let room = event.room_id.clone();
        let target = event.state_key.clone().unwrap_or_default();
        let sender = event.sender().unwrap_or("").to_string();

        // 1. Invite targeting the bot itself: join. Gating on state_key
        // prevents treating other users' invites as bot invitations
        // (spec.md §9).
        if membership == "invite" {
            if target == bot {
                if let Err(e) = self.matrix.join_as_bot(&room).await {
                    warn!(error = %e, room = %room, "failed to join invited room");
                }
            }
            return;
        }

        if membership == "join" {
            if !self.is_bridged_room(&room).await {
                self.probe_private_room(&room).await;
            }
            return;
        }

        // membership is leave/ban/kick or similar.
        if let Some(link) = self.room_link_for(&room).await {
            link.destroy().await;
            return;
        }

        if sender != bot {
            if let Ok(Some(user)) = self.store.get_user_by_private_room(&room) {
                let _ = self.store.clear_private_room_by_value(&room);
                let _ = self.matrix.leave(&room, None).await;
                let _ = self.matrix.forget(&room, None).await;
                info!(user = %user.matrix_username, room = %room, "private room departed");
            }
        }
    }

    /// "Is this a private control room?" probe: requests joined members and
    /// classifies the room (spec.md §4.6 step 2, §8 boundary behaviors).
    async fn probe_private_room(self: &Arc<Self>, room: &str) {
        let bot = self.bot_fullname();
        let members = match self.matrix.joined_member_ids(room).await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, room = %room, "failed to fetch room members");
                return;
            }
        };

        if members.len() > 2 {
            let _ = self.matrix.leave(room, None).await;
            let _ = self.matrix.forget(room, None).await;
            let _ = self.store.clear_private_room_by_value(room);
            return;
        }

        if members.len() == 2 {
            let Some(other) = members.iter().find(|m| m.as_str() != bot) else {
                return;
            };
            let user = match self.store.create_user(other) {
                Ok(u) => u,
                Err(e) => {
                    warn!(error = %e, user = %other, "failed to create user");
                    return;
                }
            };
            let previous = match self.store.set_private_room(&user.matrix_username, room) {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, user = %other, "failed to set private room");
                    return;
                }
            };
            if let Some(prev) = previous {
                if prev != room {
                    let _ = self.matrix.leave(&prev, None).await;
                    let _ = self.matrix.forget(&prev, None).await;
                }
            }
            self.greet(&user, room).await;
        }
    }

    async fn greet(&self, user: &User, room: &str) {
        let text = if user.is_authenticated() {
            "You are now logged in. Commands: list, gjoin <name>, gpart <name>, invite <name>, logout.".to_string()
        } else {
            let state = build_state(&self.config.unique_secret_key, &user.matrix_username);
            format!(
                "Welcome! Please authenticate with Gitter: {}auth_gitter/{}",
                self.config.gitter_login_url,
                urlencoding::encode(&state)
            )
        };
        if let Err(e) = self.matrix.send(room, &text, None).await {
            warn!(error = %e, room = %room, "failed to send greeting");
        }
    }

    async fn handle_message_event(self: &Arc<Self>, event: MatrixEvent) {
        let bot = self.bot_fullname();
        let msgtype = event
            .content
            .get("msgtype")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if msgtype != "m.text" {
            return;
        }
        let sender = event.sender().unwrap_or("").to_string();
        if sender == bot {
            // A message sent by the bot itself is ignored (spec.md §8).
            return;
        }
        let body = event
            .content
            .get("body")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let room = event.room_id.clone();

        if let Some(link) = self.room_link_for(&room).await {
            if link.user == sender {
                link.to_gitter(&body).await;
            }
            return;
        }

        let Ok(Some(user)) = self.store.get_user_by_matrix_username(&sender) else {
            return;
        };
        if user.matrix_private_room.as_deref() == Some(room.as_str()) {
            if user.is_authenticated() {
                self.run_command(&user, &body).await;
            } else if let Err(e) = self.matrix.send(&room, "You are not logged in.", None).await {
                warn!(error = %e, "failed to send not-logged-in reply");
            }
        }
    }

    /// Splits on whitespace and dispatches to the command handlers of
    /// spec.md §4.6.1.
    async fn run_command(self: &Arc<Self>, user: &User, body: &str) {
        let trimmed = body.trim();
        let mut parts = trimmed.splitn(2, char::is_whitespace);
        let first = parts.next().unwrap_or("").to_lowercase();
        let rest = parts.next().unwrap_or("").trim().to_string();
        let room = match user.matrix_private_room.clone() {
            Some(r) => r,
            None => return,
        };

        match first.as_str() {
            "list" => self.cmd_list(user, &room).await,
            "gjoin" => self.cmd_gjoin(user, &room, &rest).await,
            "gpart" => self.cmd_gpart(user, &room, &rest).await,
            "invite" => self.cmd_invite(user, &room, &rest).await,
            "logout" => self.cmd_logout(user, &room).await,
            _ => {
                let _ = self.matrix.send(&room, "Invalid command!", None).await;
            }
        }
    }

    async fn cmd_list(&self, user: &User, room: &str) {
        let Some(token) = user.gitter_access_token.clone() else {
            return;
        };
        let mut rooms = match self.gitter.list_rooms(&token).await {
            Ok(r) => r,
            Err(e) => {
                let _ = self
                    .matrix
                    .send(room, &format!("Failed to list Gitter rooms: {e}"), None)
                    .await;
                return;
            }
        };
        let bridged = self
            .store
            .list_bridged_room_ids_for_user(&user.matrix_username)
            .unwrap_or_default();
        rooms.sort_by(|a, b| a.name().cmp(b.name()));
        let lines: Vec<String> = rooms
            .iter()
            .map(|r| {
                let marker = if bridged.contains_key(&r.id) { " *" } else { "" };
                format!(" - {}{}", r.name(), marker)
            })
            .collect();
        let _ = self.matrix.send(room, &lines.join("\n"), None).await;
    }

    async fn cmd_gjoin(&self, user: &User, room: &str, name: &str) {
        let (Some(token), Some(gitter_user_id)) =
            (user.gitter_access_token.clone(), user.gitter_id.clone())
        else {
            return;
        };
        let result = async {
            let found = self.gitter.lookup_room(name, &token).await?;
            self.gitter.join_room(&token, &gitter_user_id, &found.id).await
        }
        .await;
        let msg = match result {
            Ok(_) => format!("Joined {name} on Gitter."),
            Err(e) => format!("Failed to join {name}: {e}"),
        };
        let _ = self.matrix.send(room, &msg, None).await;
    }

    async fn cmd_gpart(self: &Arc<Self>, user: &User, room: &str, name: &str) {
        let (Some(token), Some(gitter_user_id)) =
            (user.gitter_access_token.clone(), user.gitter_id.clone())
        else {
            return;
        };
        if let Some(link) = self.find_room_link_by_name(&user.matrix_username, name).await {
            let _ = self.matrix.leave(&link.matrix_room, None).await;
            let _ = self.matrix.forget(&link.matrix_room, None).await;
            link.destroy().await;
        }
        let result = self.gitter.leave_room(&token, &gitter_user_id, name).await;
        let msg = match result {
            Ok(_) => format!("Left {name} on Gitter."),
            Err(e) => format!("Failed to leave {name}: {e}"),
        };
        let _ = self.matrix.send(room, &msg, None).await;
    }

    async fn cmd_invite(self: &Arc<Self>, user: &User, room: &str, name: &str) {
        if name.is_empty() {
            let _ = self.matrix.send(room, "Invalid command!", None).await;
            return;
        }
        if let Some(link) = self.find_room_link_by_name(&user.matrix_username, name).await {
            let _ = self.matrix.invite(&link.matrix_room, &user.matrix_username).await;
            let _ = self
                .matrix
                .send(room, &format!("You are already on room {name}."), None)
                .await;
            return;
        }

        let Some(token) = user.gitter_access_token.clone() else {
            return;
        };
        let gitter_room = match self.gitter.lookup_room(name, &token).await {
            Ok(r) => r,
            Err(e) => {
                let _ = self
                    .matrix
                    .send(room, &format!("Failed to find {name}: {e}"), None)
                    .await;
                return;
            }
        };
        let matrix_room = match self
            .matrix
            .create_room(Some(&format!("{name} (Gitter)")), &[])
            .await
        {
            Ok(r) => r,
            Err(e) => {
                let _ = self
                    .matrix
                    .send(room, &format!("Failed to create room: {e}"), None)
                    .await;
                return;
            }
        };
        if let Err(e) =
            self.store
                .insert_bridged_room(&user.matrix_username, &matrix_room, name, &gitter_room.id)
        {
            warn!(error = %e, "failed to persist bridged room");
        }
        self.insert_room_link(
            user.matrix_username.clone(),
            matrix_room.clone(),
            name.to_string(),
            gitter_room.id.clone(),
        )
        .await;
        let _ = self.matrix.invite(&matrix_room, &user.matrix_username).await;
        let _ = self
            .matrix
            .send(room, &format!("Bridging {name}..."), None)
            .await;
    }

    async fn cmd_logout(self: &Arc<Self>, user: &User, room: &str) {
        let links: Vec<Arc<RoomLink>> = {
            let by_user = self.by_user_then_gitter_name.lock().await;
            by_user
                .get(&user.matrix_username)
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default()
        };
        for link in links {
            let _ = self.matrix.leave(&link.matrix_room, None).await;
            let _ = self.matrix.forget(&link.matrix_room, None).await;
            link.destroy().await;
        }
        let _ = self.store.clear_gitter_info(&user.matrix_username);
        let _ = self.matrix.send(room, "You have been logged out.", None).await;
        let _ = self.matrix.leave(room, None).await;
        let _ = self.matrix.forget(room, None).await;
        let _ = self.store.clear_private_room_by_value(room);
    }

    /// Lazily registers/joins the virtual user for `gitter_username`, then
    /// forwards `text` into `matrix_room` (spec.md §4.6.2).
    pub async fn forward_to_matrix(&self, matrix_room: &str, gitter_username: &str, text: &str) {
        let local_part = format!("gitter_{gitter_username}");
        let virt = format!("@{}:{}", local_part, self.config.matrix_homeserver_domain);

        if !self.store.virtual_user_exists(&virt).unwrap_or(false) {
            match self.matrix.register(&local_part).await {
                Ok(()) => {
                    if let Err(e) = self
                        .matrix
                        .set_displayname(&virt, &format!("{gitter_username} (Gitter)"))
                        .await
                    {
                        warn!(error = %e, user = %virt, "failed to set virtual user displayname");
                    }
                }
                Err(e) => warn!(error = %e, user = %virt, "failed to register virtual user"),
            }
            let _ = self.store.add_virtual_user(&virt);
        }

        if !self.store.virtual_user_in_room(&virt, matrix_room).unwrap_or(false) {
            if let Err(e) = self.matrix.invite(matrix_room, &virt).await {
                warn!(error = %e, user = %virt, room = %matrix_room, "failed to invite virtual user");
            }
            if let Err(e) = self.matrix.join_as_user(matrix_room, &virt).await {
                warn!(error = %e, user = %virt, room = %matrix_room, "failed to join virtual user");
            }
            let _ = self.store.add_virtual_user_in_room(&virt, matrix_room);
        }

        if let Err(e) = self.matrix.send(matrix_room, text, Some(&virt)).await {
            warn!(error = %e, room = %matrix_room, "failed to forward message to Matrix");
        }
    }

    /// Completes onboarding after the Gitter OAuth callback: fetches the
    /// authenticated identity and writes it atomically (spec.md §3
    /// "Lifecycles", end-to-end scenario 1).
    pub async fn complete_gitter_login(
        &self,
        matrix_username: &str,
        access_token: &str,
    ) -> Result<(), BridgeError> {
        let who = self.gitter.whoami(access_token).await?;
        self.store
            .set_gitter_info(matrix_username, &who.username, &who.id, access_token)?;
        if let Ok(Some(user)) = self.store.get_user_by_matrix_username(matrix_username) {
            if let Some(room) = &user.matrix_private_room {
                let text = format!("You are now logged in as {}.", who.username);
                if let Err(e) = self.matrix.send(room, &text, None).await {
                    warn!(error = %e, room = %room, "failed to send login confirmation");
                }
            }
        }
        Ok(())
    }
}
