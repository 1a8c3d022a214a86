//! Hosted games: lobby seating, LAN advertising and the action scheduler.
//!
//! A game moves through `Lobby -> Loading -> Loaded -> Exiting`. While in the
//! lobby it seats joiners and advertises itself; once every player has
//! loaded, the scheduler closes one action frame per latency interval and
//! hands it to each user at that user's ping-equalizer offset.

use crate::address::Family;
use crate::action_queue::{ActionQueue, FrameCallback};
use crate::async_observer::AsyncObserver;
use crate::config::{GameConfig, LobbyConfig, RttMode};
use crate::game_user::{GameUser, UserEvent, UserTick, MAX_NAME_LEN};
use crate::net::Net;
use crate::socket::StreamIoSocket;
use log::{debug, info, trace, warn};
use shared::gps::GpsReconnect;
use shared::stat_string::MapStats;
use shared::vlan::{self, VlanGameInfo};
use shared::w3gs::{self, leave_reason, reject_reason, slot_status, GameInfo, IncomingAction, SlotData};
use shared::Product;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

/// UID of the bot's own seatless player.
pub const VIRTUAL_HOST_UID: u8 = 1;
const PAUSE_ACTION: u8 = 0x01;
const RESUME_ACTION: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameState {
    Lobby,
    Loading,
    Loaded,
    Exiting,
}

/// Outcome of looking up the target of a GProxy reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectLookup {
    Found { game: usize, uid: u8 },
    InvalidKey { game: usize, uid: u8 },
    NotFound,
}

/// Extended requests match on game id first; legacy ones scan every game
/// for the UID and key.
pub fn find_reconnect_target(games: &[Game], request: &GpsReconnect) -> ReconnectLookup {
    let mut mismatch = None;
    for (index, game) in games.iter().enumerate() {
        if !matches!(game.state, GameState::Loading | GameState::Loaded) {
            continue;
        }
        if request.game_id.is_some_and(|id| id != game.gproxy_id) {
            continue;
        }
        let Some(key) = game.user(request.uid).and_then(GameUser::reconnect_key) else {
            continue;
        };
        if key == request.reconnect_key {
            return ReconnectLookup::Found {
                game: index,
                uid: request.uid,
            };
        }
        mismatch.get_or_insert(ReconnectLookup::InvalidKey {
            game: index,
            uid: request.uid,
        });
    }
    mismatch.unwrap_or(ReconnectLookup::NotFound)
}

fn random_nonzero() -> u32 {
    rand::random::<u32>().max(1)
}

#[derive(Debug)]
pub struct Game {
    host_counter: u32,
    gproxy_id: u32,
    entry_key: u32,
    random_seed: u32,
    host_port: u16,
    lobby: LobbyConfig,
    config: GameConfig,
    state: GameState,
    created_at: Instant,
    slots: Vec<SlotData>,
    users: Vec<GameUser>,
    observers: Vec<AsyncObserver>,
    actions: ActionQueue,
    last_frame_at: Instant,
    last_ping_at: Instant,
    last_broadcast_at: Option<Instant>,
    advertised_players: usize,
    announced: bool,
}

impl Game {
    pub fn new(
        host_counter: u32,
        host_port: u16,
        lobby: LobbyConfig,
        config: GameConfig,
        now: Instant,
    ) -> Self {
        let slots = (0..lobby.slots)
            .map(|i| SlotData::open(i, i))
            .collect();
        Self {
            host_counter,
            gproxy_id: random_nonzero(),
            entry_key: rand::random(),
            random_seed: rand::random(),
            host_port,
            lobby,
            config,
            state: GameState::Lobby,
            created_at: now,
            slots,
            users: Vec::new(),
            observers: Vec::new(),
            actions: ActionQueue::new(),
            last_frame_at: now,
            last_ping_at: now,
            last_broadcast_at: None,
            advertised_players: 0,
            announced: false,
        }
    }

    pub fn host_counter(&self) -> u32 {
        self.host_counter
    }

    pub fn gproxy_id(&self) -> u32 {
        self.gproxy_id
    }

    pub fn name(&self) -> &str {
        &self.lobby.name
    }

    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    pub fn state(&self) -> GameState {
        self.state
    }

    pub fn is_mirror(&self) -> bool {
        self.lobby.is_mirror
    }

    /// Open to new players through REQJOIN.
    pub fn is_joinable(&self) -> bool {
        self.state == GameState::Lobby && !self.lobby.is_mirror
    }

    pub fn users(&self) -> &[GameUser] {
        &self.users
    }

    pub fn user(&self, uid: u8) -> Option<&GameUser> {
        self.users.iter().find(|u| u.uid() == uid)
    }

    fn user_mut(&mut self, uid: u8) -> Option<&mut GameUser> {
        self.users.iter_mut().find(|u| u.uid() == uid)
    }

    pub fn observers(&self) -> &[AsyncObserver] {
        &self.observers
    }

    pub fn actions(&self) -> &ActionQueue {
        &self.actions
    }

    pub fn product(&self) -> Product {
        Product::from_tft(self.config.tft)
    }

    pub fn supports_version(&self, product: Product, version: u32) -> bool {
        product == self.product()
            && (version == self.config.war3_version || self.lobby.extra_versions.contains(&version))
    }

    fn ticks(&self, now: Instant) -> u32 {
        now.duration_since(self.created_at).as_millis() as u32
    }

    fn open_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.slot_status == slot_status::OPEN)
            .count()
    }

    fn slot_info(&self) -> Vec<u8> {
        w3gs::encode_slot_info(&self.slots, self.random_seed, 0)
    }

    pub fn game_info(&self, now: Instant) -> GameInfo {
        GameInfo {
            product: self.product(),
            version: self.config.war3_version,
            host_counter: self.host_counter,
            entry_key: self.entry_key,
            game_name: self.lobby.name.clone(),
            stats: MapStats {
                map_flags: self.lobby.map_flags,
                map_width: self.lobby.map_width,
                map_height: self.lobby.map_height,
                map_crc: self.lobby.map_crc,
                map_path: self.lobby.map_path.clone(),
                host_name: self.lobby.host_name.clone(),
            },
            slots_total: self.slots.len() as u32,
            game_type: self.lobby.map_game_type,
            slots_open: self.open_slots() as u32,
            elapsed_secs: now.duration_since(self.created_at).as_secs() as u32,
            port: self.host_port,
        }
    }

    pub fn vlan_game_info(&self, now: Instant, ip: Ipv4Addr) -> VlanGameInfo {
        VlanGameInfo {
            info: self.game_info(now),
            ip,
        }
    }

    fn prefix(&self) -> String {
        format!("[GAME: {}]", self.lobby.name)
    }

    fn send_all(&mut self, bytes: &[u8]) {
        for user in &mut self.users {
            user.send(bytes);
        }
    }

    fn name_taken(&self, name: &str) -> bool {
        name.eq_ignore_ascii_case(&self.lobby.host_name)
            || self.users.iter().any(|u| u.name().eq_ignore_ascii_case(name))
    }

    fn is_censored(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.config
            .censored_names
            .iter()
            .any(|banned| !banned.is_empty() && lower.contains(&banned.to_lowercase()))
    }

    fn next_uid(&self) -> Option<u8> {
        (1..=u8::MAX).find(|&uid| uid != VIRTUAL_HOST_UID && self.user(uid).is_none())
    }

    /// Seats the sender of a REQJOIN. On rejection the socket comes back
    /// with a REJECTJOIN queued.
    pub fn event_request_join(
        &mut self,
        mut socket: StreamIoSocket,
        request: &w3gs::IncomingJoinRequest,
    ) -> Result<u8, StreamIoSocket> {
        let reason = if !self.is_joinable() {
            Some(reject_reason::STARTED)
        } else if request.name.is_empty() || request.name.len() > MAX_NAME_LEN {
            Some(reject_reason::FULL)
        } else if self.is_censored(&request.name) || self.name_taken(&request.name) {
            Some(reject_reason::FULL)
        } else {
            None
        };
        let slot = self
            .slots
            .iter()
            .position(|s| s.slot_status == slot_status::OPEN);
        let uid = self.next_uid();
        let (slot, uid) = match (reason, slot, uid) {
            (None, Some(slot), Some(uid)) => (slot, uid),
            (reason, _, _) => {
                let reason = reason.unwrap_or(reject_reason::FULL);
                info!("{} rejected {} (reason {})", self.prefix(), request.name, reason);
                socket.put_bytes(&w3gs::send_rejectjoin(reason));
                return Err(socket);
            }
        };

        self.slots[slot].uid = uid;
        self.slots[slot].slot_status = slot_status::OCCUPIED;
        self.slots[slot].download_status = 100;

        let remote = socket.remote_addr();
        let mut user = GameUser::new(uid, request.name.clone(), request.internal_ip, socket);
        let slot_info = self.slot_info();
        user.send(&w3gs::send_slotinfojoin(
            uid,
            &slot_info,
            remote.port(),
            user.external_ip(),
        ));
        user.send(&w3gs::send_playerinfo(
            VIRTUAL_HOST_UID,
            &self.lobby.host_name,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
        ));
        for other in &self.users {
            user.send(&w3gs::send_playerinfo(
                other.uid(),
                other.name(),
                other.external_ip(),
                other.internal_ip(),
            ));
        }

        let announce = w3gs::send_playerinfo(uid, user.name(), user.external_ip(), user.internal_ip());
        self.send_all(&announce);
        self.send_all(&w3gs::send_slotinfo(&slot_info));
        self.users.push(user);

        info!(
            "{} {} joined from {} as uid {} ({}/{})",
            self.prefix(),
            request.name,
            remote,
            uid,
            self.users.len(),
            self.slots.len()
        );
        Ok(uid)
    }

    /// Hands a transport back to a user waiting on a GProxy reconnect.
    ///
    /// Returns the socket that has to be drained: the user's previous one, or
    /// `socket` itself when the user is gone.
    pub fn reconnect_user(
        &mut self,
        uid: u8,
        socket: StreamIoSocket,
        last_packet: u32,
        now: Instant,
    ) -> Option<StreamIoSocket> {
        let prefix = self.prefix();
        match self.user_mut(uid) {
            Some(user) => {
                let away = user
                    .disconnected_at()
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or_default();
                info!("{} {} reconnected after {:?}", prefix, user.name(), away);
                user.reconnect(socket, last_packet)
            }
            None => Some(socket),
        }
    }

    pub fn on_invalid_reconnect(&mut self, uid: u8, from: SocketAddr) {
        if let Some(user) = self.user_mut(uid) {
            user.on_invalid_reconnect(from);
        }
    }

    pub fn add_async_observer(&mut self, observer: AsyncObserver) {
        self.observers.push(observer);
    }

    pub fn take_observers(&mut self) -> Vec<AsyncObserver> {
        std::mem::take(&mut self.observers)
    }

    /// Puts observers back, keeping any added while they were out.
    pub fn restore_observers(&mut self, mut observers: Vec<AsyncObserver>) {
        observers.append(&mut self.observers);
        self.observers = observers;
    }

    /// Removes a user. Its socket goes back to `net` to be drained.
    pub fn remove_user(&mut self, uid: u8, reason: u32, net: &mut Net, now: Instant) {
        let Some(index) = self.users.iter().position(|u| u.uid() == uid) else {
            return;
        };
        let mut user = self.users.remove(index);
        info!("{} {} left (reason {})", self.prefix(), user.name(), reason);
        user.flush();
        if let Some(socket) = user.take_socket() {
            net.on_user_kicked(socket.local_port(), socket, now);
        }

        match self.state {
            GameState::Lobby => {
                if let Some(slot) = self.slots.iter_mut().find(|s| s.uid == uid) {
                    *slot = SlotData::open(slot.team, slot.color);
                }
                self.send_all(&w3gs::send_playerleave_others(uid, reason));
                let slot_info = self.slot_info();
                self.send_all(&w3gs::send_slotinfo(&slot_info));
            }
            GameState::Loading => {
                self.send_all(&w3gs::send_playerleave_others(uid, reason));
            }
            GameState::Loaded => {
                self.actions.tail_mut().add_leaver(uid);
            }
            GameState::Exiting => {}
        }
    }

    pub fn kick_user(&mut self, uid: u8, net: &mut Net, now: Instant) {
        let reason = match self.state {
            GameState::Lobby => leave_reason::LOBBY,
            _ => leave_reason::LOST,
        };
        self.remove_user(uid, reason, net, now);
    }

    fn start_countdown(&mut self, net: &mut Net) {
        info!("{} starting with {} players", self.prefix(), self.users.len());
        self.send_all(&w3gs::send_countdown_start());
        self.send_all(&w3gs::send_countdown_end());
        self.state = GameState::Loading;
        self.announce_gone(net);
    }

    fn finish_loading(&mut self, now: Instant) {
        info!("{} everyone loaded", self.prefix());
        self.state = GameState::Loaded;
        self.actions = ActionQueue::new();
        let current = self.actions.current();
        for user in &mut self.users {
            *user.cursor_mut() = crate::action_queue::FrameCursor::at(current);
        }
        self.last_frame_at = now;
    }

    fn user_tick(&self, net: &Net, now: Instant) -> UserTick {
        let config = net.config();
        UserTick {
            now,
            ticks: self.ticks(now),
            gproxy_basic: config.gproxy_basic_enabled,
            gproxy_extended: config.gproxy_extended_enabled,
            reconnect_wait_ms: config.reconnect_wait_ms,
            game_id: self.gproxy_id,
        }
    }

    fn handle_event(&mut self, uid: u8, event: UserEvent, net: &mut Net, now: Instant) {
        match event {
            UserEvent::Action(data) => {
                if self.state != GameState::Loaded {
                    return;
                }
                let tail = self.actions.tail_mut();
                match data.first() {
                    Some(&PAUSE_ACTION) => tail.set_callback(FrameCallback::Pause, uid),
                    Some(&RESUME_ACTION) => tail.set_callback(FrameCallback::Resume, uid),
                    _ => {}
                }
                tail.add_action(IncomingAction { uid, data });
            }
            UserEvent::KeepAlive(checksum) => trace!("{} keepalive {} from {}", self.prefix(), checksum, uid),
            UserEvent::Loaded => {
                if self.state != GameState::Loading {
                    return;
                }
                if let Some(user) = self.user_mut(uid) {
                    user.set_loaded();
                }
                self.send_all(&w3gs::send_gameloaded_others(uid));
                if self.users.iter().all(GameUser::is_loaded) {
                    self.finish_loading(now);
                }
            }
            UserEvent::Left(reason) => self.remove_user(uid, reason, net, now),
            UserEvent::Disconnected => {
                let can_wait = matches!(self.state, GameState::Loading | GameState::Loaded)
                    && self.user(uid).is_some_and(GameUser::gproxy_enabled);
                if can_wait {
                    info!("{} uid {} lost its connection, waiting for reconnect", self.prefix(), uid);
                } else {
                    self.remove_user(uid, leave_reason::DISCONNECT, net, now);
                }
            }
            UserEvent::ProtocolError => {
                debug!("{} kicking uid {} for a protocol violation", self.prefix(), uid);
                self.kick_user(uid, net, now);
            }
        }
    }

    /// Advances the game by one reactor tick.
    pub fn update(&mut self, net: &mut Net, now: Instant) {
        if self.state == GameState::Exiting {
            return;
        }
        let tick = self.user_tick(net, now);

        let mut events = Vec::new();
        for user in &mut self.users {
            for event in user.update(&tick) {
                events.push((user.uid(), event));
            }
        }
        for (uid, event) in events {
            self.handle_event(uid, event, net, now);
        }

        let wait = Duration::from_millis(tick.reconnect_wait_ms);
        let expired: Vec<u8> = self
            .users
            .iter()
            .filter(|u| u.disconnected_at().is_some_and(|at| now.saturating_duration_since(at) >= wait))
            .map(GameUser::uid)
            .collect();
        for uid in expired {
            warn!("{} uid {} did not reconnect in time", self.prefix(), uid);
            self.remove_user(uid, leave_reason::DISCONNECT, net, now);
        }

        match self.state {
            GameState::Lobby => {
                if let Some(wanted) = self.lobby.auto_start_players {
                    if wanted > 0 && self.users.len() >= wanted as usize {
                        self.start_countdown(net);
                    }
                }
                self.advertise(net, now);
            }
            GameState::Loaded => {
                self.run_actions_scheduler(now, net.config().rtt_mode);
                if self.users.is_empty() {
                    info!("{} every player left", self.prefix());
                    self.state = GameState::Exiting;
                }
            }
            GameState::Loading | GameState::Exiting => {}
        }

        self.send_pings(now);
        for user in &mut self.users {
            user.flush();
        }
    }

    fn send_pings(&mut self, now: Instant) {
        let interval = match self.state {
            GameState::Lobby => self.config.lobby_ping_interval_ms,
            _ => self.config.game_ping_interval_ms,
        };
        if now.saturating_duration_since(self.last_ping_at) < Duration::from_millis(interval) {
            return;
        }
        self.last_ping_at = now;
        let ticks = self.ticks(now);
        for user in self.users.iter_mut().filter(|u| u.socket().is_some()) {
            user.ping(ticks);
        }
    }

    /// Our public address just became known or changed. A lobby re-advertises
    /// on its next tick instead of waiting out the broadcast interval.
    pub fn on_self_ip_resolved(&mut self, family: Family) {
        if self.state != GameState::Lobby || self.lobby.is_mirror {
            return;
        }
        info!("{} public {:?} address changed, re-advertising", self.prefix(), family);
        self.last_broadcast_at = None;
    }

    /// CREATEGAME once, GAMEINFO on every broadcast interval and REFRESHGAME
    /// whenever the player count changes.
    fn advertise(&mut self, net: &mut Net, now: Instant) {
        if self.lobby.is_mirror {
            return;
        }
        let version = self.config.war3_version;
        if !self.announced {
            self.announced = true;
            net.send_game_discovery(
                &w3gs::send_creategame(self.product(), version, self.host_counter),
                &vlan::send_vlan_creategame(self.product(), version, self.host_counter),
            );
        }
        if self.users.len() != self.advertised_players {
            self.advertised_players = self.users.len();
            let players = self.users.len() as u32 + 1;
            let total = self.slots.len() as u32;
            net.send_game_discovery(
                &w3gs::send_refreshgame(self.host_counter, players, total),
                &vlan::send_vlan_refreshgame(self.host_counter, players, total),
            );
        }
        let interval = Duration::from_millis(self.config.broadcast_interval_ms);
        if self
            .last_broadcast_at
            .is_some_and(|at| now.saturating_duration_since(at) < interval)
        {
            return;
        }
        self.last_broadcast_at = Some(now);
        let ip = net.public_ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED);
        net.send_game_discovery(
            &w3gs::send_gameinfo(&self.game_info(now)),
            &vlan::send_vlan_gameinfo(&self.vlan_game_info(now, ip)),
        );
    }

    fn announce_gone(&mut self, net: &mut Net) {
        if self.announced && !self.lobby.is_mirror {
            net.send_game_discovery(
                &w3gs::send_decreategame(self.host_counter),
                &vlan::send_vlan_decreategame(self.host_counter),
            );
            self.announced = false;
        }
    }

    /// Frame offset each user should lag by, in user order.
    fn equalizer_targets(&self, mode: RttMode) -> Vec<u64> {
        if !self.config.ping_equalizer_enabled {
            return vec![0; self.users.len()];
        }
        let rtts: Vec<u32> = self.users.iter().map(|u| u.rtt(mode)).collect();
        let max_rtt = rtts.iter().copied().max().unwrap_or(0);
        let latency = u64::from(self.config.latency_ms.max(1));
        let min = u64::from(self.config.equalizer_min_frames);
        let max = u64::from(self.config.equalizer_max_frames);
        rtts.into_iter()
            .map(|rtt| u64::from(max_rtt - rtt).div_ceil(latency).clamp(min, max))
            .collect()
    }

    /// Closes a frame once per latency interval and flushes it to every user
    /// whose cursor reached it.
    pub(crate) fn run_actions_scheduler(&mut self, now: Instant, mode: RttMode) {
        let latency = self.config.latency_ms;
        if now.saturating_duration_since(self.last_frame_at) < Duration::from_millis(u64::from(latency)) {
            return;
        }
        self.last_frame_at = now;

        let targets = self.equalizer_targets(mode);
        let current = self.actions.close_tail();
        let head = self.actions.head_seq();

        for (user, target) in self.users.iter_mut().zip(targets) {
            let cursor = user.cursor_mut();
            cursor.follow(current);
            let offset = cursor.offset(current);
            if offset < target {
                cursor.add_delay(head);
            } else if offset > target {
                cursor.sub_delay(current);
            }
            if let Some(bytes) = self.actions.deliver(cursor, latency) {
                user.send(&bytes);
            }
        }

        if let Some(frame) = self.actions.get(current) {
            let bytes = frame.get_bytes(latency);
            for observer in &mut self.observers {
                observer.push_frame(bytes.clone());
            }
        }

        let history = if self.config.ping_equalizer_enabled {
            u64::from(self.config.equalizer_max_frames)
        } else {
            0
        };
        let bound = self
            .users
            .iter()
            .map(|u| u.cursor().retire_bound())
            .min()
            .unwrap_or(current);
        self.actions.retire_through(bound.saturating_sub(history));
    }

    /// Tears the game down and hands every socket back for draining.
    pub fn close(&mut self, net: &mut Net, now: Instant) {
        self.announce_gone(net);
        for mut user in self.users.drain(..) {
            user.flush();
            if let Some(socket) = user.take_socket() {
                net.on_user_kicked(socket.local_port(), socket, now);
            }
        }
        for mut observer in self.observers.drain(..) {
            if let Some(socket) = observer.take_socket() {
                net.on_user_kicked(socket.local_port(), socket, now);
            }
        }
        self.state = GameState::Exiting;
    }
}
