//! Integration tests for the hosting core
//!
//! Every test drives a real bot on loopback through its public API and talks
//! to it over real sockets, the way a game client would.

use server::action_queue::{ActionQueue, FrameCursor};
use server::bot::Bot;
use server::config::{BotConfig, LobbyConfig};
use server::game::GameState;
use server::health_check::CommandContext;
use shared::gps::{self, GpsReconnect, GPS_HEADER};
use shared::w3gs::{self, IncomingAction, IncomingJoinRequest, W3GS_HEADER};
use shared::{scan_frames, FrameVerdict, Product};
use std::cell::RefCell;
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, UdpSocket};

const POLL_ATTEMPTS: usize = 200;
const POLL_STEP: Duration = Duration::from_millis(5);

/// Loopback-only bot: OS-assigned ports, no broadcast.
fn loopback_config() -> BotConfig {
    let mut config = BotConfig::default();
    config.net.bind_address = Ipv4Addr::LOCALHOST;
    config.net.min_host_port = 0;
    config.net.max_host_port = 0;
    config.net.udp_port = 0;
    config.net.udp_broadcast_enabled = false;
    config
}

/// Retries `f` for about a second.
async fn poll_until<T>(mut f: impl FnMut() -> Option<T>) -> Option<T> {
    for _ in 0..POLL_ATTEMPTS {
        if let Some(value) = f() {
            return Some(value);
        }
        tokio::time::sleep(POLL_STEP).await;
    }
    None
}

fn join_request(host_counter: u32, name: &str) -> Vec<u8> {
    w3gs::send_reqjoin(&IncomingJoinRequest {
        host_counter,
        entry_key: 0,
        listen_port: 6112,
        peer_key: 0,
        name: name.to_string(),
        internal_ip: Ipv4Addr::LOCALHOST,
    })
}

/// A scripted game client that keeps every packet the bot sent it.
struct Client {
    stream: TcpStream,
    pending: Vec<u8>,
    packets: Vec<Vec<u8>>,
    closed: bool,
}

impl Client {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.writable().await.unwrap();
        Self {
            stream,
            pending: Vec::new(),
            packets: Vec::new(),
            closed: false,
        }
    }

    async fn join(port: u16, host_counter: u32, name: &str) -> Self {
        let client = Self::connect(port).await;
        client.send(&join_request(host_counter, name));
        client
    }

    fn send(&self, bytes: &[u8]) {
        assert_eq!(self.stream.try_write(bytes).unwrap(), bytes.len());
    }

    /// Reads whatever arrived and splits it into packets.
    fn pump(&mut self) {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => {
                    self.closed = true;
                    break;
                }
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(_) => break,
            }
        }
        let packets = &mut self.packets;
        let scan = scan_frames::<(), _>(&self.pending, |packet| {
            packets.push(packet.to_vec());
            FrameVerdict::Continue
        });
        self.pending.drain(..scan.consumed);
    }

    fn find(&self, header: u8, op: u8) -> Option<&[u8]> {
        self.packets
            .iter()
            .find(|p| p[0] == header && p[1] == op)
            .map(Vec::as_slice)
    }

    /// Every action carried by the INCOMING_ACTION packets seen so far.
    fn actions(&self) -> Vec<IncomingAction> {
        self.packets
            .iter()
            .filter_map(|p| w3gs::receive_incoming_action(p))
            .flat_map(|(_, actions)| actions)
            .collect()
    }
}

/// JOIN AND CLASSIFICATION TESTS
mod join_tests {
    use super::*;

    /// A join request on the host port seats the player in the lobby
    #[tokio::test]
    async fn test_reqjoin_seats_player() {
        let mut config = loopback_config();
        config.lobbies.push(LobbyConfig::default());
        let mut bot = Bot::new(config).unwrap();
        let host_counter = bot.games()[0].host_counter();
        let port = bot.games()[0].host_port();

        let mut client = Client::join(port, host_counter, "Moon").await;
        let uid = poll_until(|| {
            bot.update(Instant::now());
            client.pump();
            client
                .find(W3GS_HEADER, w3gs::opcode::SLOTINFOJOIN)
                .and_then(w3gs::receive_slotinfojoin)
        })
        .await
        .expect("no SLOTINFOJOIN");

        let game = bot.game(host_counter).unwrap();
        assert_eq!(game.users().len(), 1);
        assert_eq!(game.user(uid).unwrap().name(), "Moon");
        assert_eq!(bot.net().incoming_connections().count(), 0);
    }

    /// A declared length shorter than the header gets the socket closed
    #[tokio::test]
    async fn test_malformed_length_closes_connection() {
        let mut config = loopback_config();
        config.lobbies.push(LobbyConfig::default());
        let mut bot = Bot::new(config).unwrap();
        let port = bot.games()[0].host_port();

        let mut client = Client::connect(port).await;
        client.send(&[W3GS_HEADER, w3gs::opcode::REQJOIN, 0x02, 0x00]);
        poll_until(|| {
            bot.update(Instant::now());
            client.pump();
            client.closed.then_some(())
        })
        .await
        .expect("connection stayed open");
        assert!(bot.games()[0].users().is_empty());
    }

    /// A join aimed at a game that already started is dropped; the
    /// connection stays anonymous instead of being seated
    #[tokio::test]
    async fn test_join_after_start_is_ignored() {
        let mut config = loopback_config();
        config.lobbies.push(LobbyConfig {
            auto_start_players: Some(1),
            ..LobbyConfig::default()
        });
        let mut bot = Bot::new(config).unwrap();
        let host_counter = bot.games()[0].host_counter();
        let port = bot.games()[0].host_port();

        let mut first = Client::join(port, host_counter, "Moon").await;
        poll_until(|| {
            bot.update(Instant::now());
            first.pump();
            first.find(W3GS_HEADER, w3gs::opcode::COUNTDOWN_END).map(|_| ())
        })
        .await
        .expect("game never started");

        let mut late = Client::join(port, host_counter, "Late").await;
        poll_until(|| {
            bot.update(Instant::now());
            (bot.net().incoming_connections().count() == 1).then_some(())
        })
        .await
        .expect("late connection never accepted");
        for _ in 0..20 {
            bot.update(Instant::now());
            tokio::time::sleep(POLL_STEP).await;
        }
        late.pump();

        assert!(late.find(W3GS_HEADER, w3gs::opcode::SLOTINFOJOIN).is_none());
        assert!(!late.closed);
        assert_eq!(bot.games()[0].users().len(), 1);
        assert_eq!(bot.net().incoming_connections().count(), 1);
    }
}

/// GPROXY RECONNECT TESTS
mod reconnect_tests {
    use super::*;

    async fn reconnect_reply(bot: &mut Bot, port: u16, request: &GpsReconnect, op: u8) -> Vec<u8> {
        let mut client = Client::connect(port).await;
        client.send(&gps::send_gpsc_reconnect(request));
        poll_until(|| {
            bot.update(Instant::now());
            client.pump();
            client.find(GPS_HEADER, op).map(<[u8]>::to_vec)
        })
        .await
        .expect("no GPS reply")
    }

    /// A reconnect for a UID no running game knows is rejected as not found
    #[tokio::test]
    async fn test_unknown_uid_is_not_found() {
        let mut config = loopback_config();
        config.lobbies.push(LobbyConfig::default());
        let mut bot = Bot::new(config).unwrap();
        let port = bot.games()[0].host_port();

        let request = GpsReconnect {
            uid: 7,
            reconnect_key: 0xDEAD_BEEF,
            last_packet: 0,
            game_id: None,
        };
        let reply = reconnect_reply(&mut bot, port, &request, gps::opcode::REJECT).await;
        assert_eq!(gps::receive_gpss_reject(&reply), Some(gps::reject_reason::NOT_FOUND));
    }

    /// Wrong keys are rejected as invalid, the right key resumes the session
    #[tokio::test]
    async fn test_reconnect_key_is_checked() {
        let mut config = loopback_config();
        config.lobbies.push(LobbyConfig {
            auto_start_players: Some(1),
            ..LobbyConfig::default()
        });
        let mut bot = Bot::new(config).unwrap();
        let host_counter = bot.games()[0].host_counter();
        let port = bot.games()[0].host_port();

        let mut player = Client::join(port, host_counter, "Moon").await;
        poll_until(|| {
            bot.update(Instant::now());
            player.pump();
            player.find(W3GS_HEADER, w3gs::opcode::COUNTDOWN_END).map(|_| ())
        })
        .await
        .expect("game never started");
        player.send(&gps::send_gpsc_init(1));
        let init = poll_until(|| {
            bot.update(Instant::now());
            player.pump();
            player
                .find(GPS_HEADER, gps::opcode::INIT)
                .and_then(gps::receive_gpss_init)
        })
        .await
        .expect("no GPS INIT");
        assert_eq!(init.reconnect_port, port);
        assert_eq!(bot.game(host_counter).unwrap().state(), GameState::Loading);

        let wrong = GpsReconnect {
            uid: init.uid,
            reconnect_key: init.reconnect_key.wrapping_add(1),
            last_packet: 0,
            game_id: None,
        };
        let reply = reconnect_reply(&mut bot, port, &wrong, gps::opcode::REJECT).await;
        assert_eq!(gps::receive_gpss_reject(&reply), Some(gps::reject_reason::INVALID));
        let user = bot.game(host_counter).unwrap().user(init.uid).unwrap();
        assert_eq!(user.failed_reconnects(), 1);

        let right = GpsReconnect {
            reconnect_key: init.reconnect_key,
            ..wrong
        };
        let reply = reconnect_reply(&mut bot, port, &right, gps::opcode::RECONNECT).await;
        assert!(gps::receive_gpss_reconnect(&reply).is_some());
        assert_eq!(bot.game(host_counter).unwrap().users().len(), 1);
    }
}

/// LAN DISCOVERY TESTS
mod discovery_tests {
    use super::*;

    /// SEARCHGAME on the discovery port is answered with the lobby's GAMEINFO
    #[tokio::test]
    async fn test_searchgame_over_udp() {
        let mut config = loopback_config();
        config.lobbies.push(LobbyConfig {
            name: "lan party".to_string(),
            ..LobbyConfig::default()
        });
        let mut bot = Bot::new(config).unwrap();
        let udp_port = bot.net().udp_port();
        let host_port = bot.games()[0].host_port();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bot_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, udp_port));
        client
            .send_to(&w3gs::send_searchgame(Product::from_tft(true), 26), bot_addr)
            .await
            .unwrap();

        let mut buf = [0u8; 2048];
        let info = poll_until(|| {
            bot.update(Instant::now());
            let (n, _) = client.try_recv_from(&mut buf).ok()?;
            w3gs::receive_gameinfo(&buf[..n])
        })
        .await
        .expect("no GAMEINFO");
        assert_eq!(info.game_name, "lan party");
        assert_eq!(info.port, host_port);
        assert_eq!(info.host_counter, bot.games()[0].host_counter());
    }

    /// A search for an unsupported version goes unanswered
    #[tokio::test]
    async fn test_searchgame_wrong_version_is_ignored() {
        let mut config = loopback_config();
        config.lobbies.push(LobbyConfig::default());
        let mut bot = Bot::new(config).unwrap();
        let bot_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, bot.net().udp_port()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&w3gs::send_searchgame(Product::from_tft(true), 21), bot_addr)
            .await
            .unwrap();

        let mut buf = [0u8; 2048];
        for _ in 0..20 {
            bot.update(Instant::now());
            tokio::time::sleep(POLL_STEP).await;
        }
        assert!(client.try_recv_from(&mut buf).is_err());
    }
}

/// HEALTH CHECK TESTS
mod health_check_tests {
    use super::*;

    #[derive(Debug, Clone, Default)]
    struct Replies(Rc<RefCell<Vec<String>>>);

    impl CommandContext for Replies {
        fn send_reply(&mut self, message: &str) {
            self.0.borrow_mut().push(message.to_string());
        }
    }

    /// The bot can join its own lobby over loopback
    #[tokio::test]
    async fn test_health_check_reports_loopback() {
        let mut config = loopback_config();
        config.lobbies.push(LobbyConfig::default());
        let mut bot = Bot::new(config).unwrap();
        let host_counter = bot.games()[0].host_counter();

        let replies = Replies::default();
        assert!(bot.query_health_check(host_counter, Box::new(replies.clone())));
        poll_until(|| {
            bot.update(Instant::now());
            (!bot.net().has_health_check()).then_some(())
        })
        .await
        .expect("health check never finished");

        let lines = replies.0.borrow();
        assert!(lines[0].ends_with("1/1 reachable"), "{:?}", lines);
        assert!(lines.iter().any(|l| l.contains("loopback") && l.contains("OK")));

        // The probe leaves the lobby once it has its slot
        poll_until(|| {
            bot.update(Instant::now());
            bot.games()[0].users().is_empty().then_some(())
        })
        .await
        .expect("probe stayed in the lobby");
    }

    /// Unknown host counters are refused up front
    #[tokio::test]
    async fn test_health_check_unknown_game() {
        let mut bot = Bot::new(loopback_config()).unwrap();
        assert!(!bot.query_health_check(42, Box::new(Replies::default())));
        assert!(!bot.net().has_health_check());
    }
}

/// ACTION SCHEDULING TESTS
mod action_tests {
    use super::*;

    /// Actions from one player reach every player once the game is loaded
    #[tokio::test]
    async fn test_action_reaches_all_players() {
        let mut config = loopback_config();
        config.game.latency_ms = 20;
        config.lobbies.push(LobbyConfig {
            auto_start_players: Some(2),
            ..LobbyConfig::default()
        });
        let mut bot = Bot::new(config).unwrap();
        let host_counter = bot.games()[0].host_counter();
        let port = bot.games()[0].host_port();

        let mut alpha = Client::join(port, host_counter, "Alpha").await;
        let mut beta = Client::join(port, host_counter, "Beta").await;
        poll_until(|| {
            bot.update(Instant::now());
            alpha.pump();
            beta.pump();
            let started = |c: &Client| c.find(W3GS_HEADER, w3gs::opcode::COUNTDOWN_END).is_some();
            (started(&alpha) && started(&beta)).then_some(())
        })
        .await
        .expect("game never started");
        let alpha_uid = alpha
            .find(W3GS_HEADER, w3gs::opcode::SLOTINFOJOIN)
            .and_then(w3gs::receive_slotinfojoin)
            .unwrap();

        alpha.send(&w3gs::send_gameloaded_self());
        beta.send(&w3gs::send_gameloaded_self());
        poll_until(|| {
            bot.update(Instant::now());
            (bot.game(host_counter)?.state() == GameState::Loaded).then_some(())
        })
        .await
        .expect("game never loaded");

        alpha.send(&w3gs::send_outgoing_action(&[0x60, 0x01, 0x02]));
        poll_until(|| {
            bot.update(Instant::now());
            alpha.pump();
            beta.pump();
            (!alpha.actions().is_empty() && !beta.actions().is_empty()).then_some(())
        })
        .await
        .expect("action never delivered");

        let expected = vec![IncomingAction {
            uid: alpha_uid,
            data: vec![0x60, 0x01, 0x02],
        }];
        assert_eq!(alpha.actions(), expected);
        assert_eq!(beta.actions(), expected);
    }

    /// Payload bytes of every action inside a serialized frame.
    fn payloads(bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        scan_frames::<(), _>(bytes, |packet| {
            if let Some((_, actions)) = w3gs::receive_incoming_action(packet) {
                out.extend(actions.into_iter().flat_map(|a| a.data));
            }
            FrameVerdict::Continue
        });
        out
    }

    /// A queue with two cursors stepped the way the scheduler steps them.
    struct Schedule {
        queue: ActionQueue,
        cursors: [FrameCursor; 2],
        seen: [Vec<u8>; 2],
    }

    impl Schedule {
        fn new() -> Self {
            Self {
                queue: ActionQueue::new(),
                cursors: [FrameCursor::at(0), FrameCursor::at(0)],
                seen: [Vec::new(), Vec::new()],
            }
        }

        /// Closes `frames` frames, each carrying its own sequence number.
        fn run(&mut self, frames: u8, targets: [u64; 2]) {
            for _ in 0..frames {
                let seq = self.queue.tail_seq() as u8;
                self.queue.tail_mut().add_action(IncomingAction {
                    uid: 1,
                    data: vec![seq],
                });
                let current = self.queue.close_tail();
                let head = self.queue.head_seq();
                for (i, cursor) in self.cursors.iter_mut().enumerate() {
                    cursor.follow(current);
                    let offset = cursor.offset(current);
                    if offset < targets[i] {
                        cursor.add_delay(head);
                    } else if offset > targets[i] {
                        cursor.sub_delay(current);
                    }
                    if cursor.pending().is_some() {
                        let bytes = self.queue.deliver(cursor, 100).expect("frame retired too early");
                        self.seen[i].extend(payloads(&bytes));
                    }
                }
                let bound = self
                    .cursors
                    .iter()
                    .map(FrameCursor::retire_bound)
                    .min()
                    .unwrap();
                self.queue.retire_through(bound);
            }
        }
    }

    /// Two cursors, one held three frames back, each see every frame once
    /// and in order; catching up later merges frames without repeating any.
    #[test]
    fn test_equalizer_delivers_each_frame_once() {
        let mut schedule = Schedule::new();

        schedule.run(20, [0, 3]);
        assert_eq!(schedule.seen[0], (1..=20).collect::<Vec<u8>>());
        assert_eq!(schedule.seen[1], (1..=17).collect::<Vec<u8>>());
        assert_eq!(schedule.cursors[1].offset(schedule.queue.current()), 3);

        schedule.run(10, [0, 0]);
        assert_eq!(schedule.seen[0], (1..=30).collect::<Vec<u8>>());
        assert_eq!(schedule.seen[1], (1..=30).collect::<Vec<u8>>());
        assert!(schedule.queue.head_seq() > 1);
    }
}
