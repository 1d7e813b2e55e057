/// IRC server core — listener, client registry, room registry, and the
/// central routing loop that turns session events into replies and
/// room-scoped events.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::config::Config;
use super::bridge::{Bridge, BridgeError};
use super::client::{now_millis, run_session, ClientHandle, ClientId};
use super::event::{Event, EventKind};
use super::room::{room_name_valid, Room, RoomInput, RoomShared};

/// Cadence of the client liveness sweep.
pub const ALIVENESS_CHECK: Duration = Duration::from_secs(10);

/// Nicknames: 1..=9 ASCII letters, digits or dashes.
pub fn nickname_valid(nick: &str) -> bool {
    !nick.is_empty()
        && nick.len() <= 9
        && nick
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

/// A bound listening socket, plain TCP or TLS.
pub struct Listener {
    tcp: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl Listener {
    pub async fn bind(config: &Config) -> anyhow::Result<Self> {
        let tls = config.tls_acceptor()?;
        let addr = config.bind_addr();
        let tcp = TcpListener::bind(&addr).await?;
        info!(%addr, tls = tls.is_some(), "listening");
        Ok(Self { tcp, tls })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.tcp.local_addr()
    }
}

/// Accept connections and spawn a session task per client until shutdown.
/// A listener error ends the loop and propagates cancellation.
pub async fn accept_loop(
    listener: Listener,
    hostname: String,
    events: mpsc::UnboundedSender<Event>,
    shutdown: broadcast::Sender<()>,
) -> anyhow::Result<()> {
    let mut shutdown_rx = shutdown.subscribe();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return Ok(()),
            accepted = listener.tcp.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("accept failed: {e}");
                        let _ = shutdown.send(());
                        return Err(e.into());
                    }
                };
                info!(%addr, "new connection");

                let (out_tx, out_rx) = mpsc::unbounded_channel();
                let handle = Arc::new(ClientHandle::new(addr, hostname.clone(), out_tx));
                let events = events.clone();
                let session_shutdown = shutdown.subscribe();

                match listener.tls.clone() {
                    None => {
                        tokio::spawn(run_session(stream, handle, events, out_rx, session_shutdown));
                    }
                    Some(acceptor) => {
                        tokio::spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    run_session(tls_stream, handle, events, out_rx, session_shutdown)
                                        .await
                                }
                                Err(e) => warn!(%addr, "tls handshake failed: {e}"),
                            }
                        });
                    }
                }
            }
        }
    }
}

struct RoomEntry {
    queue: mpsc::UnboundedSender<RoomInput>,
    shared: Arc<RoomShared>,
}

/// The routing task's state. One per process.
pub struct Server {
    config: Config,
    hostname: String,
    clients: HashMap<ClientId, Arc<ClientHandle>>,
    rooms: HashMap<String, RoomEntry>,
    events: mpsc::UnboundedReceiver<Event>,
    shutdown: broadcast::Sender<()>,
    last_aliveness_check: u64,
}

impl Server {
    pub fn new(
        config: Config,
        events: mpsc::UnboundedReceiver<Event>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        let hostname = config.resolved_hostname();
        Self {
            config,
            hostname,
            clients: HashMap::new(),
            rooms: HashMap::new(),
            events,
            shutdown,
            last_aliveness_check: 0,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Connect configured bus bridges and create their rooms eagerly.
    /// Any failure here is fatal at startup.
    pub async fn setup_bridges(&mut self) -> Result<(), BridgeError> {
        for cfg in self.config.channels.clone() {
            let bridge = Bridge::connect(&cfg).await?;

            let mut room = Room::new(&cfg.name, &self.hostname);
            if !cfg.topic.is_empty() {
                room.set_topic(&cfg.topic);
            }
            room.set_bridge(bridge.clone());

            let (tx, rx) = mpsc::unbounded_channel();
            bridge.spawn_input(tx.clone()).await?;

            let shared = room.shared();
            tokio::spawn(room.run(rx));
            self.rooms.insert(cfg.name.clone(), RoomEntry { queue: tx, shared });
        }
        Ok(())
    }

    /// Run the central dispatch loop until shutdown or all senders close.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut tick = tokio::time::interval(ALIVENESS_CHECK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(hostname = %self.hostname, "server started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tick.tick() => self.check_aliveness(),
                ev = self.events.recv() => match ev {
                    Some(ev) => {
                        self.check_aliveness();
                        self.dispatch(ev).await;
                    }
                    None => break,
                },
            }
        }

        info!("server stopped");
        Ok(())
    }

    /// Probe every client when the cadence has elapsed.
    fn check_aliveness(&mut self) {
        let now = now_millis();
        if now.saturating_sub(self.last_aliveness_check) >= ALIVENESS_CHECK.as_millis() as u64 {
            for client in self.clients.values() {
                client.send_ping(now);
            }
            self.last_aliveness_check = now;
        }
    }

    async fn dispatch(&mut self, ev: Event) {
        let cli = ev.from;
        match ev.kind {
            EventKind::New => {
                self.clients.insert(cli.id(), cli);
            }
            EventKind::Del => {
                self.clients.remove(&cli.id());
                self.evict_from_rooms(cli.id());
            }
            EventKind::Msg => self.handle_line(cli, &ev.text).await,
            // Room-scoped kinds never land on the server queue.
            _ => {}
        }
    }

    async fn handle_line(&mut self, cli: Arc<ClientHandle>, line: &str) {
        let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
        let command = cmd.to_uppercase();

        match command.as_str() {
            "QUIT" => {
                self.clients.remove(&cli.id());
                self.evict_from_rooms(cli.id());
                cli.close();
                return;
            }
            "PING" => {
                if rest.is_empty() {
                    let _ = cli.reply_nicknamed("409", &["No origin specified"]);
                } else {
                    let origin = rest.strip_prefix(':').unwrap_or(rest);
                    let _ = cli.reply(&format!("PONG {} :{}", self.hostname, origin));
                }
                return;
            }
            // Liveness was already refreshed by the read itself.
            "PONG" => return,
            _ => {}
        }

        if !cli.is_registered() {
            self.client_register(&cli, &command, rest).await;
            return;
        }

        match command.as_str() {
            "AWAY" => {}

            "JOIN" => {
                if rest.is_empty() {
                    let _ = cli.reply_not_enough_parameters("JOIN");
                    return;
                }
                self.handle_join(&cli, rest);
            }

            "LIST" => self.send_list(&cli, rest),

            "LUSERS" => self.send_lusers(&cli),

            "MODE" => {
                if rest.is_empty() {
                    let _ = cli.reply_not_enough_parameters("MODE");
                    return;
                }
                let (first, remainder) = match rest.split_once(' ') {
                    Some((f, r)) => (f, Some(r)),
                    None => (rest, None),
                };

                if first == cli.username() {
                    match remainder {
                        None => {
                            let _ = cli.msg(format!("221 {} +", cli.nickname()));
                        }
                        Some(_) => {
                            let _ = cli.reply_nicknamed("501", &["Unknown MODE flag"]);
                        }
                    }
                    return;
                }

                match self.rooms.get(first) {
                    None => {
                        let _ = cli.reply_no_channel(first);
                    }
                    Some(entry) => {
                        let _ = entry.queue.send(RoomInput::Event(Event::new(
                            Arc::clone(&cli),
                            EventKind::Mode,
                            remainder.unwrap_or(""),
                        )));
                    }
                }
            }

            "MOTD" => self.send_motd(&cli).await,

            "PART" => {
                if rest.is_empty() {
                    let _ = cli.reply_not_enough_parameters("PART");
                    return;
                }
                for name in rest.split(',') {
                    match self.rooms.get(name) {
                        None => {
                            let _ = cli.reply_no_channel(name);
                        }
                        Some(entry) => {
                            let _ = entry.queue.send(RoomInput::Event(Event::new(
                                Arc::clone(&cli),
                                EventKind::Del,
                                "",
                            )));
                        }
                    }
                }
            }

            "NOTICE" | "PRIVMSG" => {
                if rest.is_empty() {
                    let _ = cli
                        .reply_nicknamed("411", &[&format!("No recipient given ({command})")]);
                    return;
                }
                let Some((target, payload)) = rest.split_once(' ') else {
                    let _ = cli.reply_nicknamed("412", &["No text to send"]);
                    return;
                };

                // A live client's nickname takes precedence over rooms.
                if let Some(peer) = self
                    .clients
                    .values()
                    .find(|c| c.nickname().eq_ignore_ascii_case(target))
                {
                    let _ = peer.msg(format!(
                        ":{} {} {} :{}",
                        cli,
                        command,
                        peer.nickname(),
                        payload
                    ));
                    return;
                }

                match self.rooms.get(target) {
                    None => {
                        let _ = cli.reply_no_nick_chan(target);
                    }
                    Some(entry) => {
                        let stripped = payload.strip_prefix(':').unwrap_or(payload);
                        let _ = entry.queue.send(RoomInput::Event(Event::new(
                            Arc::clone(&cli),
                            EventKind::Msg,
                            format!("{command} {stripped}"),
                        )));
                    }
                }
            }

            "TOPIC" => {
                if rest.is_empty() {
                    let _ = cli.reply_not_enough_parameters("TOPIC");
                    return;
                }
                let (name, text) = rest.split_once(' ').unwrap_or((rest, ""));
                match self.rooms.get(name) {
                    None => {
                        let _ = cli.reply_no_channel(name);
                    }
                    Some(entry) => {
                        let _ = entry.queue.send(RoomInput::Event(Event::new(
                            Arc::clone(&cli),
                            EventKind::Topic,
                            text,
                        )));
                    }
                }
            }

            "WHO" => {
                if rest.is_empty() {
                    let _ = cli.reply_not_enough_parameters("WHO");
                    return;
                }
                let name = rest.split(' ').next().unwrap_or("");
                match self.rooms.get(name) {
                    None => {
                        let _ = cli.reply_no_channel(name);
                    }
                    Some(entry) => {
                        let _ = entry.queue.send(RoomInput::Event(Event::new(
                            Arc::clone(&cli),
                            EventKind::Who,
                            "",
                        )));
                    }
                }
            }

            "WHOIS" => {
                if rest.is_empty() {
                    let _ = cli.reply_not_enough_parameters("WHOIS");
                    return;
                }
                let last = rest.split(' ').next_back().unwrap_or("");
                for nickname in last.split(',') {
                    self.send_whois(&cli, nickname);
                }
            }

            other => {
                let _ = cli.reply_nicknamed("421", &[other, "Unknown command"]);
            }
        }
    }

    /// NICK/USER handling for not-yet-registered clients; anything else is
    /// ignored until registration completes.
    async fn client_register(&mut self, cli: &Arc<ClientHandle>, command: &str, rest: &str) {
        match command {
            "NICK" => {
                if rest.is_empty() {
                    let _ = cli.reply_parts("431", &["No nickname given"]);
                    return;
                }
                let nickname = rest;
                if self
                    .clients
                    .values()
                    .any(|c| c.id() != cli.id() && c.nickname() == nickname)
                {
                    let _ =
                        cli.reply_parts("433", &["*", nickname, "Nickname is already in use"]);
                    return;
                }
                if !nickname_valid(nickname) {
                    let shown = nickname.split(' ').next().unwrap_or(nickname);
                    let _ = cli.reply_parts("432", &["*", shown, "Erroneous nickname"]);
                    return;
                }
                cli.set_nickname(nickname);
            }
            "USER" => {
                let args: Vec<&str> = rest.splitn(4, ' ').collect();
                if rest.is_empty() || args.len() < 4 {
                    let _ = cli.reply_not_enough_parameters("USER");
                    return;
                }
                let realname = args[3].strip_prefix(':').unwrap_or(args[3]);
                cli.set_user(args[0], realname);
            }
            _ => return,
        }

        if cli.try_complete_registration() {
            let _ = cli.reply_nicknamed("001", &["Hi, welcome to IRC"]);
            let _ = cli.reply_nicknamed(
                "002",
                &[&format!("Your host is {}, running goircd", self.hostname)],
            );
            let _ = cli.reply_nicknamed("003", &["This server was created sometime"]);
            let _ = cli.reply_nicknamed("004", &[&format!("{} goircd o o", self.hostname)]);
            self.send_lusers(cli);
            self.send_motd(cli).await;
        }
    }

    fn handle_join(&mut self, cli: &Arc<ClientHandle>, rest: &str) {
        let mut args = rest.split(' ');
        let rooms: Vec<&str> = args.next().unwrap_or("").split(',').collect();
        let keys: Vec<&str> = args.next().map(|k| k.split(',').collect()).unwrap_or_default();

        for (n, name) in rooms.iter().copied().enumerate() {
            if !room_name_valid(name) {
                let _ = cli.reply_no_channel(name);
                continue;
            }
            let key = keys.get(n).copied().filter(|k| !k.is_empty()).unwrap_or("");

            if let Some(entry) = self.rooms.get(name) {
                let room_key = entry.shared.key();
                if !room_key.is_empty() && room_key != key {
                    let _ = cli
                        .reply_nicknamed("475", &[name, "Cannot join channel (+k) - bad key"]);
                    continue;
                }
                let _ = entry.queue.send(RoomInput::Event(Event::new(
                    Arc::clone(cli),
                    EventKind::New,
                    "",
                )));
                continue;
            }

            let entry = self.register_room(name, key);
            let _ = entry.queue.send(RoomInput::Event(Event::new(
                Arc::clone(cli),
                EventKind::New,
                "",
            )));
        }
    }

    /// Create a room, spawn its task, and index its queue and shared state.
    fn register_room(&mut self, name: &str, key: &str) -> &RoomEntry {
        let room = Room::new(name, &self.hostname);
        if !key.is_empty() {
            room.set_key(key);
        }
        let shared = room.shared();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(room.run(rx));
        self.rooms
            .entry(name.to_owned())
            .or_insert(RoomEntry { queue: tx, shared })
    }

    fn evict_from_rooms(&self, id: ClientId) {
        for entry in self.rooms.values() {
            let _ = entry.queue.send(RoomInput::Evict(id));
        }
    }

    fn send_list(&self, cli: &ClientHandle, rest: &str) {
        let mut names: Vec<String> = if rest.is_empty() {
            self.rooms.keys().cloned().collect()
        } else {
            rest.split(' ')
                .next()
                .unwrap_or("")
                .split(',')
                .map(str::to_owned)
                .collect()
        };
        names.sort();

        for name in &names {
            if let Some(entry) = self.rooms.get(name) {
                let _ = cli.reply_nicknamed(
                    "322",
                    &[
                        name,
                        &entry.shared.member_count().to_string(),
                        &entry.shared.topic(),
                    ],
                );
            }
        }
        let _ = cli.reply_nicknamed("323", &["End of /LIST"]);
    }

    fn send_lusers(&self, cli: &ClientHandle) {
        let lusers = self.clients.values().filter(|c| c.is_registered()).count();
        let _ = cli.reply_nicknamed(
            "251",
            &[&format!(
                "There are {lusers} users and 0 invisible on 1 servers"
            )],
        );
    }

    async fn send_motd(&self, cli: &ClientHandle) {
        if self.config.motd.is_empty() {
            let _ = cli.reply_nicknamed("422", &["MOTD File is missing"]);
            return;
        }

        let motd = match tokio::fs::read_to_string(&self.config.motd).await {
            Ok(motd) => motd,
            Err(e) => {
                warn!(path = %self.config.motd, "cannot read motd file: {e}");
                let _ = cli.reply_nicknamed("422", &["Error reading MOTD File"]);
                return;
            }
        };

        let _ = cli.reply_nicknamed(
            "375",
            &[&format!("- {} Message of the day -", self.hostname)],
        );
        for line in motd.trim_matches('\n').split('\n') {
            let _ = cli.reply_nicknamed("372", &[&format!("- {line}")]);
        }
        let _ = cli.reply_nicknamed("376", &["End of /MOTD command"]);
    }

    fn send_whois(&self, cli: &ClientHandle, nickname: &str) {
        let Some(target) = self
            .clients
            .values()
            .find(|c| c.nickname().eq_ignore_ascii_case(nickname))
        else {
            let _ = cli.reply_no_nick_chan(nickname);
            return;
        };

        let host = target.addr().ip().to_string();
        let _ = cli.reply_nicknamed(
            "311",
            &[
                &target.nickname(),
                &target.username(),
                &host,
                "*",
                &target.realname(),
            ],
        );
        let _ = cli.reply_nicknamed("312", &[&target.nickname(), &self.hostname, &self.hostname]);

        let mut subscriptions: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, entry)| entry.shared.contains(target.id()))
            .map(|(name, _)| name.clone())
            .collect();
        subscriptions.sort();
        let _ = cli.reply_nicknamed("319", &[&target.nickname(), &subscriptions.join(" ")]);
        let _ = cli.reply_nicknamed("318", &[&target.nickname(), "End of /WHOIS list"]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irc::client::Outbound;
    use pretty_assertions::assert_eq;
    use std::net::SocketAddr;

    fn test_server() -> Server {
        let config = Config {
            hostname: "irc.test".into(),
            ..Config::default()
        };
        let (_tx, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        Server::new(config, rx, shutdown)
    }

    fn connect(
        server: &mut Server,
        port: u16,
    ) -> (Arc<ClientHandle>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let handle = Arc::new(ClientHandle::new(addr, "irc.test", tx));
        server.clients.insert(handle.id(), Arc::clone(&handle));
        (handle, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(out) = rx.try_recv() {
            if let Outbound::Line(l) = out {
                lines.push(l);
            }
        }
        lines
    }

    async fn line(server: &mut Server, cli: &Arc<ClientHandle>, text: &str) {
        server.handle_line(Arc::clone(cli), text).await;
    }

    async fn register(server: &mut Server, cli: &Arc<ClientHandle>, nick: &str) {
        line(server, cli, &format!("NICK {nick}")).await;
        line(server, cli, &format!("USER {nick} 0 * :{nick}")).await;
    }

    #[test]
    fn nickname_validation() {
        assert!(nickname_valid("alice"));
        assert!(nickname_valid("a-1"));
        assert!(nickname_valid("n".repeat(9).as_str()));
        assert!(!nickname_valid(""));
        assert!(!nickname_valid("n".repeat(10).as_str()));
        assert!(!nickname_valid("bad name"));
        assert!(!nickname_valid("ünïcode"));
    }

    #[tokio::test]
    async fn registration_sends_welcome_burst() {
        let mut server = test_server();
        let (alice, mut rx) = connect(&mut server, 41001);

        register(&mut server, &alice, "alice").await;

        let lines = drain(&mut rx);
        assert_eq!(
            lines,
            vec![
                ":irc.test 001 alice :Hi, welcome to IRC",
                ":irc.test 002 alice :Your host is irc.test, running goircd",
                ":irc.test 003 alice :This server was created sometime",
                ":irc.test 004 alice :irc.test goircd o o",
                ":irc.test 251 alice :There are 1 users and 0 invisible on 1 servers",
                ":irc.test 422 alice :MOTD File is missing",
            ]
        );
        assert!(alice.is_registered());
    }

    #[tokio::test]
    async fn registration_order_is_irrelevant() {
        let mut server = test_server();
        let (alice, mut rx) = connect(&mut server, 41002);

        line(&mut server, &alice, "USER alice 0 * :Alice A").await;
        assert!(!alice.is_registered());
        line(&mut server, &alice, "NICK alice").await;

        assert!(alice.is_registered());
        let lines = drain(&mut rx);
        assert_eq!(lines[0], ":irc.test 001 alice :Hi, welcome to IRC");
    }

    #[tokio::test]
    async fn duplicate_nickname_rejected() {
        let mut server = test_server();
        let (alice, _alice_rx) = connect(&mut server, 41003);
        register(&mut server, &alice, "alice").await;

        let (bob, mut bob_rx) = connect(&mut server, 41004);
        line(&mut server, &bob, "NICK alice").await;

        assert_eq!(
            drain(&mut bob_rx),
            vec![":irc.test 433 * alice :Nickname is already in use"]
        );
        assert!(!bob.is_registered());
    }

    #[tokio::test]
    async fn erroneous_nickname_echoes_first_token() {
        let mut server = test_server();
        let (alice, mut rx) = connect(&mut server, 41005);

        line(&mut server, &alice, "NICK bad name").await;

        assert_eq!(
            drain(&mut rx),
            vec![":irc.test 432 * bad :Erroneous nickname"]
        );
    }

    #[tokio::test]
    async fn nick_without_argument_replies_431() {
        let mut server = test_server();
        let (alice, mut rx) = connect(&mut server, 41006);

        line(&mut server, &alice, "NICK").await;

        assert_eq!(drain(&mut rx), vec![":irc.test 431 :No nickname given"]);
    }

    #[tokio::test]
    async fn user_requires_four_arguments() {
        let mut server = test_server();
        let (alice, mut rx) = connect(&mut server, 41007);

        line(&mut server, &alice, "USER alice 0 *").await;

        assert_eq!(
            drain(&mut rx),
            vec![":irc.test 461  USER :Not enough parameters"]
        );
    }

    #[tokio::test]
    async fn unknown_command_replies_421() {
        let mut server = test_server();
        let (alice, mut rx) = connect(&mut server, 41008);
        register(&mut server, &alice, "alice").await;
        drain(&mut rx);

        line(&mut server, &alice, "FOO bar").await;

        assert_eq!(
            drain(&mut rx),
            vec![":irc.test 421 alice FOO :Unknown command"]
        );
    }

    #[tokio::test]
    async fn unknown_commands_ignored_before_registration() {
        let mut server = test_server();
        let (alice, mut rx) = connect(&mut server, 41009);

        line(&mut server, &alice, "LIST").await;

        assert_eq!(drain(&mut rx), Vec::<String>::new());
    }

    #[tokio::test]
    async fn ping_works_before_and_after_registration() {
        let mut server = test_server();
        let (alice, mut rx) = connect(&mut server, 41010);

        line(&mut server, &alice, "PING :x").await;
        assert_eq!(drain(&mut rx), vec![":irc.test PONG irc.test :x"]);

        register(&mut server, &alice, "alice").await;
        drain(&mut rx);

        line(&mut server, &alice, "PING x").await;
        assert_eq!(drain(&mut rx), vec![":irc.test PONG irc.test :x"]);

        line(&mut server, &alice, "PING").await;
        assert_eq!(
            drain(&mut rx),
            vec![":irc.test 409 alice :No origin specified"]
        );
    }

    #[tokio::test]
    async fn privmsg_routes_to_client_case_insensitively() {
        let mut server = test_server();
        let (alice, mut alice_rx) = connect(&mut server, 41011);
        let (bob, mut bob_rx) = connect(&mut server, 41012);
        register(&mut server, &alice, "alice").await;
        register(&mut server, &bob, "bob").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        line(&mut server, &alice, "PRIVMSG BOB hello there").await;

        assert_eq!(
            drain(&mut bob_rx),
            vec![":alice!alice@127.0.0.1:41011 PRIVMSG bob :hello there"]
        );
        assert_eq!(drain(&mut alice_rx), Vec::<String>::new());
    }

    #[tokio::test]
    async fn privmsg_unknown_target_replies_401() {
        let mut server = test_server();
        let (alice, mut rx) = connect(&mut server, 41013);
        register(&mut server, &alice, "alice").await;
        drain(&mut rx);

        line(&mut server, &alice, "PRIVMSG nobody hi").await;

        assert_eq!(
            drain(&mut rx),
            vec![":irc.test 401 alice nobody :No such nick/channel"]
        );
    }

    #[tokio::test]
    async fn privmsg_without_recipient_or_text() {
        let mut server = test_server();
        let (alice, mut rx) = connect(&mut server, 41014);
        register(&mut server, &alice, "alice").await;
        drain(&mut rx);

        line(&mut server, &alice, "PRIVMSG").await;
        assert_eq!(
            drain(&mut rx),
            vec![":irc.test 411 alice :No recipient given (PRIVMSG)"]
        );

        line(&mut server, &alice, "PRIVMSG bob").await;
        assert_eq!(drain(&mut rx), vec![":irc.test 412 alice :No text to send"]);
    }

    #[tokio::test]
    async fn join_invalid_room_name_replies_403() {
        let mut server = test_server();
        let (alice, mut rx) = connect(&mut server, 41015);
        register(&mut server, &alice, "alice").await;
        drain(&mut rx);

        line(&mut server, &alice, "JOIN dev").await;

        assert_eq!(
            drain(&mut rx),
            vec![":irc.test 403 alice dev :No such channel"]
        );
    }

    #[tokio::test]
    async fn join_with_bad_key_replies_475() {
        let mut server = test_server();
        let (alice, mut alice_rx) = connect(&mut server, 41016);
        let (bob, mut bob_rx) = connect(&mut server, 41017);
        register(&mut server, &alice, "alice").await;
        register(&mut server, &bob, "bob").await;
        drain(&mut bob_rx);

        line(&mut server, &alice, "JOIN #k key1").await;
        // Let the room task process the join.
        tokio::task::yield_now().await;
        drain(&mut alice_rx);

        line(&mut server, &bob, "JOIN #k").await;
        assert_eq!(
            drain(&mut bob_rx),
            vec![":irc.test 475 bob #k :Cannot join channel (+k) - bad key"]
        );

        line(&mut server, &bob, "JOIN #k key1").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let lines = drain(&mut bob_rx);
        assert!(lines
            .iter()
            .any(|l| l == ":irc.test 353 bob = #k :alice bob"));
    }

    #[tokio::test]
    async fn mode_on_own_username() {
        let mut server = test_server();
        let (alice, mut rx) = connect(&mut server, 41018);
        register(&mut server, &alice, "alice").await;
        drain(&mut rx);

        line(&mut server, &alice, "MODE alice").await;
        assert_eq!(drain(&mut rx), vec!["221 alice +"]);

        line(&mut server, &alice, "MODE alice +i").await;
        assert_eq!(
            drain(&mut rx),
            vec![":irc.test 501 alice :Unknown MODE flag"]
        );
    }

    #[tokio::test]
    async fn lusers_counts_registered_clients() {
        let mut server = test_server();
        let (alice, mut alice_rx) = connect(&mut server, 41019);
        let (_pending, _pending_rx) = connect(&mut server, 41020);
        register(&mut server, &alice, "alice").await;
        drain(&mut alice_rx);

        line(&mut server, &alice, "LUSERS").await;

        assert_eq!(
            drain(&mut alice_rx),
            vec![":irc.test 251 alice :There are 1 users and 0 invisible on 1 servers"]
        );
    }

    #[tokio::test]
    async fn list_reports_rooms_sorted() {
        let mut server = test_server();
        let (alice, mut rx) = connect(&mut server, 41021);
        register(&mut server, &alice, "alice").await;

        line(&mut server, &alice, "JOIN #zoo,#bar").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        drain(&mut rx);

        line(&mut server, &alice, "LIST").await;
        let lines = drain(&mut rx);
        assert_eq!(
            lines,
            vec![
                ":irc.test 322 alice #bar 1 :",
                ":irc.test 322 alice #zoo 1 :",
                ":irc.test 323 alice :End of /LIST",
            ]
        );
    }

    #[tokio::test]
    async fn whois_reports_target_and_subscriptions() {
        let mut server = test_server();
        let (alice, mut alice_rx) = connect(&mut server, 41022);
        let (bob, mut bob_rx) = connect(&mut server, 41023);
        register(&mut server, &alice, "alice").await;
        register(&mut server, &bob, "bob").await;

        line(&mut server, &bob, "JOIN #dev").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        line(&mut server, &alice, "WHOIS bob").await;

        let lines = drain(&mut alice_rx);
        assert_eq!(
            lines,
            vec![
                ":irc.test 311 alice bob bob 127.0.0.1 * :bob",
                ":irc.test 312 alice bob irc.test :irc.test",
                ":irc.test 319 alice bob :#dev",
                ":irc.test 318 alice bob :End of /WHOIS list",
            ]
        );

        line(&mut server, &alice, "WHOIS ghost").await;
        assert_eq!(
            drain(&mut alice_rx),
            vec![":irc.test 401 alice ghost :No such nick/channel"]
        );
    }

    #[tokio::test]
    async fn quit_removes_client_and_room_membership() {
        let mut server = test_server();
        let (alice, mut alice_rx) = connect(&mut server, 41024);
        let (bob, mut bob_rx) = connect(&mut server, 41025);
        register(&mut server, &alice, "alice").await;
        register(&mut server, &bob, "bob").await;

        line(&mut server, &bob, "JOIN #dev").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        drain(&mut bob_rx);

        line(&mut server, &bob, "QUIT").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!server.clients.contains_key(&bob.id()));
        assert!(!server.rooms["#dev"].shared.contains(bob.id()));

        drain(&mut alice_rx);
        line(&mut server, &alice, "LUSERS").await;
        assert_eq!(
            drain(&mut alice_rx),
            vec![":irc.test 251 alice :There are 1 users and 0 invisible on 1 servers"]
        );
    }
}
