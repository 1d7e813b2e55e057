/// A room (`#channel`): member set, topic, key, and the task that applies
/// channel-scope commands and broadcasts to subscribers.
///
/// The room task is the sole mutator of its [`RoomShared`]; the server task
/// only ever takes read-side locks on it (LIST counts, WHOIS subscriptions,
/// JOIN key checks), so the single-writer discipline holds.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{info, warn};

use super::bridge::Bridge;
use super::client::{ClientHandle, ClientId};
use super::event::{Event, EventKind};

/// Room names: `#` followed by 1..=200 chars, excluding NUL, BEL, CR, LF,
/// space, comma, colon and slash.
pub fn room_name_valid(name: &str) -> bool {
    let Some(rest) = name.strip_prefix('#') else {
        return false;
    };
    let count = rest.chars().count();
    if count == 0 || count > 200 {
        return false;
    }
    rest.chars()
        .all(|c| !matches!(c, '\0' | '\x07' | '\n' | '\r' | ' ' | ',' | ':' | '/'))
}

/// Room state readable from outside the room task.
#[derive(Debug, Default)]
pub struct RoomShared {
    pub topic: Mutex<String>,
    pub key: Mutex<String>,
    pub members: Mutex<HashMap<ClientId, Arc<ClientHandle>>>,
}

impl RoomShared {
    pub fn topic(&self) -> String {
        self.topic.lock().unwrap().clone()
    }

    pub fn key(&self) -> String {
        self.key.lock().unwrap().clone()
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().unwrap().len()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.members.lock().unwrap().contains_key(&id)
    }
}

/// One item on a room's inbound queue.
#[derive(Debug)]
pub enum RoomInput {
    /// A client-scoped event routed by the server.
    Event(Event),
    /// A raw line from the bus bridge, broadcast verbatim.
    Bus(String),
    /// Silent removal of a destroyed client.
    Evict(ClientId),
}

#[derive(Debug)]
pub struct Room {
    name: String,
    hostname: String,
    shared: Arc<RoomShared>,
    bridge: Option<Bridge>,
}

impl Room {
    pub fn new(name: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hostname: hostname.into(),
            shared: Arc::new(RoomShared::default()),
            bridge: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shared(&self) -> Arc<RoomShared> {
        Arc::clone(&self.shared)
    }

    pub fn set_key(&self, key: &str) {
        *self.shared.key.lock().unwrap() = key.to_owned();
    }

    pub fn set_topic(&self, topic: &str) {
        *self.shared.topic.lock().unwrap() = topic.to_owned();
    }

    pub fn set_bridge(&mut self, bridge: Bridge) {
        self.bridge = Some(bridge);
    }

    /// Consume the inbound queue until every sender is gone.
    pub async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<RoomInput>) {
        info!(room = %self.name, "room started");
        while let Some(input) = inputs.recv().await {
            match input {
                RoomInput::Event(ev) => self.apply(ev).await,
                RoomInput::Bus(text) => self.broadcast(&text, None),
                RoomInput::Evict(id) => {
                    self.shared.members.lock().unwrap().remove(&id);
                }
            }
        }
        info!(room = %self.name, "room stopped");
    }

    async fn apply(&mut self, ev: Event) {
        let cli = ev.from;

        match ev.kind {
            EventKind::New => {
                self.shared
                    .members
                    .lock()
                    .unwrap()
                    .insert(cli.id(), Arc::clone(&cli));

                self.send_topic(&cli);
                self.broadcast(&format!(":{} JOIN {}", cli, self.name), None);

                let mut nicknames: Vec<String> = self
                    .shared
                    .members
                    .lock()
                    .unwrap()
                    .values()
                    .map(|m| m.nickname())
                    .collect();
                nicknames.sort();

                let _ = cli.reply_nicknamed("353", &["=", &self.name, &nicknames.join(" ")]);
                let _ = cli.reply_nicknamed("366", &[&self.name, "End of NAMES list"]);
            }

            EventKind::Del => {
                let removed = self.shared.members.lock().unwrap().remove(&cli.id());
                if removed.is_none() {
                    let _ =
                        cli.reply_nicknamed("442", &[&self.name, "You are not on that channel"]);
                    return;
                }
                self.broadcast(
                    &format!(":{} PART {} :{}", cli, self.name, cli.nickname()),
                    None,
                );
            }

            EventKind::Topic => {
                if !self.shared.contains(cli.id()) {
                    let _ = cli.reply_parts("442", &[&self.name, "You are not on that channel"]);
                    return;
                }

                if ev.text.is_empty() {
                    self.send_topic(&cli);
                    return;
                }

                let topic = ev.text.strip_prefix(':').unwrap_or(&ev.text).to_owned();
                *self.shared.topic.lock().unwrap() = topic.clone();
                self.broadcast(&format!(":{} TOPIC {} :{}", cli, self.name, topic), None);
            }

            EventKind::Who => {
                let members: Vec<Arc<ClientHandle>> = self
                    .shared
                    .members
                    .lock()
                    .unwrap()
                    .values()
                    .cloned()
                    .collect();
                for m in members {
                    let _ = cli.reply_nicknamed(
                        "352",
                        &[
                            &self.name,
                            &m.username(),
                            &m.addr().to_string(),
                            &self.hostname,
                            &m.nickname(),
                            "H",
                            &format!("0 {}", m.realname()),
                        ],
                    );
                }
                let _ = cli.reply_nicknamed("315", &[&self.name, "End of /WHO list"]);
            }

            EventKind::Mode => {
                if ev.text.is_empty() {
                    let mut mode = String::from("+");
                    if !self.shared.key.lock().unwrap().is_empty() {
                        mode.push('k');
                    }
                    let _ = cli.msg(format!("324 {} {} {}", cli.nickname(), self.name, mode));
                    return;
                }

                if !ev.text.starts_with("+k") && !ev.text.starts_with("-k") {
                    let _ = cli.reply_nicknamed("472", &[&ev.text, "Unknown MODE flag"]);
                    return;
                }

                if !self.shared.contains(cli.id()) {
                    let _ = cli.reply_parts("442", &[&self.name, "You are not on that channel"]);
                    return;
                }

                let msg = if ev.text.starts_with("+k") {
                    let cols: Vec<&str> = ev.text.split(' ').collect();
                    if cols.len() == 1 {
                        let _ = cli.reply_not_enough_parameters("MODE");
                        return;
                    }
                    let key = cols[1];
                    *self.shared.key.lock().unwrap() = key.to_owned();
                    format!(":{} MODE {} +k {}", cli, self.name, key)
                } else {
                    self.shared.key.lock().unwrap().clear();
                    format!(":{} MODE {} -k", cli, self.name)
                };
                self.broadcast(&msg, None);
            }

            EventKind::Msg => {
                let (command, rest) = ev
                    .text
                    .split_once(' ')
                    .unwrap_or((ev.text.as_str(), ""));
                self.broadcast(
                    &format!(":{} {} {} :{}", cli, command, self.name, rest),
                    Some(cli.id()),
                );

                if let Some(bridge) = &self.bridge {
                    bridge.publish(rest).await;
                }
            }
        }
    }

    fn send_topic(&self, cli: &ClientHandle) {
        let topic = self.shared.topic();
        if topic.is_empty() {
            let _ = cli.reply_nicknamed("331", &[&self.name, "No topic is set"]);
        } else {
            let _ = cli.reply_nicknamed("332", &[&self.name, &topic]);
        }
    }

    /// Write one line to every member except `skip`. Failures are logged and
    /// never remove the member; eviction is the liveness sweep's job.
    fn broadcast(&self, msg: &str, skip: Option<ClientId>) {
        let members = self.shared.members.lock().unwrap();
        for member in members.values() {
            if skip == Some(member.id()) {
                continue;
            }
            if let Err(e) = member.msg(msg) {
                warn!(room = %self.name, member = %member.nickname(), "cannot send message: {e}");
            }
        }
    }
}
