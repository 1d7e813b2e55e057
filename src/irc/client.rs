/// Per-connection client state and the session task.
///
/// A [`ClientHandle`] is the capability other tasks hold: it carries the
/// client's identity, liveness counters, and the sending half of the
/// outbound queue. The session task owns the socket and is the only writer
/// to it, so outbound lines from the server and from rooms never interleave
/// their bytes.
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{info, warn};

use super::codec::LineCodec;
use super::event::{Event, EventKind};

/// Max idle time before an unresponsive client is closed.
pub const PING_TIMEOUT: Duration = Duration::from_secs(180);
/// Max idle time before a PING is sent.
pub const PING_THRESHOLD: Duration = Duration::from_secs(90);

/// Server-local client identifier.
pub type ClientId = u64;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

fn next_client_id() -> ClientId {
    NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The session task is gone and can no longer accept lines.
#[derive(Debug, thiserror::Error)]
#[error("client session closed")]
pub struct SessionClosed;

/// Instruction to the session task.
#[derive(Debug)]
pub enum Outbound {
    /// Write one line (terminator appended by the codec).
    Line(String),
    /// Close the connection.
    Close,
}

/// Registration identity, written only by the server task.
#[derive(Debug, Default)]
struct Identity {
    nickname: String,
    username: String,
    realname: String,
    registered: bool,
}

/// Shared capability to one connected client.
#[derive(Debug)]
pub struct ClientHandle {
    id: ClientId,
    addr: SocketAddr,
    hostname: String,
    identity: Mutex<Identity>,
    last_activity: AtomicU64,
    ping_sent: AtomicBool,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl ClientHandle {
    pub fn new(
        addr: SocketAddr,
        hostname: impl Into<String>,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            id: next_client_id(),
            addr,
            hostname: hostname.into(),
            identity: Mutex::new(Identity::default()),
            last_activity: AtomicU64::new(now_millis()),
            ping_sent: AtomicBool::new(false),
            outbound,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn nickname(&self) -> String {
        self.identity.lock().unwrap().nickname.clone()
    }

    pub fn username(&self) -> String {
        self.identity.lock().unwrap().username.clone()
    }

    pub fn realname(&self) -> String {
        self.identity.lock().unwrap().realname.clone()
    }

    pub fn set_nickname(&self, nickname: &str) {
        self.identity.lock().unwrap().nickname = nickname.to_owned();
    }

    pub fn set_user(&self, username: &str, realname: &str) {
        let mut id = self.identity.lock().unwrap();
        id.username = username.to_owned();
        id.realname = realname.to_owned();
    }

    pub fn is_registered(&self) -> bool {
        self.identity.lock().unwrap().registered
    }

    /// A client is registered once it has both a real nickname and a
    /// username. Returns true on the pending-to-registered transition.
    pub fn try_complete_registration(&self) -> bool {
        let mut id = self.identity.lock().unwrap();
        if !id.registered
            && !id.nickname.is_empty()
            && id.nickname != "*"
            && !id.username.is_empty()
        {
            id.registered = true;
            return true;
        }
        false
    }

    /// Refresh the activity clock; any inbound traffic clears a pending ping.
    pub fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Release);
        self.ping_sent.store(false, Ordering::Release);
    }

    /// Send one raw line, terminator appended on the wire.
    pub fn msg(&self, text: impl Into<String>) -> Result<(), SessionClosed> {
        self.outbound
            .send(Outbound::Line(text.into()))
            .map_err(|_| SessionClosed)
    }

    /// Send a server-originated line: `:<hostname> <text>`.
    pub fn reply(&self, text: &str) -> Result<(), SessionClosed> {
        self.msg(format!(":{} {}", self.hostname, text))
    }

    /// Numeric reply with the last part prefixed by `:`.
    pub fn reply_parts(&self, code: &str, parts: &[&str]) -> Result<(), SessionClosed> {
        let mut all: Vec<&str> = Vec::with_capacity(parts.len() + 1);
        all.push(code);
        all.extend_from_slice(parts);
        let last = all.len() - 1;
        let line = all
            .iter()
            .enumerate()
            .map(|(i, p)| {
                if i == last {
                    format!(":{p}")
                } else {
                    (*p).to_owned()
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        self.reply(&line)
    }

    /// Numeric reply addressed to this client's nickname.
    pub fn reply_nicknamed(&self, code: &str, parts: &[&str]) -> Result<(), SessionClosed> {
        let nickname = self.nickname();
        let mut all: Vec<&str> = Vec::with_capacity(parts.len() + 1);
        all.push(&nickname);
        all.extend_from_slice(parts);
        self.reply_parts(code, &all)
    }

    pub fn reply_not_enough_parameters(&self, command: &str) -> Result<(), SessionClosed> {
        self.reply_nicknamed("461", &[command, "Not enough parameters"])
    }

    pub fn reply_no_channel(&self, channel: &str) -> Result<(), SessionClosed> {
        self.reply_nicknamed("403", &[channel, "No such channel"])
    }

    pub fn reply_no_nick_chan(&self, target: &str) -> Result<(), SessionClosed> {
        self.reply_nicknamed("401", &[target, "No such nick/channel"])
    }

    /// Ask the session task to close the connection.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    /// Liveness probe, called by the server sweep. Closes the connection
    /// when the client has been idle past [`PING_TIMEOUT`], or sends a
    /// `PING` (registered clients) / closes (unregistered) past
    /// [`PING_THRESHOLD`].
    pub fn send_ping(&self, now: u64) {
        let last = self.last_activity.load(Ordering::Acquire);
        let idle = Duration::from_millis(now.saturating_sub(last));

        if idle > PING_TIMEOUT {
            info!(addr = %self.addr, "ping timeout");
            self.close();
            return;
        }

        if !self.ping_sent.load(Ordering::Acquire) && idle > PING_THRESHOLD {
            if self.is_registered() {
                if let Err(e) = self.msg(format!("PING :{}", self.hostname)) {
                    warn!(addr = %self.addr, "cannot send ping: {e}");
                }
                self.ping_sent.store(true, Ordering::Release);
            } else {
                info!(addr = %self.addr, "ping timeout");
                self.close();
            }
        }
    }
}

impl fmt::Display for ClientHandle {
    /// The message prefix for this client: `nick!user@addr`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.identity.lock().unwrap();
        write!(f, "{}!{}@{}", id.nickname, id.username, self.addr)
    }
}

/// Run one client session until the socket closes, the server asks for a
/// close, or shutdown fires. Emits NEW on entry and DEL on exit so the
/// server sees them in order with the session's own messages.
pub async fn run_session<S>(
    stream: S,
    handle: Arc<ClientHandle>,
    events: mpsc::UnboundedSender<Event>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    mut shutdown: broadcast::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let addr = handle.addr();
    let mut framed = Framed::new(stream, LineCodec);

    if events
        .send(Event::new(handle.clone(), EventKind::New, ""))
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            frame = framed.next() => match frame {
                Some(Ok(line)) => {
                    handle.touch();
                    if events
                        .send(Event::new(handle.clone(), EventKind::Msg, line))
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Err(e)) => {
                    info!(%addr, "read error: {e}");
                    break;
                }
                None => break,
            },
            out = outbound.recv() => match out {
                Some(Outbound::Line(line)) => {
                    if let Err(e) = framed.send(line).await {
                        warn!(%addr, "write error: {e}");
                        break;
                    }
                }
                Some(Outbound::Close) | None => break,
            },
            _ = shutdown.recv() => break,
        }
    }

    let _ = events.send(Event::new(handle, EventKind::Del, ""));
    info!(%addr, "disconnected");
}
