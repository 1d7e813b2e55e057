/// Optional per-room bridge to a NATS subject.
///
/// A bridged room is created at startup. Direction `output` publishes every
/// room message's payload to the configured subject; direction `input`
/// forwards every bus message into the room's queue, where it is broadcast
/// verbatim to the members.
use serde::Deserialize;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use super::room::RoomInput;

/// Which way traffic crosses the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Bus messages are broadcast into the room.
    Input,
    /// Room messages are published to the bus.
    Output,
}

/// One `channels:` entry from the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Bus URL, e.g. `nats://127.0.0.1:4222`.
    pub url: String,
    /// Room name and bus subject.
    pub name: String,
    pub direction: Direction,
    /// Initial topic override for the room.
    #[serde(default)]
    pub topic: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("cannot connect to {url}: {source}")]
    Connect {
        url: String,
        source: async_nats::ConnectError,
    },
    #[error("cannot subscribe to {subject}: {source}")]
    Subscribe {
        subject: String,
        source: async_nats::SubscribeError,
    },
}

/// A live bus connection scoped to one room.
#[derive(Debug, Clone)]
pub struct Bridge {
    client: async_nats::Client,
    subject: String,
    direction: Direction,
}

impl Bridge {
    pub async fn connect(cfg: &BridgeConfig) -> Result<Self, BridgeError> {
        let client = async_nats::connect(&cfg.url)
            .await
            .map_err(|source| BridgeError::Connect {
                url: cfg.url.clone(),
                source,
            })?;
        info!(url = %cfg.url, subject = %cfg.name, "bridge connected");

        Ok(Self {
            client,
            subject: cfg.name.clone(),
            direction: cfg.direction,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Publish a room message payload to the subject. Only meaningful for
    /// `output` bridges; failures are logged and do not affect the room.
    pub async fn publish(&self, payload: &str) {
        if self.direction != Direction::Output {
            return;
        }
        if let Err(e) = self
            .client
            .publish(self.subject.clone(), payload.as_bytes().to_vec().into())
            .await
        {
            warn!(subject = %self.subject, "bridge publish failed: {e}");
        }
    }

    /// For an `input` bridge, spawn the subscriber task feeding the room's
    /// queue. The task ends when the room queue closes or the bus drops.
    pub async fn spawn_input(
        &self,
        room: tokio::sync::mpsc::UnboundedSender<RoomInput>,
    ) -> Result<(), BridgeError> {
        if self.direction != Direction::Input {
            return Ok(());
        }

        let mut sub = self
            .client
            .subscribe(self.subject.clone())
            .await
            .map_err(|source| BridgeError::Subscribe {
                subject: self.subject.clone(),
                source,
            })?;

        let subject = self.subject.clone();
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let text = String::from_utf8_lossy(&msg.payload).into_owned();
                if room.send(RoomInput::Bus(text)).is_err() {
                    break;
                }
            }
            info!(%subject, "bridge input task stopped");
        });

        Ok(())
    }
}
