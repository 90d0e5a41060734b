//! Publisher/Subscriber capabilities (spec §1 "out of scope", §6).
//!
//! The core only depends on these traits; a concrete MQTT-backed
//! implementation is wired in behind the `mqtt` feature, the way the
//! teacher wraps a single external endpoint behind a small typed client
//! (`AirlockClient`, `HeliumClient`).

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::envelope::DownlinkRequest;

/// `publish(topic, payload_bytes, qos) -> Result` (spec §6).
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8], qos: u8) -> anyhow::Result<()>;
}

/// Delivers downlink-request envelopes to be translated into
/// `ScheduledDownlink` entries (spec §6).
#[async_trait]
pub trait Subscriber: Send {
    async fn recv(&mut self) -> anyhow::Result<Option<DownlinkRequest>>;
}

/// In-memory publisher for tests: records every publish call.
#[derive(Default)]
pub struct RecordingPublisher {
    sent: tokio::sync::Mutex<Vec<(String, Vec<u8>, u8)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<(String, Vec<u8>, u8)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: &[u8], qos: u8) -> anyhow::Result<()> {
        self.sent.lock().await.push((topic.to_string(), payload.to_vec(), qos));
        Ok(())
    }
}

/// A `Subscriber` fed from a channel, used by the subscriber-drain task
/// when the inbound transport (MQTT) hands off decoded requests.
pub struct ChannelSubscriber {
    rx: tokio::sync::mpsc::Receiver<DownlinkRequest>,
}

impl ChannelSubscriber {
    pub fn new(rx: tokio::sync::mpsc::Receiver<DownlinkRequest>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl Subscriber for ChannelSubscriber {
    async fn recv(&mut self) -> anyhow::Result<Option<DownlinkRequest>> {
        Ok(self.rx.recv().await)
    }
}

/// A `Subscriber` that never yields anything, for deployments with no
/// platform-originated downlinks configured.
#[derive(Default)]
pub struct NullSubscriber;

#[async_trait]
impl Subscriber for NullSubscriber {
    async fn recv(&mut self) -> anyhow::Result<Option<DownlinkRequest>> {
        std::future::pending::<()>().await;
        Ok(None)
    }
}

#[cfg(feature = "mqtt")]
pub use mqtt::connect;

#[cfg(feature = "mqtt")]
mod mqtt {
    use super::*;
    use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
    use std::time::Duration;

    /// Cheaply-cloneable MQTT publish handle (`AsyncClient` wraps an
    /// internal channel sender), the way the teacher's `AirlockClient`/
    /// `HeliumClient` each wrap one external endpoint behind a typed client.
    #[derive(Clone)]
    pub struct MqttPublisher {
        client: AsyncClient,
    }

    #[async_trait]
    impl Publisher for MqttPublisher {
        async fn publish(&self, topic: &str, payload: &[u8], qos: u8) -> anyhow::Result<()> {
            let qos = match qos {
                0 => QoS::AtMostOnce,
                1 => QoS::AtLeastOnce,
                _ => QoS::ExactlyOnce,
            };
            self.client.publish(topic, qos, false, payload).await?;
            debug!("published {} bytes to {}", payload.len(), topic);
            Ok(())
        }
    }

    /// Connect to a single broker, subscribe to `subscribe_topic`, and
    /// return a publish handle plus a channel-backed `Subscriber` fed by a
    /// background task draining the MQTT event loop.
    pub async fn connect(
        client_id: &str,
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        subscribe_topic: &str,
    ) -> anyhow::Result<(MqttPublisher, ChannelSubscriber)> {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(u), Some(p)) = (username, password) {
            options.set_credentials(u, p);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        client.subscribe(subscribe_topic, QoS::AtMostOnce).await?;
        info!("MQTT connected to {}:{} (subscribed {})", host, port, subscribe_topic);

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match serde_json::from_slice::<DownlinkRequest>(&publish.payload) {
                            Ok(req) => {
                                if tx.send(req).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                error!("failed to parse downlink request: {e}");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT event loop error: {e}");
                    }
                }
            }
        });

        Ok((MqttPublisher { client }, ChannelSubscriber::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_publisher_records_calls() {
        let publisher = RecordingPublisher::new();
        publisher.publish("topic", b"payload", 0).await.unwrap();
        let sent = publisher.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "topic");
        assert_eq!(sent[0].1, b"payload");
    }

    #[tokio::test]
    async fn channel_subscriber_yields_sent_requests() {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let mut sub = ChannelSubscriber::new(rx);
        let req = DownlinkRequest {
            dev_addr: "26011BDA".into(),
            counter_down: 1,
            port: 5,
            payload: "AA==".into(),
            confirmed: false,
            queue_if_late: false,
        };
        tx.send(req).await.unwrap();
        let received = sub.recv().await.unwrap().unwrap();
        assert_eq!(received.dev_addr, "26011BDA");
    }
}
