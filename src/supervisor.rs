//! Supervisor (spec §4.H): owns sockets, the directory cache, the
//! publisher/subscriber, the downlink queue, and the per-device uplink
//! context map. Spawns the uplink, downlink, and subscriber-drain tasks
//! and joins them.
//!
//! Grounded on the teacher's `main`/`udp::run_server` construct-then-spawn
//! pattern.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::directory::{DeviceDirectory, DirectoryCache, StaticDeviceDirectory};
use crate::downlink::{self, DownlinkQueue, ScheduledDownlink};
use crate::envelope;
use crate::publisher::{NullSubscriber, Publisher, Subscriber};
use crate::uplink::{self, SharedUplinkContexts};

pub struct Supervisor {
    config: Config,
    directory: Arc<DirectoryCache>,
    publisher: Arc<dyn Publisher>,
    subscriber: Box<dyn Subscriber>,
    queue: DownlinkQueue,
    contexts: SharedUplinkContexts,
}

impl Supervisor {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let directory_backend: Arc<dyn DeviceDirectory> = build_directory(&config)?;
        let directory = Arc::new(DirectoryCache::new(directory_backend));

        let (publisher, subscriber) = build_transport(&config).await?;

        Ok(Self {
            config,
            directory,
            publisher,
            subscriber,
            queue: Arc::new(tokio::sync::Mutex::new(std::collections::VecDeque::new())),
            contexts: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let Supervisor {
            config,
            directory,
            publisher,
            mut subscriber,
            queue,
            contexts,
        } = self;

        let uplink_bind = config.udp.uplink_bind.clone();
        let publish_topic = config.publisher.topic.clone();
        let uplink_directory = directory.clone();
        let uplink_publisher = publisher.clone();
        let uplink_contexts = contexts.clone();
        let lorawan_options = uplink::LorawanOptions {
            decrypt_payload: config.lorawan.decrypt_payload,
            verify_mic: config.lorawan.verify_mic,
        };
        let uplink_task = tokio::spawn(async move {
            uplink::run(
                &uplink_bind,
                uplink_directory,
                uplink_publisher,
                publish_topic,
                uplink_contexts,
                lorawan_options,
            )
            .await
        });

        let downlink_bind = config.udp.downlink_bind.clone();
        let downlink_queue = queue.clone();
        let downlink_directory = directory.clone();
        let downlink_publisher = publisher.clone();
        let downlink_topic = config.publisher.topic.clone();
        let downlink_task = tokio::spawn(async move {
            downlink::run(&downlink_bind, downlink_queue, downlink_directory, downlink_publisher, downlink_topic).await
        });

        let directory_for_drain = directory.clone();
        let drain_topic = config.publisher.topic.clone();
        let drain_task = tokio::spawn(async move {
            loop {
                match subscriber.recv().await {
                    Ok(Some(request)) => {
                        translate_request(&request, &directory_for_drain, &publisher, &contexts, &queue, &drain_topic).await;
                    }
                    Ok(None) => {
                        warn!("subscriber closed, downlink-request drain stopping");
                        return;
                    }
                    Err(e) => {
                        error!("subscriber error: {e:#}");
                    }
                }
            }
        });

        tokio::select! {
            res = uplink_task => res??,
            res = downlink_task => res??,
            res = drain_task => res?,
        }

        Ok(())
    }
}

/// Translate an inbound `DownlinkRequest` into a `ScheduledDownlink` keyed
/// off the device's most recent uplink context (spec §4.G, §6; resolves
/// spec §9's downlink-construction open question). Failures are reported
/// back as an `error` envelope rather than silently dropped, mirroring
/// `ParamsError`'s role in the platform's tagged union
/// (original_source/lkt_lns/messages.py).
async fn translate_request(
    request: &envelope::DownlinkRequest,
    directory: &DirectoryCache,
    publisher: &Arc<dyn Publisher>,
    contexts: &SharedUplinkContexts,
    queue: &DownlinkQueue,
    topic: &str,
) {
    let Some(device) = directory.lookup_or_fetch(&request.dev_addr).await else {
        warn!("downlink request for unknown device {}", request.dev_addr);
        publish_error(publisher, topic, &request.dev_addr, "unknown device").await;
        return;
    };

    let Some(ctx) = contexts.read().await.get(&request.dev_addr).cloned() else {
        warn!("no uplink context for {}, dropping downlink request", request.dev_addr);
        publish_error(publisher, topic, &request.dev_addr, "no prior uplink context").await;
        return;
    };

    let Ok(plaintext) = crate::codec::radio::base64_decode(&request.payload) else {
        warn!("invalid base64 payload in downlink request for {}", request.dev_addr);
        publish_error(publisher, topic, &request.dev_addr, "invalid base64 payload").await;
        return;
    };

    let dev_addr: u32 = match u32::from_str_radix(&request.dev_addr, 16) {
        Ok(v) => v,
        Err(_) => {
            warn!("malformed DevAddr {} in downlink request", request.dev_addr);
            publish_error(publisher, topic, &request.dev_addr, "malformed DevAddr").await;
            return;
        }
    };

    let Some(txpk) = envelope::build_rx1_txpk_from_context(
        &ctx,
        dev_addr,
        &device.nwk_skey,
        &device.app_skey,
        &plaintext,
        request.counter_down,
        request.port,
        request.confirmed,
    ) else {
        warn!("uplink frequency {} off-plan, dropping downlink for {}", ctx.freq, request.dev_addr);
        publish_error(publisher, topic, &request.dev_addr, "uplink frequency off-plan").await;
        return;
    };

    let deadline_ms = txpk.tmst.unwrap_or(0) as i64;
    queue.lock().await.push_back(ScheduledDownlink {
        txpk,
        deadline_ms,
        dev_addr_hex: request.dev_addr.clone(),
        port: request.port,
        counter_down: request.counter_down,
        plaintext_b64: crate::codec::radio::base64_encode(&plaintext),
    });

    // The platform's downlink-request payload carries no packet_hash of its
    // own to echo (spec §6 inbound shape is flat, unwrapped by a meta).
    let response = envelope::build_downlink_response(&device, &ctx.gateway_id_hex, request, "");
    if let Ok(payload) = serde_json::to_vec(&response) {
        if let Err(e) = publisher.publish(topic, &payload, 0).await {
            error!("publish of downlink_response failed: {e:#}");
        }
    }

    info!("scheduled downlink for {}", request.dev_addr);
}

async fn publish_error(publisher: &Arc<dyn Publisher>, topic: &str, device_addr: &str, message: &str) {
    let envelope = envelope::build_error(device_addr, message);
    if let Ok(payload) = serde_json::to_vec(&envelope) {
        if let Err(e) = publisher.publish(topic, &payload, 0).await {
            error!("publish of error envelope failed: {e:#}");
        }
    }
}

fn build_directory(config: &Config) -> anyhow::Result<Arc<dyn DeviceDirectory>> {
    match &config.directory {
        Some(directory_config) => {
            #[cfg(feature = "http-directory")]
            {
                let backend = crate::directory::HttpDeviceDirectory::new(
                    directory_config.url.clone(),
                    directory_config.token.clone(),
                )?;
                Ok(Arc::new(backend))
            }
            #[cfg(not(feature = "http-directory"))]
            {
                let _ = directory_config;
                anyhow::bail!("directory configured but the http-directory feature is disabled");
            }
        }
        None => {
            info!("no directory configured, starting with an empty static directory");
            Ok(Arc::new(StaticDeviceDirectory::new(HashMap::new())))
        }
    }
}

async fn build_transport(config: &Config) -> anyhow::Result<(Arc<dyn Publisher>, Box<dyn Subscriber>)> {
    #[cfg(feature = "mqtt")]
    if let Some(mqtt_config) = &config.mqtt {
        let (publisher, subscriber) = crate::publisher::connect(
            "lora-bridge",
            &mqtt_config.host,
            mqtt_config.port,
            mqtt_config.username.as_deref(),
            mqtt_config.password.as_deref(),
            &config.subscriber.topic,
        )
        .await?;
        return Ok((Arc::new(publisher), Box::new(subscriber)));
    }

    let _ = config;
    warn!("no publisher/subscriber transport configured, running with a no-op subscriber");
    Ok((
        Arc::new(crate::publisher::RecordingPublisher::new()),
        Box::new(NullSubscriber),
    ))
}
