//! # subscriber
//!
//! One MQTT subscription per configured region, each in its own task, all
//! feeding the shared decode channel. The mesh is lossy by design, so
//! everything is QoS 0 with clean sessions — a packet missed during a
//! reconnect is gone, and that is fine.
//!
//! Connection errors never crash the task: reconnect with exponential
//! backoff (1 s base, 60 s cap, jittered), reset once the broker answers.

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::RegionConfig;
use crate::pipeline::{now_unix, RawEnvelope};

pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Exponential backoff with jitter. Jitter keeps a fleet of subscribers from
/// stampeding a recovering broker in lockstep.
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Next delay: `base * 2^attempt` capped, then jittered to 50–100%.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        let capped = exp.min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        capped.mul_f64(0.5 + rand::random::<f64>() * 0.5)
    }
}

/// Run one region's subscription until shutdown. Decoded work goes into
/// `raw_tx`; if that channel fills, this task blocks on send and the broker
/// connection absorbs the backpressure.
pub async fn run_subscriber(
    config: RegionConfig,
    raw_tx: mpsc::Sender<RawEnvelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    let client_id = format!("wesense-ingester-{}", config.region.to_lowercase());
    let mut options = MqttOptions::new(client_id, config.broker.as_str(), config.port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(true);
    if let Some(username) = &config.username {
        options.set_credentials(username.as_str(), config.password.clone().unwrap_or_default());
    }

    let (client, mut eventloop) = AsyncClient::new(options, 64);
    let mut backoff = Backoff::new(BACKOFF_BASE, BACKOFF_CAP);
    let mut received: u64 = 0;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = client.disconnect().await;
                    break;
                }
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    backoff.reset();
                    info!(region = %config.region, broker = %config.broker, "connected");
                    if let Err(e) = client.subscribe(config.topic.as_str(), QoS::AtMostOnce).await {
                        error!(region = %config.region, "subscribe to {} failed: {e}", config.topic);
                    } else {
                        info!(region = %config.region, topic = %config.topic, "subscribed");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    received += 1;
                    let envelope = RawEnvelope {
                        region: config.region.clone(),
                        topic: publish.topic.clone(),
                        payload: publish.payload,
                        received_at: now_unix(),
                    };
                    if raw_tx.send(envelope).await.is_err() {
                        // Decode stage gone; nothing left to feed
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        region = %config.region,
                        "mqtt error: {e} — reconnecting in {:.1}s",
                        delay.as_secs_f64()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    info!(region = %config.region, received, "subscriber stopped");
}

/// Spawn every enabled region. Disabled regions are logged and skipped so a
/// config with a region parked `"enabled": false` is visible at startup.
pub fn spawn_fleet(
    regions: &[RegionConfig],
    raw_tx: &mpsc::Sender<RawEnvelope>,
    shutdown: &watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();
    for region in regions {
        if !region.enabled {
            debug!(region = %region.region, "region disabled, skipping");
            continue;
        }
        handles.push(tokio::spawn(run_subscriber(
            region.clone(),
            raw_tx.clone(),
            shutdown.clone(),
        )));
    }
    handles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let mut previous_cap = Duration::ZERO;
        for i in 0..10u64 {
            let delay = backoff.next_delay();
            // Jitter keeps every delay within 50–100% of the un-jittered value
            let nominal = Duration::from_secs(1 << i.min(6)).min(Duration::from_secs(60));
            assert!(delay <= nominal, "attempt {i}: {delay:?} > {nominal:?}");
            assert!(
                delay >= nominal.mul_f64(0.5),
                "attempt {i}: {delay:?} < half of {nominal:?}"
            );
            previous_cap = previous_cap.max(delay);
        }
        assert!(previous_cap <= Duration::from_secs(60));
    }

    #[test]
    fn backoff_reset_restarts_from_base() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..6 {
            backoff.next_delay();
        }
        backoff.reset();
        let delay = backoff.next_delay();
        assert!(delay <= Duration::from_secs(1));
        assert!(delay >= Duration::from_millis(500));
    }
}
