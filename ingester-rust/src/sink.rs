//! # sink
//!
//! Buffered writes to the columnar store, with a parallel best-effort MQTT
//! republish. Rows accumulate until BATCH_SIZE or FLUSH_INTERVAL, whichever
//! comes first. A failed flush retries with capped backoff; once retries are
//! exhausted the batch is dropped and counted — the store accepts duplicates
//! and dedupes downstream, so losing a batch is recoverable but blocking the
//! pipeline is not.
//!
//! Republish uses QoS 0 and `try_publish`: a slow output broker can never
//! hold up the columnar write.

use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{ColumnarConfig, OutputMqttConfig};
use crate::metrics::Metrics;
use crate::model::EnrichedRecord;

pub const FLUSH_MAX_ATTEMPTS: u32 = 5;
pub const FLUSH_BACKOFF_CAP: Duration = Duration::from_secs(60);

struct Republisher {
    client: AsyncClient,
}

impl Republisher {
    fn start(config: &OutputMqttConfig) -> Self {
        let mut options = MqttOptions::new("wesense-ingester-out", config.host.as_str(), config.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        if let Some(username) = &config.username {
            options.set_credentials(username.as_str(), config.password.clone().unwrap_or_default());
        }
        let (client, mut eventloop) = AsyncClient::new(options, 64);
        // The eventloop must be polled for publishes to go out; errors just
        // pause it briefly, reconnection is rumqttc's problem
        tokio::spawn(async move {
            loop {
                if let Err(e) = eventloop.poll().await {
                    debug!("republish mqtt error: {e}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        });
        Self { client }
    }
}

pub struct Sink {
    columnar: ColumnarConfig,
    client: reqwest::Client,
    republisher: Option<Republisher>,
    ingestion_node_id: String,
    metrics: Arc<Metrics>,
}

impl Sink {
    pub fn new(
        columnar: ColumnarConfig,
        output_mqtt: Option<&OutputMqttConfig>,
        ingestion_node_id: String,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            columnar,
            client: reqwest::Client::new(),
            republisher: output_mqtt.map(Republisher::start),
            ingestion_node_id,
            metrics,
        }
    }

    /// Sink worker loop: single consumer of the correlator's output. Exits
    /// after a final flush once the correlator closes the channel.
    pub async fn run(self, mut record_rx: mpsc::Receiver<EnrichedRecord>) {
        let mut buffer: Vec<EnrichedRecord> = Vec::with_capacity(self.columnar.batch_size);
        let mut ticker = tokio::time::interval(self.columnar.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // the immediate tick, not a flush

        loop {
            tokio::select! {
                maybe = record_rx.recv() => match maybe {
                    Some(record) => {
                        self.republish(&record);
                        buffer.push(record);
                        if buffer.len() >= self.columnar.batch_size {
                            self.flush(&mut buffer).await;
                            ticker.reset();
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&mut buffer).await;
                    }
                }
            }
        }

        if !buffer.is_empty() {
            self.flush(&mut buffer).await;
        }
        info!("sink stopped");
    }

    /// One attempt per backoff step; the batch is dropped once attempts are
    /// exhausted so the buffer cannot grow without bound behind a dead store.
    async fn flush(&self, buffer: &mut Vec<EnrichedRecord>) {
        let rows = buffer.len();
        let body = build_body(buffer, &self.ingestion_node_id);

        for attempt in 1..=FLUSH_MAX_ATTEMPTS {
            match self.insert(body.clone()).await {
                Ok(()) => {
                    Metrics::add(&self.metrics.rows_written, rows as u64);
                    Metrics::incr(&self.metrics.batches_flushed);
                    info!(rows, "batch flushed");
                    buffer.clear();
                    return;
                }
                Err(e) => {
                    let delay = retry_delay(attempt);
                    warn!(
                        attempt,
                        rows,
                        "columnar insert failed: {e:#} — retrying in {:.1}s",
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Metrics::incr(&self.metrics.batches_dropped);
        warn!(rows, "dropping batch after {FLUSH_MAX_ATTEMPTS} failed attempts");
        buffer.clear();
    }

    async fn insert(&self, body: String) -> anyhow::Result<()> {
        let mut request = self.client.post(self.columnar.insert_url()).body(body);
        if let Some(username) = &self.columnar.username {
            request = request.basic_auth(username, self.columnar.password.as_deref());
        }
        request.send().await?.error_for_status()?;
        Ok(())
    }

    /// Fire-and-forget: QoS 0, non-blocking, failures counted and dropped.
    fn republish(&self, record: &EnrichedRecord) {
        let Some(republisher) = &self.republisher else {
            return;
        };
        let topic = record.republish_topic();
        let payload = record.republish_payload().to_string();
        match republisher
            .client
            .try_publish(topic.as_str(), QoS::AtMostOnce, false, payload)
        {
            Ok(()) => Metrics::incr(&self.metrics.republished),
            Err(e) => {
                Metrics::incr(&self.metrics.republish_failed);
                debug!(topic = %topic, "republish failed: {e}");
            }
        }
    }
}

/// JSON-lines body for the wide-table insert.
fn build_body(records: &[EnrichedRecord], ingestion_node_id: &str) -> String {
    let mut body = String::new();
    for record in records {
        body.push_str(&record.columnar_row(ingestion_node_id).to_string());
        body.push('\n');
    }
    body
}

/// Exponential backoff for flush retries: 1 s, 2 s, 4 s, … capped at 60 s,
/// jittered to 50–100%.
fn retry_delay(attempt: u32) -> Duration {
    let exp = Duration::from_secs(1).saturating_mul(1u32 << (attempt - 1).min(16));
    let capped = exp.min(FLUSH_BACKOFF_CAP);
    capped.mul_f64(0.5 + rand::thread_rng().gen::<f64>() * 0.5)
}
