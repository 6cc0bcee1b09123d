//! The producer harness: drains a production generator into broker-bound
//! test cases, one in flight at a time.

use crate::checksum::crc32;
use crate::config::ProducerConfig;
use crate::generator::Generator;
use crate::protocol::{self, Message};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

/// Running totals reported by the status line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerCounters {
    pub sent: u64,
    pub delivered: u64,
    pub stored: u64,
    pub crashes: u64,
}

/// Protocol logic for one producer, free of sockets.
///
/// The core pipelines one test at a time: a fresh test goes out when the
/// previous one's delivery receipt arrives, and the run is finished when
/// the generator is exhausted and the last result ack has landed.
pub struct ProducerCore<G: Generator<Item = Vec<u8>>> {
    config: ProducerConfig,
    generator: G,
    counters: ProducerCounters,
    started: bool,
    next_id: u64,
    in_flight: Option<Message>,
    awaiting_results: u64,
    options: Value,
}

impl<G: Generator<Item = Vec<u8>>> ProducerCore<G> {
    pub fn new(config: ProducerConfig, generator: G) -> Self {
        let options = serde_json::to_value(&config.fuzzbot_options).unwrap_or(Value::Null);
        ProducerCore {
            config,
            generator,
            counters: ProducerCounters::default(),
            started: false,
            next_id: 1,
            in_flight: None,
            awaiting_results: 0,
            options,
        }
    }

    pub fn counters(&self) -> ProducerCounters {
        self.counters
    }

    /// The generator is drained and every submitted test has its result.
    pub fn finished(&self) -> bool {
        self.started
            && !self.generator.has_next()
            && self.in_flight.is_none()
            && self.awaiting_results == 0
    }

    /// The announcement sent on connect and on broker `reset`.
    pub fn startup(&self) -> Message {
        Message::ClientStartup {
            client_type: "producer".to_string(),
        }
    }

    /// The message to repeat when the poll timer fires with no ack.
    pub fn pending_retry(&self) -> Option<Message> {
        if !self.started {
            return Some(self.startup());
        }
        self.in_flight.clone()
    }

    /// Builds the next test case, if the generator has one.
    fn next_test(&mut self) -> Option<Message> {
        if !self.generator.has_next() {
            return None;
        }
        let data = self.generator.next_value().ok()?;
        let checksum = crc32(&data);
        let id = self.next_id;
        self.next_id += 1;
        let tag = format!(
            "{} producer_crc={checksum:08x} timestamp={} iteration={id}",
            self.config.base_tag,
            Utc::now().to_rfc3339(),
        );
        let msg = Message::NewTestCase {
            id,
            data,
            crc32: checksum,
            queue: self.config.queue_name.clone(),
            tag,
            options: self.options.clone(),
        };
        self.counters.sent += 1;
        self.in_flight = Some(msg.clone());
        self.awaiting_results += 1;
        Some(msg)
    }

    /// Reacts to one broker message, returning whatever should be sent.
    pub fn handle_message(&mut self, msg: Message) -> Vec<Message> {
        let mut out = Vec::new();
        match msg {
            Message::AckMsg { ack_id, extras } => {
                if extras.get("startup_ack").and_then(Value::as_bool) == Some(true) {
                    if !self.started {
                        debug!("startup acknowledged");
                        self.started = true;
                        if let Some(test) = self.next_test() {
                            out.push(test);
                        }
                    }
                    return out;
                }

                if let Some(result) = extras.get("result") {
                    // Second ack: the result-store outcome.
                    self.awaiting_results = self.awaiting_results.saturating_sub(1);
                    self.counters.stored += 1;
                    if result.as_str() == Some("crash") {
                        self.counters.crashes += 1;
                        info!(
                            ack_id,
                            db_id = ?extras.get("db_id"),
                            "crash archived"
                        );
                    }
                    return out;
                }

                // First ack: delivery receipt for the in-flight test.
                let matches_in_flight = matches!(
                    &self.in_flight,
                    Some(Message::NewTestCase { id, .. }) if *id == ack_id
                );
                if matches_in_flight {
                    self.counters.delivered += 1;
                    self.in_flight = None;
                    if let Some(test) = self.next_test() {
                        out.push(test);
                    }
                } else {
                    debug!(ack_id, "receipt for an unknown test ignored");
                }
            }
            Message::Reset => {
                info!("broker requested reset, re-announcing");
                self.started = false;
                out.push(self.startup());
            }
            other => {
                warn!(?other, "unexpected message direction");
            }
        }
        out
    }
}

/// Connects to the broker and runs the production loop to exhaustion.
pub async fn run<G: Generator<Item = Vec<u8>>>(
    config: ProducerConfig,
    generator: G,
) -> Result<ProducerCounters, anyhow::Error> {
    let addr = format!("{}:{}", config.server_ip, config.server_port);
    let poll = Duration::from_millis(config.poll_interval_ms);
    let mut core = ProducerCore::new(config, generator);

    'reconnect: loop {
        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%addr, %err, "broker unreachable, retrying");
                tokio::time::sleep(poll).await;
                continue;
            }
        };
        info!(%addr, "connected to broker");
        let (read_half, write_half) = stream.into_split();
        let mut frames = FramedRead::new(read_half, LengthDelimitedCodec::new());
        let mut sink = FramedWrite::new(write_half, LengthDelimitedCodec::new());

        if send(&mut sink, &core.startup()).await.is_err() {
            continue;
        }
        let mut retry = tokio::time::interval(poll);
        retry.tick().await;

        loop {
            if core.finished() {
                info!(counters = ?core.counters(), "generator exhausted, stopping");
                return Ok(core.counters());
            }
            tokio::select! {
                frame = frames.next() => {
                    let Some(Ok(bytes)) = frame else {
                        warn!("broker connection lost, reconnecting");
                        tokio::time::sleep(poll).await;
                        continue 'reconnect;
                    };
                    let msg = match protocol::decode_message(&bytes) {
                        Ok(msg) => msg,
                        Err(err) => {
                            warn!(%err, "dropping malformed frame");
                            continue;
                        }
                    };
                    for reply in core.handle_message(msg) {
                        if send(&mut sink, &reply).await.is_err() {
                            continue 'reconnect;
                        }
                    }
                }
                _ = retry.tick() => {
                    if let Some(msg) = core.pending_retry() {
                        debug!("poll timer fired, repeating unanswered message");
                        if send(&mut sink, &msg).await.is_err() {
                            continue 'reconnect;
                        }
                    }
                }
            }
        }
    }
}

async fn send(
    sink: &mut FramedWrite<tokio::net::tcp::OwnedWriteHalf, LengthDelimitedCodec>,
    msg: &Message,
) -> Result<(), anyhow::Error> {
    let bytes = protocol::encode_message(msg)?;
    sink.send(bytes).await?;
    Ok(())
}
