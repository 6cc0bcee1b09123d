//! The worker harness: receives tests, runs the target delivery hook and
//! reports status back to the broker.

use crate::checksum::crc32;
use crate::config::WorkerConfig;
use crate::protocol::{self, Message};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What the target delivery hook observed for one test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// `"success"`, `"crash"`, `"timeout"`, …; `"crash"` triggers the full
    /// result pipeline.
    pub status: String,
    /// Raw debugger output for crashes, empty otherwise.
    pub detail: String,
    /// Paths of files involved in reproducing the crash.
    pub chain: Vec<String>,
}

/// The user-supplied capability that actually exercises the victim.
pub trait Delivery: Send {
    fn deliver(&mut self, data: &[u8]) -> Result<DeliveryOutcome, anyhow::Error>;
}

impl<F> Delivery for F
where
    F: FnMut(&[u8]) -> Result<DeliveryOutcome, anyhow::Error> + Send,
{
    fn deliver(&mut self, data: &[u8]) -> Result<DeliveryOutcome, anyhow::Error> {
        self(data)
    }
}

/// Per-delivery logic, kept separate from the socket loop so it can be
/// exercised directly.
pub struct WorkerCore<D: Delivery> {
    delivery: D,
    host_id: Uuid,
}

impl<D: Delivery> WorkerCore<D> {
    pub fn new(delivery: D) -> Self {
        WorkerCore {
            delivery,
            host_id: Uuid::new_v4(),
        }
    }

    /// Handles one `deliver`, returning the ack to send, or `None` when the
    /// hook failed and the result must be silently dropped so the broker's
    /// timeout re-delivers instead of archiving a poisoned outcome.
    pub fn handle_deliver(
        &mut self,
        ack_id: u64,
        data: &[u8],
        expected_crc: u32,
        tag: &str,
    ) -> Option<Message> {
        let computed = crc32(data);
        if computed != expected_crc {
            warn!(
                ack_id,
                expected = format_args!("{expected_crc:#010x}"),
                computed = format_args!("{computed:#010x}"),
                "payload failed crc verification"
            );
            return Some(Message::ack_with(
                ack_id,
                vec![("status", Value::from("error"))],
            ));
        }

        let outcome = match catch_unwind(AssertUnwindSafe(|| self.delivery.deliver(data))) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                debug!(ack_id, %err, "delivery hook failed, dropping result");
                return None;
            }
            Err(_panic) => {
                debug!(ack_id, "delivery hook panicked, dropping result");
                return None;
            }
        };

        let mut tag = tag.to_string();
        if outcome.status == "crash" {
            tag.push_str(&format!(
                "\nhost={} md5_data={:x} md5_detail={:x} crc32={computed:08x} timestamp={}",
                self.host_id,
                md5::compute(data),
                md5::compute(outcome.detail.as_bytes()),
                Utc::now().to_rfc3339(),
            ));
        }

        let chain = Value::from(outcome.chain);
        Some(Message::ack_with(
            ack_id,
            vec![
                ("status", Value::from(outcome.status)),
                ("detail", Value::from(outcome.detail)),
                ("chain", chain),
                ("crc32", Value::from(computed)),
                ("tag", Value::from(tag)),
            ],
        ))
    }
}

/// Connects to the broker and serves deliveries until told to stop.
///
/// The loop announces `client_ready`, handles one test, and announces
/// again; lost connections are re-dialled after the poll interval (clients
/// reconnect, servers never do).
pub async fn run<D: Delivery>(config: WorkerConfig, delivery: D) -> Result<(), anyhow::Error> {
    let mut core = WorkerCore::new(delivery);
    let addr = format!("{}:{}", config.server_ip, config.server_port);
    let poll = Duration::from_millis(config.poll_interval_ms);

    loop {
        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%addr, %err, "broker unreachable, retrying");
                tokio::time::sleep(poll).await;
                continue;
            }
        };
        info!(%addr, queue = %config.queue_name, "connected to broker");
        let (read_half, write_half) = stream.into_split();
        let mut frames = FramedRead::new(read_half, LengthDelimitedCodec::new());
        let mut sink = FramedWrite::new(write_half, LengthDelimitedCodec::new());

        let ready = Message::ClientReady {
            queue: config.queue_name.clone(),
        };
        if send(&mut sink, &ready).await.is_err() {
            continue;
        }
        let mut heartbeat = tokio::time::interval(poll);
        heartbeat.tick().await;

        'connection: loop {
            tokio::select! {
                frame = frames.next() => {
                    let Some(Ok(bytes)) = frame else {
                        warn!("broker connection lost, reconnecting");
                        break 'connection;
                    };
                    let msg = match protocol::decode_message(&bytes) {
                        Ok(msg) => msg,
                        Err(err) => {
                            warn!(%err, "dropping malformed frame");
                            continue;
                        }
                    };
                    if let Message::Deliver { ack_id, data, crc32, tag, .. } = msg {
                        if let Some(ack) = core.handle_deliver(ack_id, &data, crc32, &tag) {
                            if send(&mut sink, &ack).await.is_err() {
                                break 'connection;
                            }
                        }
                        // Back to the idle loop for the next test.
                        if send(&mut sink, &ready).await.is_err() {
                            break 'connection;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if send(&mut sink, &ready).await.is_err() {
                        break 'connection;
                    }
                }
            }
        }
        tokio::time::sleep(poll).await;
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

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_hook(status: &'static str, detail: &'static str) -> impl Delivery {
        move |_data: &[u8]| {
            Ok(DeliveryOutcome {
                status: status.to_string(),
                detail: detail.to_string(),
                chain: vec!["/tmp/a.raw".to_string()],
            })
        }
    }

    #[test]
    fn crc_mismatch_acks_an_error_without_running_the_hook() {
        let mut ran = false;
        let hook = |_data: &[u8]| {
            ran = true;
            Ok(DeliveryOutcome {
                status: "success".to_string(),
                detail: String::new(),
                chain: Vec::new(),
            })
        };
        let mut core = WorkerCore::new(hook);
        let ack = core.handle_deliver(5, b"\x00\x01", 0x1234_5678, "t").unwrap();
        match ack {
            Message::AckMsg { ack_id, extras } => {
                assert_eq!(ack_id, 5);
                assert_eq!(extras["status"], "error");
            }
            other => panic!("expected an ack, got {other:?}"),
        }
        drop(core);
        assert!(!ran, "hook must not run on corrupt payloads");
    }

    #[test]
    fn success_ack_echoes_the_crc_and_tag() {
        let mut core = WorkerCore::new(ok_hook("success", ""));
        let data = b"\x00\x01";
        let ack = core
            .handle_deliver(9, data, crc32(data), "base-tag")
            .unwrap();
        match ack {
            Message::AckMsg { ack_id, extras } => {
                assert_eq!(ack_id, 9);
                assert_eq!(extras["status"], "success");
                assert_eq!(extras["crc32"], crc32(data));
                assert_eq!(extras["tag"], "base-tag");
            }
            other => panic!("expected an ack, got {other:?}"),
        }
    }

    #[test]
    fn crash_ack_augments_the_tag() {
        let mut core = WorkerCore::new(ok_hook("crash", "EXCEPTION_TYPE:X\n"));
        let data = b"abc";
        let ack = core
            .handle_deliver(2, data, crc32(data), "base-tag")
            .unwrap();
        match ack {
            Message::AckMsg { extras, .. } => {
                assert_eq!(extras["status"], "crash");
                assert_eq!(extras["detail"], "EXCEPTION_TYPE:X\n");
                let tag = extras["tag"].as_str().unwrap();
                assert!(tag.starts_with("base-tag"));
                assert!(tag.contains("host="));
                assert!(tag.contains(&format!("md5_data={:x}", md5::compute(data))));
                assert!(tag.contains("md5_detail="));
                assert!(tag.contains(&format!("crc32={:08x}", crc32(data))));
                assert!(tag.contains("timestamp="));
                assert_eq!(extras["chain"][0], "/tmp/a.raw");
            }
            other => panic!("expected an ack, got {other:?}"),
        }
    }

    #[test]
    fn hook_failure_and_panic_are_silently_dropped() {
        let failing = |_data: &[u8]| -> Result<DeliveryOutcome, anyhow::Error> {
            Err(anyhow::anyhow!("target never came back"))
        };
        let mut core = WorkerCore::new(failing);
        let data = b"xy";
        assert!(core.handle_deliver(1, data, crc32(data), "t").is_none());

        let panicking = |_data: &[u8]| -> Result<DeliveryOutcome, anyhow::Error> {
            panic!("poisoned test");
        };
        let mut core = WorkerCore::new(panicking);
        assert!(core.handle_deliver(2, data, crc32(data), "t").is_none());
    }
}
