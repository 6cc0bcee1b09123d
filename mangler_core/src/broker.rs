//! The broker: authoritative matcher between producers, workers and the
//! result store.
//!
//! All state lives in [`BrokerCore`], a single-owner state machine driven
//! by one event loop; the async shell in [`serve`] only moves frames
//! between sockets and the core. Handlers never block and never lock.

use crate::config::BrokerConfig;
use crate::protocol::{self, Message};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write as _;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

/// Connection identity assigned by the accept loop.
pub type ConnId = u64;

#[derive(Error, Debug)]
pub enum BrokerError {
    /// A worker echoed a CRC that does not match the stored test. The
    /// broker handed out a corrupted payload; stop and dump diagnostics.
    #[error("crc mismatch on ack {ack_id}: stored {stored:#010x}, reported {reported:#010x}")]
    CrcMismatch {
        ack_id: u64,
        stored: u32,
        reported: u32,
    },

    #[error("broker I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything the broker must remember about an accepted test until both
/// acks have fired.
#[derive(Debug, Clone)]
struct PendingTest {
    producer: ConnId,
    producer_ack_id: u64,
    data: Vec<u8>,
    crc32: u32,
    queue: String,
    tag: String,
    options: Value,
}

/// An outbound message awaiting its ack.
#[derive(Debug)]
struct Unanswered {
    peer: ConnId,
    msg: Message,
    /// `Some` re-enqueues onto that queue on timeout; `None` resends to the
    /// same peer.
    queue: Option<String>,
    test: Option<PendingTest>,
    server_id: Option<u64>,
    deadline: Instant,
}

/// Result bookkeeping between the worker ack and the store ack.
#[derive(Debug, Clone)]
struct DelayedResult {
    producer: ConnId,
    producer_ack_id: u64,
    crc32: u32,
    tag: String,
    is_crash: bool,
    crashdetail: String,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PendingTest>,
    ready: VecDeque<ConnId>,
}

/// Events fed to the core by the transport shell.
#[derive(Debug)]
pub enum BrokerEvent {
    Connected(ConnId),
    Message(ConnId, Message),
    Disconnected(ConnId),
    Tick,
}

pub struct BrokerCore {
    config: BrokerConfig,
    queues: HashMap<String, QueueState>,
    db_pending: VecDeque<Message>,
    db_ready: VecDeque<ConnId>,
    worker_ready: HashSet<ConnId>,
    db_worker_ready: HashSet<ConnId>,
    unanswered: HashMap<u64, Unanswered>,
    delayed: HashMap<u64, DelayedResult>,
    shedding: bool,
    next_ack_id: u64,
    next_server_id: u64,
    poll_interval: Duration,
    outbox: Vec<(ConnId, Message)>,
}

impl BrokerCore {
    pub fn new(config: BrokerConfig) -> Self {
        let shedding = config.queue_shedding;
        let poll_interval = Duration::from_millis(config.poll_interval_ms);
        BrokerCore {
            config,
            queues: HashMap::new(),
            db_pending: VecDeque::new(),
            db_ready: VecDeque::new(),
            worker_ready: HashSet::new(),
            db_worker_ready: HashSet::new(),
            unanswered: HashMap::new(),
            delayed: HashMap::new(),
            shedding,
            next_ack_id: 1,
            next_server_id: 1,
            poll_interval,
            outbox: Vec::new(),
        }
    }

    pub fn is_shedding(&self) -> bool {
        self.shedding
    }

    /// Queue depths for the status line: `(pending tests, ready workers)`.
    pub fn queue_depth(&self, queue: &str) -> (usize, usize) {
        self.queues
            .get(queue)
            .map(|q| (q.pending.len(), q.ready.len()))
            .unwrap_or((0, 0))
    }

    /// Feeds one event through the state machine, returning the messages to
    /// transmit. CRC mismatches surface as errors; the component stops.
    pub fn handle_event(
        &mut self,
        event: BrokerEvent,
        now: Instant,
    ) -> Result<Vec<(ConnId, Message)>, BrokerError> {
        match event {
            BrokerEvent::Connected(conn) => {
                debug!(conn, "peer connected");
            }
            BrokerEvent::Disconnected(conn) => self.on_disconnect(conn),
            BrokerEvent::Tick => self.on_tick(now),
            BrokerEvent::Message(conn, msg) => self.on_message(conn, msg, now)?,
        }
        Ok(std::mem::take(&mut self.outbox))
    }

    fn on_message(
        &mut self,
        conn: ConnId,
        msg: Message,
        now: Instant,
    ) -> Result<(), BrokerError> {
        match msg {
            Message::ClientStartup { client_type } => {
                debug!(conn, %client_type, "client startup");
                self.outbox.push((
                    conn,
                    Message::ack_with(0, vec![("startup_ack", Value::from(true))]),
                ));
            }
            Message::ClientReady { queue } => {
                if self.worker_ready.insert(conn) {
                    self.queues.entry(queue.clone()).or_default().ready.push_back(conn);
                }
                self.match_queue(&queue, now);
            }
            Message::DbReady => {
                if self.db_worker_ready.insert(conn) {
                    self.db_ready.push_back(conn);
                }
                self.flush_db(now);
            }
            Message::NewTestCase {
                id,
                data,
                crc32,
                queue,
                tag,
                options,
            } => {
                let state = self.queues.entry(queue.clone()).or_default();
                let duplicate = state
                    .pending
                    .iter()
                    .any(|t| t.producer == conn && t.producer_ack_id == id);
                if duplicate {
                    debug!(conn, id, "duplicate test dropped");
                    return Ok(());
                }
                state.pending.push_back(PendingTest {
                    producer: conn,
                    producer_ack_id: id,
                    data,
                    crc32,
                    queue: queue.clone(),
                    tag,
                    options,
                });
                self.match_queue(&queue, now);
            }
            Message::AckMsg { ack_id, extras } => {
                self.on_ack(conn, ack_id, extras, now)?;
            }
            other => {
                // Wrong-direction traffic; fatal to this message only.
                warn!(conn, ?other, "unexpected message direction");
            }
        }
        Ok(())
    }

    fn on_ack(
        &mut self,
        conn: ConnId,
        ack_id: u64,
        extras: std::collections::BTreeMap<String, Value>,
        now: Instant,
    ) -> Result<(), BrokerError> {
        let Some(entry) = self.unanswered.remove(&ack_id) else {
            debug!(conn, ack_id, "stale or duplicate ack ignored");
            return Ok(());
        };

        if entry.queue.is_some() {
            // A worker accepted (or rejected) a delivery.
            let test = entry.test.expect("deliver entries carry their test");
            let server_id = entry.server_id.expect("deliver entries carry a server id");
            let status = extras
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            if status != "error" {
                if let Some(reported) = extras.get("crc32").and_then(Value::as_u64) {
                    if reported as u32 != test.crc32 {
                        return Err(BrokerError::CrcMismatch {
                            ack_id,
                            stored: test.crc32,
                            reported: reported as u32,
                        });
                    }
                }
            }

            match status.as_str() {
                "error" => {
                    // Worker-side verification failed; the producer's own
                    // retry timer covers re-submission.
                    debug!(ack_id, "errored delivery dropped");
                }
                status_str => {
                    // Delivery receipt: the first of the two producer acks.
                    self.outbox
                        .push((test.producer, Message::ack(test.producer_ack_id)));

                    let is_crash = status_str == "crash";
                    let detail = extras
                        .get("detail")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let tag = extras
                        .get("tag")
                        .and_then(Value::as_str)
                        .unwrap_or(&test.tag)
                        .to_string();
                    let template_hash = extras
                        .get("template_hash")
                        .and_then(Value::as_str)
                        .map(str::to_string);

                    if self.config.dummy {
                        self.outbox.push((
                            test.producer,
                            Message::ack_with(
                                test.producer_ack_id,
                                vec![
                                    ("result", Value::from(status_str)),
                                    ("db_id", Value::from(0)),
                                ],
                            ),
                        ));
                        return Ok(());
                    }

                    self.delayed.insert(
                        server_id,
                        DelayedResult {
                            producer: test.producer,
                            producer_ack_id: test.producer_ack_id,
                            crc32: test.crc32,
                            tag: tag.clone(),
                            is_crash,
                            crashdetail: detail.clone(),
                        },
                    );
                    let result = Message::TestResult {
                        ack_id: 0,
                        server_id,
                        status: status_str.to_string(),
                        data: test.data.clone(),
                        detail,
                        queue: test.queue.clone(),
                        tag,
                        crc32: test.crc32,
                        template_hash,
                    };
                    self.push_db(result, now);
                }
            }
        } else if let Some(server_id) = entry.server_id {
            // The result store acknowledged persistence: second producer ack.
            let Some(delayed) = self.delayed.remove(&server_id) else {
                warn!(server_id, "store ack without delayed result");
                return Ok(());
            };
            let result = extras
                .get("result")
                .cloned()
                .unwrap_or_else(|| Value::from(""));
            let db_id = extras.get("db_id").cloned().unwrap_or(Value::Null);
            let mut ack_extras = vec![("result", result), ("db_id", db_id)];
            if delayed.is_crash {
                ack_extras.push(("crashdetail", Value::from(delayed.crashdetail.clone())));
                ack_extras.push(("crc32", Value::from(delayed.crc32)));
                ack_extras.push(("tag", Value::from(delayed.tag.clone())));
            }
            self.outbox.push((
                delayed.producer,
                Message::ack_with(delayed.producer_ack_id, ack_extras),
            ));

            if self.shedding && self.db_pending.is_empty() {
                self.clear_shedding(now);
            }
        } else {
            debug!(conn, ack_id, "ack for untracked message");
        }
        Ok(())
    }

    fn on_tick(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .unanswered
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for ack_id in expired {
            let Some(entry) = self.unanswered.remove(&ack_id) else {
                continue;
            };
            match entry.queue {
                Some(queue) => {
                    // Queue semantics: hand the test to the next worker.
                    debug!(ack_id, %queue, "delivery timed out, re-enqueueing");
                    if let Some(test) = entry.test {
                        self.queues.entry(queue.clone()).or_default().pending.push_back(test);
                    }
                    if let Some(server_id) = entry.server_id {
                        self.delayed.remove(&server_id);
                    }
                    self.match_queue(&queue, now);
                }
                None => {
                    // Peer semantics: same message, same ack id, new timer.
                    debug!(ack_id, peer = entry.peer, "resending unanswered message");
                    self.outbox.push((entry.peer, entry.msg.clone()));
                    self.unanswered.insert(
                        ack_id,
                        Unanswered {
                            deadline: now + self.poll_interval,
                            ..entry
                        },
                    );
                }
            }
        }
    }

    fn on_disconnect(&mut self, conn: ConnId) {
        self.worker_ready.remove(&conn);
        self.db_worker_ready.remove(&conn);
        for queue in self.queues.values_mut() {
            queue.ready.retain(|c| *c != conn);
        }
        self.db_ready.retain(|c| *c != conn);
        debug!(conn, "peer disconnected");
        // In-flight messages to this peer are left to the poll timer; their
        // timeouts re-enqueue or resend as usual.
    }

    fn match_queue(&mut self, name: &str, now: Instant) {
        loop {
            if self.shedding {
                return;
            }
            let Some(state) = self.queues.get_mut(name) else {
                return;
            };
            if state.pending.is_empty() || state.ready.is_empty() {
                return;
            }
            let Some(worker) = state.ready.pop_front() else {
                return;
            };
            if !self.worker_ready.remove(&worker) {
                // Stale entry from a vanished worker.
                continue;
            }
            let test = state.pending.pop_front().expect("non-empty checked above");

            let ack_id = self.next_ack_id;
            self.next_ack_id += 1;
            let server_id = self.next_server_id;
            self.next_server_id += 1;

            let msg = Message::Deliver {
                ack_id,
                data: test.data.clone(),
                server_id,
                producer_ack_id: test.producer_ack_id,
                crc32: test.crc32,
                tag: test.tag.clone(),
                options: test.options.clone(),
            };
            self.outbox.push((worker, msg.clone()));
            self.unanswered.insert(
                ack_id,
                Unanswered {
                    peer: worker,
                    msg,
                    queue: Some(name.to_string()),
                    test: Some(test),
                    server_id: Some(server_id),
                    deadline: now + self.poll_interval,
                },
            );
        }
    }

    fn push_db(&mut self, result: Message, now: Instant) {
        self.db_pending.push_back(result);
        if self.db_pending.len() > self.config.dbq_max {
            if !self.shedding {
                info!(
                    backlog = self.db_pending.len(),
                    "result backlog over dbq_max, shedding"
                );
            }
            self.shedding = true;
        }
        self.flush_db(now);
    }

    fn flush_db(&mut self, now: Instant) {
        while !self.db_pending.is_empty() {
            let Some(conn) = self.db_ready.pop_front() else {
                break;
            };
            if !self.db_worker_ready.remove(&conn) {
                continue;
            }
            let mut result = self.db_pending.pop_front().expect("non-empty checked");
            let ack_id = self.next_ack_id;
            self.next_ack_id += 1;
            let server_id = match &mut result {
                Message::TestResult {
                    ack_id: slot,
                    server_id,
                    ..
                } => {
                    *slot = ack_id;
                    Some(*server_id)
                }
                _ => None,
            };
            self.outbox.push((conn, result.clone()));
            self.unanswered.insert(
                ack_id,
                Unanswered {
                    peer: conn,
                    msg: result,
                    queue: None,
                    test: None,
                    server_id,
                    deadline: now + self.poll_interval,
                },
            );
        }
        if self.shedding && self.db_pending.is_empty() {
            self.clear_shedding(now);
        }
    }

    fn clear_shedding(&mut self, now: Instant) {
        info!("result backlog drained, shedding cleared");
        self.shedding = false;
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.match_queue(&name, now);
        }
    }
}

/// Binds the listener and runs the broker until a fatal error.
///
/// Invariant violations (CRC mismatch) are appended to
/// `<work_dir>/broker_errors.log` before the loop stops; transport errors
/// only drop the offending connection.
pub async fn serve(config: BrokerConfig) -> Result<(), anyhow::Error> {
    let addr = format!("{}:{}", config.listen_ip, config.listen_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "broker listening");

    let error_log = config.work_dir.join("broker_errors.log");
    let poll = Duration::from_millis(config.poll_interval_ms);
    let mut core = BrokerCore::new(config);
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<BrokerEvent>();
    let mut senders: HashMap<ConnId, mpsc::UnboundedSender<Message>> = HashMap::new();
    let mut ticker = tokio::time::interval(poll);
    let mut next_conn: ConnId = 1;

    loop {
        let event = tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = accepted?;
                let conn = next_conn;
                next_conn += 1;
                debug!(conn, %peer_addr, "accepted connection");

                let (read_half, write_half) = stream.into_split();
                let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
                senders.insert(conn, out_tx);

                let events = event_tx.clone();
                tokio::spawn(async move {
                    let mut frames = FramedRead::new(read_half, LengthDelimitedCodec::new());
                    while let Some(frame) = frames.next().await {
                        match frame {
                            Ok(bytes) => match protocol::decode_message(&bytes) {
                                Ok(msg) => {
                                    if events.send(BrokerEvent::Message(conn, msg)).is_err() {
                                        break;
                                    }
                                }
                                Err(err) => warn!(conn, %err, "dropping malformed frame"),
                            },
                            Err(err) => {
                                warn!(conn, %err, "read error");
                                break;
                            }
                        }
                    }
                    let _ = events.send(BrokerEvent::Disconnected(conn));
                });

                tokio::spawn(async move {
                    let mut sink = FramedWrite::new(write_half, LengthDelimitedCodec::new());
                    while let Some(msg) = out_rx.recv().await {
                        let Ok(bytes) = protocol::encode_message(&msg) else {
                            continue;
                        };
                        if sink.send(bytes).await.is_err() {
                            // Drop detection is lazy: the reader task reports
                            // the disconnect.
                            break;
                        }
                    }
                });

                BrokerEvent::Connected(conn)
            }
            Some(event) = event_rx.recv() => event,
            _ = ticker.tick() => BrokerEvent::Tick,
        };

        if let BrokerEvent::Disconnected(conn) = &event {
            senders.remove(conn);
        }

        match core.handle_event(event, Instant::now()) {
            Ok(outbound) => {
                for (conn, msg) in outbound {
                    if let Some(sender) = senders.get(&conn) {
                        let _ = sender.send(msg);
                    }
                }
            }
            Err(err) => {
                if let Ok(mut file) = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&error_log)
                {
                    let _ = writeln!(file, "{err}");
                }
                return Err(err.into());
            }
        }
    }
}
