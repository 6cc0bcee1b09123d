//! Content-addressed crash archive: a relational schema with interned
//! strings plus raw artifact files on disk.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/mangler.db
//! <root>/crashfiles/<crash_id>.raw
//! <root>/crashdata/<crash_id>.txt
//! <root>/templates/<template_id>.raw
//! ```

use crate::crashparse::{self, CrashDetail};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("artifact I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One finished test as reported by a worker, ready for persistence.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    /// The queue the test ran on.
    pub stream: String,
    /// Worker status text, `"crash"` triggering the full crash pipeline.
    pub status: String,
    /// The exact bytes delivered to the target.
    pub payload: Vec<u8>,
    /// Raw debugger output, present for crashes.
    pub detail_text: String,
    /// Producer/worker tag text.
    pub tag: String,
    /// Content hash of the seed input this test was derived from, if the
    /// producer registered one.
    pub template_hash: Option<String>,
}

/// Row identifiers handed back to the broker for the result ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredResult {
    pub result_id: i64,
    pub crash_id: Option<i64>,
}

/// The archive: one SQLite database and three artifact directories.
///
/// Interning tables are grow-only `(id, value UNIQUE)` dictionaries; crash
/// rows reference them by id. Every result is written in one transaction,
/// and artifact-file failures roll the whole transaction back so the broker
/// re-delivers.
pub struct ResultStore {
    conn: Connection,
    root: PathBuf,
}

const INTERN_TABLES: &[&str] = &[
    "streams",
    "descs",
    "exception_types",
    "exception_subtypes",
    "classifications",
    "hash_strings",
    "result_strings",
    "functions",
];

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS streams (id INTEGER PRIMARY KEY, value TEXT NOT NULL UNIQUE);
CREATE TABLE IF NOT EXISTS descs (id INTEGER PRIMARY KEY, value TEXT NOT NULL UNIQUE);
CREATE TABLE IF NOT EXISTS exception_types (id INTEGER PRIMARY KEY, value TEXT NOT NULL UNIQUE);
CREATE TABLE IF NOT EXISTS exception_subtypes (id INTEGER PRIMARY KEY, value TEXT NOT NULL UNIQUE);
CREATE TABLE IF NOT EXISTS classifications (id INTEGER PRIMARY KEY, value TEXT NOT NULL UNIQUE);
CREATE TABLE IF NOT EXISTS hash_strings (id INTEGER PRIMARY KEY, value TEXT NOT NULL UNIQUE);
CREATE TABLE IF NOT EXISTS result_strings (id INTEGER PRIMARY KEY, value TEXT NOT NULL UNIQUE);
CREATE TABLE IF NOT EXISTS functions (id INTEGER PRIMARY KEY, value TEXT NOT NULL UNIQUE);
CREATE TABLE IF NOT EXISTS templates (
    id INTEGER PRIMARY KEY,
    hash TEXT NOT NULL UNIQUE,
    path TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS modules (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    checksum TEXT NOT NULL,
    UNIQUE (name, checksum)
);
CREATE TABLE IF NOT EXISTS results (
    id INTEGER PRIMARY KEY,
    timestamp TEXT NOT NULL,
    stream_id INTEGER NOT NULL REFERENCES streams(id),
    result_string_id INTEGER NOT NULL REFERENCES result_strings(id),
    tag TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS crashes (
    id INTEGER PRIMARY KEY,
    result_id INTEGER NOT NULL REFERENCES results(id),
    timestamp TEXT NOT NULL,
    hash_string_id INTEGER NOT NULL REFERENCES hash_strings(id),
    desc_id INTEGER NOT NULL REFERENCES descs(id),
    exception_type_id INTEGER NOT NULL REFERENCES exception_types(id),
    exception_subtype_id INTEGER NOT NULL REFERENCES exception_subtypes(id),
    classification_id INTEGER NOT NULL REFERENCES classifications(id),
    template_id INTEGER REFERENCES templates(id),
    crash_file TEXT NOT NULL,
    detail_file TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS stacktraces (
    id INTEGER PRIMARY KEY,
    crash_id INTEGER NOT NULL REFERENCES crashes(id),
    seq INTEGER NOT NULL,
    frame TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS stackframes (
    id INTEGER PRIMARY KEY,
    crash_id INTEGER NOT NULL REFERENCES crashes(id),
    seq INTEGER NOT NULL,
    module_id INTEGER REFERENCES modules(id),
    function_id INTEGER REFERENCES functions(id),
    frame_offset INTEGER
);
CREATE TABLE IF NOT EXISTS loaded_modules (
    id INTEGER PRIMARY KEY,
    crash_id INTEGER NOT NULL REFERENCES crashes(id),
    module_id INTEGER NOT NULL REFERENCES modules(id),
    base_address INTEGER NOT NULL,
    syms_loaded INTEGER NOT NULL,
    size INTEGER,
    timestamp TEXT NOT NULL,
    version TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS register_dumps (
    id INTEGER PRIMARY KEY,
    crash_id INTEGER NOT NULL REFERENCES crashes(id),
    register TEXT NOT NULL,
    value INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS diffs (
    id INTEGER PRIMARY KEY,
    crash_id INTEGER NOT NULL REFERENCES crashes(id),
    byte_offset INTEGER NOT NULL,
    template_byte INTEGER NOT NULL,
    crash_byte INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS disasm (
    id INTEGER PRIMARY KEY,
    crash_id INTEGER NOT NULL REFERENCES crashes(id),
    seq INTEGER NOT NULL,
    address INTEGER,
    text TEXT NOT NULL
);
";

/// Returns the existing id for `value` in an interning table, inserting it
/// first when absent. Uniqueness plus read-back keeps this idempotent under
/// concurrent inserters.
fn intern(tx: &Transaction<'_>, table: &str, value: &str) -> Result<i64, rusqlite::Error> {
    debug_assert!(INTERN_TABLES.contains(&table));
    tx.execute(
        &format!("INSERT INTO {table} (value) VALUES (?1) ON CONFLICT (value) DO NOTHING"),
        params![value],
    )?;
    tx.query_row(
        &format!("SELECT id FROM {table} WHERE value = ?1"),
        params![value],
        |row| row.get(0),
    )
}

fn module_id(
    tx: &Transaction<'_>,
    name: &str,
    checksum: &str,
) -> Result<i64, rusqlite::Error> {
    tx.execute(
        "INSERT INTO modules (name, checksum) VALUES (?1, ?2)
         ON CONFLICT (name, checksum) DO NOTHING",
        params![name, checksum],
    )?;
    tx.query_row(
        "SELECT id FROM modules WHERE name = ?1 AND checksum = ?2",
        params![name, checksum],
        |row| row.get(0),
    )
}

impl ResultStore {
    /// Opens (or creates) the archive under `root`.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        for dir in ["crashfiles", "crashdata", "templates"] {
            fs::create_dir_all(root.join(dir))?;
        }
        let conn = Connection::open(root.join("mangler.db"))?;
        conn.execute_batch(SCHEMA)?;
        Ok(ResultStore {
            conn,
            root: root.to_path_buf(),
        })
    }

    /// In-memory archive with artifact directories under `root`; test use.
    pub fn open_in_memory(root: &Path) -> Result<Self, StoreError> {
        for dir in ["crashfiles", "crashdata", "templates"] {
            fs::create_dir_all(root.join(dir))?;
        }
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(ResultStore {
            conn,
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Registers a seed input, content-addressed by MD5. Re-registering the
    /// same bytes is a no-op returning the existing row.
    pub fn register_template(&mut self, bytes: &[u8]) -> Result<(i64, String), StoreError> {
        let hash = format!("{:x}", md5::compute(bytes));
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM templates WHERE hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok((id, hash));
        }

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO templates (hash, path) VALUES (?1, ?2)",
            params![hash, ""],
        )?;
        let id = tx.last_insert_rowid();
        let path = format!("templates/{id}.raw");
        tx.execute(
            "UPDATE templates SET path = ?1 WHERE id = ?2",
            params![path, id],
        )?;
        fs::write(self.root.join(&path), bytes)?;
        tx.commit()?;
        debug!(template_id = id, %hash, "registered template");
        Ok((id, hash))
    }

    /// Persists one test outcome atomically.
    ///
    /// Crash outcomes additionally parse the debugger detail, intern its
    /// strings, write the module/frame/register/disassembly rows and both
    /// artifact files. A failed file write drops the transaction, removes
    /// any partial artifacts and surfaces the error; the upstream ack stays
    /// pending and the broker re-delivers.
    pub fn record_result(&mut self, outcome: &TestOutcome) -> Result<StoredResult, StoreError> {
        let timestamp = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;

        let stream_id = intern(&tx, "streams", &outcome.stream)?;
        let result_string_id = intern(&tx, "result_strings", &outcome.status)?;
        tx.execute(
            "INSERT INTO results (timestamp, stream_id, result_string_id, tag)
             VALUES (?1, ?2, ?3, ?4)",
            params![timestamp, stream_id, result_string_id, outcome.tag],
        )?;
        let result_id = tx.last_insert_rowid();

        if outcome.status != "crash" {
            tx.commit()?;
            return Ok(StoredResult {
                result_id,
                crash_id: None,
            });
        }

        let detail = crashparse::parse(&outcome.detail_text);
        let crash_id = insert_crash(&tx, result_id, &timestamp, outcome, &detail)?;

        // Byte-level differences from the registered seed, when known.
        if let Some(template_hash) = &outcome.template_hash {
            let template_path: Option<String> = tx
                .query_row(
                    "SELECT path FROM templates WHERE hash = ?1",
                    params![template_hash],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(path) = template_path {
                if let Ok(template_bytes) = fs::read(self.root.join(path)) {
                    for (offset, (t, c)) in
                        template_bytes.iter().zip(outcome.payload.iter()).enumerate()
                    {
                        if t != c {
                            tx.execute(
                                "INSERT INTO diffs (crash_id, byte_offset, template_byte, crash_byte)
                                 VALUES (?1, ?2, ?3, ?4)",
                                params![crash_id, offset as i64, *t, *c],
                            )?;
                        }
                    }
                }
            }
        }

        let crash_file = format!("crashfiles/{crash_id}.raw");
        let detail_file = format!("crashdata/{crash_id}.txt");
        tx.execute(
            "UPDATE crashes SET crash_file = ?1, detail_file = ?2 WHERE id = ?3",
            params![crash_file, detail_file, crash_id],
        )?;

        if let Err(err) = fs::write(self.root.join(&crash_file), &outcome.payload)
            .and_then(|_| fs::write(self.root.join(&detail_file), &outcome.detail_text))
        {
            // Roll back the rows and clean up whatever landed on disk.
            drop(tx);
            let _ = fs::remove_file(self.root.join(&crash_file));
            let _ = fs::remove_file(self.root.join(&detail_file));
            warn!(%err, "artifact write failed, result rolled back");
            return Err(StoreError::Io(err));
        }

        tx.commit()?;
        debug!(result_id, crash_id, "stored crash result");
        Ok(StoredResult {
            result_id,
            crash_id: Some(crash_id),
        })
    }

    /// The number of rows in a table; used by tests and the status line.
    pub fn count(&self, table: &str) -> Result<i64, StoreError> {
        debug_assert!(
            INTERN_TABLES.contains(&table)
                || [
                    "templates",
                    "modules",
                    "results",
                    "crashes",
                    "stacktraces",
                    "stackframes",
                    "loaded_modules",
                    "register_dumps",
                    "diffs",
                    "disasm",
                ]
                .contains(&table)
        );
        Ok(self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })?)
    }

    /// Looks a crash row up by id, returning the interned strings joined
    /// back in.
    pub fn crash_summary(&self, crash_id: i64) -> Result<Option<CrashSummary>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT h.value, e.value, s.value, c.value, d.value
                 FROM crashes
                 JOIN hash_strings h ON h.id = crashes.hash_string_id
                 JOIN exception_types e ON e.id = crashes.exception_type_id
                 JOIN exception_subtypes s ON s.id = crashes.exception_subtype_id
                 JOIN classifications c ON c.id = crashes.classification_id
                 JOIN descs d ON d.id = crashes.desc_id
                 WHERE crashes.id = ?1",
                params![crash_id],
                |row| {
                    Ok(CrashSummary {
                        hash_string: row.get(0)?,
                        exception_type: row.get(1)?,
                        exception_subtype: row.get(2)?,
                        classification: row.get(3)?,
                        short_desc: row.get(4)?,
                    })
                },
            )
            .optional()?)
    }
}

/// Interned strings of one crash row, re-joined for callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashSummary {
    pub hash_string: String,
    pub exception_type: String,
    pub exception_subtype: String,
    pub classification: String,
    pub short_desc: String,
}

fn insert_crash(
    tx: &Transaction<'_>,
    result_id: i64,
    timestamp: &str,
    outcome: &TestOutcome,
    detail: &CrashDetail,
) -> Result<i64, rusqlite::Error> {
    let hash_id = intern(tx, "hash_strings", &detail.hash)?;
    let desc_id = intern(tx, "descs", &detail.short_desc)?;
    let type_id = intern(tx, "exception_types", &detail.exception_type)?;
    let subtype_id = intern(tx, "exception_subtypes", &detail.exception_subtype)?;
    let class_id = intern(tx, "classifications", &detail.classification)?;
    let template_id: Option<i64> = match &outcome.template_hash {
        Some(hash) => tx
            .query_row(
                "SELECT id FROM templates WHERE hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?,
        None => None,
    };

    tx.execute(
        "INSERT INTO crashes (result_id, timestamp, hash_string_id, desc_id,
             exception_type_id, exception_subtype_id, classification_id,
             template_id, crash_file, detail_file)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, '', '')",
        params![
            result_id, timestamp, hash_id, desc_id, type_id, subtype_id, class_id, template_id
        ],
    )?;
    let crash_id = tx.last_insert_rowid();

    for (base, module) in &detail.loaded_modules {
        let mid = module_id(tx, &module.name, &module.checksum)?;
        tx.execute(
            "INSERT INTO loaded_modules
                 (crash_id, module_id, base_address, syms_loaded, size, timestamp, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                crash_id,
                mid,
                *base as i64,
                module.syms_loaded,
                module.size.map(|s| s as i64),
                module.timestamp,
                module.version
            ],
        )?;
    }

    for (seq, frame) in &detail.stack_frames {
        tx.execute(
            "INSERT INTO stacktraces (crash_id, seq, frame) VALUES (?1, ?2, ?3)",
            params![crash_id, seq, frame],
        )?;
        let (module, func_name, offset) = crashparse::split_frame(frame);
        let module_ref = match module {
            Some(name) => Some(module_id(tx, &name, "")?),
            None => None,
        };
        let function_ref = match func_name {
            Some(name) => Some(intern(tx, "functions", &name)?),
            None => None,
        };
        tx.execute(
            "INSERT INTO stackframes (crash_id, seq, module_id, function_id, frame_offset)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                crash_id,
                seq,
                module_ref,
                function_ref,
                offset.map(|o| o as i64)
            ],
        )?;
    }

    for (name, value) in &detail.registers {
        tx.execute(
            "INSERT INTO register_dumps (crash_id, register, value) VALUES (?1, ?2, ?3)",
            params![crash_id, name, *value as i64],
        )?;
    }

    for (seq, text) in &detail.disassembly {
        // Split off a leading hex address when one survived the capture.
        let (address, rest) = match text.split_once(' ') {
            Some((first, rest)) => {
                match u64::from_str_radix(first.trim_start_matches("0x"), 16) {
                    Ok(addr) => (Some(addr as i64), rest.trim().to_string()),
                    Err(_) => (None, text.clone()),
                }
            }
            None => (None, text.clone()),
        };
        tx.execute(
            "INSERT INTO disasm (crash_id, seq, address, text) VALUES (?1, ?2, ?3, ?4)",
            params![crash_id, seq, address, rest],
        )?;
    }

    Ok(crash_id)
}

/// Protocol shim between the broker and a [`ResultStore`].
///
/// Persistence failures produce no ack at all: the broker's poll timer
/// resends the result, and the transaction rollback guarantees the retry
/// starts clean.
pub struct StoreWorkerCore {
    store: ResultStore,
}

impl StoreWorkerCore {
    pub fn new(store: ResultStore) -> Self {
        StoreWorkerCore { store }
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    /// Handles one broker message, returning the ack when persistence
    /// succeeded.
    pub fn handle_message(&mut self, msg: crate::protocol::Message) -> Option<crate::protocol::Message> {
        use crate::protocol::Message;
        use serde_json::Value;

        let Message::TestResult {
            ack_id,
            status,
            data,
            detail,
            queue,
            tag,
            template_hash,
            ..
        } = msg
        else {
            debug!("ignoring non-result message");
            return None;
        };

        let outcome = TestOutcome {
            stream: queue,
            status: status.clone(),
            payload: data,
            detail_text: detail,
            tag,
            template_hash,
        };
        match self.store.record_result(&outcome) {
            Ok(stored) => {
                let mut extras = vec![
                    ("result", Value::from(status)),
                    ("db_id", Value::from(stored.result_id)),
                ];
                if let Some(crash_id) = stored.crash_id {
                    extras.push(("crash_id", Value::from(crash_id)));
                }
                Some(Message::ack_with(ack_id, extras))
            }
            Err(err) => {
                warn!(%err, "persist failed, leaving result unacked");
                None
            }
        }
    }
}

/// Connects to the broker and persists results until the process stops.
pub async fn run_store_worker(
    server_ip: &str,
    server_port: u16,
    poll_interval_ms: u64,
    store: ResultStore,
) -> Result<(), anyhow::Error> {
    use crate::protocol::{self, Message};
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

    let mut core = StoreWorkerCore::new(store);
    let addr = format!("{server_ip}:{server_port}");
    let poll = std::time::Duration::from_millis(poll_interval_ms);

    loop {
        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%addr, %err, "broker unreachable, retrying");
                tokio::time::sleep(poll).await;
                continue;
            }
        };
        tracing::info!(%addr, "store worker connected");
        let (read_half, write_half) = stream.into_split();
        let mut frames = FramedRead::new(read_half, LengthDelimitedCodec::new());
        let mut sink = FramedWrite::new(write_half, LengthDelimitedCodec::new());

        let announce = protocol::encode_message(&Message::DbReady)?;
        if sink.send(announce).await.is_err() {
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
                    if let Some(ack) = core.handle_message(msg) {
                        let bytes = protocol::encode_message(&ack)?;
                        if sink.send(bytes).await.is_err() {
                            break 'connection;
                        }
                    }
                    let announce = protocol::encode_message(&Message::DbReady)?;
                    if sink.send(announce).await.is_err() {
                        break 'connection;
                    }
                }
                _ = heartbeat.tick() => {
                    let announce = protocol::encode_message(&Message::DbReady)?;
                    if sink.send(announce).await.is_err() {
                        break 'connection;
                    }
                }
            }
        }
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn crash_outcome() -> TestOutcome {
        TestOutcome {
            stream: "default".to_string(),
            status: "crash".to_string(),
            payload: vec![0x00, 0x01],
            detail_text: "EXCEPTION_TYPE:X\nMAJOR_HASH:a\nMINOR_HASH:b\n".to_string(),
            tag: "producer_crc=0 iteration=1".to_string(),
            template_hash: None,
        }
    }

    #[test]
    fn plain_result_inserts_one_row_and_no_crash() {
        let dir = tempdir().unwrap();
        let mut store = ResultStore::open(dir.path()).unwrap();
        let stored = store
            .record_result(&TestOutcome {
                status: "success".to_string(),
                detail_text: String::new(),
                ..crash_outcome()
            })
            .unwrap();
        assert!(stored.crash_id.is_none());
        assert_eq!(store.count("results").unwrap(), 1);
        assert_eq!(store.count("crashes").unwrap(), 0);
    }

    #[test]
    fn crash_result_writes_rows_and_artifacts() {
        let dir = tempdir().unwrap();
        let mut store = ResultStore::open(dir.path()).unwrap();
        let stored = store.record_result(&crash_outcome()).unwrap();
        let crash_id = stored.crash_id.expect("crash row allocated");

        let summary = store.crash_summary(crash_id).unwrap().unwrap();
        assert_eq!(summary.hash_string, "a.b");
        assert_eq!(summary.exception_type, "X");

        let raw = dir.path().join(format!("crashfiles/{crash_id}.raw"));
        let txt = dir.path().join(format!("crashdata/{crash_id}.txt"));
        assert_eq!(fs::read(raw).unwrap(), vec![0x00, 0x01]);
        assert!(fs::read_to_string(txt).unwrap().contains("MAJOR_HASH:a"));
    }

    #[test]
    fn interners_deduplicate_values() {
        let dir = tempdir().unwrap();
        let mut store = ResultStore::open(dir.path()).unwrap();
        store.record_result(&crash_outcome()).unwrap();
        store.record_result(&crash_outcome()).unwrap();
        assert_eq!(store.count("results").unwrap(), 2);
        assert_eq!(store.count("crashes").unwrap(), 2);
        // Same hash, type and (empty) subtype/classification each intern once.
        assert_eq!(store.count("hash_strings").unwrap(), 1);
        assert_eq!(store.count("exception_types").unwrap(), 1);
    }

    #[test]
    fn modules_deduplicate_by_name_and_checksum() {
        let dir = tempdir().unwrap();
        let mut store = ResultStore::open(dir.path()).unwrap();
        let detail = "\
EXCEPTION_TYPE:X
MAJOR_HASH:m
MINOR_HASH:n
STACK_FRAME:target!boom+0x10
00400000 00410000   target   (deferred)
    Image name: target.exe
    CheckSum: 00001111
";
        let outcome = TestOutcome {
            detail_text: detail.to_string(),
            ..crash_outcome()
        };
        store.record_result(&outcome).unwrap();
        store.record_result(&outcome).unwrap();
        // target.exe with its checksum, plus the bare "target" frame module.
        assert_eq!(store.count("modules").unwrap(), 2);
        assert_eq!(store.count("loaded_modules").unwrap(), 2);
        assert_eq!(store.count("stackframes").unwrap(), 2);
        assert_eq!(store.count("functions").unwrap(), 1);
    }

    #[test]
    fn templates_are_content_addressed() {
        let dir = tempdir().unwrap();
        let mut store = ResultStore::open(dir.path()).unwrap();
        let (id1, hash1) = store.register_template(b"seed bytes").unwrap();
        let (id2, hash2) = store.register_template(b"seed bytes").unwrap();
        assert_eq!(id1, id2);
        assert_eq!(hash1, hash2);
        assert_eq!(store.count("templates").unwrap(), 1);

        let path = dir.path().join(format!("templates/{id1}.raw"));
        assert_eq!(fs::read(path).unwrap(), b"seed bytes");

        let outcome = TestOutcome {
            template_hash: Some(hash1),
            ..crash_outcome()
        };
        let stored = store.record_result(&outcome).unwrap();
        let template_ref: Option<i64> = store
            .conn
            .query_row(
                "SELECT template_id FROM crashes WHERE id = ?1",
                params![stored.crash_id.unwrap()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(template_ref, Some(id1));
    }

    #[test]
    fn store_worker_acks_with_db_and_crash_ids() {
        use crate::protocol::Message;

        let dir = tempdir().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        let mut worker = StoreWorkerCore::new(store);

        let result = Message::TestResult {
            ack_id: 11,
            server_id: 1,
            status: "crash".to_string(),
            data: vec![0x00, 0x01],
            detail: "EXCEPTION_TYPE:X\nMAJOR_HASH:a\nMINOR_HASH:b\n".to_string(),
            queue: "default".to_string(),
            tag: "t".to_string(),
            crc32: 0xB6CC_4292,
            template_hash: None,
        };
        let ack = worker.handle_message(result).expect("persist succeeds");
        match ack {
            Message::AckMsg { ack_id, extras } => {
                assert_eq!(ack_id, 11);
                assert_eq!(extras["result"], "crash");
                assert!(extras["db_id"].as_i64().unwrap() > 0);
                assert!(extras["crash_id"].as_i64().unwrap() > 0);
            }
            other => panic!("expected an ack, got {other:?}"),
        }
        assert_eq!(worker.store().count("crashes").unwrap(), 1);
    }

    #[test]
    fn store_worker_swallows_the_ack_on_persist_failure() {
        use crate::protocol::Message;

        let dir = tempdir().unwrap();
        let store = ResultStore::open(dir.path()).unwrap();
        fs::remove_dir_all(dir.path().join("crashdata")).unwrap();
        fs::write(dir.path().join("crashdata"), b"in the way").unwrap();
        let mut worker = StoreWorkerCore::new(store);

        let result = Message::TestResult {
            ack_id: 4,
            server_id: 1,
            status: "crash".to_string(),
            data: vec![1],
            detail: "MAJOR_HASH:x\nMINOR_HASH:y\n".to_string(),
            queue: "default".to_string(),
            tag: "t".to_string(),
            crc32: 0,
            template_hash: None,
        };
        assert!(worker.handle_message(result).is_none());
        assert_eq!(worker.store().count("results").unwrap(), 0);
    }

    #[test]
    fn artifact_write_failure_rolls_back_the_result() {
        let dir = tempdir().unwrap();
        let mut store = ResultStore::open(dir.path()).unwrap();
        // Make crashfiles/ unusable by replacing it with a regular file.
        fs::remove_dir_all(dir.path().join("crashfiles")).unwrap();
        fs::write(dir.path().join("crashfiles"), b"not a directory").unwrap();

        let err = store.record_result(&crash_outcome()).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert_eq!(store.count("results").unwrap(), 0);
        assert_eq!(store.count("crashes").unwrap(), 0);
        assert_eq!(store.count("hash_strings").unwrap(), 0);
    }
}
