use ionet_common::Direction;
use rusqlite::{params, Connection, Result, Row};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::Receiver;
use tokio::time::{interval, Duration};

use crate::record::PacketRecord;

const BATCH_ROWS: usize = 1000;
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

const INSERT_EVENT: &str = "INSERT INTO events (timestamp, protocol_id, protocol, direction, interface, family, src_ip, dst_ip, src_port, dst_port, bytes, pkt_type, ip_class)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)";

#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
    /// Rows lost to database errors. A failed batch is dropped, not retried.
    failed_rows: Arc<AtomicU64>,
}

impl Storage {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        let _: String = conn.query_row("PRAGMA journal_mode=WAL;", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                protocol_id INTEGER NOT NULL,
                protocol TEXT NOT NULL,
                direction TEXT NOT NULL,
                interface TEXT NOT NULL,
                family TEXT NOT NULL,
                src_ip TEXT,
                dst_ip TEXT,
                src_port INTEGER,
                dst_port INTEGER,
                bytes INTEGER NOT NULL,
                pkt_type TEXT NOT NULL,
                ip_class TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            failed_rows: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn failed_rows(&self) -> u64 {
        self.failed_rows.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Batch records from `rx` into the database until the channel closes.
    pub async fn run_writer(&self, mut rx: Receiver<PacketRecord>) {
        let mut buffer = Vec::with_capacity(BATCH_ROWS);
        let mut ticker = interval(FLUSH_INTERVAL);

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(record) => {
                        buffer.push(record);
                        if buffer.len() >= BATCH_ROWS {
                            self.flush(&mut buffer);
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&mut buffer);
                    }
                }
            }
        }

        if !buffer.is_empty() {
            self.flush(&mut buffer);
        }
        tracing::debug!("storage writer stopped");
    }

    /// Write `buffer` in one transaction. The buffer is always empty on
    /// return; rows that could not be written are counted in `failed_rows`.
    fn flush(&self, buffer: &mut Vec<PacketRecord>) {
        let failed = match self.write_batch(buffer) {
            Ok(failed) => failed,
            Err(e) => {
                tracing::error!("Dropping batch of {} events: {}", buffer.len(), e);
                buffer.len() as u64
            }
        };
        if failed > 0 {
            self.failed_rows.fetch_add(failed, Ordering::Relaxed);
        }
        buffer.clear();
    }

    /// Insert every record, returning how many rows failed individually.
    fn write_batch(&self, buffer: &[PacketRecord]) -> Result<u64> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut failed = 0;

        {
            let mut stmt = tx.prepare_cached(INSERT_EVENT)?;
            for record in buffer {
                if let Err(e) = stmt.execute(params![
                    record.timestamp,
                    record.protocol_id,
                    record.protocol,
                    record.direction.as_str(),
                    record.interface,
                    record.family,
                    record.src_ip,
                    record.dst_ip,
                    record.src_port,
                    record.dst_port,
                    record.bytes as i64,
                    record.pkt_type,
                    record.ip_class,
                ]) {
                    tracing::warn!("Failed to insert event: {}", e);
                    failed += 1;
                }
            }
        }

        tx.commit()?;
        tracing::trace!("flushed {} events", buffer.len());
        Ok(failed)
    }

    /// Stored events, newest first.
    pub fn query_history(&self, limit: usize) -> Result<Vec<PacketRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT timestamp, protocol_id, protocol, direction, interface, family, src_ip, dst_ip, src_port, dst_port, bytes, pkt_type, ip_class
             FROM events ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map([limit as i64], record_from_row)?;
        rows.collect()
    }

    pub fn delete_old_data(&self, older_than_seconds: u64) -> Result<usize> {
        let cutoff_ms = chrono::Utc::now().timestamp_millis() - (older_than_seconds as i64 * 1000);
        self.lock()
            .execute("DELETE FROM events WHERE timestamp < ?1", params![cutoff_ms])
    }
}

fn record_from_row(row: &Row<'_>) -> Result<PacketRecord> {
    let direction: String = row.get(3)?;
    let bytes: i64 = row.get(10)?;
    Ok(PacketRecord {
        timestamp: row.get(0)?,
        protocol_id: row.get(1)?,
        protocol: row.get(2)?,
        direction: if direction == Direction::Ingress.as_str() {
            Direction::Ingress
        } else {
            Direction::Egress
        },
        interface: row.get(4)?,
        family: row.get(5)?,
        src_ip: row.get(6)?,
        dst_ip: row.get(7)?,
        src_port: row.get(8)?,
        dst_port: row.get(9)?,
        bytes: bytes as u64,
        pkt_type: row.get(11)?,
        ip_class: row.get(12)?,
    })
}
