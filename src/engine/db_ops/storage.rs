//! Storage collaborator: explicit transaction boundaries so the batch logger owns all-or-nothing.

use anyhow::{Context, Result, bail, ensure};
use rusqlite::Connection;
use std::path::Path;

use crate::types::ProcessedRecord;

use super::{INSERT_DTC_SQL, INSERT_MESSAGE_SQL, open_db, open_db_in_memory};

/// Durable sink for batches. Owned exclusively by the batch logger.
pub trait Storage: Send {
    fn begin_transaction(&mut self) -> Result<()>;

    /// Insert one record (and its diagnostic hits) inside the open transaction.
    fn insert(&mut self, record: &ProcessedRecord) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    /// Discard everything since `begin_transaction`. Must be safe to call when no transaction is open.
    fn rollback(&mut self) -> Result<()>;

    /// Release the handle. Called once at shutdown.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// SQLite implementation over `can_messages` / `dtcs`.
pub struct SqliteStorage {
    conn: Option<Connection>,
    in_tx: bool,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_connection(open_db(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(open_db_in_memory()?))
    }

    /// Wrap a connection that already has the schema applied.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Some(conn),
            in_tx: false,
        }
    }

    /// The underlying connection, for queries (None after close).
    pub fn connection(&self) -> Option<&Connection> {
        self.conn.as_ref()
    }

    fn conn(&self) -> Result<&Connection> {
        match self.conn.as_ref() {
            Some(c) => Ok(c),
            None => bail!("storage is closed"),
        }
    }
}

impl Storage for SqliteStorage {
    fn begin_transaction(&mut self) -> Result<()> {
        ensure!(!self.in_tx, "transaction already open");
        self.conn()?
            .execute_batch("BEGIN IMMEDIATE")
            .context("begin transaction")?;
        self.in_tx = true;
        Ok(())
    }

    fn insert(&mut self, record: &ProcessedRecord) -> Result<()> {
        ensure!(self.in_tx, "insert outside a transaction");
        let conn = self.conn()?;
        let f = &record.frame;
        let mut stmt = conn
            .prepare_cached(INSERT_MESSAGE_SQL)
            .context("prepare insert")?;
        stmt.execute((
            f.timestamp_ns,
            i64::from(f.id),
            f.payload.as_slice(),
            f.dlc() as i64,
            f.direction.is_rx(),
            i64::from(f.channel),
            record.symbolic_name(),
            record.decoded.as_ref().map(|_| record.signals_json()),
            record.seq as i64,
        ))
        .context("insert message")?;

        if !record.diagnostics.is_empty() {
            let mut stmt = conn.prepare_cached(INSERT_DTC_SQL).context("prepare dtc insert")?;
            for hit in &record.diagnostics {
                stmt.execute((
                    f.timestamp_ns,
                    hit.code.as_str(),
                    hit.info.name.as_str(),
                    hit.info.description.as_str(),
                    hit.info.severity.as_str(),
                    hit.source_signal.as_deref(),
                    i64::from(f.id),
                ))
                .context("insert dtc")?;
            }
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        ensure!(self.in_tx, "commit without a transaction");
        self.conn()?.execute_batch("COMMIT").context("commit transaction")?;
        self.in_tx = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.in_tx {
            return Ok(());
        }
        self.in_tx = false;
        let conn = self.conn()?;
        // A failed COMMIT may already have ended the transaction.
        if conn.is_autocommit() {
            return Ok(());
        }
        conn.execute_batch("ROLLBACK").context("rollback transaction")
    }

    fn close(&mut self) -> Result<()> {
        if self.in_tx {
            self.rollback()?;
        }
        if let Some(conn) = self.conn.take() {
            conn.close()
                .map_err(|(_, e)| e)
                .context("close database")?;
        }
        Ok(())
    }
}
