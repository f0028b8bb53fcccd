//! Database operations: schema, open, transactional record storage, export queries, statistics.

mod connection;
mod queries;
mod storage;

pub use connection::{open_db, open_db_in_memory};
pub use queries::{
    IdCount, Statistics, StoredDtc, StoredMessage, TimeRange, for_each_message, load_dtcs,
    load_messages, statistics,
};
pub use storage::{SqliteStorage, Storage};

/// WAL tuning pragmas (synchronous, autocheckpoint, size limit). Use after PRAGMA journal_mode = WAL.
pub(crate) const WAL_PRAGMAS: &str = r#"
        PRAGMA synchronous = NORMAL;
        PRAGMA wal_autocheckpoint = 10000;
        PRAGMA journal_size_limit = 67108864;
        "#;

/// Insert statement for the message log.
pub(crate) const INSERT_MESSAGE_SQL: &str = "INSERT INTO can_messages \
     (timestamp_ns, can_id, data, dlc, is_rx, channel, message_name, decoded_data, seq) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

/// Insert statement for diagnostic hits.
pub(crate) const INSERT_DTC_SQL: &str = "INSERT INTO dtcs \
     (timestamp_ns, dtc_code, dtc_name, description, severity, source_signal, can_id) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

/// Schema for the message log and diagnostic hits.
pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS can_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp_ns INTEGER NOT NULL,
    can_id INTEGER NOT NULL,
    data BLOB NOT NULL,
    dlc INTEGER NOT NULL,
    is_rx INTEGER NOT NULL,
    channel INTEGER NOT NULL,
    message_name TEXT,
    decoded_data TEXT,
    seq INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON can_messages(timestamp_ns);
CREATE INDEX IF NOT EXISTS idx_messages_can_id ON can_messages(can_id);

CREATE TABLE IF NOT EXISTS dtcs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp_ns INTEGER NOT NULL,
    dtc_code TEXT NOT NULL,
    dtc_name TEXT,
    description TEXT,
    severity TEXT,
    source_signal TEXT,
    can_id INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dtcs_timestamp ON dtcs(timestamp_ns);
CREATE INDEX IF NOT EXISTS idx_dtcs_code ON dtcs(dtc_code);
"#;
