//! Logical replication over the streaming replication protocol.
//!
//! `ReplicationSession` drives the connection; `MessageDecoder` turns
//! XLogData payloads from wal2json or pgoutput into `WalChange`s.

pub mod decoder;
pub mod pgoutput;
pub mod protocol;
pub mod publication;
pub mod relation_cache;
pub mod session;
pub mod slot;
pub mod transport;
pub mod wire;

pub use decoder::{BinaryDecoder, DecodePlugin, MessageDecoder};
pub use pgoutput::{PgOutputDecoder, PgOutputMessage};
pub use protocol::{ReplicationFrame, StandbyStatus};
pub use publication::{quote_ident, quote_literal, quote_table_name};
pub use relation_cache::RelationCache;
pub use session::{ReplicationConfig, ReplicationSession, SessionState, SystemIdentity};
pub use slot::{SlotAnchor, SlotPolicy};
pub use transport::{ReplicationTransport, TextRow};
pub use wire::WireConnection;
