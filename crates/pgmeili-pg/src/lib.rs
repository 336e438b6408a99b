mod connect;
pub mod conninfo;
mod error;
pub mod identity;
pub mod replication;
pub mod snapshot;

pub use connect::connect_postgres;
pub use conninfo::ConnectionParams;
pub use error::{PgError, PgResult};
pub use identity::{check_replica_identity, ReplicaIdentityKind, ReplicaIdentityReport};
pub use pgmeili_core::{format_lsn, parse_lsn};
pub use replication::{
    DecodePlugin, MessageDecoder, ReplicationConfig, ReplicationSession, ReplicationTransport,
    SessionState, SlotAnchor, SlotPolicy, SystemIdentity, WireConnection,
};
pub use snapshot::{RowSource, SnapshotScanner};
