use std::future::Future;

use bytes::Bytes;

use crate::error::PgResult;

/// One row of a simple-query result, in text format.
pub type TextRow = Vec<Option<String>>;

/// A connection opened in `replication=database` mode.
///
/// `WireConnection` is the real implementation; the session only talks to
/// this trait so it can be driven by a scripted transport in tests.
pub trait ReplicationTransport: Send {
    /// Run a simple query (or replication command) and collect its rows.
    fn simple_query(&mut self, sql: &str) -> impl Future<Output = PgResult<Vec<TextRow>>> + Send;

    /// Send a command that switches the connection into CopyBoth mode.
    fn start_copy_both(&mut self, sql: &str) -> impl Future<Output = PgResult<()>> + Send;

    /// Next CopyData payload. `Ok(None)` when the server ends the copy.
    ///
    /// Must be cancel-safe: dropping the future before it completes may not
    /// lose or corrupt a message.
    fn recv_copy_data(&mut self) -> impl Future<Output = PgResult<Option<Bytes>>> + Send;

    fn send_copy_data(&mut self, data: &[u8]) -> impl Future<Output = PgResult<()>> + Send;

    /// End CopyBoth and terminate the connection. Best-effort.
    fn close(&mut self) -> impl Future<Output = PgResult<()>> + Send;
}
