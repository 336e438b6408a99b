//! Replication session state machine.
//!
//! ```text
//! Connecting -> Identifying -> SlotSetup -> Streaming -> Closed
//!       \            \             \            \
//!        +------------+-------------+------------+--> Fatal
//! ```
//!
//! The session owns the connection and the LSN cursor. A fatal error closes
//! the connection and leaves the session in `Fatal`; there is no reconnect.

use std::time::Duration;

use bytes::Bytes;
use pgmeili_core::{format_lsn, parse_lsn, ChangeSink};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::decoder::{DecodePlugin, MessageDecoder};
use super::protocol::{pg_now, ReplicationFrame, StandbyStatus};
use super::slot::{self, start_replication_sql, SlotAnchor, SlotPolicy};
use super::transport::ReplicationTransport;
use super::wire::WireConnection;
use crate::error::{PgError, PgResult};

pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Identifying,
    SlotSetup,
    Streaming,
    Closed,
    Fatal,
}

/// Settings for one replication session.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub slot: String,
    pub publication: String,
    /// Schema-qualified tables for the publication. Empty means all tables.
    pub tables: Vec<String>,
    pub plugin: DecodePlugin,
    pub slot_policy: SlotPolicy,
    pub status_interval: Duration,
    /// pgoutput protocol version; 2 and above enables streamed transactions.
    pub proto_version: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            slot: "pgmeili".to_string(),
            publication: "pgmeili_pub".to_string(),
            tables: Vec::new(),
            plugin: DecodePlugin::default(),
            slot_policy: SlotPolicy::default(),
            status_interval: DEFAULT_STATUS_INTERVAL,
            proto_version: 1,
        }
    }
}

/// Result of `IDENTIFY_SYSTEM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemIdentity {
    pub system_id: String,
    pub timeline: u32,
    pub xlog_pos: u64,
    pub dbname: Option<String>,
}

/// Outcome of waiting for the next frame.
#[derive(Debug)]
enum Received {
    Frame(Bytes),
    /// The status deadline passed without a frame.
    Idle,
}

pub struct ReplicationSession<T> {
    transport: T,
    config: ReplicationConfig,
    state: SessionState,
    cursor: u64,
    decoder: MessageDecoder,
    next_status: Instant,
}

impl ReplicationSession<WireConnection> {
    /// Open a replication connection and wrap it in a session.
    pub async fn connect(connection_string: &str, config: ReplicationConfig) -> PgResult<Self> {
        let transport = WireConnection::connect(connection_string).await?;
        Ok(Self::new(transport, config))
    }
}

impl<T: ReplicationTransport> ReplicationSession<T> {
    pub fn new(transport: T, config: ReplicationConfig) -> Self {
        let decoder = MessageDecoder::for_plugin(config.plugin);
        let next_status = Instant::now() + config.status_interval;
        Self {
            transport,
            config,
            state: SessionState::Connecting,
            cursor: 0,
            decoder,
            next_status,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Highest position processed so far.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// `IDENTIFY_SYSTEM`. Any failure is fatal.
    pub async fn identify(&mut self) -> PgResult<SystemIdentity> {
        self.expect_state(SessionState::Connecting)?;
        self.state = SessionState::Identifying;

        let identity = match self.query_identity().await {
            Ok(identity) => identity,
            Err(e) => return Err(self.fail(e).await),
        };

        info!(
            system_id = %identity.system_id,
            timeline = identity.timeline,
            xlog_pos = %format_lsn(identity.xlog_pos),
            dbname = ?identity.dbname,
            "Identified system"
        );

        self.state = SessionState::SlotSetup;
        Ok(identity)
    }

    async fn query_identity(&mut self) -> PgResult<SystemIdentity> {
        let rows = self
            .transport
            .simple_query("IDENTIFY_SYSTEM")
            .await
            .map_err(|e| PgError::Identify(e.to_string()))?;

        // systemid | timeline | xlogpos | dbname
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| PgError::Identify("no result row".into()))?;
        let mut fields = row.into_iter();
        let mut next = |name: &str| {
            fields
                .next()
                .flatten()
                .ok_or_else(|| PgError::Identify(format!("missing {}", name)))
        };

        let system_id = next("systemid")?;
        let timeline = next("timeline")?
            .parse()
            .map_err(|_| PgError::Identify("timeline is not a number".into()))?;
        let xlog_pos = parse_lsn(&next("xlogpos")?)?;
        let dbname = next("dbname").ok();

        Ok(SystemIdentity {
            system_id,
            timeline,
            xlog_pos,
            dbname,
        })
    }

    /// Ensure the publication and slot. The returned anchor must be handed
    /// to `start_streaming`; any snapshot read has to happen before that.
    pub async fn setup_slot(&mut self) -> PgResult<SlotAnchor> {
        self.expect_state(SessionState::SlotSetup)?;

        let result = slot::setup_slot(
            &mut self.transport,
            &self.config.slot,
            &self.config.publication,
            &self.config.tables,
            self.config.plugin,
            self.config.slot_policy,
        )
        .await;

        match result {
            Ok(anchor) => Ok(anchor),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Enter CopyBoth at the anchor's consistent point.
    pub async fn start_streaming(&mut self, anchor: SlotAnchor) -> PgResult<()> {
        self.expect_state(SessionState::SlotSetup)?;

        let options = self
            .config
            .plugin
            .start_options(&self.config.publication, self.config.proto_version);
        let sql = start_replication_sql(&anchor.slot_name, anchor.consistent_point, &options);

        if let Err(e) = self.transport.start_copy_both(&sql).await {
            return Err(self.fail(e).await);
        }

        self.cursor = anchor.consistent_point;
        self.next_status = Instant::now() + self.config.status_interval;
        self.state = SessionState::Streaming;

        info!(
            slot = %anchor.slot_name,
            lsn = %format_lsn(self.cursor),
            plugin = %self.config.plugin,
            "Streaming started"
        );
        Ok(())
    }

    /// Receive, decode and deliver until cancelled or a fatal error.
    ///
    /// On cancellation a final status is sent and the connection is closed
    /// cleanly; the session ends in `Closed`.
    pub async fn run<S: ChangeSink>(
        &mut self,
        sink: &S,
        cancel: &CancellationToken,
    ) -> PgResult<()> {
        self.expect_state(SessionState::Streaming)?;

        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                received = self.next_frame() => Some(received),
            };

            let result = match received {
                None => return self.shutdown().await,
                Some(Ok(received)) => self.process(received, sink).await,
                Some(Err(e)) => Err(e),
            };

            if let Err(e) = result {
                return Err(self.fail(e).await);
            }
        }
    }

    /// One receive/process iteration.
    #[cfg(test)]
    pub(crate) async fn step<S: ChangeSink>(&mut self, sink: &S) -> PgResult<()> {
        let received = self.next_frame().await?;
        self.process(received, sink).await
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    async fn next_frame(&mut self) -> PgResult<Received> {
        match timeout_at(self.next_status, self.transport.recv_copy_data()).await {
            Ok(Ok(Some(payload))) => Ok(Received::Frame(payload)),
            Ok(Ok(None)) => Err(PgError::StreamEnded),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(Received::Idle),
        }
    }

    async fn process<S: ChangeSink>(&mut self, received: Received, sink: &S) -> PgResult<()> {
        if let Received::Frame(payload) = received {
            match ReplicationFrame::parse(payload)? {
                ReplicationFrame::Keepalive(keepalive) => {
                    self.advance(keepalive.wal_end);
                    if keepalive.reply_requested {
                        self.send_status().await?;
                    }
                }
                ReplicationFrame::XLogData(xlog) => {
                    match self.decoder.decode(&xlog.data, xlog.wal_start) {
                        Ok(changes) => {
                            for change in changes {
                                sink.deliver(change).await;
                            }
                            self.advance(xlog.wal_start);
                        }
                        Err(e) if !e.is_fatal() => {
                            warn!(
                                lsn = %format_lsn(xlog.wal_start),
                                error = %e,
                                "Skipping undecodable frame"
                            );
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        if Instant::now() >= self.next_status {
            self.send_status().await?;
        }
        Ok(())
    }

    /// Move the cursor forward; it never moves back.
    fn advance(&mut self, lsn: u64) {
        if lsn > self.cursor {
            self.cursor = lsn;
        }
    }

    async fn send_status(&mut self) -> PgResult<()> {
        let status = StandbyStatus::new(self.cursor, pg_now());
        self.transport.send_copy_data(&status.encode()).await?;
        self.next_status = Instant::now() + self.config.status_interval;
        debug!(lsn = %format_lsn(self.cursor), "Sent standby status");
        Ok(())
    }

    async fn shutdown(&mut self) -> PgResult<()> {
        info!(lsn = %format_lsn(self.cursor), "Stopping replication");
        if let Err(e) = self.send_status().await {
            warn!(error = %e, "Failed to send final standby status");
        }
        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Failed to close replication connection");
        }
        self.state = SessionState::Closed;
        Ok(())
    }

    /// Enter `Fatal` and close the connection, best-effort.
    async fn fail(&mut self, error: PgError) -> PgError {
        tracing::error!(
            state = ?self.state,
            lsn = %format_lsn(self.cursor),
            error = %error,
            "Replication session failed"
        );
        self.state = SessionState::Fatal;
        if let Err(e) = self.transport.close().await {
            debug!(error = %e, "Close after failure did not complete");
        }
        error
    }

    fn expect_state(&self, expected: SessionState) -> PgResult<()> {
        if self.state != expected {
            return Err(PgError::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use pgmeili_core::{Value, WalChange};

    use super::*;
    use crate::replication::protocol::tests::{keepalive_frame, xlog_frame};
    use crate::replication::transport::TextRow;

    enum Incoming {
        Frame(Bytes),
        End,
        Error(PgError),
    }

    /// In-memory transport replaying scripted responses.
    ///
    /// Query responses are consumed in order. Once the frame script runs
    /// out, `recv_copy_data` never resolves.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        responses: VecDeque<PgResult<Vec<TextRow>>>,
        incoming: VecDeque<Incoming>,
        queries: Vec<String>,
        copy_command: Option<String>,
        sent: Vec<Bytes>,
        closed: bool,
    }

    impl ScriptedTransport {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn with_rows(mut self, rows: Vec<TextRow>) -> Self {
            self.responses.push_back(Ok(rows));
            self
        }

        pub(crate) fn with_error(mut self, code: &str, message: &str) -> Self {
            self.responses.push_back(Err(PgError::Server {
                severity: "ERROR".into(),
                code: code.into(),
                message: message.into(),
            }));
            self
        }

        fn with_frame(mut self, frame: Bytes) -> Self {
            self.incoming.push_back(Incoming::Frame(frame));
            self
        }

        fn with_end(mut self) -> Self {
            self.incoming.push_back(Incoming::End);
            self
        }

        fn with_recv_error(mut self, error: PgError) -> Self {
            self.incoming.push_back(Incoming::Error(error));
            self
        }

        pub(crate) fn queries(&self) -> Vec<&str> {
            self.queries.iter().map(String::as_str).collect()
        }

        /// Positions reported by the standby status messages sent so far.
        fn reported(&self) -> Vec<u64> {
            self.sent
                .iter()
                .filter(|m| m[0] == b'r')
                .map(|m| u64::from_be_bytes(m[1..9].try_into().unwrap()))
                .collect()
        }
    }

    impl ReplicationTransport for ScriptedTransport {
        async fn simple_query(&mut self, sql: &str) -> PgResult<Vec<TextRow>> {
            self.queries.push(sql.to_string());
            self.responses
                .pop_front()
                .unwrap_or_else(|| Err(PgError::Protocol(format!("unscripted query: {}", sql))))
        }

        async fn start_copy_both(&mut self, sql: &str) -> PgResult<()> {
            self.copy_command = Some(sql.to_string());
            Ok(())
        }

        async fn recv_copy_data(&mut self) -> PgResult<Option<Bytes>> {
            match self.incoming.pop_front() {
                Some(Incoming::Frame(frame)) => Ok(Some(frame)),
                Some(Incoming::End) => Ok(None),
                Some(Incoming::Error(e)) => Err(e),
                None => std::future::pending().await,
            }
        }

        async fn send_copy_data(&mut self, data: &[u8]) -> PgResult<()> {
            self.sent.push(Bytes::copy_from_slice(data));
            Ok(())
        }

        async fn close(&mut self) -> PgResult<()> {
            self.closed = true;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Collector {
        changes: Mutex<Vec<WalChange>>,
    }

    impl Collector {
        fn ids(&self) -> Vec<Value> {
            self.changes
                .lock()
                .unwrap()
                .iter()
                .filter_map(|c| c.column("id").cloned())
                .collect()
        }
    }

    impl ChangeSink for Collector {
        async fn deliver(&self, change: WalChange) {
            self.changes.lock().unwrap().push(change);
        }
    }

    fn insert_payload(id: i64) -> Vec<u8> {
        format!(
            r#"{{"change":[{{"kind":"insert","schema":"public","table":"users","columnnames":["id"],"columnvalues":[{}]}}]}}"#,
            id
        )
        .into_bytes()
    }

    fn anchor(lsn: u64) -> SlotAnchor {
        SlotAnchor {
            slot_name: "pgmeili".into(),
            consistent_point: lsn,
            snapshot_name: Some("snap".into()),
            created: true,
        }
    }

    fn identify_row() -> Vec<TextRow> {
        vec![vec![
            Some("7301234567890".into()),
            Some("1".into()),
            Some("0/16B3748".into()),
            Some("app".into()),
        ]]
    }

    /// Session already streaming from `lsn`.
    async fn streaming(transport: ScriptedTransport, lsn: u64) -> ReplicationSession<ScriptedTransport> {
        let mut session = ReplicationSession::new(transport.with_rows(identify_row()), ReplicationConfig::default());
        session.identify().await.unwrap();
        session.start_streaming(anchor(lsn)).await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_identify_then_setup_then_stream() {
        let transport = ScriptedTransport::new()
            .with_rows(identify_row())
            .with_rows(vec![])
            .with_rows(vec![])
            .with_rows(vec![vec![
                Some("pgmeili".into()),
                Some("0/16B3748".into()),
                Some("00000003-00000002-1".into()),
                Some("wal2json".into()),
            ]]);
        let mut session = ReplicationSession::new(transport, ReplicationConfig::default());
        assert_eq!(session.state(), SessionState::Connecting);

        let identity = session.identify().await.unwrap();
        assert_eq!(identity.timeline, 1);
        assert_eq!(identity.xlog_pos, 0x16B3748);
        assert_eq!(identity.dbname.as_deref(), Some("app"));
        assert_eq!(session.state(), SessionState::SlotSetup);

        let anchor = session.setup_slot().await.unwrap();
        session.start_streaming(anchor).await.unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.cursor(), 0x16B3748);
        assert_eq!(
            session.transport().copy_command.as_deref(),
            Some(
                "START_REPLICATION SLOT \"pgmeili\" LOGICAL 0/16B3748 \
                 (\"pretty-print\" '0', \"write-in-chunks\" '0')"
            )
        );
    }

    #[tokio::test]
    async fn test_identify_failure_is_fatal() {
        let transport = ScriptedTransport::new().with_error("XX000", "boom");
        let mut session = ReplicationSession::new(transport, ReplicationConfig::default());

        let err = session.identify().await.unwrap_err();
        assert!(matches!(err, PgError::Identify(_)));
        assert_eq!(session.state(), SessionState::Fatal);
        assert!(session.transport().closed);
    }

    #[tokio::test]
    async fn test_out_of_order_calls_are_rejected() {
        let mut session =
            ReplicationSession::new(ScriptedTransport::new(), ReplicationConfig::default());

        let err = session.start_streaming(anchor(0)).await.unwrap_err();
        assert!(matches!(
            err,
            PgError::InvalidState {
                expected: SessionState::SlotSetup,
                actual: SessionState::Connecting,
            }
        ));
        let err = session
            .run(&Collector::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PgError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_reply_requested_keepalive_advances_and_replies() {
        let transport = ScriptedTransport::new()
            .with_frame(keepalive_frame(0x200, true))
            .with_frame(xlog_frame(0x300, &insert_payload(1)));
        let mut session = streaming(transport, 0x100).await;
        let sink = Collector::default();

        session.step(&sink).await.unwrap();
        assert_eq!(session.cursor(), 0x200);
        // The reply went out before the next frame was read
        assert_eq!(session.transport().reported(), vec![0x200]);
        assert!(sink.ids().is_empty());

        session.step(&sink).await.unwrap();
        assert_eq!(session.cursor(), 0x300);
        assert_eq!(sink.ids(), vec![Value::Int(1)]);
    }

    #[tokio::test]
    async fn test_cursor_never_moves_back() {
        let transport = ScriptedTransport::new()
            .with_frame(keepalive_frame(0x50, false))
            .with_frame(xlog_frame(0x80, &insert_payload(1)))
            .with_frame(xlog_frame(0x400, &insert_payload(2)))
            .with_frame(keepalive_frame(0x300, false));
        let mut session = streaming(transport, 0x100).await;
        let sink = Collector::default();

        for _ in 0..4 {
            session.step(&sink).await.unwrap();
        }
        assert_eq!(session.cursor(), 0x400);
        assert_eq!(sink.ids(), vec![Value::Int(1), Value::Int(2)]);
        // No reply requested and the interval has not elapsed
        assert!(session.transport().reported().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_interval_sends_status() {
        let mut session = streaming(ScriptedTransport::new(), 0x100).await;
        let sink = Collector::default();

        let started = Instant::now();
        session.step(&sink).await.unwrap();
        assert!(started.elapsed() >= DEFAULT_STATUS_INTERVAL);
        assert_eq!(session.transport().reported(), vec![0x100]);

        session.step(&sink).await.unwrap();
        assert_eq!(session.transport().reported(), vec![0x100, 0x100]);
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_skipped() {
        let transport = ScriptedTransport::new()
            .with_frame(xlog_frame(0x200, b"{not json"))
            .with_frame(xlog_frame(0x300, &insert_payload(7)));
        let mut session = streaming(transport, 0x100).await;
        let sink = Collector::default();

        session.step(&sink).await.unwrap();
        assert_eq!(session.cursor(), 0x100);
        session.step(&sink).await.unwrap();
        assert_eq!(sink.ids(), vec![Value::Int(7)]);
        assert_eq!(session.cursor(), 0x300);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_fatal() {
        let transport = ScriptedTransport::new()
            .with_frame(xlog_frame(0x200, &insert_payload(1)))
            .with_frame(Bytes::from_static(b"zzz"));
        let mut session = streaming(transport, 0x100).await;
        let sink = Collector::default();

        let err = session
            .run(&sink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PgError::Protocol(_)));
        assert_eq!(session.state(), SessionState::Fatal);
        assert!(session.transport().closed);
        assert_eq!(sink.ids(), vec![Value::Int(1)]);
    }

    #[tokio::test]
    async fn test_stream_end_and_connection_loss_are_fatal() {
        let mut session = streaming(ScriptedTransport::new().with_end(), 0).await;
        let err = session
            .run(&Collector::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PgError::StreamEnded));
        assert_eq!(session.state(), SessionState::Fatal);

        let transport = ScriptedTransport::new()
            .with_recv_error(PgError::Connection("server closed the connection".into()));
        let mut session = streaming(transport, 0).await;
        let err = session
            .run(&Collector::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PgError::Connection(_)));
        assert_eq!(session.state(), SessionState::Fatal);
    }

    #[tokio::test]
    async fn test_cancel_sends_final_status_and_closes() {
        let transport = ScriptedTransport::new().with_frame(keepalive_frame(0x500, false));
        let mut session = streaming(transport, 0x100).await;
        let sink = Collector::default();
        session.step(&sink).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        session.run(&sink, &cancel).await.unwrap();

        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.transport().closed);
        assert_eq!(session.transport().reported(), vec![0x500]);
    }
}
