//! Streaming replication CopyData sub-protocol.
//!
//! Once `START_REPLICATION` switches the connection into CopyBoth mode, every
//! server message is a CopyData whose first byte says what it carries:
//!
//! ```text
//! 'w' XLogData         wal_start u64 | wal_end u64 | server_time i64 | payload
//! 'k' Primary keepalive wal_end u64  | server_time i64 | reply_requested u8
//! ```
//!
//! The client answers with:
//!
//! ```text
//! 'r' Standby status   write u64 | flush u64 | apply u64 | client_time i64 | reply u8
//! ```
//!
//! Timestamps are microseconds since 2000-01-01 00:00:00 UTC.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{PgError, PgResult};

pub const XLOG_DATA_TAG: u8 = b'w';
pub const KEEPALIVE_TAG: u8 = b'k';
pub const STANDBY_STATUS_TAG: u8 = b'r';

/// Seconds between the Unix epoch and the Postgres epoch.
pub const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

const XLOG_HEADER_LEN: usize = 24;
const KEEPALIVE_LEN: usize = 17;

/// A server message received inside CopyBoth.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationFrame {
    Keepalive(Keepalive),
    XLogData(XLogData),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub wal_end: u64,
    pub server_time: i64,
    pub reply_requested: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct XLogData {
    pub wal_start: u64,
    pub wal_end: u64,
    pub server_time: i64,
    pub data: Bytes,
}

impl ReplicationFrame {
    /// Parse the body of a CopyData message.
    pub fn parse(mut payload: Bytes) -> PgResult<Self> {
        if payload.is_empty() {
            return Err(PgError::Protocol("empty CopyData message".into()));
        }

        let tag = payload.get_u8();
        match tag {
            XLOG_DATA_TAG => {
                if payload.len() < XLOG_HEADER_LEN {
                    return Err(PgError::Protocol(format!(
                        "XLogData header truncated: {} bytes",
                        payload.len()
                    )));
                }
                let wal_start = payload.get_u64();
                let wal_end = payload.get_u64();
                let server_time = payload.get_i64();
                Ok(ReplicationFrame::XLogData(XLogData {
                    wal_start,
                    wal_end,
                    server_time,
                    data: payload,
                }))
            }
            KEEPALIVE_TAG => {
                if payload.len() < KEEPALIVE_LEN {
                    return Err(PgError::Protocol(format!(
                        "keepalive truncated: {} bytes",
                        payload.len()
                    )));
                }
                Ok(ReplicationFrame::Keepalive(Keepalive {
                    wal_end: payload.get_u64(),
                    server_time: payload.get_i64(),
                    reply_requested: payload.get_u8() != 0,
                }))
            }
            other => Err(PgError::Protocol(format!(
                "unexpected CopyData tag: {} (0x{:02X})",
                other as char, other
            ))),
        }
    }
}

/// Standby status update reporting how far the client has processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyStatus {
    pub write_lsn: u64,
    pub flush_lsn: u64,
    pub apply_lsn: u64,
    pub client_time: i64,
    pub reply_requested: bool,
}

impl StandbyStatus {
    /// Report one position as written, flushed and applied.
    pub fn new(lsn: u64, client_time: i64) -> Self {
        Self {
            write_lsn: lsn,
            flush_lsn: lsn,
            apply_lsn: lsn,
            client_time,
            reply_requested: false,
        }
    }

    /// Encode as a CopyData body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(34);
        buf.put_u8(STANDBY_STATUS_TAG);
        buf.put_u64(self.write_lsn);
        buf.put_u64(self.flush_lsn);
        buf.put_u64(self.apply_lsn);
        buf.put_i64(self.client_time);
        buf.put_u8(u8::from(self.reply_requested));
        buf.freeze()
    }
}

/// Current time in Postgres epoch microseconds.
pub fn pg_now() -> i64 {
    chrono::Utc::now().timestamp_micros() - PG_EPOCH_OFFSET_SECS * 1_000_000
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn keepalive_frame(wal_end: u64, reply_requested: bool) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(KEEPALIVE_TAG);
        buf.put_u64(wal_end);
        buf.put_i64(0);
        buf.put_u8(u8::from(reply_requested));
        buf.freeze()
    }

    pub(crate) fn xlog_frame(wal_start: u64, data: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(XLOG_DATA_TAG);
        buf.put_u64(wal_start);
        buf.put_u64(wal_start + data.len() as u64);
        buf.put_i64(0);
        buf.put_slice(data);
        buf.freeze()
    }

    #[test]
    fn test_parse_keepalive() {
        let frame = ReplicationFrame::parse(keepalive_frame(0x1_0000_0010, true)).unwrap();
        assert_eq!(
            frame,
            ReplicationFrame::Keepalive(Keepalive {
                wal_end: 0x1_0000_0010,
                server_time: 0,
                reply_requested: true,
            })
        );
    }

    #[test]
    fn test_parse_xlog_data() {
        let frame = ReplicationFrame::parse(xlog_frame(0x100, b"{\"change\":[]}")).unwrap();
        match frame {
            ReplicationFrame::XLogData(x) => {
                assert_eq!(x.wal_start, 0x100);
                assert_eq!(x.wal_end, 0x100 + 13);
                assert_eq!(&x.data[..], b"{\"change\":[]}");
            }
            other => panic!("expected XLogData, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_and_unknown_frames_are_protocol_errors() {
        let truncated = Bytes::from_static(&[b'k', 0, 0, 0]);
        assert!(matches!(
            ReplicationFrame::parse(truncated),
            Err(PgError::Protocol(_))
        ));

        let truncated = Bytes::from_static(&[b'w', 0, 0, 0, 0, 0, 0, 0, 1]);
        assert!(matches!(
            ReplicationFrame::parse(truncated),
            Err(PgError::Protocol(_))
        ));

        assert!(matches!(
            ReplicationFrame::parse(Bytes::from_static(b"zjunk")),
            Err(PgError::Protocol(_))
        ));
        assert!(ReplicationFrame::parse(Bytes::new()).is_err());
    }

    #[test]
    fn test_standby_status_layout() {
        let encoded = StandbyStatus::new(0x0102_0304_0506_0708, 42).encode();
        assert_eq!(encoded.len(), 34);
        assert_eq!(encoded[0], b'r');
        assert_eq!(&encoded[1..9], &0x0102_0304_0506_0708u64.to_be_bytes());
        assert_eq!(&encoded[9..17], &encoded[1..9]);
        assert_eq!(&encoded[17..25], &encoded[1..9]);
        assert_eq!(&encoded[25..33], &42i64.to_be_bytes());
        assert_eq!(encoded[33], 0);
    }

    #[test]
    fn test_pg_now_is_past_the_postgres_epoch() {
        // 2020-01-01 in Postgres epoch microseconds
        assert!(pg_now() > 631_152_000_000_000);
    }
}
