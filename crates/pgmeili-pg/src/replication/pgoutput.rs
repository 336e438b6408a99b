//! Decoder for PostgreSQL pgoutput logical replication protocol.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-logicalrep-message-formats.html

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read};

use crate::error::{PgError, PgResult};

/// A decoded pgoutput message.
#[derive(Debug, Clone)]
pub enum PgOutputMessage {
    Begin(BeginMessage),
    Commit(CommitMessage),
    Relation(RelationMessage),
    Type(TypeMessage),
    Insert(InsertMessage),
    Update(UpdateMessage),
    Delete(DeleteMessage),
    Truncate(TruncateMessage),
    Origin(OriginMessage),
    Message(LogicalMessage),
    StreamStart(StreamStartMessage),
    StreamStop,
    StreamCommit(StreamCommitMessage),
    StreamAbort(StreamAbortMessage),
}

#[derive(Debug, Clone)]
pub struct BeginMessage {
    pub final_lsn: u64,
    pub timestamp: i64, // microseconds since 2000-01-01
    pub xid: u32,
}

#[derive(Debug, Clone)]
pub struct CommitMessage {
    pub flags: u8,
    pub commit_lsn: u64,
    pub end_lsn: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct RelationMessage {
    pub xid: Option<u32>,
    pub relation_id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: ReplicaIdentity,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaIdentity {
    Default, // 'd' - default (primary key or unique index)
    Nothing, // 'n' - nothing
    Full,    // 'f' - full (all columns)
    Index,   // 'i' - index
}

impl From<u8> for ReplicaIdentity {
    fn from(b: u8) -> Self {
        match b {
            b'n' => ReplicaIdentity::Nothing,
            b'f' => ReplicaIdentity::Full,
            b'i' => ReplicaIdentity::Index,
            _ => ReplicaIdentity::Default,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub flags: u8, // 1 = part of key
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

impl ColumnInfo {
    pub fn is_key(&self) -> bool {
        self.flags & 1 == 1
    }
}

#[derive(Debug, Clone)]
pub struct TypeMessage {
    pub xid: Option<u32>,
    pub type_id: u32,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct InsertMessage {
    pub xid: Option<u32>,
    pub relation_id: u32,
    pub tuple: TupleData,
}

#[derive(Debug, Clone)]
pub struct UpdateMessage {
    pub xid: Option<u32>,
    pub relation_id: u32,
    pub old_tuple: Option<OldTuple>,
    pub new_tuple: TupleData,
}

#[derive(Debug, Clone)]
pub struct DeleteMessage {
    pub xid: Option<u32>,
    pub relation_id: u32,
    pub old_tuple: OldTuple,
}

/// Old row image sent with updates and deletes.
#[derive(Debug, Clone)]
pub struct OldTuple {
    /// `K`: only replica identity key columns are meaningful.
    /// `O`: the full old row (REPLICA IDENTITY FULL).
    pub key_only: bool,
    pub tuple: TupleData,
}

#[derive(Debug, Clone)]
pub struct TruncateMessage {
    pub xid: Option<u32>,
    pub options: u8,
    pub relation_ids: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct OriginMessage {
    pub origin_lsn: u64,
    pub origin_name: String,
}

#[derive(Debug, Clone)]
pub struct LogicalMessage {
    pub xid: Option<u32>,
    pub flags: u8,
    pub lsn: u64,
    pub prefix: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct StreamStartMessage {
    pub xid: u32,
    pub first_segment: bool,
}

#[derive(Debug, Clone)]
pub struct StreamCommitMessage {
    pub xid: u32,
    pub flags: u8,
    pub commit_lsn: u64,
    pub end_lsn: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct StreamAbortMessage {
    pub xid: u32,
    pub subxid: u32,
}

#[derive(Debug, Clone)]
pub struct TupleData {
    pub columns: Vec<ColumnValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Unchanged, // TOASTed value unchanged
    Text(String),
    Binary(Vec<u8>),
}

/// Decoder for pgoutput binary protocol messages.
///
/// Stateless: whether a message sits inside a streamed-transaction block
/// (and so carries a leading xid) is tracked by the caller.
#[derive(Debug, Default)]
pub struct PgOutputDecoder;

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Decode a pgoutput message from raw bytes.
    pub fn decode(&self, data: &[u8], in_stream: bool) -> PgResult<PgOutputMessage> {
        if data.is_empty() {
            return Err(PgError::PgOutput("empty message".into()));
        }

        let msg_type = data[0];
        let mut cursor = Cursor::new(&data[1..]);

        self.decode_body(msg_type, &mut cursor, in_stream)
            .map_err(|e| match e {
                PgError::Io(io) => PgError::PgOutput(format!(
                    "truncated '{}' message: {}",
                    msg_type as char, io
                )),
                other => other,
            })
    }

    fn decode_body(
        &self,
        msg_type: u8,
        cursor: &mut Cursor<&[u8]>,
        in_stream: bool,
    ) -> PgResult<PgOutputMessage> {
        match msg_type {
            b'B' => self.decode_begin(cursor),
            b'C' => self.decode_commit(cursor),
            b'R' => self.decode_relation(cursor, in_stream),
            b'Y' => self.decode_type(cursor, in_stream),
            b'I' => self.decode_insert(cursor, in_stream),
            b'U' => self.decode_update(cursor, in_stream),
            b'D' => self.decode_delete(cursor, in_stream),
            b'T' => self.decode_truncate(cursor, in_stream),
            b'O' => self.decode_origin(cursor),
            b'M' => self.decode_message(cursor, in_stream),
            b'S' => self.decode_stream_start(cursor),
            b'E' => Ok(PgOutputMessage::StreamStop),
            b'c' => self.decode_stream_commit(cursor),
            b'A' => self.decode_stream_abort(cursor),
            other => Err(PgError::PgOutput(format!(
                "unknown message type: {} (0x{:02X})",
                other as char, other
            ))),
        }
    }

    fn decode_begin(&self, cursor: &mut Cursor<&[u8]>) -> PgResult<PgOutputMessage> {
        let final_lsn = cursor.read_u64::<BigEndian>()?;
        let timestamp = cursor.read_i64::<BigEndian>()?;
        let xid = cursor.read_u32::<BigEndian>()?;

        Ok(PgOutputMessage::Begin(BeginMessage {
            final_lsn,
            timestamp,
            xid,
        }))
    }

    fn decode_commit(&self, cursor: &mut Cursor<&[u8]>) -> PgResult<PgOutputMessage> {
        let flags = cursor.read_u8()?;
        let commit_lsn = cursor.read_u64::<BigEndian>()?;
        let end_lsn = cursor.read_u64::<BigEndian>()?;
        let timestamp = cursor.read_i64::<BigEndian>()?;

        Ok(PgOutputMessage::Commit(CommitMessage {
            flags,
            commit_lsn,
            end_lsn,
            timestamp,
        }))
    }

    fn decode_relation(
        &self,
        cursor: &mut Cursor<&[u8]>,
        in_stream: bool,
    ) -> PgResult<PgOutputMessage> {
        let xid = self.read_xid(cursor, in_stream)?;
        let relation_id = cursor.read_u32::<BigEndian>()?;
        let namespace = self.read_string(cursor)?;
        let name = self.read_string(cursor)?;
        let replica_identity = cursor.read_u8()?.into();
        let num_columns = cursor.read_i16::<BigEndian>()?.max(0) as usize;

        let mut columns = Vec::with_capacity(num_columns);
        for _ in 0..num_columns {
            let flags = cursor.read_u8()?;
            let col_name = self.read_string(cursor)?;
            let type_oid = cursor.read_u32::<BigEndian>()?;
            let type_modifier = cursor.read_i32::<BigEndian>()?;

            columns.push(ColumnInfo {
                flags,
                name: col_name,
                type_oid,
                type_modifier,
            });
        }

        Ok(PgOutputMessage::Relation(RelationMessage {
            xid,
            relation_id,
            namespace,
            name,
            replica_identity,
            columns,
        }))
    }

    fn decode_type(&self, cursor: &mut Cursor<&[u8]>, in_stream: bool) -> PgResult<PgOutputMessage> {
        let xid = self.read_xid(cursor, in_stream)?;
        let type_id = cursor.read_u32::<BigEndian>()?;
        let namespace = self.read_string(cursor)?;
        let name = self.read_string(cursor)?;

        Ok(PgOutputMessage::Type(TypeMessage {
            xid,
            type_id,
            namespace,
            name,
        }))
    }

    fn decode_insert(
        &self,
        cursor: &mut Cursor<&[u8]>,
        in_stream: bool,
    ) -> PgResult<PgOutputMessage> {
        let xid = self.read_xid(cursor, in_stream)?;
        let relation_id = cursor.read_u32::<BigEndian>()?;
        let tuple_type = cursor.read_u8()?;

        if tuple_type != b'N' {
            return Err(PgError::PgOutput(format!(
                "expected 'N' for new tuple, got '{}'",
                tuple_type as char
            )));
        }

        let tuple = self.decode_tuple(cursor)?;

        Ok(PgOutputMessage::Insert(InsertMessage {
            xid,
            relation_id,
            tuple,
        }))
    }

    fn decode_update(
        &self,
        cursor: &mut Cursor<&[u8]>,
        in_stream: bool,
    ) -> PgResult<PgOutputMessage> {
        let xid = self.read_xid(cursor, in_stream)?;
        let relation_id = cursor.read_u32::<BigEndian>()?;

        let first_type = cursor.read_u8()?;
        let (old_tuple, new_tuple) = match first_type {
            b'K' | b'O' => {
                let old = OldTuple {
                    key_only: first_type == b'K',
                    tuple: self.decode_tuple(cursor)?,
                };
                let new_type = cursor.read_u8()?;
                if new_type != b'N' {
                    return Err(PgError::PgOutput(format!(
                        "expected 'N' for new tuple, got '{}'",
                        new_type as char
                    )));
                }
                (Some(old), self.decode_tuple(cursor)?)
            }
            b'N' => (None, self.decode_tuple(cursor)?),
            other => {
                return Err(PgError::PgOutput(format!(
                    "unexpected tuple type in update: '{}'",
                    other as char
                )));
            }
        };

        Ok(PgOutputMessage::Update(UpdateMessage {
            xid,
            relation_id,
            old_tuple,
            new_tuple,
        }))
    }

    fn decode_delete(
        &self,
        cursor: &mut Cursor<&[u8]>,
        in_stream: bool,
    ) -> PgResult<PgOutputMessage> {
        let xid = self.read_xid(cursor, in_stream)?;
        let relation_id = cursor.read_u32::<BigEndian>()?;
        let tuple_type = cursor.read_u8()?;

        if tuple_type != b'K' && tuple_type != b'O' {
            return Err(PgError::PgOutput(format!(
                "expected 'K' or 'O' for delete tuple, got '{}'",
                tuple_type as char
            )));
        }

        let old_tuple = OldTuple {
            key_only: tuple_type == b'K',
            tuple: self.decode_tuple(cursor)?,
        };

        Ok(PgOutputMessage::Delete(DeleteMessage {
            xid,
            relation_id,
            old_tuple,
        }))
    }

    fn decode_truncate(
        &self,
        cursor: &mut Cursor<&[u8]>,
        in_stream: bool,
    ) -> PgResult<PgOutputMessage> {
        let xid = self.read_xid(cursor, in_stream)?;
        let num_relations = cursor.read_u32::<BigEndian>()? as usize;
        let options = cursor.read_u8()?;

        let mut relation_ids = Vec::with_capacity(num_relations.min(1024));
        for _ in 0..num_relations {
            relation_ids.push(cursor.read_u32::<BigEndian>()?);
        }

        Ok(PgOutputMessage::Truncate(TruncateMessage {
            xid,
            options,
            relation_ids,
        }))
    }

    fn decode_origin(&self, cursor: &mut Cursor<&[u8]>) -> PgResult<PgOutputMessage> {
        let origin_lsn = cursor.read_u64::<BigEndian>()?;
        let origin_name = self.read_string(cursor)?;

        Ok(PgOutputMessage::Origin(OriginMessage {
            origin_lsn,
            origin_name,
        }))
    }

    fn decode_message(
        &self,
        cursor: &mut Cursor<&[u8]>,
        in_stream: bool,
    ) -> PgResult<PgOutputMessage> {
        let xid = self.read_xid(cursor, in_stream)?;
        let flags = cursor.read_u8()?;
        let lsn = cursor.read_u64::<BigEndian>()?;
        let prefix = self.read_string(cursor)?;
        let content_len = cursor.read_u32::<BigEndian>()? as usize;
        let content = self.read_bytes(cursor, content_len)?;

        Ok(PgOutputMessage::Message(LogicalMessage {
            xid,
            flags,
            lsn,
            prefix,
            content,
        }))
    }

    fn decode_stream_start(&self, cursor: &mut Cursor<&[u8]>) -> PgResult<PgOutputMessage> {
        let xid = cursor.read_u32::<BigEndian>()?;
        let first_segment = cursor.read_u8()? == 1;

        Ok(PgOutputMessage::StreamStart(StreamStartMessage { xid, first_segment }))
    }

    fn decode_stream_commit(&self, cursor: &mut Cursor<&[u8]>) -> PgResult<PgOutputMessage> {
        let xid = cursor.read_u32::<BigEndian>()?;
        let flags = cursor.read_u8()?;
        let commit_lsn = cursor.read_u64::<BigEndian>()?;
        let end_lsn = cursor.read_u64::<BigEndian>()?;
        let timestamp = cursor.read_i64::<BigEndian>()?;

        Ok(PgOutputMessage::StreamCommit(StreamCommitMessage {
            xid,
            flags,
            commit_lsn,
            end_lsn,
            timestamp,
        }))
    }

    fn decode_stream_abort(&self, cursor: &mut Cursor<&[u8]>) -> PgResult<PgOutputMessage> {
        // Protocol v4 appends abort lsn and timestamp; they are not needed here.
        let xid = cursor.read_u32::<BigEndian>()?;
        let subxid = cursor.read_u32::<BigEndian>()?;

        Ok(PgOutputMessage::StreamAbort(StreamAbortMessage { xid, subxid }))
    }

    fn decode_tuple(&self, cursor: &mut Cursor<&[u8]>) -> PgResult<TupleData> {
        let num_columns = cursor.read_i16::<BigEndian>()?.max(0) as usize;
        let mut columns = Vec::with_capacity(num_columns);

        for _ in 0..num_columns {
            let col_type = cursor.read_u8()?;
            let value = match col_type {
                b'n' => ColumnValue::Null,
                b'u' => ColumnValue::Unchanged,
                b't' => {
                    let len = cursor.read_i32::<BigEndian>()?.max(0) as usize;
                    let buf = self.read_bytes(cursor, len)?;
                    ColumnValue::Text(String::from_utf8_lossy(&buf).into_owned())
                }
                b'b' => {
                    let len = cursor.read_i32::<BigEndian>()?.max(0) as usize;
                    ColumnValue::Binary(self.read_bytes(cursor, len)?)
                }
                other => {
                    return Err(PgError::PgOutput(format!(
                        "unknown column value type: '{}' (0x{:02X})",
                        other as char, other
                    )));
                }
            };
            columns.push(value);
        }

        Ok(TupleData { columns })
    }

    fn read_xid(&self, cursor: &mut Cursor<&[u8]>, in_stream: bool) -> PgResult<Option<u32>> {
        if in_stream {
            Ok(Some(cursor.read_u32::<BigEndian>()?))
        } else {
            Ok(None)
        }
    }

    /// Read exactly `len` bytes, refusing lengths past the end of the message.
    fn read_bytes(&self, cursor: &mut Cursor<&[u8]>, len: usize) -> PgResult<Vec<u8>> {
        let remaining = cursor.get_ref().len() as u64 - cursor.position();
        if len as u64 > remaining {
            return Err(PgError::PgOutput(format!(
                "value length {} exceeds remaining {} bytes",
                len, remaining
            )));
        }
        let mut buf = vec![0u8; len];
        cursor.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Read a null-terminated string.
    fn read_string(&self, cursor: &mut Cursor<&[u8]>) -> PgResult<String> {
        let mut bytes = Vec::new();
        loop {
            let b = cursor.read_u8()?;
            if b == 0 {
                break;
            }
            bytes.push(b);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Relation 16384 public.users (id int4 key, name text, bio text).
    pub(crate) fn users_relation(xid: Option<u32>) -> Vec<u8> {
        let mut data = vec![b'R'];
        if let Some(xid) = xid {
            data.extend_from_slice(&xid.to_be_bytes());
        }
        data.extend_from_slice(&16384u32.to_be_bytes()); // relation_id
        data.extend_from_slice(b"public\0"); // namespace
        data.extend_from_slice(b"users\0"); // name
        data.push(b'd'); // replica identity (default)
        data.extend_from_slice(&3i16.to_be_bytes()); // num columns

        for (flags, name, oid) in [(1u8, "id", 23u32), (0, "name", 25), (0, "bio", 25)] {
            data.push(flags);
            data.extend_from_slice(name.as_bytes());
            data.push(0);
            data.extend_from_slice(&oid.to_be_bytes());
            data.extend_from_slice(&(-1i32).to_be_bytes());
        }
        data
    }

    pub(crate) fn text(data: &mut Vec<u8>, value: &str) {
        data.push(b't');
        data.extend_from_slice(&(value.len() as i32).to_be_bytes());
        data.extend_from_slice(value.as_bytes());
    }

    #[test]
    fn test_decode_begin() {
        // 'B' + Int64(final_lsn) + Int64(timestamp) + Int32(xid)
        let mut data = vec![b'B'];
        data.extend_from_slice(&0x16B3748u64.to_be_bytes()); // final_lsn
        data.extend_from_slice(&12345678i64.to_be_bytes()); // timestamp
        data.extend_from_slice(&123u32.to_be_bytes()); // xid

        let msg = PgOutputDecoder::new().decode(&data, false).unwrap();

        match msg {
            PgOutputMessage::Begin(b) => {
                assert_eq!(b.xid, 123);
                assert_eq!(b.final_lsn, 0x16B3748);
                assert_eq!(b.timestamp, 12345678);
            }
            _ => panic!("expected Begin message"),
        }
    }

    #[test]
    fn test_decode_relation() {
        let msg = PgOutputDecoder::new()
            .decode(&users_relation(None), false)
            .unwrap();

        match msg {
            PgOutputMessage::Relation(r) => {
                assert_eq!(r.relation_id, 16384);
                assert_eq!(r.namespace, "public");
                assert_eq!(r.name, "users");
                assert_eq!(r.replica_identity, ReplicaIdentity::Default);
                assert_eq!(r.columns.len(), 3);
                assert!(r.columns[0].is_key());
                assert!(!r.columns[1].is_key());
                assert_eq!(r.columns[0].type_oid, 23);
            }
            _ => panic!("expected Relation message"),
        }
    }

    #[test]
    fn test_decode_update_keeps_unchanged_distinct_from_null() {
        let mut data = vec![b'U'];
        data.extend_from_slice(&16384u32.to_be_bytes());
        data.push(b'N');
        data.extend_from_slice(&3i16.to_be_bytes());
        text(&mut data, "1");
        data.push(b'n');
        data.push(b'u');

        let msg = PgOutputDecoder::new().decode(&data, false).unwrap();

        match msg {
            PgOutputMessage::Update(u) => {
                assert!(u.old_tuple.is_none());
                assert_eq!(u.new_tuple.columns[0], ColumnValue::Text("1".into()));
                assert_eq!(u.new_tuple.columns[1], ColumnValue::Null);
                assert_eq!(u.new_tuple.columns[2], ColumnValue::Unchanged);
            }
            _ => panic!("expected Update message"),
        }
    }

    #[test]
    fn test_decode_delete_key_tuple() {
        let mut data = vec![b'D'];
        data.extend_from_slice(&16384u32.to_be_bytes());
        data.push(b'K');
        data.extend_from_slice(&3i16.to_be_bytes());
        text(&mut data, "7");
        data.push(b'n');
        data.push(b'n');

        let msg = PgOutputDecoder::new().decode(&data, false).unwrap();

        match msg {
            PgOutputMessage::Delete(d) => {
                assert_eq!(d.relation_id, 16384);
                assert!(d.old_tuple.key_only);
                assert_eq!(d.old_tuple.tuple.columns.len(), 3);
            }
            _ => panic!("expected Delete message"),
        }
    }

    #[test]
    fn test_streamed_insert_carries_xid() {
        let mut data = vec![b'I'];
        data.extend_from_slice(&900u32.to_be_bytes()); // xid
        data.extend_from_slice(&16384u32.to_be_bytes());
        data.push(b'N');
        data.extend_from_slice(&1i16.to_be_bytes());
        text(&mut data, "1");

        match PgOutputDecoder::new().decode(&data, true).unwrap() {
            PgOutputMessage::Insert(i) => {
                assert_eq!(i.xid, Some(900));
                assert_eq!(i.relation_id, 16384);
            }
            _ => panic!("expected Insert message"),
        }
    }

    #[test]
    fn test_decode_stream_control_messages() {
        let decoder = PgOutputDecoder::new();

        let mut start = vec![b'S'];
        start.extend_from_slice(&900u32.to_be_bytes());
        start.push(1);
        assert!(matches!(
            decoder.decode(&start, false).unwrap(),
            PgOutputMessage::StreamStart(StreamStartMessage { xid: 900, first_segment: true })
        ));

        assert!(matches!(
            decoder.decode(b"E", true).unwrap(),
            PgOutputMessage::StreamStop
        ));

        let mut abort = vec![b'A'];
        abort.extend_from_slice(&900u32.to_be_bytes());
        abort.extend_from_slice(&901u32.to_be_bytes());
        assert!(matches!(
            decoder.decode(&abort, false).unwrap(),
            PgOutputMessage::StreamAbort(StreamAbortMessage { xid: 900, subxid: 901 })
        ));

        let mut commit = vec![b'c'];
        commit.extend_from_slice(&900u32.to_be_bytes());
        commit.push(0);
        commit.extend_from_slice(&10u64.to_be_bytes());
        commit.extend_from_slice(&20u64.to_be_bytes());
        commit.extend_from_slice(&0i64.to_be_bytes());
        match decoder.decode(&commit, false).unwrap() {
            PgOutputMessage::StreamCommit(c) => {
                assert_eq!(c.xid, 900);
                assert_eq!(c.end_lsn, 20);
            }
            _ => panic!("expected StreamCommit message"),
        }
    }

    #[test]
    fn test_malformed_messages_are_errors() {
        let decoder = PgOutputDecoder::new();

        assert!(matches!(decoder.decode(b"", false), Err(PgError::PgOutput(_))));
        assert!(matches!(decoder.decode(b"Z", false), Err(PgError::PgOutput(_))));
        // Truncated begin
        assert!(matches!(
            decoder.decode(&[b'B', 0, 0], false),
            Err(PgError::PgOutput(_))
        ));

        // Text value claims more bytes than the message holds
        let mut data = vec![b'I'];
        data.extend_from_slice(&16384u32.to_be_bytes());
        data.push(b'N');
        data.extend_from_slice(&1i16.to_be_bytes());
        data.push(b't');
        data.extend_from_slice(&1000i32.to_be_bytes());
        data.extend_from_slice(b"short");
        assert!(matches!(decoder.decode(&data, false), Err(PgError::PgOutput(_))));
    }
}
