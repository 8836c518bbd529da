//! Binary decoder for pgoutput protocol v1.
//!
//! Each XLogData payload holds exactly one message; the first byte selects
//! the kind. Unknown kinds are an error the caller logs and skips — one bad
//! record must not abort the stream.

use super::message::{ColumnSpec, PgOutputMessage, Relation, TupleData, TupleValue};
use bytes::{Buf, Bytes};
use thiserror::Error;

/// Decoder failure for a single message.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("message truncated")]
    Truncated,
    #[error("unknown message type: {0:#04x}")]
    UnknownType(u8),
    #[error("unexpected tuple marker: {0:#04x}")]
    UnexpectedMarker(u8),
    #[error("invalid utf8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// Decode one pgoutput message from an XLogData payload.
pub fn decode_message(buf: &mut Bytes) -> Result<PgOutputMessage, DecodeError> {
    let tag = take_u8(buf)?;
    match tag {
        b'B' => decode_begin(buf),
        b'C' => decode_commit(buf),
        b'R' => decode_relation(buf),
        b'I' => decode_insert(buf),
        b'U' => decode_update(buf),
        b'D' => decode_delete(buf),
        b'T' => decode_truncate(buf),
        b'O' => Ok(PgOutputMessage::Origin),
        b'Y' => Ok(PgOutputMessage::Type),
        other => Err(DecodeError::UnknownType(other)),
    }
}

fn decode_begin(buf: &mut Bytes) -> Result<PgOutputMessage, DecodeError> {
    Ok(PgOutputMessage::Begin {
        final_lsn: take_u64(buf)?,
        commit_ts: take_i64(buf)?,
        xid: take_u32(buf)?,
    })
}

fn decode_commit(buf: &mut Bytes) -> Result<PgOutputMessage, DecodeError> {
    let _flags = take_u8(buf)?;
    Ok(PgOutputMessage::Commit {
        commit_lsn: take_u64(buf)?,
        end_lsn: take_u64(buf)?,
        commit_ts: take_i64(buf)?,
    })
}

fn decode_relation(buf: &mut Bytes) -> Result<PgOutputMessage, DecodeError> {
    let id = take_u32(buf)?;
    let namespace = take_cstring(buf)?;
    let name = take_cstring(buf)?;
    let replica_identity = take_u8(buf)?;
    let column_count = take_u16(buf)?;

    let mut columns = Vec::with_capacity(column_count as usize);
    for _ in 0..column_count {
        let flags = take_u8(buf)?;
        let name = take_cstring(buf)?;
        let type_oid = take_i32(buf)?;
        let _type_modifier = take_i32(buf)?;
        columns.push(ColumnSpec {
            flags,
            name,
            type_oid,
        });
    }

    Ok(PgOutputMessage::Relation(Relation {
        id,
        namespace,
        name,
        replica_identity,
        columns,
    }))
}

fn decode_insert(buf: &mut Bytes) -> Result<PgOutputMessage, DecodeError> {
    let relation_id = take_u32(buf)?;
    expect_marker(buf, b'N')?;
    let new = decode_tuple(buf)?;
    Ok(PgOutputMessage::Insert { relation_id, new })
}

fn decode_update(buf: &mut Bytes) -> Result<PgOutputMessage, DecodeError> {
    let relation_id = take_u32(buf)?;
    let marker = take_u8(buf)?;
    let (old, new) = match marker {
        // Key or full old image, then the new tuple behind its own marker.
        b'K' | b'O' => {
            let old = decode_tuple(buf)?;
            expect_marker(buf, b'N')?;
            (Some(old), decode_tuple(buf)?)
        }
        b'N' => (None, decode_tuple(buf)?),
        other => return Err(DecodeError::UnexpectedMarker(other)),
    };
    Ok(PgOutputMessage::Update {
        relation_id,
        old,
        new,
    })
}

fn decode_delete(buf: &mut Bytes) -> Result<PgOutputMessage, DecodeError> {
    let relation_id = take_u32(buf)?;
    let marker = take_u8(buf)?;
    if marker != b'K' && marker != b'O' {
        return Err(DecodeError::UnexpectedMarker(marker));
    }
    let key = decode_tuple(buf)?;
    Ok(PgOutputMessage::Delete { relation_id, key })
}

fn decode_truncate(buf: &mut Bytes) -> Result<PgOutputMessage, DecodeError> {
    let count = take_u32(buf)?;
    let _options = take_u8(buf)?;
    let mut relation_ids = Vec::with_capacity(count as usize);
    for _ in 0..count {
        relation_ids.push(take_u32(buf)?);
    }
    Ok(PgOutputMessage::Truncate { relation_ids })
}

fn decode_tuple(buf: &mut Bytes) -> Result<TupleData, DecodeError> {
    let column_count = take_u16(buf)?;
    let mut values = Vec::with_capacity(column_count as usize);
    for _ in 0..column_count {
        let kind = take_u8(buf)?;
        let value = match kind {
            b'n' => TupleValue::Null,
            b'u' => TupleValue::Unchanged,
            b't' => {
                let len = take_u32(buf)? as usize;
                if buf.remaining() < len {
                    return Err(DecodeError::Truncated);
                }
                TupleValue::Text(buf.copy_to_bytes(len))
            }
            other => return Err(DecodeError::UnexpectedMarker(other)),
        };
        values.push(value);
    }
    Ok(TupleData(values))
}

fn expect_marker(buf: &mut Bytes, expected: u8) -> Result<(), DecodeError> {
    let marker = take_u8(buf)?;
    if marker != expected {
        return Err(DecodeError::UnexpectedMarker(marker));
    }
    Ok(())
}

fn take_cstring(buf: &mut Bytes) -> Result<String, DecodeError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::Truncated)?;
    let raw = buf.copy_to_bytes(end);
    buf.advance(1);
    Ok(std::str::from_utf8(&raw)?.to_owned())
}

macro_rules! take_fixed {
    ($name:ident, $ty:ty, $get:ident, $size:expr) => {
        fn $name(buf: &mut Bytes) -> Result<$ty, DecodeError> {
            if buf.remaining() < $size {
                return Err(DecodeError::Truncated);
            }
            Ok(buf.$get())
        }
    };
}

take_fixed!(take_u8, u8, get_u8, 1);
take_fixed!(take_u16, u16, get_u16, 2);
take_fixed!(take_u32, u32, get_u32, 4);
take_fixed!(take_i32, i32, get_i32, 4);
take_fixed!(take_u64, u64, get_u64, 8);
take_fixed!(take_i64, i64, get_i64, 8);

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn put_cstring(buf: &mut BytesMut, s: &str) {
        buf.put_slice(s.as_bytes());
        buf.put_u8(0);
    }

    fn put_text_tuple(buf: &mut BytesMut, values: &[&str]) {
        buf.put_u16(values.len() as u16);
        for v in values {
            buf.put_u8(b't');
            buf.put_u32(v.len() as u32);
            buf.put_slice(v.as_bytes());
        }
    }

    #[test]
    fn test_decode_begin() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(0x0000_0001_0000_0000);
        buf.put_i64(1_705_000_000_000_000);
        buf.put_u32(731);

        let msg = decode_message(&mut buf.freeze()).unwrap();
        match msg {
            PgOutputMessage::Begin { xid, final_lsn, .. } => {
                assert_eq!(xid, 731);
                assert_eq!(final_lsn, 0x0000_0001_0000_0000);
            }
            other => panic!("expected Begin, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_relation() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(16385);
        put_cstring(&mut buf, "public");
        put_cstring(&mut buf, "users");
        buf.put_u8(b'd');
        buf.put_u16(2);
        // id column, key flag set
        buf.put_u8(1);
        put_cstring(&mut buf, "id");
        buf.put_i32(20);
        buf.put_i32(-1);
        // email column
        buf.put_u8(0);
        put_cstring(&mut buf, "email");
        buf.put_i32(25);
        buf.put_i32(-1);

        let msg = decode_message(&mut buf.freeze()).unwrap();
        match msg {
            PgOutputMessage::Relation(rel) => {
                assert_eq!(rel.id, 16385);
                assert_eq!(rel.namespace, "public");
                assert_eq!(rel.name, "users");
                assert_eq!(rel.columns.len(), 2);
                assert_eq!(rel.columns[0].name, "id");
                assert_eq!(rel.columns[0].flags, 1);
                assert_eq!(rel.columns[1].name, "email");
            }
            other => panic!("expected Relation, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_insert() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(16385);
        buf.put_u8(b'N');
        put_text_tuple(&mut buf, &["42", "alice@example.com"]);

        let msg = decode_message(&mut buf.freeze()).unwrap();
        match msg {
            PgOutputMessage::Insert { relation_id, new } => {
                assert_eq!(relation_id, 16385);
                assert_eq!(new.0.len(), 2);
                assert_eq!(new.0[0], TupleValue::Text(Bytes::from_static(b"42")));
            }
            other => panic!("expected Insert, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_update_with_key_image() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        buf.put_u32(16385);
        buf.put_u8(b'K');
        put_text_tuple(&mut buf, &["42"]);
        buf.put_u8(b'N');
        put_text_tuple(&mut buf, &["42", "bob@example.com"]);

        let msg = decode_message(&mut buf.freeze()).unwrap();
        match msg {
            PgOutputMessage::Update { old, new, .. } => {
                assert_eq!(old.unwrap().0.len(), 1);
                assert_eq!(new.0.len(), 2);
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_update_without_old_image() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        buf.put_u32(16385);
        buf.put_u8(b'N');
        put_text_tuple(&mut buf, &["42", "bob@example.com"]);

        let msg = decode_message(&mut buf.freeze()).unwrap();
        match msg {
            PgOutputMessage::Update { old, .. } => assert!(old.is_none()),
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_delete_key_only() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_u32(16385);
        buf.put_u8(b'K');
        put_text_tuple(&mut buf, &["42"]);

        let msg = decode_message(&mut buf.freeze()).unwrap();
        match msg {
            PgOutputMessage::Delete { key, .. } => {
                assert_eq!(key.0, vec![TupleValue::Text(Bytes::from_static(b"42"))]);
            }
            other => panic!("expected Delete, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_tuple_null_and_unchanged() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(1);
        buf.put_u8(b'N');
        buf.put_u16(2);
        buf.put_u8(b'n');
        buf.put_u8(b'u');

        let msg = decode_message(&mut buf.freeze()).unwrap();
        match msg {
            PgOutputMessage::Insert { new, .. } => {
                assert_eq!(new.0, vec![TupleValue::Null, TupleValue::Unchanged]);
            }
            other => panic!("expected Insert, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'Z');
        let err = decode_message(&mut buf.freeze()).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownType(b'Z')));
    }

    #[test]
    fn test_truncated_message_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u32(1); // begin needs 20 bytes, only 4 present
        let err = decode_message(&mut buf.freeze()).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated));
    }
}
