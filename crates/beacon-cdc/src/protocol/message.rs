//! pgoutput protocol v1 message types.

use bytes::Bytes;

/// A decoded pgoutput message.
#[derive(Debug, Clone)]
pub enum PgOutputMessage {
    /// Transaction start; changes until Commit belong to one transaction.
    Begin {
        final_lsn: u64,
        commit_ts: i64,
        xid: u32,
    },
    /// Transaction end; buffered changes become visible here.
    Commit {
        commit_lsn: u64,
        end_lsn: u64,
        commit_ts: i64,
    },
    /// Table schema announcement; sent before the first change of a
    /// relation on each connection and again after DDL.
    Relation(Relation),
    /// Row inserted; `new` is the full tuple.
    Insert { relation_id: u32, new: TupleData },
    /// Row updated; `old` carries the key or full old image when the
    /// replica identity provides one.
    Update {
        relation_id: u32,
        old: Option<TupleData>,
        new: TupleData,
    },
    /// Row deleted; only the replica-identity tuple is available.
    Delete { relation_id: u32, key: TupleData },
    /// Tables truncated.
    Truncate { relation_ids: Vec<u32> },
    /// Replication origin marker; ignored downstream.
    Origin,
    /// Type announcement for custom types; ignored downstream.
    Type,
}

/// Schema of a replicated table, cached by relation id.
#[derive(Debug, Clone)]
pub struct Relation {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<ColumnSpec>,
}

/// One column of a relation.
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    /// Bit 1 marks the column as part of the key.
    pub flags: u8,
    pub name: String,
    pub type_oid: i32,
}

/// A row image: one value per column, in relation column order.
#[derive(Debug, Clone)]
pub struct TupleData(pub Vec<TupleValue>);

/// One column value within a tuple.
#[derive(Debug, Clone, PartialEq)]
pub enum TupleValue {
    /// SQL NULL.
    Null,
    /// TOASTed value not included in the image (unchanged).
    Unchanged,
    /// Textual representation of the value.
    Text(Bytes),
}
