//! PostgreSQL logical replication plumbing.
//!
//! A raw-TCP replication client (startup, password auth, `START_REPLICATION`,
//! CopyBoth pump, standby status updates) and a decoder for the `pgoutput`
//! plugin's protocol version 1 messages.

mod client;
mod decoder;
mod message;

pub use client::{
    ReplicationClient, ReplicationFrame, ReplicationReader, ReplicationStream, ReplicationWriter,
};
pub use decoder::{decode_message, DecodeError};
pub use message::{
    ColumnSpec, PgOutputMessage, Relation, TupleData, TupleValue,
};
