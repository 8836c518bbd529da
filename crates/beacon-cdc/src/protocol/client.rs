//! Replication connection client.
//!
//! Speaks the frontend/backend protocol directly over TCP because the
//! replication sub-protocol (CopyBoth) is not exposed by regular client
//! libraries. Supports cleartext and MD5 password authentication; SCRAM is
//! not implemented and surfaces as a configuration-class error.
//!
//! The socket is split at connect time: all reads go through a buffered
//! read half, writes through the write half. After the subscribe handshake
//! the stream splits into independent reader/writer ends so the consumer
//! can acknowledge WAL positions while a frame read is in flight.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use postgres_protocol::message::{backend, frontend};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

use crate::{CdcError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Seconds between the Unix and PostgreSQL epochs (2000-01-01).
const PG_EPOCH_OFFSET_SECS: u64 = 946_684_800;

type Reader = BufReader<OwnedReadHalf>;
type Writer = OwnedWriteHalf;

/// A connection authenticated in replication mode, ready to subscribe.
pub struct ReplicationClient {
    reader: Reader,
    writer: Writer,
}

impl ReplicationClient {
    /// Open a replication-mode connection and authenticate.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        database: &str,
        password: Option<&str>,
    ) -> Result<Self> {
        debug!(host, port, user, database, "opening replication connection");
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                CdcError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {host}:{port} timed out"),
                ))
            })??;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;

        let params = [
            ("user", user),
            ("database", database),
            ("replication", "database"),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(params.into_iter(), &mut buf)?;
        writer.write_all(&buf).await?;
        writer.flush().await?;

        authenticate(&mut reader, &mut writer, user, password).await?;
        wait_ready(&mut reader).await?;

        Ok(Self { reader, writer })
    }

    /// Issue `START_REPLICATION` for the slot/publication pair and enter
    /// CopyBoth mode. Streams from the slot's confirmed position (0/0).
    pub async fn start_replication(
        mut self,
        slot: &str,
        publication: &str,
    ) -> Result<ReplicationStream> {
        let query = format!(
            "START_REPLICATION SLOT {slot} LOGICAL 0/0 \
             (proto_version '1', publication_names '{publication}')"
        );
        let mut buf = BytesMut::new();
        frontend::query(&query, &mut buf)?;
        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;

        loop {
            let (tag, body) = read_message(&mut self.reader).await?;
            match tag {
                // CopyBothResponse
                b'W' => {
                    info!(slot, publication, "replication stream started");
                    return Ok(ReplicationStream {
                        reader: self.reader,
                        writer: self.writer,
                    });
                }
                b'E' => return Err(server_error(&body)),
                // NoticeResponse and parameter chatter before the copy starts
                b'N' | b'S' => continue,
                other => {
                    return Err(CdcError::replication(format!(
                        "unexpected response to START_REPLICATION: {:?}",
                        other as char
                    )))
                }
            }
        }
    }
}

/// The CopyBoth stream after a successful subscribe.
pub struct ReplicationStream {
    reader: Reader,
    writer: Writer,
}

impl ReplicationStream {
    /// Split into independent frame reader and status writer.
    pub fn into_split(self) -> (ReplicationReader, ReplicationWriter) {
        (
            ReplicationReader {
                reader: self.reader,
            },
            ReplicationWriter {
                writer: self.writer,
            },
        )
    }
}

/// A CopyBoth frame relevant to the consumer.
#[derive(Debug)]
pub enum ReplicationFrame {
    /// WAL payload carrying one pgoutput message.
    XLogData { wal_end: u64, payload: Bytes },
    /// Server keepalive; `reply_requested` demands an immediate status
    /// update on pain of disconnection.
    Keepalive { wal_end: u64, reply_requested: bool },
}

/// Reading end of the copy stream.
pub struct ReplicationReader {
    reader: Reader,
}

impl ReplicationReader {
    /// Next frame, `None` once the server ends the copy.
    pub async fn next_frame(&mut self) -> Result<Option<ReplicationFrame>> {
        loop {
            let (tag, body) = read_message(&mut self.reader).await?;
            match tag {
                // CopyData
                b'd' => {
                    let mut payload = Bytes::from(body);
                    if payload.remaining() < 1 {
                        return Err(CdcError::replication("empty CopyData frame"));
                    }
                    match payload.get_u8() {
                        b'w' => {
                            if payload.remaining() < 24 {
                                return Err(CdcError::replication("short XLogData header"));
                            }
                            let _wal_start = payload.get_u64();
                            let wal_end = payload.get_u64();
                            let _server_ts = payload.get_i64();
                            return Ok(Some(ReplicationFrame::XLogData { wal_end, payload }));
                        }
                        b'k' => {
                            if payload.remaining() < 17 {
                                return Err(CdcError::replication("short keepalive frame"));
                            }
                            let wal_end = payload.get_u64();
                            let _server_ts = payload.get_i64();
                            let reply_requested = payload.get_u8() == 1;
                            return Ok(Some(ReplicationFrame::Keepalive {
                                wal_end,
                                reply_requested,
                            }));
                        }
                        other => {
                            debug!(kind = other, "ignoring unknown CopyData sub-message");
                            continue;
                        }
                    }
                }
                // CopyDone
                b'c' => return Ok(None),
                b'E' => return Err(server_error(&body)),
                b'N' => continue,
                other => {
                    return Err(CdcError::replication(format!(
                        "unexpected message in copy stream: {:?}",
                        other as char
                    )))
                }
            }
        }
    }
}

/// Writing end of the copy stream, for standby status updates.
pub struct ReplicationWriter {
    writer: Writer,
}

impl ReplicationWriter {
    /// Send a standby status update acknowledging `lsn` as written,
    /// flushed and applied.
    pub async fn send_status_update(&mut self, lsn: u64) -> Result<()> {
        let mut payload = BytesMut::with_capacity(34);
        payload.put_u8(b'r');
        payload.put_u64(lsn);
        payload.put_u64(lsn);
        payload.put_u64(lsn);
        payload.put_i64(pg_timestamp_micros());
        payload.put_u8(0);

        let mut frame = BytesMut::with_capacity(1 + 4 + payload.len());
        frame.put_u8(b'd');
        frame.put_i32((payload.len() + 4) as i32);
        frame.put_slice(&payload);

        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

async fn authenticate(
    reader: &mut Reader,
    writer: &mut Writer,
    user: &str,
    password: Option<&str>,
) -> Result<()> {
    loop {
        let (tag, body) = read_message(reader).await?;

        let mut raw = BytesMut::with_capacity(1 + 4 + body.len());
        raw.put_u8(tag);
        raw.put_i32((body.len() + 4) as i32);
        raw.put_slice(&body);

        let message = backend::Message::parse(&mut raw)?
            .ok_or_else(|| CdcError::auth("incomplete authentication message"))?;

        match message {
            backend::Message::AuthenticationOk => {
                debug!("replication connection authenticated");
                return Ok(());
            }
            backend::Message::AuthenticationCleartextPassword => {
                let password = required_password(password)?;
                send_password(writer, password.as_bytes()).await?;
            }
            backend::Message::AuthenticationMd5Password(md5_body) => {
                let password = required_password(password)?;
                let hashed = md5_password(user, password, &md5_body.salt());
                send_password(writer, hashed.as_bytes()).await?;
            }
            backend::Message::AuthenticationSasl(_) => {
                return Err(CdcError::auth(
                    "server requires SCRAM authentication, which is not supported; \
                     configure md5 or password auth for the replication role",
                ));
            }
            backend::Message::ErrorResponse(_) => return Err(server_error(&body)),
            _ => return Err(CdcError::auth("unexpected message during authentication")),
        }
    }
}

async fn wait_ready(reader: &mut Reader) -> Result<()> {
    loop {
        let (tag, body) = read_message(reader).await?;
        match tag {
            // ReadyForQuery
            b'Z' => return Ok(()),
            b'E' => return Err(server_error(&body)),
            // ParameterStatus / BackendKeyData / NoticeResponse
            _ => continue,
        }
    }
}

async fn send_password(writer: &mut Writer, password: &[u8]) -> Result<()> {
    let mut buf = BytesMut::new();
    frontend::password_message(password, &mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_message(reader: &mut Reader) -> Result<(u8, Vec<u8>)> {
    let tag = reader.read_u8().await?;
    let len = reader.read_i32().await?;
    if len < 4 {
        return Err(CdcError::replication(format!("invalid frame length {len}")));
    }
    let mut body = vec![0u8; len as usize - 4];
    reader.read_exact(&mut body).await?;
    Ok((tag, body))
}

fn required_password(password: Option<&str>) -> Result<&str> {
    password.ok_or_else(|| CdcError::auth("server requires a password but none is configured"))
}

fn md5_password(user: &str, password: &str, salt: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(password);
    hasher.update(user);
    let inner = hex::encode(hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner);
    hasher.update(salt);
    format!("md5{}", hex::encode(hasher.finalize()))
}

/// Parse an ErrorResponse body into a classified error. Fields are
/// `(type byte, cstring)` pairs terminated by a zero byte; we care about
/// the SQLSTATE (`C`) and the message (`M`).
fn server_error(body: &[u8]) -> CdcError {
    let mut sqlstate = None;
    let mut message = String::from("server error");

    let mut rest = body;
    while let Some((&field, tail)) = rest.split_first() {
        if field == 0 {
            break;
        }
        let end = match tail.iter().position(|&b| b == 0) {
            Some(end) => end,
            None => break,
        };
        let value = String::from_utf8_lossy(&tail[..end]).into_owned();
        match field {
            b'C' => sqlstate = Some(value),
            b'M' => message = value,
            _ => {}
        }
        rest = &tail[end + 1..];
    }

    CdcError::from_server(sqlstate.as_deref(), &message)
}

fn pg_timestamp_micros() -> i64 {
    let pg_epoch =
        std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(PG_EPOCH_OFFSET_SECS);
    std::time::SystemTime::now()
        .duration_since(pg_epoch)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_body(fields: &[(u8, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (tag, value) in fields {
            body.push(*tag);
            body.extend_from_slice(value.as_bytes());
            body.push(0);
        }
        body.push(0);
        body
    }

    #[test]
    fn test_server_error_slot_in_use() {
        let body = error_body(&[
            (b'S', "ERROR"),
            (b'C', "55006"),
            (b'M', "replication slot \"s\" is active for PID 99"),
        ]);
        let err = server_error(&body);
        assert!(matches!(err, CdcError::SlotInUse(_)));
    }

    #[test]
    fn test_server_error_generic() {
        let body = error_body(&[(b'C', "42704"), (b'M', "publication \"p\" does not exist")]);
        let err = server_error(&body);
        assert!(matches!(err, CdcError::Replication(_)));
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_server_error_malformed_body() {
        // Missing terminators must not panic.
        let err = server_error(&[b'M', b'x']);
        assert!(matches!(err, CdcError::Replication(_)));
    }

    #[test]
    fn test_md5_password_shape() {
        let hashed = md5_password("dev", "dev", &[1, 2, 3, 4]);
        assert!(hashed.starts_with("md5"));
        assert_eq!(hashed.len(), 35);
    }
}
