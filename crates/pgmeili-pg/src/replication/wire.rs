//! Frontend/backend protocol over a raw socket, for replication connections.
//!
//! tokio-postgres cannot enter CopyBoth mode, so the replication connection
//! speaks the protocol directly: startup, authentication, the simple query
//! protocol and CopyData framing. Message encoding uses `postgres_protocol`.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use postgres_protocol::authentication::md5_hash;
use postgres_protocol::authentication::sasl::{ChannelBinding, ScramSha256, SCRAM_SHA_256};
use postgres_protocol::message::frontend;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use super::transport::{ReplicationTransport, TextRow};
use crate::connect::tls_config;
use crate::conninfo::ConnectionParams;
use crate::error::{PgError, PgResult};

const APPLICATION_NAME: &str = "pgmeili";

// Authentication request codes
const AUTH_OK: i32 = 0;
const AUTH_CLEARTEXT: i32 = 3;
const AUTH_MD5: i32 = 5;
const AUTH_SASL: i32 = 10;
const AUTH_SASL_CONTINUE: i32 = 11;
const AUTH_SASL_FINAL: i32 = 12;

trait Socket: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Socket for T {}

/// A replication-mode connection.
pub struct WireConnection {
    stream: Box<dyn Socket>,
    read_buf: BytesMut,
    in_copy: bool,
}

impl std::fmt::Debug for WireConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireConnection")
            .field("in_copy", &self.in_copy)
            .finish()
    }
}

impl WireConnection {
    /// Connect, negotiate TLS per sslmode, and authenticate.
    pub async fn connect(connection_string: &str) -> PgResult<Self> {
        let params = ConnectionParams::parse(connection_string)?;
        info!(
            host = %params.host,
            port = params.port,
            user = %params.user,
            database = %params.database,
            "Opening replication connection"
        );

        let tcp = TcpStream::connect((params.host.as_str(), params.port))
            .await
            .map_err(|e| {
                PgError::Connection(format!("{}:{}: {}", params.host, params.port, e))
            })?;
        tcp.set_nodelay(true)?;

        let stream = if params.requires_tls() {
            negotiate_tls(tcp, &params.host, true).await?
        } else if params.sslmode.as_deref() == Some("prefer") {
            negotiate_tls(tcp, &params.host, false).await?
        } else {
            Box::new(tcp)
        };

        let mut conn = Self::from_stream(stream);
        conn.startup(&params).await?;
        Ok(conn)
    }

    fn from_stream(stream: Box<dyn Socket>) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(8 * 1024),
            in_copy: false,
        }
    }

    async fn startup(&mut self, params: &ConnectionParams) -> PgResult<()> {
        let mut buf = BytesMut::new();
        frontend::startup_message(
            [
                ("user", params.user.as_str()),
                ("database", params.database.as_str()),
                ("replication", "database"),
                ("application_name", APPLICATION_NAME),
            ],
            &mut buf,
        )?;
        self.write(&buf).await?;

        self.authenticate(params).await?;

        // ParameterStatus and BackendKeyData until ReadyForQuery
        loop {
            let (tag, body) = self.read_message().await?;
            match tag {
                b'Z' => break,
                b'E' => return Err(parse_error(body)),
                b'S' | b'K' | b'N' => {}
                other => {
                    return Err(PgError::Protocol(format!(
                        "unexpected message during startup: '{}'",
                        other as char
                    )));
                }
            }
        }

        debug!("Replication connection ready");
        Ok(())
    }

    async fn authenticate(&mut self, params: &ConnectionParams) -> PgResult<()> {
        let mut scram: Option<ScramSha256> = None;

        loop {
            let (tag, mut body) = self.read_message().await?;
            match tag {
                b'R' => {}
                b'E' => {
                    return Err(PgError::Auth(parse_error(body).to_string()));
                }
                other => {
                    return Err(PgError::Protocol(format!(
                        "unexpected message during authentication: '{}'",
                        other as char
                    )));
                }
            }
            if body.len() < 4 {
                return Err(PgError::Protocol("truncated authentication request".into()));
            }

            let mut buf = BytesMut::new();
            match body.get_i32() {
                AUTH_OK => {
                    debug!("Authentication successful");
                    return Ok(());
                }
                AUTH_CLEARTEXT => {
                    frontend::password_message(password(params)?.as_bytes(), &mut buf)?;
                }
                AUTH_MD5 => {
                    if body.len() < 4 {
                        return Err(PgError::Protocol("MD5 request without salt".into()));
                    }
                    let mut salt = [0u8; 4];
                    body.copy_to_slice(&mut salt);
                    let hash = md5_hash(
                        params.user.as_bytes(),
                        password(params)?.as_bytes(),
                        salt,
                    );
                    frontend::password_message(hash.as_bytes(), &mut buf)?;
                }
                AUTH_SASL => {
                    let mechanisms = split_cstrings(&body);
                    if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                        return Err(PgError::Auth(format!(
                            "no supported SASL mechanism in {:?}",
                            mechanisms
                        )));
                    }
                    let exchange = ScramSha256::new(
                        password(params)?.as_bytes(),
                        ChannelBinding::unsupported(),
                    );
                    frontend::sasl_initial_response(SCRAM_SHA_256, exchange.message(), &mut buf)?;
                    scram = Some(exchange);
                }
                AUTH_SASL_CONTINUE => {
                    let exchange = scram
                        .as_mut()
                        .ok_or_else(|| PgError::Protocol("SASL continue before start".into()))?;
                    exchange
                        .update(&body)
                        .map_err(|e| PgError::Auth(e.to_string()))?;
                    frontend::sasl_response(exchange.message(), &mut buf)?;
                }
                AUTH_SASL_FINAL => {
                    let exchange = scram
                        .as_mut()
                        .ok_or_else(|| PgError::Protocol("SASL final before start".into()))?;
                    exchange
                        .finish(&body)
                        .map_err(|e| PgError::Auth(e.to_string()))?;
                    continue;
                }
                other => {
                    return Err(PgError::Auth(format!(
                        "unsupported authentication method: {}",
                        other
                    )));
                }
            }
            self.write(&buf).await?;
        }
    }

    /// Read one complete backend message. Cancel-safe: partial reads stay
    /// in `read_buf`.
    async fn read_message(&mut self) -> PgResult<(u8, Bytes)> {
        loop {
            if let Some(message) = split_message(&mut self.read_buf)? {
                return Ok(message);
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(PgError::Connection("server closed the connection".into()));
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> PgResult<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

impl ReplicationTransport for WireConnection {
    async fn simple_query(&mut self, sql: &str) -> PgResult<Vec<TextRow>> {
        debug!(sql, "Simple query");
        let mut buf = BytesMut::new();
        frontend::query(sql, &mut buf)?;
        self.write(&buf).await?;

        let mut rows = Vec::new();
        let mut error = None;
        loop {
            let (tag, body) = self.read_message().await?;
            match tag {
                b'D' => rows.push(parse_data_row(body)?),
                b'E' => error = Some(parse_error(body)),
                b'Z' => break,
                // RowDescription, CommandComplete, EmptyQueryResponse, notices
                b'T' | b'C' | b'I' | b'N' | b'S' => {}
                other => {
                    return Err(PgError::Protocol(format!(
                        "unexpected message in simple query: '{}'",
                        other as char
                    )));
                }
            }
        }

        match error {
            Some(e) => Err(e),
            None => Ok(rows),
        }
    }

    async fn start_copy_both(&mut self, sql: &str) -> PgResult<()> {
        debug!(sql, "Starting CopyBoth");
        let mut buf = BytesMut::new();
        frontend::query(sql, &mut buf)?;
        self.write(&buf).await?;

        let mut error = None;
        loop {
            let (tag, body) = self.read_message().await?;
            match tag {
                b'W' => {
                    self.in_copy = true;
                    return Ok(());
                }
                b'E' => error = Some(parse_error(body)),
                b'Z' => {
                    return Err(error.unwrap_or_else(|| {
                        PgError::Protocol("command did not enter CopyBoth mode".into())
                    }));
                }
                b'N' | b'S' => {}
                other => {
                    return Err(PgError::Protocol(format!(
                        "unexpected response to {}: '{}'",
                        sql, other as char
                    )));
                }
            }
        }
    }

    async fn recv_copy_data(&mut self) -> PgResult<Option<Bytes>> {
        loop {
            let (tag, body) = self.read_message().await?;
            match tag {
                b'd' => return Ok(Some(body)),
                b'c' => {
                    self.in_copy = false;
                    return Ok(None);
                }
                b'E' => return Err(parse_error(body)),
                b'N' | b'S' => {}
                other => {
                    return Err(PgError::Protocol(format!(
                        "unexpected message in CopyBoth: '{}'",
                        other as char
                    )));
                }
            }
        }
    }

    async fn send_copy_data(&mut self, data: &[u8]) -> PgResult<()> {
        let mut buf = BytesMut::with_capacity(data.len() + 5);
        buf.put_u8(b'd');
        buf.put_i32((data.len() + 4) as i32);
        buf.put_slice(data);
        self.write(&buf).await
    }

    async fn close(&mut self) -> PgResult<()> {
        let mut buf = BytesMut::new();
        if self.in_copy {
            frontend::copy_done(&mut buf);
            self.in_copy = false;
        }
        frontend::terminate(&mut buf);
        self.write(&buf).await?;
        if let Err(e) = self.stream.shutdown().await {
            warn!(error = %e, "Failed to shut down replication socket");
        }
        Ok(())
    }
}

async fn negotiate_tls(
    mut tcp: TcpStream,
    host: &str,
    required: bool,
) -> PgResult<Box<dyn Socket>> {
    let mut buf = BytesMut::new();
    frontend::ssl_request(&mut buf);
    tcp.write_all(&buf).await?;
    tcp.flush().await?;

    match tcp.read_u8().await? {
        b'S' => {
            let connector = TlsConnector::from(Arc::new(tls_config()?));
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|_| PgError::Connection(format!("invalid TLS server name: {}", host)))?;
            let tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| PgError::Connection(format!("TLS handshake failed: {}", e)))?;
            debug!("TLS established");
            Ok(Box::new(tls))
        }
        b'N' if !required => {
            debug!("Server declined TLS, continuing without");
            Ok(Box::new(tcp))
        }
        b'N' => Err(PgError::Connection(
            "server does not support TLS but sslmode requires it".into(),
        )),
        other => Err(PgError::Protocol(format!(
            "unexpected SSLRequest response: 0x{:02X}",
            other
        ))),
    }
}

fn password(params: &ConnectionParams) -> PgResult<&str> {
    if params.password.is_empty() {
        return Err(PgError::Auth("server requested a password but none was given".into()));
    }
    Ok(&params.password)
}

/// Split one `tag | len | body` message off the front of `buf`.
fn split_message(buf: &mut BytesMut) -> PgResult<Option<(u8, Bytes)>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let len = (&buf[1..5]).get_i32();
    if len < 4 {
        return Err(PgError::Protocol(format!("invalid message length: {}", len)));
    }
    let total = 1 + len as usize;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    let mut frame = buf.split_to(total);
    let tag = frame[0];
    frame.advance(5);
    Ok(Some((tag, frame.freeze())))
}

fn parse_data_row(mut body: Bytes) -> PgResult<TextRow> {
    let truncated = || PgError::Protocol("truncated DataRow".into());
    if body.len() < 2 {
        return Err(truncated());
    }
    let count = body.get_i16().max(0) as usize;
    let mut row = Vec::with_capacity(count);
    for _ in 0..count {
        if body.len() < 4 {
            return Err(truncated());
        }
        let len = body.get_i32();
        if len < 0 {
            row.push(None);
            continue;
        }
        let len = len as usize;
        if body.len() < len {
            return Err(truncated());
        }
        let value = body.split_to(len);
        row.push(Some(String::from_utf8_lossy(&value).into_owned()));
    }
    Ok(row)
}

/// Turn an ErrorResponse body into `PgError::Server`.
fn parse_error(body: Bytes) -> PgError {
    let mut severity = String::new();
    let mut code = String::new();
    let mut message = String::new();

    let mut fields = body.as_ref();
    while let Some((&field, rest)) = fields.split_first() {
        if field == 0 {
            break;
        }
        let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
        let value = String::from_utf8_lossy(&rest[..end]).into_owned();
        match field {
            b'S' => severity = value,
            b'C' => code = value,
            b'M' => message = value,
            _ => {}
        }
        fields = rest.get(end + 1..).unwrap_or_default();
    }

    PgError::Server {
        severity,
        code,
        message,
    }
}

fn split_cstrings(body: &[u8]) -> Vec<String> {
    body.split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}
