//! Key-value store seam and the memcached client behind it
//!
//! Writers only see [`KvStore`]. The production implementation speaks the
//! memcached text protocol over a small pool of TCP connections; tests plug
//! in-process stores in instead.

use crate::error::StoreError;
use crate::retry::Transient;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Longest key memcached accepts
pub const MAX_KEY_LEN: usize = 250;

/// Write access to one key space
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Store `value` under `key` with no expiry, overwriting any prior value
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Address used in logs
    fn addr(&self) -> &str;
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        !matches!(self, StoreError::InvalidKey(_))
    }
}

/// Check a key against memcached's text protocol rules
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && !key
            .bytes()
            .any(|b| b.is_ascii_whitespace() || b.is_ascii_control());

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

type Connection = BufStream<TcpStream>;

/// Memcached client for a single server
///
/// Connections are opened lazily and returned to an idle pool after each
/// successful exchange, so concurrent writers each get their own socket. A
/// pooled connection the server has since closed is replaced once within the
/// same call.
pub struct MemcacheClient {
    addr: String,
    timeout: Duration,
    idle: Mutex<Vec<Connection>>,
}

impl MemcacheClient {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Take an idle connection, or open one if the pool is empty
    ///
    /// The flag is `true` when the connection came from the pool.
    async fn checkout(&self) -> Result<(Connection, bool), StoreError> {
        if let Some(conn) = self.idle.lock().await.pop() {
            return Ok((conn, true));
        }

        Ok((self.connect().await?, false))
    }

    async fn connect(&self) -> Result<Connection, StoreError> {
        debug!("Opening connection to {}", self.addr);
        let stream = self
            .with_timeout(async {
                TcpStream::connect(&self.addr)
                    .await
                    .map_err(|source| StoreError::Connect {
                        addr: self.addr.clone(),
                        source,
                    })
            })
            .await?;

        stream.set_nodelay(true).map_err(|source| StoreError::Connect {
            addr: self.addr.clone(),
            source,
        })?;

        Ok(BufStream::new(stream))
    }

    async fn checkin(&self, conn: Connection) {
        self.idle.lock().await.push(conn);
    }

    async fn with_timeout<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout {
                addr: self.addr.clone(),
                timeout_ms: self.timeout.as_millis(),
            })?
    }

    async fn exchange(
        &self,
        conn: &mut Connection,
        key: &str,
        value: &[u8],
    ) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            addr: self.addr.clone(),
            source,
        };

        let header = format!("set {} 0 0 {}\r\n", key, value.len());
        conn.write_all(header.as_bytes()).await.map_err(io_err)?;
        conn.write_all(value).await.map_err(io_err)?;
        conn.write_all(b"\r\n").await.map_err(io_err)?;
        conn.flush().await.map_err(io_err)?;

        let mut reply = String::new();
        if conn.read_line(&mut reply).await.map_err(io_err)? == 0 {
            return Err(StoreError::ConnectionClosed {
                addr: self.addr.clone(),
            });
        }

        match reply.trim_end() {
            "STORED" => Ok(()),
            other => Err(StoreError::Rejected {
                addr: self.addr.clone(),
                reply: other.to_string(),
            }),
        }
    }
}

#[async_trait]
impl KvStore for MemcacheClient {
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        validate_key(key)?;

        let (mut conn, reused) = self.checkout().await?;
        let mut result = self.with_timeout(self.exchange(&mut conn, key, value)).await;

        // The server may have closed an idle socket since it was pooled
        if reused
            && matches!(
                result,
                Err(StoreError::ConnectionClosed { .. } | StoreError::Io { .. })
            )
        {
            debug!("Pooled connection to {} is stale, reconnecting", self.addr);
            conn = self.connect().await?;
            result = self.with_timeout(self.exchange(&mut conn, key, value)).await;
        }

        // A rejection is a complete reply, so the connection is still in sync.
        // Anything else leaves it in an unknown state and it is dropped.
        if matches!(result, Ok(()) | Err(StoreError::Rejected { .. })) {
            self.checkin(conn).await;
        }

        result
    }

    fn addr(&self) -> &str {
        &self.addr
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, BufReader};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct FakeServer {
        accepted: AtomicUsize,
        stored: std::sync::Mutex<Vec<(String, Vec<u8>)>>,
        generation: std::sync::Mutex<CancellationToken>,
    }

    impl FakeServer {
        /// Close every connection accepted so far; new ones are still served
        fn close_existing(&self) {
            let mut generation = self.generation.lock().unwrap();
            generation.cancel();
            *generation = CancellationToken::new();
        }
    }

    /// Minimal memcached that answers every `set` with `reply`
    async fn spawn_fake(reply: &'static str) -> (String, Arc<FakeServer>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(FakeServer::default());

        let server = state.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                server.accepted.fetch_add(1, Ordering::SeqCst);
                let closed = server.generation.lock().unwrap().clone();
                let server = server.clone();
                tokio::spawn(async move {
                    let mut socket = BufReader::new(socket);
                    loop {
                        let mut header = String::new();
                        let read = tokio::select! {
                            biased;
                            _ = closed.cancelled() => break,
                            read = socket.read_line(&mut header) => read.unwrap_or(0),
                        };
                        if read == 0 {
                            break;
                        }
                        let parts: Vec<&str> = header.split_whitespace().collect();
                        let len: usize = parts[4].parse().unwrap();
                        let mut data = vec![0u8; len + 2];
                        socket.read_exact(&mut data).await.unwrap();
                        data.truncate(len);
                        server
                            .stored
                            .lock()
                            .unwrap()
                            .push((parts[1].to_string(), data));
                        socket.get_mut().write_all(reply.as_bytes()).await.unwrap();
                    }
                });
            }
        });

        (addr, state)
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("idfa:1rfw452y52g2gq4g").is_ok());
        assert!(validate_key("gaid:a:b:c").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("idfa:has space").is_err());
        assert!(validate_key("idfa:tab\there").is_err());
        assert!(validate_key(&"k".repeat(MAX_KEY_LEN)).is_ok());
        assert!(validate_key(&"k".repeat(MAX_KEY_LEN + 1)).is_err());
    }

    #[test]
    fn test_invalid_key_is_permanent() {
        assert!(!StoreError::InvalidKey("x y".into()).is_transient());
        assert!(StoreError::ConnectionClosed { addr: "a".into() }.is_transient());
    }

    #[tokio::test]
    async fn test_set_stores_value() {
        let (addr, server) = spawn_fake("STORED\r\n").await;
        let client = MemcacheClient::new(addr, Duration::from_secs(1));

        client.set("idfa:abc", b"\x08\x01payload").await.unwrap();

        let stored = server.stored.lock().unwrap().clone();
        assert_eq!(stored, vec![("idfa:abc".to_string(), b"\x08\x01payload".to_vec())]);
    }

    #[tokio::test]
    async fn test_connection_is_reused() {
        let (addr, server) = spawn_fake("STORED\r\n").await;
        let client = MemcacheClient::new(addr, Duration::from_secs(1));

        for i in 0..5 {
            client.set(&format!("gaid:{}", i), b"v").await.unwrap();
        }

        assert_eq!(server.accepted.load(Ordering::SeqCst), 1);
        assert_eq!(server.stored.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_stale_pooled_connections_are_replaced() {
        let (addr, server) = spawn_fake("STORED\r\n").await;
        let client = MemcacheClient::new(addr, Duration::from_secs(1));

        let (a, b, c) = tokio::join!(
            client.set("idfa:a", b"v"),
            client.set("idfa:b", b"v"),
            client.set("idfa:c", b"v"),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();
        assert_eq!(client.idle.lock().await.len(), 3);

        server.close_existing();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Every pooled socket is dead, yet each write lands on the first attempt
        let retry = RetryPolicy::new(1, Duration::from_millis(10));
        let cancel = CancellationToken::new();
        for i in 0..3 {
            let key = format!("idfa:x{}", i);
            retry.run(&cancel, |_| client.set(&key, b"v")).await.unwrap();
        }

        assert_eq!(server.accepted.load(Ordering::SeqCst), 6);
        assert_eq!(server.stored.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_rejected_reply() {
        let (addr, _server) = spawn_fake("SERVER_ERROR out of memory\r\n").await;
        let client = MemcacheClient::new(addr, Duration::from_secs(1));

        match client.set("adid:abc", b"v").await {
            Err(StoreError::Rejected { reply, .. }) => {
                assert_eq!(reply, "SERVER_ERROR out of memory")
            },
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_key_never_connects() {
        let (addr, server) = spawn_fake("STORED\r\n").await;
        let client = MemcacheClient::new(addr, Duration::from_secs(1));

        let result = client.set("dvid:bad key", b"v").await;
        assert!(matches!(result, Err(StoreError::InvalidKey(_))));
        assert_eq!(server.accepted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = MemcacheClient::new(addr, Duration::from_secs(1));
        let result = client.set("idfa:abc", b"v").await;
        assert!(matches!(
            result,
            Err(StoreError::Connect { .. }) | Err(StoreError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = MemcacheClient::new(addr, Duration::from_millis(50));
        let result = client.set("idfa:abc", b"v").await;
        assert!(matches!(result, Err(StoreError::Timeout { .. })));
    }
}
