/// RESP connections, per-node connection pooling and the networked
/// `StoreClient` implementation.
use super::resp::{RespEncoder, RespParser, RespValue};
use super::scripts::Script;
use super::{ttl_millis, KeyTtl, StoreClient};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use bytes::BytesMut;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

/// A single RESP connection to a store node
#[derive(Debug)]
pub struct RespConnection {
    stream: TcpStream,
    buffer: BytesMut,
    addr: String,
}

impl RespConnection {
    /// Connect to a store node, bounded by `connect_timeout`
    pub async fn connect(addr: &str, connect_timeout: Duration) -> StoreResult<Self> {
        debug!("Connecting to store node {}", addr);

        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = Self::configure_stream(&stream) {
                    warn!("Failed to configure stream to {}: {}", addr, e);
                }
                Ok(Self {
                    stream,
                    buffer: BytesMut::with_capacity(4096),
                    addr: addr.to_string(),
                })
            }
            Ok(Err(e)) => Err(StoreError::connection(format!(
                "connect to {} failed: {}",
                addr, e
            ))),
            Err(_) => Err(StoreError::connection(format!(
                "connect to {} timed out after {:?}",
                addr, connect_timeout
            ))),
        }
    }

    fn configure_stream(stream: &TcpStream) -> Result<(), io::Error> {
        stream.set_nodelay(true)?;
        socket2::SockRef::from(stream).set_keepalive(true)?;
        Ok(())
    }

    /// Send one command and wait for its reply
    pub async fn request(&mut self, command: &RespValue) -> StoreResult<RespValue> {
        let encoded = RespEncoder::encode(command);
        self.stream.write_all(&encoded).await?;

        loop {
            if let Some(reply) = RespParser::parse(&mut self.buffer)? {
                return Ok(reply);
            }
            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(StoreError::connection(format!(
                    "connection to {} closed by peer",
                    self.addr
                )));
            }
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

/// Pool settings shared by every node
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub max_idle: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_secs(3),
            max_idle: 8,
        }
    }
}

/// Idle connections to one node. Connections that saw an I/O error are
/// dropped instead of being returned.
pub struct ConnectionPool {
    addr: String,
    credential: Option<String>,
    settings: PoolSettings,
    idle: Mutex<Vec<RespConnection>>,
}

impl ConnectionPool {
    pub fn new(addr: String, credential: Option<String>, settings: PoolSettings) -> Self {
        Self {
            addr,
            credential,
            settings,
            idle: Mutex::new(Vec::new()),
        }
    }

    async fn acquire(&self) -> StoreResult<RespConnection> {
        if let Some(conn) = self.idle.lock().await.pop() {
            return Ok(conn);
        }

        let mut conn = RespConnection::connect(&self.addr, self.settings.connect_timeout).await?;
        if let Some(credential) = self.credential.as_deref().filter(|c| !c.is_empty()) {
            let auth = RespEncoder::create_command("AUTH", &[credential]);
            match timeout(self.settings.io_timeout, conn.request(&auth)).await {
                Ok(Ok(RespValue::Error(msg))) => return Err(StoreError::command("AUTH", msg)),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(StoreError::connection("AUTH timed out")),
            }
        }
        Ok(conn)
    }

    async fn release(&self, conn: RespConnection) {
        let mut idle = self.idle.lock().await;
        if idle.len() < self.settings.max_idle {
            idle.push(conn);
        }
    }

    /// Run one command on a pooled connection
    pub async fn call(&self, name: &str, command: RespValue) -> StoreResult<RespValue> {
        let mut conn = self.acquire().await?;

        match timeout(self.settings.io_timeout, conn.request(&command)).await {
            Ok(Ok(RespValue::Error(message))) => {
                self.release(conn).await;
                Err(StoreError::command(name, message))
            }
            Ok(Ok(reply)) => {
                self.release(conn).await;
                Ok(reply)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StoreError::connection(format!(
                "{} on {} timed out after {:?}",
                name, self.addr, self.settings.io_timeout
            ))),
        }
    }

    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }
}

/// `StoreClient` speaking RESP to a Redis-compatible node
pub struct RespClient {
    pool: ConnectionPool,
}

impl RespClient {
    pub fn new(addr: String, credential: Option<String>, settings: PoolSettings) -> Self {
        Self {
            pool: ConnectionPool::new(addr, credential, settings),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    async fn call<S: AsRef<str>>(&self, name: &str, args: &[S]) -> StoreResult<RespValue> {
        self.pool
            .call(name, RespEncoder::create_command(name, args))
            .await
    }

    async fn call_integer<S: AsRef<str>>(&self, name: &str, args: &[S]) -> StoreResult<i64> {
        let reply = self.call(name, args).await?;
        reply
            .as_integer()
            .ok_or_else(|| StoreError::unexpected(name, &reply))
    }
}

fn optional_string(command: &str, reply: RespValue) -> StoreResult<Option<String>> {
    match reply {
        RespValue::BulkString(None) => Ok(None),
        RespValue::BulkString(Some(_)) | RespValue::SimpleString(_) => Ok(reply.into_string()),
        other => Err(StoreError::unexpected(command, other)),
    }
}

#[async_trait]
impl StoreClient for RespClient {
    async fn ping(&self) -> StoreResult<()> {
        match self.call::<&str>("PING", &[]).await? {
            RespValue::SimpleString(s) if s == "PONG" => Ok(()),
            other => Err(StoreError::unexpected("PING", other)),
        }
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let reply = self.call("GET", &[key]).await?;
        optional_string("GET", reply)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let millis = ttl_millis(ttl).to_string();
        match self.call("SET", &[key, value, "PX", millis.as_str()]).await? {
            RespValue::SimpleString(_) => Ok(()),
            other => Err(StoreError::unexpected("SET", other)),
        }
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let millis = ttl_millis(ttl).to_string();
        match self.call("SET", &[key, value, "NX", "PX", millis.as_str()]).await? {
            RespValue::SimpleString(_) => Ok(true),
            RespValue::BulkString(None) => Ok(false),
            other => Err(StoreError::unexpected("SET", other)),
        }
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        let millis = self.call_integer("PTTL", &[key]).await?;
        Ok(KeyTtl::from_reply(millis))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.call_integer("EXISTS", &[key]).await? > 0)
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        Ok(self.call_integer("DEL", &[key]).await? > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let millis = ttl_millis(ttl).to_string();
        Ok(self.call_integer("PEXPIRE", &[key, millis.as_str()]).await? == 1)
    }

    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()> {
        let mut args = Vec::with_capacity(fields.len() * 2 + 1);
        args.push(key.to_string());
        for (field, value) in fields {
            args.push(field.to_string());
            args.push(value.clone());
        }
        self.call_integer("HSET", args.as_slice()).await.map(|_| ())
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> StoreResult<Vec<Option<String>>> {
        let mut args = Vec::with_capacity(fields.len() + 1);
        args.push(key);
        args.extend_from_slice(fields);

        let reply = self.call("HMGET", args.as_slice()).await?;
        let elements = match reply {
            RespValue::Array(Some(elements)) => elements,
            other => return Err(StoreError::unexpected("HMGET", other)),
        };
        elements
            .into_iter()
            .map(|element| optional_string("HMGET", element))
            .collect()
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let delta = delta.to_string();
        self.call_integer("HINCRBY", &[key, field, delta.as_str()]).await
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> StoreResult<()> {
        let score = score.to_string();
        self.call_integer("ZADD", &[key, score.as_str(), member])
            .await
            .map(|_| ())
    }

    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> StoreResult<u64> {
        let (min, max) = (min.to_string(), max.to_string());
        let removed = self
            .call_integer("ZREMRANGEBYSCORE", &[key, min.as_str(), max.as_str()])
            .await?;
        Ok(removed.max(0) as u64)
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        Ok(self.call_integer("ZCARD", &[key]).await?.max(0) as u64)
    }

    async fn eval(&self, script: &Script, keys: &[&str], args: &[String]) -> StoreResult<RespValue> {
        let mut command = Vec::with_capacity(keys.len() + args.len() + 2);
        command.push(script.source.to_string());
        command.push(keys.len().to_string());
        command.extend(keys.iter().map(|k| k.to_string()));
        command.extend(args.iter().cloned());

        debug!("EVAL {} on {} key(s)", script.name, keys.len());
        self.call("EVAL", command.as_slice()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn args_of(value: RespValue) -> Vec<String> {
        value
            .into_array()
            .unwrap_or_default()
            .into_iter()
            .filter_map(RespValue::into_string)
            .collect()
    }

    /// Accepts connections and answers every command with `handler`
    async fn spawn_mock_server<F>(handler: F) -> (SocketAddr, Arc<AtomicUsize>)
    where
        F: Fn(Vec<String>) -> RespValue + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(handler);

        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let mut buf = BytesMut::new();
                    loop {
                        match stream.read_buf(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {}
                        }
                        for command in RespParser::parse_all(&mut buf).unwrap() {
                            let reply = handler(args_of(command));
                            if stream.write_all(&RespEncoder::encode(&reply)).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });

        (addr, accepted)
    }

    fn client_for(addr: SocketAddr, credential: Option<&str>) -> RespClient {
        RespClient::new(
            addr.to_string(),
            credential.map(str::to_string),
            PoolSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_set_nx_reply_mapping() {
        let (addr, _) = spawn_mock_server(|args| {
            if args[1] == "taken" {
                RespValue::BulkString(None)
            } else {
                RespValue::SimpleString("OK".to_string())
            }
        })
        .await;
        let client = client_for(addr, None);

        assert!(client
            .set_nx_ex("free", "t1", Duration::from_secs(10))
            .await
            .unwrap());
        assert!(!client
            .set_nx_ex("taken", "t1", Duration::from_secs(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_set_nx_sends_expected_arguments() {
        let (addr, _) = spawn_mock_server(|args| {
            assert_eq!(args, vec!["SET", "lock", "token", "NX", "PX", "1900"]);
            RespValue::SimpleString("OK".to_string())
        })
        .await;
        let client = client_for(addr, None);
        assert!(client
            .set_nx_ex("lock", "token", Duration::from_millis(1900))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_auth_is_sent_on_connect() {
        let (addr, _) = spawn_mock_server(|args| match args[0].as_str() {
            "AUTH" if args[1] == "s3cret" => RespValue::SimpleString("OK".to_string()),
            "AUTH" => RespValue::Error("WRONGPASS invalid password".to_string()),
            _ => RespValue::SimpleString("PONG".to_string()),
        })
        .await;

        assert!(client_for(addr, Some("s3cret")).ping().await.is_ok());

        let err = client_for(addr, Some("nope")).ping().await.unwrap_err();
        assert!(matches!(err, StoreError::Command { .. }));
    }

    #[tokio::test]
    async fn test_error_reply_is_data_level() {
        let (addr, _) = spawn_mock_server(|_| RespValue::Error("ERR wrong type".to_string())).await;
        let client = client_for(addr, None);

        let err = client.get("k").await.unwrap_err();
        assert!(!err.is_connection());
    }

    #[tokio::test]
    async fn test_hmget_with_missing_fields() {
        let (addr, _) = spawn_mock_server(|_| {
            RespValue::Array(Some(vec![
                RespValue::bulk("1"),
                RespValue::BulkString(None),
            ]))
        })
        .await;
        let client = client_for(addr, None);

        let values = client.hmget("item", &["status", "total"]).await.unwrap();
        assert_eq!(values, vec![Some("1".to_string()), None]);
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let (addr, accepted) = spawn_mock_server(|_| RespValue::Integer(1)).await;
        let client = client_for(addr, None);

        for _ in 0..5 {
            assert!(client.exists("k").await.unwrap());
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(client.pool().idle_count().await, 1);
    }

    #[tokio::test]
    async fn test_unreachable_node_is_connection_error() {
        let client = client_for("127.0.0.1:1".parse().unwrap(), None);
        let err = client.ping().await.unwrap_err();
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn test_eval_layout() {
        let (addr, _) = spawn_mock_server(|args| {
            assert_eq!(args[0], "EVAL");
            assert_eq!(args[2], "1");
            assert_eq!(args[3], "lock");
            assert_eq!(args[4], "token");
            RespValue::Integer(1)
        })
        .await;
        let client = client_for(addr, None);

        let reply = client
            .eval(
                &crate::store::scripts::RELEASE_LOCK,
                &["lock"],
                &["token".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(reply, RespValue::Integer(1));
    }
}
