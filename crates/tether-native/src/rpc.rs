use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::{oneshot, Mutex},
};
use tokio_util::sync::CancellationToken;

use crate::error::{NativeError, Result};

#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub connect_timeout: Duration,
    /// Default reply timeout for calls that do not pass their own.
    pub reply_timeout: Duration,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a, P> {
    method: &'a str,
    params: [P; 1],
    id: u64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

type Reply = std::result::Result<Value, String>;

#[derive(Debug)]
struct Inner {
    writer: Mutex<tokio::net::tcp::OwnedWriteHalf>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    config: RpcClientConfig,
}

/// JSON-RPC 1.0 client for the native debugger's headless API.
///
/// Requests and replies are newline-delimited JSON objects. Several calls may be in
/// flight at once; replies are matched by `id`.
#[derive(Debug, Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl RpcClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with_config(addr, RpcClientConfig::default()).await
    }

    pub async fn connect_with_config(addr: SocketAddr, config: RpcClientConfig) -> Result<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NativeError::Timeout)??;
        let _ = stream.set_nodelay(true);

        let (reader, writer) = stream.into_split();
        let inner = Arc::new(Inner {
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            config,
        });

        tokio::spawn(read_loop(reader, inner.clone()));
        tracing::debug!(%addr, "connected to native debugger");

        Ok(Self { inner })
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Cancelled when the client is shut down or the connection closes.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn reply_timeout(&self) -> Duration {
        self.inner.config.reply_timeout
    }

    /// Issue `method` with the default reply timeout.
    pub async fn call<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.call_with(method, params, self.inner.config.reply_timeout, None)
            .await
    }

    /// Issue `method`, giving up after `timeout` or when `cancel` fires.
    ///
    /// Giving up only stops waiting; callers that need the native side to stop as well
    /// must follow up with a command of their own.
    pub async fn call_with<P, R>(
        &self,
        method: &str,
        params: P,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        if self.is_closed() {
            return Err(NativeError::ConnectionClosed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        let mut line = serde_json::to_vec(&RpcRequest {
            method,
            params: [params],
            id,
        })?;
        line.push(b'\n');
        {
            let mut writer = self.inner.writer.lock().await;
            if let Err(err) = writer.write_all(&line).await {
                drop(writer);
                self.remove_pending(id).await;
                return Err(err.into());
            }
        }
        tracing::trace!(method, id, "native debugger request");

        let never = CancellationToken::new();
        let cancel = cancel.unwrap_or(&never);
        // A reply that raced with the connection closing still wins.
        let reply = tokio::select! {
            biased;
            res = tokio::time::timeout(timeout, rx) => match res {
                Ok(Ok(reply)) => reply,
                Ok(Err(_closed)) => return Err(NativeError::ConnectionClosed),
                Err(_elapsed) => {
                    self.remove_pending(id).await;
                    return Err(NativeError::Timeout);
                }
            },
            _ = cancel.cancelled() => {
                self.remove_pending(id).await;
                return Err(NativeError::Cancelled);
            }
            _ = self.inner.shutdown.cancelled() => {
                self.remove_pending(id).await;
                return Err(NativeError::ConnectionClosed);
            }
        };

        let value = reply.map_err(|message| NativeError::Rpc {
            method: method.to_string(),
            message,
        })?;
        Ok(serde_json::from_value(value)?)
    }

    async fn remove_pending(&self, id: u64) {
        self.inner.pending.lock().await.remove(&id);
    }
}

async fn read_loop(reader: tokio::net::tcp::OwnedReadHalf, inner: Arc<Inner>) {
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = lines.next_line() => res,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(error = %err, "native debugger read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response: RpcResponse = match serde_json::from_str(&line) {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(error = %err, "malformed reply from native debugger");
                break;
            }
        };
        let Some(id) = response.id else {
            continue;
        };

        let reply = match response.error {
            None | Some(Value::Null) => Ok(response.result.unwrap_or(Value::Null)),
            Some(Value::String(message)) => Err(message),
            Some(other) => Err(other.to_string()),
        };

        let tx = inner.pending.lock().await.remove(&id);
        match tx {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => tracing::trace!(id, "dropping reply for abandoned request"),
        }
    }

    // Dropping the senders wakes every waiter with `ConnectionClosed`.
    inner.pending.lock().await.clear();
    inner.shutdown.cancel();
}
