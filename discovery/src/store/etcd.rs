//! etcd v3 adapter
//!
//! `etcd_client::Client` を [`CoordinationStore`] として使う。
//! キープアライブはクライアント側から能動的に送る必要があるので、
//! TTL の1/3ごとに再送するポンプタスクを持つ。

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tonic::Code;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    CoordinationStore, EventKind, KeepAliveAck, KeepAliveStream, KeyValue, LeaseId, StoreError,
    StoreResult, StoreStream, WatchEvent, WatchMessage, WatchStream,
};

impl From<etcd_client::Error> for StoreError {
    fn from(err: etcd_client::Error) -> Self {
        match err {
            etcd_client::Error::TransportError(e) => StoreError::Unavailable(e.to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// etcd-backed coordination store
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to the given etcd endpoints
    pub async fn connect(endpoints: &[String]) -> StoreResult<Self> {
        let options = ConnectOptions::new()
            .with_timeout(Duration::from_secs(5))
            .with_keep_alive(Duration::from_secs(30), Duration::from_secs(10));

        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to connect to etcd: {}", e)))?;

        info!(endpoints = ?endpoints, "Connected to etcd");
        Ok(Self { client })
    }
}

/// 存在しないリースへの操作か（etcd は gRPC の NotFound で返す）
fn is_not_found(err: &etcd_client::Error) -> bool {
    matches!(err, etcd_client::Error::GRpcStatus(status) if status.code() == Code::NotFound)
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        client
            .put(key, value, options)
            .await
            .map_err(|e| match lease {
                Some(lease) if is_not_found(&e) => StoreError::LeaseNotFound(lease),
                _ => e.into(),
            })?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        let mut client = self.client.clone();
        let response = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        Ok(response
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
                lease: (kv.lease() != 0).then(|| kv.lease()),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut client = self.client.clone();
        let response = client.delete(key, None).await?;
        Ok(response.deleted() > 0)
    }

    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream> {
        let mut client = self.client.clone();
        let (mut watcher, mut stream) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let cancel = token.clone();
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(e) = watcher.cancel().await {
                            debug!(prefix = %prefix, error = %e, "Failed to cancel etcd watch");
                        }
                        break;
                    }
                    message = stream.message() => match message {
                        Ok(Some(response)) => {
                            if response.canceled() {
                                let _ = tx.send(WatchMessage::Canceled);
                                break;
                            }
                            for event in response.events() {
                                let kind = match event.event_type() {
                                    EventType::Put => EventKind::Put,
                                    EventType::Delete => EventKind::Delete,
                                };
                                let key = event
                                    .kv()
                                    .map(|kv| String::from_utf8_lossy(kv.key()).into_owned())
                                    .unwrap_or_default();
                                if tx.send(WatchMessage::Event(WatchEvent { key, kind })).is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(prefix = %prefix, error = %e, "etcd watch stream failed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(StoreStream::new(rx, token))
    }

    async fn lease_grant(&self, ttl: Duration) -> StoreResult<LeaseId> {
        let mut client = self.client.clone();
        let ttl = ttl.as_secs().max(1) as i64;
        let response = client.lease_grant(ttl, None).await?;
        Ok(response.id())
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> StoreResult<KeepAliveStream> {
        let mut client = self.client.clone();
        let ttl = client.lease_time_to_live(lease, None).await?.ttl();
        if ttl <= 0 {
            return Err(StoreError::LeaseNotFound(lease));
        }
        let (mut keeper, mut stream) = client.lease_keep_alive(lease).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let cancel = token.clone();
        let period = Duration::from_secs((ttl as u64 / 3).max(1));
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {
                        if let Err(e) = keeper.keep_alive().await {
                            warn!(lease, error = %e, "Failed to send etcd keepalive");
                            break;
                        }
                    }
                    message = stream.message() => match message {
                        Ok(Some(response)) => {
                            // TTL 0 はリースが既に存在しないことを示す
                            if response.ttl() <= 0 {
                                break;
                            }
                            let ack = KeepAliveAck { lease: response.id(), ttl: response.ttl() };
                            if tx.send(ack).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(lease, error = %e, "etcd keepalive stream failed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(StoreStream::new(rx, token))
    }

    async fn lease_revoke(&self, lease: LeaseId) -> StoreResult<()> {
        let mut client = self.client.clone();
        match client.lease_revoke(lease).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(lease, "Lease already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
