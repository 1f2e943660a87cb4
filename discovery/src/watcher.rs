//! 変更通知ウォッチャー
//!
//! ストアのプレフィックスウォッチを、ペイロードを持たない通知ストリームへ
//! 変換する。通知を受けた側は `get_service` で最新の状態を取り直す。

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use service_discovery_common::{DiscoveryError, DiscoveryResult};

use crate::store::{CoordinationStore, WatchMessage};
use crate::Watcher;

/// 通知ストリームが閉じた理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `watch` に渡したトークンがキャンセルされた
    CallerCancelled,
    /// [`ChangeWatcher::stop`] が呼ばれた
    Stopped,
    /// ストア側でウォッチがキャンセルされた
    UpstreamCanceled,
    /// ストアのストリームが終了した（通信断など）
    UpstreamClosed,
}

/// Change notification stream
///
/// 変更1件につき `()` を1件届ける。閉じた後は [`ChangeStream::close_reason`]
/// で理由を確認できる。
pub struct ChangeStream {
    rx: mpsc::UnboundedReceiver<()>,
    reason: watch::Receiver<Option<CloseReason>>,
}

impl ChangeStream {
    /// 次の通知を待つ（閉じた場合は `None`）
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    /// 閉じた理由（まだ開いている場合は `None`）
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.reason.borrow()
    }
}

impl Stream for ChangeStream {
    type Item = ();

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<()>> {
        self.rx.poll_recv(cx)
    }
}

/// プレフィックスを監視するウォッチャー
pub struct ChangeWatcher {
    store: Arc<dyn CoordinationStore>,
    prefix: String,
    stop: CancellationToken,
}

impl ChangeWatcher {
    /// ストアとプレフィックスから作成
    pub fn new(store: Arc<dyn CoordinationStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            stop: CancellationToken::new(),
        }
    }

    /// 監視対象のプレフィックス
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// 監視を開始する
    ///
    /// 購読以降の変更のみ通知する。`token` のキャンセル、[`Self::stop`]、
    /// ストア側の終了のいずれかでストリームは閉じる。
    pub async fn watch(&self, token: &CancellationToken) -> DiscoveryResult<ChangeStream> {
        let mut upstream = self
            .store
            .watch_prefix(&self.prefix)
            .await
            .map_err(|e| DiscoveryError::StoreRead(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (reason_tx, reason_rx) = watch::channel(None);
        let caller = token.clone();
        let stop = self.stop.clone();
        let prefix = self.prefix.clone();

        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    biased;
                    _ = caller.cancelled() => break CloseReason::CallerCancelled,
                    _ = stop.cancelled() => break CloseReason::Stopped,
                    message = upstream.next() => match message {
                        Some(WatchMessage::Event(event)) => {
                            debug!(prefix = %prefix, key = %event.key, kind = ?event.kind, "Service changed");
                            if tx.send(()).is_err() {
                                // 受信側が破棄された
                                upstream.cancel();
                                return;
                            }
                        }
                        Some(WatchMessage::Canceled) => {
                            warn!(prefix = %prefix, "Watch canceled by store");
                            break CloseReason::UpstreamCanceled;
                        }
                        None => {
                            warn!(prefix = %prefix, "Watch stream closed by store");
                            break CloseReason::UpstreamClosed;
                        }
                    }
                }
            };

            upstream.cancel();
            // 理由を設定してから送信側を閉じる
            let _ = reason_tx.send(Some(reason));
            drop(tx);
            debug!(prefix = %prefix, reason = ?reason, "Watch closed");
        });

        Ok(ChangeStream {
            rx,
            reason: reason_rx,
        })
    }

    /// このウォッチャーから開始した全ての監視を終了する（冪等）
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

#[async_trait]
impl Watcher for ChangeWatcher {
    async fn watch(&self, token: &CancellationToken) -> DiscoveryResult<ChangeStream> {
        ChangeWatcher::watch(self, token).await
    }

    fn stop(&self) {
        ChangeWatcher::stop(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Registry, RegistryOptions};
    use crate::store::MemoryStore;
    use service_discovery_common::{EndPointInstance, ServiceInstance};
    use std::time::Duration;

    async fn next(stream: &mut ChangeStream) -> Option<()> {
        tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .expect("no notification in time")
    }

    fn setup() -> (MemoryStore, Registry) {
        let store = MemoryStore::new();
        let registry = Registry::new(Arc::new(store.clone()), RegistryOptions::default());
        (store, registry)
    }

    #[tokio::test]
    async fn test_register_and_deregister_notify() {
        let (_store, registry) = setup();
        let watcher = registry.watcher("orders");
        assert_eq!(watcher.prefix(), "/services/orders/");
        let token = CancellationToken::new();
        let mut stream = watcher.watch(&token).await.unwrap();

        let svc = ServiceInstance::with_id("i-1", "orders")
            .with_endpoint(EndPointInstance::new("10.0.0.1:8080", 1));
        registry.register(&token, &svc).await.unwrap();
        assert_eq!(next(&mut stream).await, Some(()));
        assert_eq!(registry.get_service("orders").await.unwrap().len(), 1);

        registry.deregister(&svc).await.unwrap();
        assert_eq!(next(&mut stream).await, Some(()));
        assert!(registry.get_service("orders").await.unwrap().is_empty());
        watcher.stop();
    }

    #[tokio::test]
    async fn test_one_notification_per_event() {
        let (store, registry) = setup();
        let watcher = registry.watcher("orders");
        let token = CancellationToken::new();
        let mut stream = watcher.watch(&token).await.unwrap();

        store.put("/services/orders/a", b"{}".to_vec(), None).await.unwrap();
        store.put("/services/orders-v2/c", b"{}".to_vec(), None).await.unwrap();
        store.put("/services/orders/b", b"{}".to_vec(), None).await.unwrap();
        store.delete("/services/orders/a").await.unwrap();

        for _ in 0..3 {
            assert_eq!(next(&mut stream).await, Some(()));
        }
        let extra = tokio::time::timeout(Duration::from_millis(50), stream.recv()).await;
        assert!(extra.is_err());
        watcher.stop();
    }

    #[tokio::test]
    async fn test_caller_cancel_closes_stream() {
        let (store, registry) = setup();
        let watcher = registry.watcher("orders");
        let token = CancellationToken::new();
        let mut stream = watcher.watch(&token).await.unwrap();
        assert_eq!(stream.close_reason(), None);

        token.cancel();
        assert_eq!(next(&mut stream).await, None);
        assert_eq!(stream.close_reason(), Some(CloseReason::CallerCancelled));
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (store, registry) = setup();
        let watcher = registry.watcher("orders");
        let token = CancellationToken::new();
        let mut first = watcher.watch(&token).await.unwrap();
        let mut second = watcher.watch(&token).await.unwrap();

        watcher.stop();
        watcher.stop();

        assert_eq!(next(&mut first).await, None);
        assert_eq!(next(&mut second).await, None);
        assert_eq!(first.close_reason(), Some(CloseReason::Stopped));
        assert_eq!(second.close_reason(), Some(CloseReason::Stopped));
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_upstream_cancel_closes_stream() {
        let (store, registry) = setup();
        let watcher = registry.watcher("orders");
        let mut stream = watcher.watch(&CancellationToken::new()).await.unwrap();

        store.cancel_watches();

        assert_eq!(next(&mut stream).await, None);
        assert_eq!(stream.close_reason(), Some(CloseReason::UpstreamCanceled));
    }

    #[tokio::test]
    async fn test_stream_trait() {
        use futures::StreamExt;

        let (store, registry) = setup();
        let watcher = registry.watcher("orders");
        let token = CancellationToken::new();
        let stream = watcher.watch(&token).await.unwrap();

        store.put("/services/orders/a", b"{}".to_vec(), None).await.unwrap();
        store.put("/services/orders/b", b"{}".to_vec(), None).await.unwrap();

        let received: Vec<()> = tokio::time::timeout(Duration::from_secs(5), stream.take(2).collect())
            .await
            .unwrap();
        assert_eq!(received.len(), 2);
        token.cancel();
    }
}
