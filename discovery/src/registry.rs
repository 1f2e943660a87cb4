//! サービスレジストリ
//!
//! 登録のライフサイクル（リース取得・キー書き込み・ハートビート・登録解除）と
//! 検索・変更監視を提供する。
//!
//! リースは `LeaseGuard` として Registry が所有し、再登録時は古いものを
//! 必ず閉じてから置き換える。ハートビートのキャンセルスコープは呼び出し元
//! トークンの子トークンで、登録解除でも終了する。

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use service_discovery_common::{DiscoveryConfig, DiscoveryError, DiscoveryResult, ServiceInstance};

use crate::store::{CoordinationStore, LeaseId, StoreError};
use crate::watcher::ChangeWatcher;
use crate::{Registrar, Watcher};

/// デフォルトのネームスペース
pub const DEFAULT_NAMESPACE: &str = "/services";

/// デフォルトのリースTTL
pub const DEFAULT_TTL: Duration = Duration::from_secs(15);

/// Registry options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryOptions {
    /// キーのネームスペース
    pub namespace: String,
    /// リースTTL
    pub ttl: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            ttl: DEFAULT_TTL,
        }
    }
}

impl RegistryOptions {
    /// 設定から作成
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            ttl: config.ttl(),
        }
    }

    /// ネームスペースを設定
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// TTLを設定
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// ハートビートの状態
///
/// ストリーム終了はエラーとして返らないため、利用側はこの状態で
/// 「自分で止めた」のか「リースを失った」のかを区別する。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    /// まだ登録していない
    Idle,
    /// ハートビート中
    Alive {
        /// 維持しているリース
        lease: LeaseId,
    },
    /// 登録解除・再登録で解放した
    Released {
        /// 解放したリース
        lease: LeaseId,
    },
    /// 呼び出し元のトークンがキャンセルされた
    Cancelled {
        /// 維持をやめたリース
        lease: LeaseId,
    },
    /// ストアがキープアライブを終了した（失効・破棄・通信断）
    Lost {
        /// 失ったリース
        lease: LeaseId,
    },
}

impl LeaseStatus {
    /// 対象のリース
    pub fn lease(&self) -> Option<LeaseId> {
        match *self {
            Self::Idle => None,
            Self::Alive { lease }
            | Self::Released { lease }
            | Self::Cancelled { lease }
            | Self::Lost { lease } => Some(lease),
        }
    }

    /// ハートビート中か
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Alive { .. })
    }
}

/// 保持中のリース
///
/// 破棄されるとハートビートを止める。
struct LeaseGuard {
    lease: LeaseId,
    scope: CancellationToken,
    heartbeat: Option<JoinHandle<()>>,
}

impl LeaseGuard {
    /// ハートビートを止め、状態を Released にする
    fn close(&self, status: &watch::Sender<LeaseStatus>) {
        let lease = self.lease;
        status.send_if_modified(|current| {
            if *current == (LeaseStatus::Alive { lease }) {
                *current = LeaseStatus::Released { lease };
                true
            } else {
                false
            }
        });
        self.scope.cancel();
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

/// コーディネーションストア上のサービスレジストリ
pub struct Registry {
    opts: RegistryOptions,
    store: Arc<dyn CoordinationStore>,
    lease: Mutex<Option<LeaseGuard>>,
    status: Arc<watch::Sender<LeaseStatus>>,
}

impl Registry {
    /// 新しいレジストリを作成
    pub fn new(store: Arc<dyn CoordinationStore>, opts: RegistryOptions) -> Self {
        let (status, _) = watch::channel(LeaseStatus::Idle);
        Self {
            opts,
            store,
            lease: Mutex::new(None),
            status: Arc::new(status),
        }
    }

    /// インスタンスのキー `{namespace}/{name}/{id}`
    pub fn instance_key(&self, service: &ServiceInstance) -> String {
        format!("{}/{}/{}", self.opts.namespace, service.name, service.id)
    }

    /// サービスのキープレフィックス `{namespace}/{name}/`
    ///
    /// 末尾の `/` で `orders` と `orders-v2` を区別する。
    pub fn service_prefix(&self, name: &str) -> String {
        format!("{}/{}/", self.opts.namespace, name)
    }

    /// ハートビート状態を購読
    pub fn lease_status(&self) -> watch::Receiver<LeaseStatus> {
        self.status.subscribe()
    }

    /// 現在保持しているリース
    pub async fn current_lease(&self) -> Option<LeaseId> {
        self.lease.lock().await.as_ref().map(|guard| guard.lease)
    }

    /// インスタンスを登録
    ///
    /// 既存のリースは先に閉じる。古いリースは破棄せずTTLで失効させる
    /// （同じキーは新しいリースに付け替わるため）。
    pub async fn register(
        &self,
        token: &CancellationToken,
        service: &ServiceInstance,
    ) -> DiscoveryResult<()> {
        let value = service.to_json()?;
        let key = self.instance_key(service);

        let mut slot = self.lease.lock().await;
        if let Some(previous) = slot.take() {
            debug!(lease = previous.lease, key = %key, "Closing previous lease");
            previous.close(&self.status);
        }

        let lease = self
            .store
            .lease_grant(self.opts.ttl)
            .await
            .map_err(|e| DiscoveryError::Lease(e.to_string()))?;

        if let Err(e) = self.store.put(&key, value, Some(lease)).await {
            if let Err(revoke_err) = self.store.lease_revoke(lease).await {
                debug!(lease, error = %revoke_err, "Failed to revoke unused lease");
            }
            return Err(DiscoveryError::StoreWrite(e.to_string()));
        }

        let scope = token.child_token();
        self.status.send_replace(LeaseStatus::Alive { lease });
        let heartbeat = tokio::spawn(run_heartbeat(
            Arc::clone(&self.store),
            lease,
            scope.clone(),
            Arc::clone(&self.status),
        ));
        *slot = Some(LeaseGuard {
            lease,
            scope,
            heartbeat: Some(heartbeat),
        });

        info!(
            key = %key,
            lease,
            endpoints = service.endpoints.len(),
            "Service instance registered"
        );
        Ok(())
    }

    /// インスタンスを登録解除
    ///
    /// キー削除の成否にかかわらずリースは解放する。
    pub async fn deregister(&self, service: &ServiceInstance) -> DiscoveryResult<()> {
        let key = self.instance_key(service);
        let mut slot = self.lease.lock().await;
        let guard = slot.take();

        let deleted = self.store.delete(&key).await;

        if let Some(guard) = guard {
            self.release(guard).await;
        }

        match deleted {
            Ok(true) => {
                info!(key = %key, "Service instance deregistered");
                Ok(())
            }
            Ok(false) => {
                debug!(key = %key, "Service instance was already absent");
                Ok(())
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to delete service instance");
                Err(DiscoveryError::StoreWrite(e.to_string()))
            }
        }
    }

    async fn release(&self, mut guard: LeaseGuard) {
        guard.close(&self.status);
        if let Some(heartbeat) = guard.heartbeat.take() {
            if let Err(e) = heartbeat.await {
                warn!(lease = guard.lease, error = %e, "Heartbeat task failed");
            }
        }
        if let Err(e) = self.store.lease_revoke(guard.lease).await {
            // 破棄できなくてもTTLで失効する
            warn!(lease = guard.lease, error = %e, "Failed to revoke lease");
        }
    }

    /// 登録済みインスタンスの値を、現在のリースのまま書き換える
    ///
    /// このレジストリのリース枠には触れないため、他プロセスが所有する
    /// インスタンスにも使える。キーが無い（登録解除・失効済み）場合は
    /// 書き込まずに `false` を返す。
    pub async fn update(&self, service: &ServiceInstance) -> DiscoveryResult<bool> {
        let value = service.to_json()?;
        let key = self.instance_key(service);

        let current = self
            .store
            .get_prefix(&key)
            .await
            .map_err(|e| DiscoveryError::StoreRead(e.to_string()))?
            .into_iter()
            .find(|kv| kv.key == key);
        let Some(current) = current else {
            debug!(key = %key, "Instance is no longer registered, skipping update");
            return Ok(false);
        };

        match self.store.put(&key, value, current.lease).await {
            Ok(()) => {
                debug!(key = %key, lease = ?current.lease, "Service instance updated");
                Ok(true)
            }
            Err(StoreError::LeaseNotFound(lease)) => {
                debug!(key = %key, lease, "Lease expired before update, skipping");
                Ok(false)
            }
            Err(e) => Err(DiscoveryError::StoreWrite(e.to_string())),
        }
    }

    /// サービスの全インスタンスを取得
    ///
    /// 1件でもデコードできなければ全体を失敗させる。
    pub async fn get_service(&self, name: &str) -> DiscoveryResult<Vec<ServiceInstance>> {
        let prefix = self.service_prefix(name);
        let kvs = self
            .store
            .get_prefix(&prefix)
            .await
            .map_err(|e| DiscoveryError::StoreRead(e.to_string()))?;

        kvs.iter()
            .map(|kv| ServiceInstance::from_json(&kv.key, &kv.value))
            .collect()
    }

    /// サービスの変更ウォッチャーを作成
    pub fn watcher(&self, name: &str) -> ChangeWatcher {
        ChangeWatcher::new(Arc::clone(&self.store), self.service_prefix(name))
    }
}

/// キープアライブ応答を読み続ける
///
/// 再送はストア側のキープアライブ機構に任せ、ここでは応答を消費するだけ。
async fn run_heartbeat(
    store: Arc<dyn CoordinationStore>,
    lease: LeaseId,
    scope: CancellationToken,
    status: Arc<watch::Sender<LeaseStatus>>,
) {
    let finish = |next: LeaseStatus| {
        status.send_if_modified(|current| {
            if *current == (LeaseStatus::Alive { lease }) {
                *current = next;
                true
            } else {
                false
            }
        })
    };

    let mut acks = match store.lease_keep_alive(lease).await {
        Ok(acks) => acks,
        Err(e) => {
            if finish(LeaseStatus::Lost { lease }) {
                warn!(lease, error = %e, "Failed to start keepalive");
            }
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = scope.cancelled() => {
                acks.cancel();
                if finish(LeaseStatus::Cancelled { lease }) {
                    debug!(lease, "Heartbeat cancelled by caller");
                }
                return;
            }
            ack = acks.next() => match ack {
                Some(ack) => debug!(lease = ack.lease, ttl = ack.ttl, "Keepalive acknowledged"),
                None => {
                    if finish(LeaseStatus::Lost { lease }) {
                        warn!(lease, "Keepalive stream closed; registration will expire");
                    }
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl Registrar for Registry {
    async fn register(
        &self,
        token: &CancellationToken,
        service: &ServiceInstance,
    ) -> DiscoveryResult<()> {
        Registry::register(self, token, service).await
    }

    async fn deregister(&self, service: &ServiceInstance) -> DiscoveryResult<()> {
        Registry::deregister(self, service).await
    }

    async fn update(&self, service: &ServiceInstance) -> DiscoveryResult<bool> {
        Registry::update(self, service).await
    }

    async fn get_service(&self, service_name: &str) -> DiscoveryResult<Vec<ServiceInstance>> {
        Registry::get_service(self, service_name).await
    }

    fn watcher(&self, service_name: &str) -> Box<dyn Watcher> {
        Box::new(Registry::watcher(self, service_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        KeepAliveStream, KeyValue, MemoryStore, StoreError, StoreResult, WatchStream,
    };
    use service_discovery_common::EndPointInstance;
    use std::sync::atomic::{AtomicBool, Ordering};

    const TTL: Duration = Duration::from_secs(3);

    /// 任意の操作を失敗させられるストア
    #[derive(Default)]
    struct FailingStore {
        inner: MemoryStore,
        fail_grant: AtomicBool,
        fail_put: AtomicBool,
        fail_get: AtomicBool,
        fail_delete: AtomicBool,
    }

    fn injected(flag: &AtomicBool) -> StoreResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }

    #[async_trait]
    impl CoordinationStore for FailingStore {
        async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()> {
            injected(&self.fail_put)?;
            self.inner.put(key, value, lease).await
        }

        async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
            injected(&self.fail_get)?;
            self.inner.get_prefix(prefix).await
        }

        async fn delete(&self, key: &str) -> StoreResult<bool> {
            injected(&self.fail_delete)?;
            self.inner.delete(key).await
        }

        async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream> {
            self.inner.watch_prefix(prefix).await
        }

        async fn lease_grant(&self, ttl: Duration) -> StoreResult<LeaseId> {
            injected(&self.fail_grant)?;
            self.inner.lease_grant(ttl).await
        }

        async fn lease_keep_alive(&self, lease: LeaseId) -> StoreResult<KeepAliveStream> {
            self.inner.lease_keep_alive(lease).await
        }

        async fn lease_revoke(&self, lease: LeaseId) -> StoreResult<()> {
            self.inner.lease_revoke(lease).await
        }
    }

    fn instance(id: &str) -> ServiceInstance {
        ServiceInstance::with_id(id, "orders")
            .with_endpoint(EndPointInstance::new("10.0.0.1:8080", 1))
            .with_endpoint(EndPointInstance::new("10.0.0.2:8080", 3))
    }

    fn setup() -> (MemoryStore, Registry) {
        let store = MemoryStore::new();
        let registry = Registry::new(
            Arc::new(store.clone()),
            RegistryOptions::default().with_ttl(TTL),
        );
        (store, registry)
    }

    async fn wait_status(registry: &Registry, pred: impl FnMut(&LeaseStatus) -> bool) -> LeaseStatus {
        let mut rx = registry.lease_status();
        let status = tokio::time::timeout(Duration::from_secs(30), rx.wait_for(pred))
            .await
            .expect("lease status did not change in time")
            .expect("status sender dropped");
        *status
    }

    #[test]
    fn test_registry_options_defaults() {
        let opts = RegistryOptions::default();
        assert_eq!(opts.namespace, "/services");
        assert_eq!(opts.ttl, Duration::from_secs(15));

        let config = DiscoveryConfig {
            namespace: "/prod".to_string(),
            ttl_secs: 30,
            ..Default::default()
        };
        let opts = RegistryOptions::from_config(&config);
        assert_eq!(opts.namespace, "/prod");
        assert_eq!(opts.ttl, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_key_layout() {
        let (store, registry) = setup();
        let token = CancellationToken::new();
        registry.register(&token, &instance("i-1")).await.unwrap();

        let kvs = store.get_prefix("/services/").await.unwrap();
        assert_eq!(kvs.len(), 1);
        assert_eq!(kvs[0].key, "/services/orders/i-1");
        assert_eq!(kvs[0].lease, registry.current_lease().await);

        let stored: serde_json::Value = serde_json::from_slice(&kvs[0].value).unwrap();
        assert_eq!(stored["endpoints"][1]["weight"], 3);
        token.cancel();
    }

    #[tokio::test]
    async fn test_register_then_get_service() {
        let (_store, registry) = setup();
        let token = CancellationToken::new();
        let svc = instance("i-1");

        registry.register(&token, &svc).await.unwrap();
        let found = registry.get_service("orders").await.unwrap();

        assert_eq!(found, vec![svc]);
        assert!(registry.lease_status().borrow().is_alive());
        token.cancel();
    }

    #[tokio::test]
    async fn test_deregister_removes_instance_and_lease() {
        let (store, registry) = setup();
        let token = CancellationToken::new();
        let svc = instance("i-1");

        registry.register(&token, &svc).await.unwrap();
        let lease = registry.current_lease().await.unwrap();
        registry.deregister(&svc).await.unwrap();

        assert!(registry.get_service("orders").await.unwrap().is_empty());
        assert!(!store.lease_alive(lease));
        assert_eq!(registry.current_lease().await, None);
        assert_eq!(*registry.lease_status().borrow(), LeaseStatus::Released { lease });
    }

    #[tokio::test]
    async fn test_deregister_twice_is_ok() {
        let (_store, registry) = setup();
        let token = CancellationToken::new();
        let svc = instance("i-1");

        registry.register(&token, &svc).await.unwrap();
        registry.deregister(&svc).await.unwrap();
        registry.deregister(&svc).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_service_isolates_similar_names() {
        let (store, registry) = setup();
        let v2_registry = Registry::new(Arc::new(store.clone()), RegistryOptions::default());
        let token = CancellationToken::new();

        registry.register(&token, &instance("i-1")).await.unwrap();
        let v2 = ServiceInstance::with_id("i-2", "orders-v2")
            .with_endpoint(EndPointInstance::new("10.0.1.1:8080", 1));
        v2_registry.register(&token, &v2).await.unwrap();

        let orders = registry.get_service("orders").await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].id, "i-1");
        assert_eq!(registry.get_service("orders-v2").await.unwrap(), vec![v2]);
        assert!(registry.get_service("order").await.unwrap().is_empty());
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_registration_alive() {
        let (_store, registry) = setup();
        let token = CancellationToken::new();
        registry.register(&token, &instance("i-1")).await.unwrap();

        // TTLの数倍経過しても残る
        tokio::time::sleep(TTL * 4).await;
        assert_eq!(registry.get_service("orders").await.unwrap().len(), 1);
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_cancel_stops_heartbeat() {
        let (store, registry) = setup();
        let token = CancellationToken::new();
        registry.register(&token, &instance("i-1")).await.unwrap();
        let lease = registry.current_lease().await.unwrap();

        token.cancel();
        let status = wait_status(&registry, |s| !s.is_alive()).await;
        assert_eq!(status, LeaseStatus::Cancelled { lease });

        tokio::time::sleep(TTL + Duration::from_secs(1)).await;
        assert!(registry.get_service("orders").await.unwrap().is_empty());
        assert!(!store.lease_alive(lease));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregister_replaces_lease() {
        let (store, registry) = setup();
        let token = CancellationToken::new();
        let svc = instance("i-1");

        registry.register(&token, &svc).await.unwrap();
        let first = registry.current_lease().await.unwrap();
        registry.register(&token, &svc).await.unwrap();
        let second = registry.current_lease().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(*registry.lease_status().borrow(), LeaseStatus::Alive { lease: second });

        // 古いリースは維持されずに失効し、キーは新しいリースで残る
        tokio::time::sleep(TTL * 3).await;
        assert!(!store.lease_alive(first));
        assert!(store.lease_alive(second));
        assert_eq!(registry.get_service("orders").await.unwrap().len(), 1);
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_stops_after_deregister() {
        let (store, registry) = setup();
        let token = CancellationToken::new();
        let svc = instance("i-1");

        registry.register(&token, &svc).await.unwrap();
        registry.deregister(&svc).await.unwrap();
        assert_eq!(store.lease_count(), 0);

        // 呼び出し元トークンが生きていても再登録されない
        tokio::time::sleep(TTL * 2).await;
        assert!(registry.get_service("orders").await.unwrap().is_empty());
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_lease_lost_is_reported() {
        let (store, registry) = setup();
        let token = CancellationToken::new();
        registry.register(&token, &instance("i-1")).await.unwrap();
        let lease = registry.current_lease().await.unwrap();

        // ストア側でリースが消えた
        store.lease_revoke(lease).await.unwrap();

        let status = wait_status(&registry, |s| !s.is_alive()).await;
        assert_eq!(status, LeaseStatus::Lost { lease });
        assert_eq!(status.lease(), Some(lease));
        assert_eq!(LeaseStatus::Idle.lease(), None);
        token.cancel();
    }

    #[tokio::test]
    async fn test_update_keeps_owner_lease() {
        let (store, a) = setup();
        let b = Registry::new(Arc::new(store.clone()), RegistryOptions::default().with_ttl(TTL));
        let token = CancellationToken::new();

        a.register(&token, &instance("a")).await.unwrap();
        b.register(&token, &instance("b")).await.unwrap();
        let a_lease = a.current_lease().await.unwrap();
        let b_lease = b.current_lease().await.unwrap();

        // a が b のインスタンスを書き換えても、どちらのリースも動かない
        let pruned = ServiceInstance::with_id("b", "orders")
            .with_endpoint(EndPointInstance::new("10.0.0.1:8080", 1));
        assert!(a.update(&pruned).await.unwrap());

        let kvs = store.get_prefix("/services/orders/b").await.unwrap();
        assert_eq!(kvs.len(), 1);
        assert_eq!(kvs[0].lease, Some(b_lease));
        assert_eq!(a.current_lease().await, Some(a_lease));
        assert_eq!(*a.lease_status().borrow(), LeaseStatus::Alive { lease: a_lease });

        // a の登録解除で b は消えない
        a.deregister(&instance("a")).await.unwrap();
        let found = b.get_service("orders").await.unwrap();
        assert_eq!(found, vec![pruned]);
        token.cancel();
    }

    #[tokio::test]
    async fn test_update_skips_absent_instance() {
        let (store, registry) = setup();
        let token = CancellationToken::new();
        registry.register(&token, &instance("i-10")).await.unwrap();

        // i-1 は i-10 のプレフィックスだが別キー
        assert!(!registry.update(&instance("i-1")).await.unwrap());
        let kvs = store.get_prefix("/services/").await.unwrap();
        assert_eq!(kvs.len(), 1);
        assert_eq!(kvs[0].key, "/services/orders/i-10");
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_does_not_revive_expired_instance() {
        let (store, registry) = setup();
        let token = CancellationToken::new();
        let svc = instance("i-1");
        registry.register(&token, &svc).await.unwrap();

        token.cancel();
        tokio::time::sleep(TTL + Duration::from_secs(1)).await;

        assert!(!registry.update(&svc).await.unwrap());
        assert!(store.get_prefix("/services/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lease_grant_failure_writes_nothing() {
        let store = Arc::new(FailingStore::default());
        let registry = Registry::new(store.clone(), RegistryOptions::default());
        store.fail_grant.store(true, Ordering::SeqCst);

        let err = registry
            .register(&CancellationToken::new(), &instance("i-1"))
            .await
            .unwrap_err();

        assert!(matches!(err, DiscoveryError::Lease(_)));
        assert!(store.inner.get_prefix("/").await.unwrap().is_empty());
        assert_eq!(*registry.lease_status().borrow(), LeaseStatus::Idle);
    }

    #[tokio::test]
    async fn test_put_failure_releases_granted_lease() {
        let store = Arc::new(FailingStore::default());
        let registry = Registry::new(store.clone(), RegistryOptions::default());
        store.fail_put.store(true, Ordering::SeqCst);

        let err = registry
            .register(&CancellationToken::new(), &instance("i-1"))
            .await
            .unwrap_err();

        assert!(matches!(err, DiscoveryError::StoreWrite(_)));
        assert_eq!(store.inner.lease_count(), 0);
        assert_eq!(registry.current_lease().await, None);
    }

    #[tokio::test]
    async fn test_delete_failure_still_releases_lease() {
        let store = Arc::new(FailingStore::default());
        let registry = Registry::new(store.clone(), RegistryOptions::default());
        let token = CancellationToken::new();
        let svc = instance("i-1");

        registry.register(&token, &svc).await.unwrap();
        let lease = registry.current_lease().await.unwrap();
        store.fail_delete.store(true, Ordering::SeqCst);

        let err = registry.deregister(&svc).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::StoreWrite(_)));
        assert!(!store.inner.lease_alive(lease));
        assert_eq!(registry.current_lease().await, None);
        assert_eq!(*registry.lease_status().borrow(), LeaseStatus::Released { lease });
    }

    #[tokio::test]
    async fn test_get_service_read_failure() {
        let store = Arc::new(FailingStore::default());
        let registry = Registry::new(store.clone(), RegistryOptions::default());
        store.fail_get.store(true, Ordering::SeqCst);

        let err = registry.get_service("orders").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::StoreRead(_)));
    }

    #[tokio::test]
    async fn test_malformed_entry_aborts_lookup() {
        let (store, registry) = setup();
        let token = CancellationToken::new();
        registry.register(&token, &instance("i-1")).await.unwrap();
        store
            .put("/services/orders/i-2", b"{broken".to_vec(), None)
            .await
            .unwrap();

        match registry.get_service("orders").await.unwrap_err() {
            DiscoveryError::Decode { key, .. } => assert_eq!(key, "/services/orders/i-2"),
            other => panic!("unexpected error: {other:?}"),
        }
        token.cancel();
    }

    #[tokio::test]
    async fn test_registrar_trait_object() {
        let (_store, registry) = setup();
        let registrar: Arc<dyn Registrar> = Arc::new(registry);
        let token = CancellationToken::new();
        let svc = instance("i-1");

        registrar.register(&token, &svc).await.unwrap();
        assert_eq!(registrar.get_service("orders").await.unwrap(), vec![svc.clone()]);
        registrar.deregister(&svc).await.unwrap();
        assert!(registrar.get_service("orders").await.unwrap().is_empty());
    }
}
