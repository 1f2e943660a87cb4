//! インメモリ・コーディネーションストア
//!
//! 単一プロセス内で完結するストア。テストやデモ用。
//! リースの期限は tokio の時計で管理するため、`tokio::time::pause` で制御できる。

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{
    CoordinationStore, EventKind, KeepAliveAck, KeepAliveStream, KeyValue, LeaseId, StoreError,
    StoreResult, StoreStream, WatchEvent, WatchMessage, WatchStream,
};

struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
    /// このリースのキープアライブストリーム
    keepalives: Vec<CancellationToken>,
}

struct WatchSlot {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchMessage>,
    token: CancellationToken,
}

#[derive(Default)]
struct Inner {
    kvs: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseEntry>,
    next_lease: LeaseId,
    watchers: Vec<WatchSlot>,
}

impl Inner {
    fn emit(&mut self, key: &str, kind: EventKind) {
        self.watchers.retain(|slot| {
            if slot.token.is_cancelled() {
                return false;
            }
            if !key.starts_with(&slot.prefix) {
                return true;
            }
            slot.tx
                .send(WatchMessage::Event(WatchEvent {
                    key: key.to_string(),
                    kind,
                }))
                .is_ok()
        });
    }

    fn remove_lease(&mut self, lease: LeaseId) -> bool {
        let Some(entry) = self.leases.remove(&lease) else {
            return false;
        };
        for token in entry.keepalives {
            token.cancel();
        }

        let attached: Vec<String> = self
            .kvs
            .iter()
            .filter(|(_, e)| e.lease == Some(lease))
            .map(|(k, _)| k.clone())
            .collect();
        for key in attached {
            self.kvs.remove(&key);
            self.emit(&key, EventKind::Delete);
        }
        true
    }

    fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in &expired {
            debug!(lease = *lease, "Lease expired");
            self.remove_lease(*lease);
        }
        expired.len()
    }
}

/// インメモリ実装
///
/// `Clone` は同じキー空間を共有する。
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// 空のストアを作成
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // 保持中にパニックしても中身は整合しているので回復して使う
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 生存中のリース数
    pub fn lease_count(&self) -> usize {
        let mut inner = self.lock();
        inner.purge_expired();
        inner.leases.len()
    }

    /// リースが生存しているか
    pub fn lease_alive(&self, lease: LeaseId) -> bool {
        let mut inner = self.lock();
        inner.purge_expired();
        inner.leases.contains_key(&lease)
    }

    /// 生存中のウォッチ数
    pub fn watcher_count(&self) -> usize {
        let mut inner = self.lock();
        inner.watchers.retain(|slot| !slot.token.is_cancelled() && !slot.tx.is_closed());
        inner.watchers.len()
    }

    /// 全ウォッチをストア側からキャンセルする
    pub fn cancel_watches(&self) {
        let mut inner = self.lock();
        for slot in inner.watchers.drain(..) {
            let _ = slot.tx.send(WatchMessage::Canceled);
        }
    }

    /// 失効したリースを掃除する
    ///
    /// 各操作の前にも実行されるので、明示的に呼ぶ必要はない。
    pub fn sweep(&self) -> usize {
        self.lock().purge_expired()
    }

    /// 定期的に失効リースを掃除するタスクを起動
    ///
    /// 操作が無くてもウォッチャーに削除イベントを届けるために使う。
    pub fn spawn_expiry_sweeper(
        &self,
        period: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = timer.tick() => {
                        let expired = store.sweep();
                        if expired > 0 {
                            trace!(expired, "Expiry sweep");
                        }
                    }
                }
            }
        })
    }

    fn refresh(&self, lease: LeaseId) -> Option<KeepAliveAck> {
        let mut inner = self.lock();
        inner.purge_expired();
        let entry = inner.leases.get_mut(&lease)?;
        entry.deadline = Instant::now() + entry.ttl;
        Some(KeepAliveAck {
            lease,
            ttl: entry.ttl.as_secs() as i64,
        })
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.purge_expired();
        if let Some(lease) = lease {
            if !inner.leases.contains_key(&lease) {
                return Err(StoreError::LeaseNotFound(lease));
            }
        }
        inner.kvs.insert(key.to_string(), Entry { value, lease });
        inner.emit(key, EventKind::Put);
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>> {
        let mut inner = self.lock();
        inner.purge_expired();
        Ok(inner
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
                lease: e.lease,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut inner = self.lock();
        inner.purge_expired();
        let existed = inner.kvs.remove(key).is_some();
        if existed {
            inner.emit(key, EventKind::Delete);
        }
        Ok(existed)
    }

    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let mut inner = self.lock();
        inner.purge_expired();
        inner.watchers.push(WatchSlot {
            prefix: prefix.to_string(),
            tx,
            token: token.clone(),
        });
        Ok(StoreStream::new(rx, token))
    }

    async fn lease_grant(&self, ttl: Duration) -> StoreResult<LeaseId> {
        let mut inner = self.lock();
        inner.purge_expired();
        inner.next_lease += 1;
        let lease = inner.next_lease;
        inner.leases.insert(
            lease,
            LeaseEntry {
                ttl,
                deadline: Instant::now() + ttl,
                keepalives: Vec::new(),
            },
        );
        Ok(lease)
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> StoreResult<KeepAliveStream> {
        let token = CancellationToken::new();
        let ttl = {
            let mut inner = self.lock();
            inner.purge_expired();
            let entry = inner
                .leases
                .get_mut(&lease)
                .ok_or(StoreError::LeaseNotFound(lease))?;
            entry.keepalives.push(token.clone());
            entry.ttl
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let store = self.clone();
        let pump = token.clone();
        // etcdクライアントと同じく TTL の1/3ごとに更新する
        let period = (ttl / 3).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            loop {
                tokio::select! {
                    biased;
                    _ = pump.cancelled() => break,
                    _ = timer.tick() => {
                        let Some(ack) = store.refresh(lease) else {
                            break;
                        };
                        if tx.send(ack).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(StoreStream::new(rx, token))
    }

    async fn lease_revoke(&self, lease: LeaseId) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.purge_expired();
        if inner.remove_lease(lease) {
            debug!(lease, "Lease revoked");
        }
        Ok(())
    }
}
