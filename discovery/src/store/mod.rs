//! コーディネーションストア
//!
//! レジストリが利用する最小限のKV契約。キー単位でアトミック、
//! 読み取りは線形化可能であることを前提とする。

pub mod memory;

#[cfg(feature = "etcd")]
pub mod etcd;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

pub use memory::MemoryStore;

#[cfg(feature = "etcd")]
pub use self::etcd::EtcdStore;

/// ストアが払い出すリースID
pub type LeaseId = i64;

/// ストア操作のエラー
#[derive(Debug, Error)]
pub enum StoreError {
    /// ストアに接続できない
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// リースが存在しない（失効・破棄済み）
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    /// バックエンド固有のエラー
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Result alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// キーと値の組
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// キー
    pub key: String,
    /// 値
    pub value: Vec<u8>,
    /// キーが紐づくリース
    pub lease: Option<LeaseId>,
}

/// 変更の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// 作成・更新
    Put,
    /// 削除（明示的削除・リース失効）
    Delete,
}

/// プレフィックス配下の1件の変更
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// 変更されたキー
    pub key: String,
    /// 変更の種類
    pub kind: EventKind,
}

/// ウォッチストリームの要素
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchMessage {
    /// 変更イベント
    Event(WatchEvent),
    /// ストア側でウォッチがキャンセルされた（この後ストリームは終了する）
    Canceled,
}

/// キープアライブ応答
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveAck {
    /// 更新されたリース
    pub lease: LeaseId,
    /// 更新後の残りTTL（秒）
    pub ttl: i64,
}

/// ストアから届くストリーム
///
/// 破棄または [`StoreStream::cancel`] でストア側のリソースを解放する。
pub struct StoreStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
    token: CancellationToken,
    _guard: DropGuard,
}

/// プレフィックスウォッチ
pub type WatchStream = StoreStream<WatchMessage>;

/// リースのキープアライブ応答ストリーム
pub type KeepAliveStream = StoreStream<KeepAliveAck>;

impl<T> StoreStream<T> {
    /// 受信側と、供給側タスクが監視するトークンから作成
    pub fn new(rx: mpsc::UnboundedReceiver<T>, token: CancellationToken) -> Self {
        let guard = token.clone().drop_guard();
        Self {
            rx,
            token,
            _guard: guard,
        }
    }

    /// 次の要素を待つ（終了時は `None`）
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// ストア側のリソースを解放する
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// 解放済みか
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// コーディネーションストアの契約
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// 値を書き込む（`lease` 指定時はリースに紐づける）
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()>;

    /// プレフィックス配下のキーをキー順で取得
    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<KeyValue>>;

    /// キーを削除する（存在しなかった場合は `false`）
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// プレフィックス配下の変更を監視（購読以降の変更のみ）
    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream>;

    /// リースを発行
    async fn lease_grant(&self, ttl: Duration) -> StoreResult<LeaseId>;

    /// リースを維持し続け、応答をストリームで返す
    ///
    /// 失効・破棄・通信断でストリームは終了する。
    async fn lease_keep_alive(&self, lease: LeaseId) -> StoreResult<KeepAliveStream>;

    /// リースを破棄し、紐づくキーを削除する（存在しないリースは成功扱い）
    async fn lease_revoke(&self, lease: LeaseId) -> StoreResult<()>;
}
