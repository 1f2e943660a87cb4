//! Service Discovery
//!
//! コーディネーションストア上のリース付き登録・検索・変更通知
//!
//! ```text
//! provider ──register──► Registry ──lease_grant/put──► CoordinationStore
//!                           │  └── heartbeat task (lease_keep_alive)
//! consumer ──get_service──► Registry ──get_prefix────► CoordinationStore
//! consumer ──watcher──────► ChangeWatcher ──watch_prefix──► bridge task ──► ChangeStream
//! ```

#![warn(missing_docs)]

/// コーディネーションストアの契約と実装
pub mod store;

/// サービスレジストリ（リース・ハートビート）
pub mod registry;

/// 変更通知ウォッチャー
pub mod watcher;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use registry::{LeaseStatus, Registry, RegistryOptions};
pub use service_discovery_common::{
    DiscoveryConfig, DiscoveryError, DiscoveryResult, EndPointInstance, ServiceInstance,
};
pub use store::{CoordinationStore, MemoryStore};
pub use watcher::{ChangeStream, ChangeWatcher, CloseReason};

/// サービス登録・検索の抽象
#[async_trait]
pub trait Registrar: Send + Sync {
    /// インスタンスを登録し、`token` がキャンセルされるまでリースを維持する
    async fn register(
        &self,
        token: &CancellationToken,
        service: &ServiceInstance,
    ) -> DiscoveryResult<()>;

    /// インスタンスを削除し、保持しているリースを解放する
    async fn deregister(&self, service: &ServiceInstance) -> DiscoveryResult<()>;

    /// 登録済みインスタンスの値を、所有者のリースを保ったまま書き換える
    ///
    /// 未登録なら何もせず `false` を返す。
    async fn update(&self, service: &ServiceInstance) -> DiscoveryResult<bool>;

    /// サービス名に登録されている全インスタンスを取得
    async fn get_service(&self, service_name: &str) -> DiscoveryResult<Vec<ServiceInstance>>;

    /// サービス名の変更を監視するウォッチャーを作成
    fn watcher(&self, service_name: &str) -> Box<dyn Watcher>;
}

/// 変更通知の購読
#[async_trait]
pub trait Watcher: Send + Sync {
    /// 監視を開始し、変更ごとに1件通知するストリームを返す
    async fn watch(&self, token: &CancellationToken) -> DiscoveryResult<ChangeStream>;

    /// 監視リソースを解放する（冪等）
    fn stop(&self);
}
