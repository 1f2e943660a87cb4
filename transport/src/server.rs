//! プロバイダー側サーバー
//!
//! 自インスタンスの登録・登録解除と、ヘルススーパーバイザーの起動を行う。

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use service_discovery::{DiscoveryResult, Registrar, ServiceInstance};

use crate::health::{HealthOptions, HealthSupervisor};

/// Provider facade
pub struct Server {
    registrar: Arc<dyn Registrar>,
    instance: ServiceInstance,
    token: CancellationToken,
    supervisor_token: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// サーバーを作成し、ヘルススーパーバイザーを起動する
    ///
    /// スーパーバイザーは `token` の子トークンで動き、`token` のキャンセルか
    /// [`Server::shutdown`] で止まる。tokio ランタイム内で呼ぶこと。
    pub fn new(
        token: CancellationToken,
        instance: ServiceInstance,
        registrar: Arc<dyn Registrar>,
        options: HealthOptions,
    ) -> Self {
        let supervisor_token = token.child_token();
        let supervisor = HealthSupervisor::new(registrar.clone(), instance.name.clone(), options)
            .with_owner(instance.id.clone())
            .spawn(supervisor_token.clone(), token.clone());

        Self {
            registrar,
            instance,
            token,
            supervisor_token,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    /// 管理しているインスタンス
    pub fn instance(&self) -> &ServiceInstance {
        &self.instance
    }

    /// インスタンスを登録する
    pub async fn register(&self) -> DiscoveryResult<()> {
        self.registrar.register(&self.token, &self.instance).await?;
        info!(
            service = %self.instance.name,
            instance_id = %self.instance.id,
            "Service registered"
        );
        Ok(())
    }

    /// インスタンスの登録を解除する
    pub async fn deregister(&self) -> DiscoveryResult<()> {
        self.registrar.deregister(&self.instance).await?;
        info!(
            service = %self.instance.name,
            instance_id = %self.instance.id,
            "Service deregistered"
        );
        Ok(())
    }

    /// スーパーバイザーを止めてから登録を解除する
    pub async fn shutdown(&self) -> DiscoveryResult<()> {
        self.supervisor_token.cancel();
        if let Some(handle) = self.supervisor.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Health supervisor task failed");
            }
        }
        self.deregister().await
    }
}
