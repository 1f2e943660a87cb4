//! コンシューマー側クライアント
//!
//! サービス名をエンドポイント一覧に解決し、重み付きで1件を選ぶ。

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::{Arc, Mutex};
use tracing::debug;

use service_discovery::{DiscoveryResult, EndPointInstance, Registrar, ServiceInstance};

use crate::balancer::pick_weighted;

/// Endpoint resolver
pub struct Client {
    registrar: Arc<dyn Registrar>,
    current: ServiceInstance,
    rng: Mutex<StdRng>,
}

impl Client {
    /// 自身のインスタンスとレジストラから作成
    pub fn new(current: ServiceInstance, registrar: Arc<dyn Registrar>) -> Self {
        Self {
            registrar,
            current,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// 乱数シードを固定する（テスト用）
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// 呼び出し元自身のインスタンス
    pub fn current_service(&self) -> &ServiceInstance {
        &self.current
    }

    /// サービスの全エンドポイントを取得
    ///
    /// インスタンス順、その中のエンドポイント順を保つ。
    pub async fn get_endpoints(&self, name: &str) -> DiscoveryResult<Vec<EndPointInstance>> {
        let instances = self.registrar.get_service(name).await?;
        let endpoints: Vec<EndPointInstance> = instances
            .into_iter()
            .flat_map(|instance| instance.endpoints)
            .collect();
        debug!(service = %name, count = endpoints.len(), "Resolved endpoints");
        Ok(endpoints)
    }

    /// 重み付きランダムでエンドポイントを1件選ぶ
    pub async fn pick_one_endpoint(&self, name: &str) -> DiscoveryResult<EndPointInstance> {
        let endpoints = self.get_endpoints(name).await?;
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let picked = pick_weighted(&endpoints, &mut *rng)?;
        debug!(service = %name, endpoint = %picked.endpoint, weight = picked.weight, "Picked endpoint");
        Ok(picked.clone())
    }
}
