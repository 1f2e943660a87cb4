//! ヘルススーパーバイザー
//!
//! 一定間隔で自サービスの全インスタンスのエンドポイントへTCP接続を試み、
//! 到達できないものを除いて書き戻す。自インスタンスは再登録し、
//! 他プロセスのインスタンスは所有者のリースのまま書き換える。

use chrono::Utc;
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use service_discovery::{DiscoveryConfig, EndPointInstance, Registrar, ServiceInstance};

/// デフォルトのチェック間隔
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// デフォルトの接続タイムアウト
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// ヘルスチェック設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthOptions {
    /// チェック間隔
    pub interval: Duration,
    /// 1エンドポイントあたりの接続タイムアウト
    pub probe_timeout: Duration,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_CHECK_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl HealthOptions {
    /// 設定から作成
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            interval: config.health_check_interval(),
            probe_timeout: config.probe_timeout(),
        }
    }
}

/// 接続確認の失敗理由
#[derive(Debug)]
pub enum ProbeFailure {
    /// タイムアウト内に接続できなかった
    Timeout,
    /// 接続が拒否された等
    Connect(std::io::Error),
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "probe timed out"),
            Self::Connect(e) => write!(f, "connect failed: {}", e),
        }
    }
}

/// 1回のチェック結果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// 確認したインスタンス数
    pub instances: usize,
    /// 到達できたエンドポイント数
    pub healthy: usize,
    /// 除外したエンドポイント数
    pub dropped: usize,
    /// 再登録に失敗したインスタンス数
    pub reregister_failures: usize,
}

/// エンドポイントへTCP接続できるか確認する
pub async fn probe(endpoint: &str, timeout: Duration) -> Result<(), ProbeFailure> {
    match tokio::time::timeout(timeout, TcpStream::connect(endpoint)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(ProbeFailure::Connect(e)),
        Err(_) => Err(ProbeFailure::Timeout),
    }
}

/// Health supervisor
///
/// `service_name` に登録された全インスタンスを監視する。
#[derive(Clone)]
pub struct HealthSupervisor {
    registrar: Arc<dyn Registrar>,
    service_name: String,
    owner: Option<String>,
    options: HealthOptions,
}

impl HealthSupervisor {
    /// 新しいスーパーバイザーを作成
    pub fn new(
        registrar: Arc<dyn Registrar>,
        service_name: impl Into<String>,
        options: HealthOptions,
    ) -> Self {
        Self {
            registrar,
            service_name: service_name.into(),
            owner: None,
            options,
        }
    }

    /// 自プロセスが所有するインスタンスIDを設定する
    ///
    /// このインスタンスだけが `register` で再登録され、ハートビートを得る。
    pub fn with_owner(mut self, instance_id: impl Into<String>) -> Self {
        self.owner = Some(instance_id.into());
        self
    }

    /// `token` がキャンセルされるまでバックグラウンドで監視する
    ///
    /// 最初のチェックは開始から1間隔後。`register_token` は再登録時の
    /// ハートビートの親トークンになる。
    pub fn spawn(
        self,
        token: CancellationToken,
        register_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = interval(self.options.interval);
            // interval() の初回tickは即時なので読み捨てる
            timer.tick().await;

            info!(
                service = %self.service_name,
                interval_secs = self.options.interval.as_secs(),
                "Health supervisor started"
            );

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = timer.tick() => {
                        self.check_once(&register_token).await;
                    }
                }
            }

            info!(service = %self.service_name, "Health supervisor stopped");
        })
    }

    /// 1回分のチェックを実行する
    ///
    /// 検索に失敗した場合は空のレポートを返し、次回に任せる。
    pub async fn check_once(&self, register_token: &CancellationToken) -> HealthReport {
        let mut report = HealthReport::default();

        let instances = match self.registrar.get_service(&self.service_name).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(service = %self.service_name, error = %e, "Health check lookup failed");
                return report;
            }
        };

        for instance in instances {
            report.instances += 1;
            let total = instance.endpoints.len();
            let checked = self.check_instance(instance).await;
            report.healthy += checked.endpoints.len();
            report.dropped += total - checked.endpoints.len();

            let written = if self.owner.as_deref() == Some(checked.id.as_str()) {
                self.registrar.register(register_token, &checked).await
            } else {
                match self.registrar.update(&checked).await {
                    Ok(true) => Ok(()),
                    Ok(false) => {
                        debug!(
                            service = %checked.name,
                            instance_id = %checked.id,
                            "Instance went away during health check"
                        );
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            };

            if let Err(e) = written {
                report.reregister_failures += 1;
                warn!(
                    service = %checked.name,
                    instance_id = %checked.id,
                    error = %e,
                    "Failed to re-register after health check"
                );
            }
        }

        debug!(
            service = %self.service_name,
            instances = report.instances,
            healthy = report.healthy,
            dropped = report.dropped,
            "Health check completed"
        );
        report
    }

    /// 到達できたエンドポイントだけを残したインスタンスを返す
    async fn check_instance(&self, mut instance: ServiceInstance) -> ServiceInstance {
        let started = Utc::now().timestamp();
        let timeout = self.options.probe_timeout;

        let endpoints = std::mem::take(&mut instance.endpoints);
        let results = join_all(
            endpoints
                .iter()
                .map(|endpoint| probe(&endpoint.endpoint, timeout)),
        )
        .await;

        let healthy: Vec<EndPointInstance> = endpoints
            .into_iter()
            .zip(results)
            .filter_map(|(mut endpoint, result)| match result {
                Ok(()) => {
                    endpoint.mark_healthy_at(started);
                    Some(endpoint)
                }
                Err(failure) => {
                    log_failure(&instance.id, &endpoint, &failure);
                    None
                }
            })
            .collect();
        instance.endpoints = healthy;
        instance
    }
}

fn log_failure(instance_id: &str, endpoint: &EndPointInstance, failure: &ProbeFailure) {
    match failure {
        ProbeFailure::Timeout => debug!(
            instance_id = %instance_id,
            endpoint = %endpoint.endpoint,
            "Endpoint probe timed out, dropping"
        ),
        ProbeFailure::Connect(e) => warn!(
            instance_id = %instance_id,
            endpoint = %endpoint.endpoint,
            error = %e,
            "Endpoint unreachable, dropping"
        ),
    }
}
