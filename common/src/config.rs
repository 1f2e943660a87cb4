//! 設定管理
//!
//! DiscoveryConfig 等の設定構造体。設定ファイル（任意）と `DISCOVERY_*`
//! 環境変数から `config` クレートで読み込む。

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{DiscoveryError, DiscoveryResult};

/// 環境変数のプレフィックス
pub const ENV_PREFIX: &str = "DISCOVERY";

/// service discovery設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// キーのネームスペース (デフォルト: "/services")
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// 登録リースのTTL（秒）(デフォルト: 15)
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    /// ヘルスチェック間隔（秒）(デフォルト: 60)
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// 接続確認のタイムアウト（秒）(デフォルト: 3)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// etcdエンドポイント（カンマ区切り）(デフォルト: "http://127.0.0.1:2379")
    #[serde(default = "default_etcd_endpoints")]
    pub etcd_endpoints: String,
}

fn default_namespace() -> String {
    "/services".to_string()
}

fn default_ttl() -> u64 {
    15
}

fn default_health_check_interval() -> u64 {
    60
}

fn default_probe_timeout() -> u64 {
    3
}

fn default_etcd_endpoints() -> String {
    "http://127.0.0.1:2379".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            ttl_secs: default_ttl(),
            health_check_interval_secs: default_health_check_interval(),
            probe_timeout_secs: default_probe_timeout(),
            etcd_endpoints: default_etcd_endpoints(),
        }
    }
}

impl DiscoveryConfig {
    /// 設定ファイル（任意）と環境変数から読み込む
    ///
    /// 環境変数は設定ファイルより優先される（例: `DISCOVERY_TTL_SECS=20`）。
    pub fn load(path: Option<&Path>) -> DiscoveryResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// 値の整合性を検証
    pub fn validate(&self) -> DiscoveryResult<()> {
        if !self.namespace.starts_with('/') || self.namespace.len() < 2 {
            return Err(DiscoveryError::Config(format!(
                "namespace must be an absolute key prefix, got {:?}",
                self.namespace
            )));
        }
        if self.namespace.ends_with('/') {
            return Err(DiscoveryError::Config(format!(
                "namespace must not end with '/', got {:?}",
                self.namespace
            )));
        }
        for (name, value) in [
            ("ttl_secs", self.ttl_secs),
            ("health_check_interval_secs", self.health_check_interval_secs),
            ("probe_timeout_secs", self.probe_timeout_secs),
        ] {
            if value == 0 {
                return Err(DiscoveryError::Config(format!("{name} must be greater than 0")));
            }
        }
        Ok(())
    }

    /// リースTTL
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// ヘルスチェック間隔
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// 接続確認タイムアウト
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// etcdエンドポイントの一覧
    pub fn etcd_endpoint_list(&self) -> Vec<String> {
        self.etcd_endpoints
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}
