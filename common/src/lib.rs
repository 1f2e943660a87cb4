//! Service Discovery Common
//!
//! レジストリ・クライアント・ヘルスチェッカー間で共有する型定義

#![warn(missing_docs)]

/// サービスインスタンス・エンドポイントのデータ型
pub mod types;

/// 統一エラー型
pub mod error;

/// 設定管理（設定ファイル・環境変数）
pub mod config;

/// ロギング初期化ユーティリティ
pub mod logging;

pub use config::DiscoveryConfig;
pub use error::{DiscoveryError, DiscoveryResult};
pub use types::{EndPointInstance, ServiceInstance};
