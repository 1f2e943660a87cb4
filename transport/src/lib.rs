//! Service Discovery Transport
//!
//! レジストリの上に構築するコンシューマー側クライアント（エンドポイント解決・
//! 重み付き選択）と、プロバイダー側サーバー（登録・ヘルススーパーバイザー）

#![warn(missing_docs)]

/// 重み付きランダム選択
pub mod balancer;

/// エンドポイント解決クライアント
pub mod client;

/// 定期ヘルスチェック
pub mod health;

/// プロバイダー側の登録ファサード
pub mod server;

/// sdctl コマンドライン
pub mod cli;

pub use balancer::pick_weighted;
pub use client::Client;
pub use health::{HealthOptions, HealthReport, HealthSupervisor, ProbeFailure};
pub use server::Server;
