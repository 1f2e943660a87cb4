//! ロギング初期化
//!
//! `RUST_LOG`（未設定時は `info`）で出力レベルを制御する。

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// デフォルトのログフィルタ
const DEFAULT_FILTER: &str = "info";

/// tracing subscriber を初期化
///
/// 既にグローバルsubscriberが設定済みの場合はエラーを返す。
pub fn init() -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
}
