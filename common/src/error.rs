//! エラー型定義
//!
//! 統一エラー型（thiserror使用）
//!
//! ストア・シリアライズ系の失敗はすべて呼び出し元に返す。内部リトライはしない。
//! ハートビートやウォッチのストリーム終了はエラーではなく、各モジュールの
//! 終端状態（`LeaseStatus` / `CloseReason`）として表現する。

use thiserror::Error;

/// Service discovery error type
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// インスタンスのエンコード失敗（何も書き込まれていない）
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// ストア上の値のデコード失敗（検索全体を中断）
    #[error("Failed to decode service instance at {key}: {source}")]
    Decode {
        /// 壊れていたキー
        key: String,
        /// デコードエラー
        #[source]
        source: serde_json::Error,
    },

    /// put / delete の失敗
    #[error("Store write error: {0}")]
    StoreWrite(String),

    /// get / watch の失敗
    #[error("Store read error: {0}")]
    StoreRead(String),

    /// リース取得・キープアライブ開始の失敗
    #[error("Lease error: {0}")]
    Lease(String),

    /// 選択可能なエンドポイントがない（空、または重み合計が0）
    #[error("No available endpoints")]
    NoEndpointsAvailable,

    /// 負の重み（設定ミス）
    #[error("Invalid weight {weight} for endpoint {endpoint}")]
    InvalidWeight {
        /// 対象エンドポイント
        endpoint: String,
        /// 設定された重み
        weight: i32,
    },

    /// 設定エラー
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DiscoveryError {
    /// ストア側の一時的な障害か（呼び出し元がリトライを判断するため）
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            Self::StoreWrite(_) | Self::StoreRead(_) | Self::Lease(_)
        )
    }
}

impl From<config::ConfigError> for DiscoveryError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result alias for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
