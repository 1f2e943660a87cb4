//! 共通型定義
//!
//! ServiceInstance, EndPointInstance 等のレジストリに保存されるデータ型。
//! フィールド名はストアに書き込まれるJSONの形そのものなので変更しないこと。

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DiscoveryError, DiscoveryResult};

/// サービスインスタンス
///
/// 1プロセス分の登録単位。`{namespace}/{name}/{id}` に保存される。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceInstance {
    /// プロセスごとに一意な識別子（呼び出し側が割り当てる）
    pub id: String,
    /// 論理サービス名（検索キー）
    pub name: String,
    /// 到達可能なアドレス一覧（順序あり）
    #[serde(default)]
    pub endpoints: Vec<EndPointInstance>,
}

impl ServiceInstance {
    /// ランダムなIDで新しいインスタンスを作成
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), name)
    }

    /// 指定IDで新しいインスタンスを作成
    pub fn with_id(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            endpoints: Vec::new(),
        }
    }

    /// エンドポイントを追加（ビルダー形式）
    pub fn with_endpoint(mut self, endpoint: EndPointInstance) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// 全エンドポイントの重みを検証する
    ///
    /// 負の重みは設定ミスとして報告する。
    pub fn validate_weights(&self) -> DiscoveryResult<()> {
        self.endpoints.iter().try_for_each(EndPointInstance::validate)
    }

    /// JSONにエンコード
    pub fn to_json(&self) -> DiscoveryResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// JSONからデコード
    ///
    /// `key` はエラー報告用のストアキー。
    pub fn from_json(key: &str, bytes: &[u8]) -> DiscoveryResult<Self> {
        serde_json::from_slice(bytes).map_err(|source| DiscoveryError::Decode {
            key: key.to_string(),
            source,
        })
    }
}

/// エンドポイント
///
/// 親の [`ServiceInstance`] にのみ所有される。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndPointInstance {
    /// `host:port` 形式のアドレス
    pub endpoint: String,
    /// 相対的な選択確率（0 は選択されない）
    pub weight: i32,
    /// 最終ヘルスチェック成功時刻（UNIX秒、未チェックは0）
    #[serde(default)]
    pub healthy_at: i64,
}

impl EndPointInstance {
    /// 未チェック状態のエンドポイントを作成
    pub fn new(endpoint: impl Into<String>, weight: i32) -> Self {
        Self {
            endpoint: endpoint.into(),
            weight,
            healthy_at: 0,
        }
    }

    /// 重みが非負であることを確認
    pub fn validate(&self) -> DiscoveryResult<()> {
        if self.weight < 0 {
            return Err(DiscoveryError::InvalidWeight {
                endpoint: self.endpoint.clone(),
                weight: self.weight,
            });
        }
        Ok(())
    }

    /// 一度でもヘルスチェックに成功したか
    pub fn is_probed(&self) -> bool {
        self.healthy_at > 0
    }

    /// ヘルスチェック成功を記録（UNIX秒）
    pub fn mark_healthy_at(&mut self, at: i64) {
        self.healthy_at = at;
    }
}
