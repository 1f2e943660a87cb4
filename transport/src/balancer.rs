//! 重み付きランダム選択
//!
//! 重みの合計に対する比率で1件を選ぶ。重み0のエンドポイントは選ばれない。

use rand::Rng;

use service_discovery_common::{DiscoveryError, DiscoveryResult, EndPointInstance};

/// エンドポイントを重みに比例した確率で1件選ぶ
///
/// - 負の重みがあれば [`DiscoveryError::InvalidWeight`]
/// - 空、または重みの合計が0なら [`DiscoveryError::NoEndpointsAvailable`]
pub fn pick_weighted<'a, R: Rng + ?Sized>(
    endpoints: &'a [EndPointInstance],
    rng: &mut R,
) -> DiscoveryResult<&'a EndPointInstance> {
    let mut total: u64 = 0;
    for endpoint in endpoints {
        endpoint.validate()?;
        total += endpoint.weight as u64;
    }
    if total == 0 {
        return Err(DiscoveryError::NoEndpointsAvailable);
    }

    let mut remaining = rng.gen_range(0..total);
    for endpoint in endpoints {
        let weight = endpoint.weight as u64;
        if remaining < weight {
            return Ok(endpoint);
        }
        remaining -= weight;
    }

    // remaining < total なので到達しない
    Err(DiscoveryError::NoEndpointsAvailable)
}
