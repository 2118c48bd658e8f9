//! Access gate: a direct conversation is visible iff both sides hold at least one
//! asset contract in common.

use std::collections::HashSet;

use crate::error::AccessDenial;
use crate::state::{Address, AssetInfo};

/// Assets of `a` whose contract `b` also holds. Order follows `a`.
pub fn shared_assets(a: &[AssetInfo], b: &[AssetInfo]) -> Vec<AssetInfo> {
    let theirs: HashSet<&Address> = b.iter().map(|x| &x.contract_address).collect();
    let mut seen = HashSet::new();
    a.iter()
        .filter(|x| theirs.contains(&x.contract_address))
        .filter(|x| seen.insert(x.contract_address.clone()))
        .cloned()
        .collect()
}

/// Shared assets, or the specific reason there are none.
pub fn evaluate(user: &[AssetInfo], peer: &[AssetInfo]) -> Result<Vec<AssetInfo>, AccessDenial> {
    if user.is_empty() {
        return Err(AccessDenial::UserOwnsNothing);
    }
    if peer.is_empty() {
        return Err(AccessDenial::PeerOwnsNothing);
    }
    let shared = shared_assets(user, peer);
    if shared.is_empty() {
        return Err(AccessDenial::NoOverlap);
    }
    Ok(shared)
}
