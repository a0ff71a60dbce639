//! Pool-proportional payout arithmetic.
//!
//! Every winning wager takes `amount / winning_total` of the *whole* pool (winners and losers
//! combined), and every losing wager forfeits its stake. Amounts are computed in hundredths of a
//! point with integer arithmetic: floor first, then the leftover hundredths go one by one to the
//! largest remainders (ties to the lower wager id), so the awards always sum to the pool exactly.

use crate::db::models::ledger::{POINT_SCALE, Points};
use crate::db::models::user::UserId;
use crate::db::models::wager::{Wager, WagerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolDelta {
    pub wager_id: WagerId,
    pub user_id: UserId,
    pub delta: Points,
}

/// Point deltas for every wager in `pool` when `winner` is declared.
///
/// Returns nothing when no wager picked `winner`: with nobody to pay out, losers keep their
/// stakes too.
pub fn distribute(pool: &[Wager], winner: &str) -> Vec<PoolDelta> {
    let winning_total: i128 = pool
        .iter()
        .filter(|w| w.selected_team == winner)
        .map(|w| w.amount as i128)
        .sum();

    if winning_total == 0 {
        return Vec::new();
    }

    let scale = POINT_SCALE as i128;
    let scaled_pool: i128 = pool.iter().map(|w| w.amount as i128).sum::<i128>() * scale;

    // (index into pool, floored award, remainder)
    let mut shares: Vec<(usize, i128, i128)> = pool
        .iter()
        .enumerate()
        .filter(|(_, w)| w.selected_team == winner)
        .map(|(idx, w)| {
            let numerator = w.amount as i128 * scaled_pool;
            (idx, numerator / winning_total, numerator % winning_total)
        })
        .collect();

    let floored: i128 = shares.iter().map(|(_, award, _)| award).sum();
    let leftover = (scaled_pool - floored) as usize;

    shares.sort_by(|a, b| b.2.cmp(&a.2).then(pool[a.0].id.cmp(&pool[b.0].id)));
    for share in shares.iter_mut().take(leftover) {
        share.1 += 1;
    }

    let mut awards = vec![None; pool.len()];
    for (idx, award, _) in shares {
        awards[idx] = Some(award as i64);
    }

    pool.iter()
        .zip(awards)
        .map(|(wager, award)| PoolDelta {
            wager_id: wager.id,
            user_id: wager.user_id,
            delta: match award {
                Some(hundredths) => Points(hundredths),
                None => -Points::from_whole(wager.amount),
            },
        })
        .collect()
}
