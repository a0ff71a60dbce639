use core::fmt;

use async_trait::async_trait;
use uuid::Uuid;

use crate::db::StoreResult;
use crate::db::models::fixture::{Match, MatchId, NewMatch};
use crate::db::models::ledger::{LedgerEntry, Payout, Points};
use crate::db::models::user::{NewUser, User, UserId};
use crate::db::models::wager::{NewWager, Wager, WagerId};

pub mod memory;
pub mod pg;

/// Everything a settlement changes, applied by [`Store::commit_settlement`] as one unit.
#[derive(Debug, Clone)]
pub struct SettlementCommit {
    pub settlement_id: Uuid,
    pub match_id: MatchId,
    /// Version read before the plan was built; the commit fails if the match moved on
    pub expected_version: i64,
    pub winner: Option<String>,
    pub is_abandoned: bool,
    /// Net relative increments per user (reversal of the previous payouts plus the new ones)
    pub increments: Vec<(UserId, Points)>,
    /// Replaces every payout row currently stored for the match
    pub payouts: Vec<Payout>,
}

/// Persistence seam for the engine and its collaborators.
///
/// Ledger totals only ever move through [`Store::commit_settlement`], and only by relative
/// increments.
#[async_trait]
pub trait Store: Send + Sync + fmt::Debug {
    fn backend(&self) -> &'static str;

    async fn insert_user(&self, item: &NewUser) -> StoreResult<User>;
    async fn get_user(&self, id: UserId) -> StoreResult<Option<User>>;
    async fn list_users(&self) -> StoreResult<Vec<User>>;
    async fn set_user_active(&self, id: UserId, active: bool) -> StoreResult<Option<User>>;

    async fn insert_match(&self, item: &NewMatch) -> StoreResult<Match>;
    async fn get_match(&self, id: MatchId) -> StoreResult<Option<Match>>;
    async fn list_matches(&self) -> StoreResult<Vec<Match>>;

    // Wager writes re-check that the match is open and bump its version in the same unit as the
    // write. A settlement planned before the write then fails its version check instead of
    // committing without the wager, and a write after a settlement fails with `MatchClosed`.

    /// Fails with `DuplicateWager` if the user already has a wager on the match.
    async fn insert_wager(&self, item: &NewWager) -> StoreResult<Wager>;
    async fn update_wager(
        &self,
        id: WagerId,
        selected_team: &str,
        amount: i64,
    ) -> StoreResult<Option<Wager>>;
    async fn update_wager_by_user_and_match(
        &self,
        user_id: UserId,
        match_id: MatchId,
        selected_team: &str,
        amount: i64,
    ) -> StoreResult<Option<Wager>>;
    async fn get_wager(&self, id: WagerId) -> StoreResult<Option<Wager>>;
    async fn get_wager_for(&self, user_id: UserId, match_id: MatchId)
    -> StoreResult<Option<Wager>>;
    async fn list_wagers_for_match(&self, match_id: MatchId) -> StoreResult<Vec<Wager>>;
    async fn list_wagers_for_user(&self, user_id: UserId) -> StoreResult<Vec<Wager>>;
    async fn list_wagers(&self) -> StoreResult<Vec<Wager>>;

    async fn list_payouts_for_match(&self, match_id: MatchId) -> StoreResult<Vec<Payout>>;
    async fn get_score(&self, user_id: UserId) -> StoreResult<Option<LedgerEntry>>;
    async fn list_scores(&self) -> StoreResult<Vec<LedgerEntry>>;

    /// Atomically: check and bump the match version, persist the outcome, swap the payout rows
    /// and apply the increments. Nothing is visible if any step fails.
    async fn commit_settlement(&self, commit: &SettlementCommit) -> StoreResult<Match>;
}
