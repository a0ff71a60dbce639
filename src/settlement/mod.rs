use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use crate::db::prelude::*;
use crate::util::lock::MatchLocks;

pub mod payout;

/// What an admin declared for a match, checked against its teams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Winner(String),
    Abandoned,
    /// Winner revoked; the match goes back to open-for-settlement
    Unresolved,
}

impl Outcome {
    pub fn resolve(
        fixture: &Match,
        winner: Option<String>,
        is_abandoned: bool,
    ) -> SettlementResult<Self> {
        match (winner, is_abandoned) {
            (Some(team), false) if fixture.has_team(&team) => Ok(Outcome::Winner(team)),
            (Some(team), false) => Err(SettlementError::InvalidOutcome(format!(
                "'{team}' is not playing in match {} ({} vs {})",
                fixture.id, fixture.team1, fixture.team2
            ))),
            (Some(_), true) => Err(SettlementError::InvalidOutcome(String::from(
                "an abandoned match cannot have a winner",
            ))),
            (None, true) => Ok(Outcome::Abandoned),
            (None, false) => Ok(Outcome::Unresolved),
        }
    }

    pub fn winner(&self) -> Option<&str> {
        match self {
            Outcome::Winner(team) => Some(team),
            _ => None,
        }
    }

    pub fn is_abandoned(&self) -> bool {
        matches!(self, Outcome::Abandoned)
    }
}

/// Builds the commit that takes a match from its recorded state to `outcome`.
///
/// `previous` are the payout rows stored for the match; they are negated as-is rather than
/// recomputed, so reversal is the exact inverse of the earlier application.
pub fn plan_settlement(
    fixture: &Match,
    pool: &[Wager],
    previous: &[Payout],
    outcome: &Outcome,
    settlement_id: Uuid,
) -> SettlementCommit {
    let payouts: Vec<Payout> = match outcome.winner() {
        Some(winner) => payout::distribute(pool, winner)
            .into_iter()
            .map(|d| Payout {
                settlement_id,
                match_id: fixture.id,
                wager_id: d.wager_id,
                user_id: d.user_id,
                delta: d.delta,
            })
            .collect(),
        None => Vec::new(),
    };

    let mut net: BTreeMap<UserId, Points> = BTreeMap::new();
    for old in previous {
        *net.entry(old.user_id).or_default() += -old.delta;
    }
    for new in &payouts {
        *net.entry(new.user_id).or_default() += new.delta;
    }

    SettlementCommit {
        settlement_id,
        match_id: fixture.id,
        expected_version: fixture.version,
        winner: outcome.winner().map(str::to_string),
        is_abandoned: outcome.is_abandoned(),
        increments: net.into_iter().filter(|(_, d)| !d.is_zero()).collect(),
        payouts,
    }
}

#[derive(Debug, Clone)]
pub struct SettlementEngine {
    store: Arc<dyn Store>,
    locks: MatchLocks,
}

impl SettlementEngine {
    pub fn new(store: Arc<dyn Store>, locks: MatchLocks) -> Self {
        Self { store, locks }
    }

    /// Declares `winner` (or abandonment, or neither) for a match, reversing whatever the
    /// previous declaration did to the ledger before applying the new one.
    #[instrument(skip(self, actor), fields(actor = %actor.id))]
    pub async fn settle_match(
        &self,
        actor: &CurrentUser,
        match_id: MatchId,
        winner: Option<String>,
        is_abandoned: bool,
    ) -> SettlementResult<Match> {
        if !actor.is_admin() {
            return Err(SettlementError::Unauthorized);
        }

        let _guard = self.locks.lock(match_id).await;

        let fixture = self
            .store
            .get_match(match_id)
            .await?
            .ok_or(SettlementError::NotFound(match_id))?;
        let outcome = Outcome::resolve(&fixture, winner, is_abandoned)?;

        let pool = self.store.list_wagers_for_match(match_id).await?;
        let previous = self.store.list_payouts_for_match(match_id).await?;
        let commit = plan_settlement(&fixture, &pool, &previous, &outcome, Uuid::new_v4());

        let updated = self
            .store
            .commit_settlement(&commit)
            .await
            .map_err(|e| match e {
                StoreError::VersionConflict { match_id, .. } => SettlementError::Conflict(match_id),
                StoreError::MatchNotFound(match_id) => SettlementError::NotFound(match_id),
                other => SettlementError::StorageUnavailable(other),
            })?;

        tracing::info!(
            %match_id,
            settlement_id = %commit.settlement_id,
            previous_winner = ?fixture.winner,
            winner = ?updated.winner,
            is_abandoned = updated.is_abandoned,
            wagers = pool.len(),
            reversed = previous.len(),
            users_touched = commit.increments.len(),
            "match settled"
        );

        Ok(updated)
    }
}

pub type SettlementResult<T> = core::result::Result<T, SettlementError>;

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("match {0} not found")]
    NotFound(MatchId),

    #[error("invalid outcome: {0}")]
    InvalidOutcome(String),

    #[error("only admins can settle matches")]
    Unauthorized,

    #[error("match {0} was settled concurrently, reload and retry")]
    Conflict(MatchId),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StoreError),
}

#[cfg(test)]
mod test {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::wager::{WagerError, WagerService};

    struct Fixture {
        store: Arc<dyn Store>,
        engine: SettlementEngine,
        admin: CurrentUser,
        fixture: Match,
    }

    async fn setup() -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let admin = store
            .insert_user(&NewUser {
                full_name: String::from("Umpire"),
                role: Role::Admin,
            })
            .await
            .unwrap();

        let fixture = store
            .insert_match(&NewMatch {
                team1: String::from("India"),
                team2: String::from("Australia"),
                venue: String::from("Wankhede"),
                starts_at: Utc::now() + Duration::days(1),
            })
            .await
            .unwrap();

        Fixture {
            engine: SettlementEngine::new(store.clone(), MatchLocks::new()),
            admin: CurrentUser::from(&admin),
            store,
            fixture,
        }
    }

    async fn bettor(fx: &Fixture, name: &str, team: &str, amount: i64) -> UserId {
        let user = fx
            .store
            .insert_user(&NewUser {
                full_name: name.to_string(),
                role: Role::User,
            })
            .await
            .unwrap();

        fx.store
            .insert_wager(&NewWager {
                user_id: user.id,
                match_id: fx.fixture.id,
                selected_team: team.to_string(),
                amount,
            })
            .await
            .unwrap();

        user.id
    }

    async fn points(store: &Arc<dyn Store>, user: UserId) -> Points {
        store
            .get_score(user)
            .await
            .unwrap()
            .map(|e| e.points)
            .unwrap_or_default()
    }

    async fn settle(
        fx: &Fixture,
        winner: Option<&str>,
        abandoned: bool,
    ) -> SettlementResult<Match> {
        fx.engine
            .settle_match(&fx.admin, fx.fixture.id, winner.map(str::to_string), abandoned)
            .await
    }

    #[tokio::test]
    async fn test_declare_then_change_winner() {
        let fx = setup().await;
        let a = bettor(&fx, "A", "India", 20).await;
        let b = bettor(&fx, "B", "Australia", 10).await;

        let settled = settle(&fx, Some("India"), false).await.unwrap();
        assert_eq!(settled.winner.as_deref(), Some("India"));
        assert_eq!(points(&fx.store, a).await, Points::from_whole(30));
        assert_eq!(points(&fx.store, b).await, Points::from_whole(-10));

        settle(&fx, Some("Australia"), false).await.unwrap();
        assert_eq!(points(&fx.store, a).await, Points::from_whole(-20));
        assert_eq!(points(&fx.store, b).await, Points::from_whole(30));
    }

    #[tokio::test]
    async fn test_resettling_same_winner_is_noop() {
        let fx = setup().await;
        let a = bettor(&fx, "A", "India", 10).await;
        let b = bettor(&fx, "B", "India", 20).await;
        let c = bettor(&fx, "C", "Australia", 30).await;

        let settled = settle(&fx, Some("India"), false).await.unwrap();
        let first = (
            points(&fx.store, a).await,
            points(&fx.store, b).await,
            points(&fx.store, c).await,
        );

        let again = settle(&fx, Some("India"), false).await.unwrap();
        let second = (
            points(&fx.store, a).await,
            points(&fx.store, b).await,
            points(&fx.store, c).await,
        );

        assert_eq!(first, second);
        assert_eq!(first.0 + first.1, Points::from_whole(60));
        assert_eq!(again.version, settled.version + 1);
    }

    #[tokio::test]
    async fn test_reset_restores_baseline() {
        let fx = setup().await;
        let a = bettor(&fx, "A", "India", 10).await;
        let b = bettor(&fx, "B", "India", 10).await;
        let c = bettor(&fx, "C", "India", 10).await;
        let d = bettor(&fx, "D", "Australia", 20).await;
        let e = bettor(&fx, "E", "Australia", 20).await;

        settle(&fx, Some("India"), false).await.unwrap();
        assert_eq!(points(&fx.store, a).await, Points(2334));

        let reset = settle(&fx, None, false).await.unwrap();
        assert!(!reset.is_resolved());

        for user in [a, b, c, d, e] {
            assert_eq!(points(&fx.store, user).await, Points::ZERO);
        }
        assert!(
            fx.store
                .list_payouts_for_match(fx.fixture.id)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_abandon_after_settlement_restores_baseline() {
        let fx = setup().await;
        let a = bettor(&fx, "A", "India", 20).await;
        let b = bettor(&fx, "B", "Australia", 10).await;

        settle(&fx, Some("Australia"), false).await.unwrap();
        let abandoned = settle(&fx, None, true).await.unwrap();

        assert!(abandoned.is_abandoned);
        assert_eq!(abandoned.winner, None);
        assert_eq!(points(&fx.store, a).await, Points::ZERO);
        assert_eq!(points(&fx.store, b).await, Points::ZERO);
    }

    #[tokio::test]
    async fn test_nobody_backed_winner() {
        let fx = setup().await;
        let a = bettor(&fx, "A", "Australia", 20).await;
        let b = bettor(&fx, "B", "Australia", 10).await;

        let settled = settle(&fx, Some("India"), false).await.unwrap();

        assert_eq!(settled.winner.as_deref(), Some("India"));
        assert_eq!(fx.store.get_score(a).await.unwrap(), None);
        assert_eq!(fx.store.get_score(b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_outcome_changes_nothing() {
        let fx = setup().await;
        let a = bettor(&fx, "A", "India", 20).await;
        bettor(&fx, "B", "Australia", 10).await;
        let settled = settle(&fx, Some("India"), false).await.unwrap();

        let res = settle(&fx, Some("England"), false).await;
        assert!(matches!(res, Err(SettlementError::InvalidOutcome(_))));

        let res = settle(&fx, Some("Australia"), true).await;
        assert!(matches!(res, Err(SettlementError::InvalidOutcome(_))));

        let stored = fx.store.get_match(fx.fixture.id).await.unwrap().unwrap();
        assert_eq!(stored.winner.as_deref(), Some("India"));
        assert_eq!(stored.version, settled.version);
        assert_eq!(points(&fx.store, a).await, Points::from_whole(30));
    }

    #[tokio::test]
    async fn test_missing_match_and_non_admin() {
        let fx = setup().await;

        let res = fx
            .engine
            .settle_match(&fx.admin, MatchId(404), Some(String::from("India")), false)
            .await;
        assert!(matches!(res, Err(SettlementError::NotFound(MatchId(404)))));

        let punter = CurrentUser {
            id: UserId(99),
            role: Role::User,
        };
        let res = fx
            .engine
            .settle_match(&punter, fx.fixture.id, Some(String::from("India")), false)
            .await;
        assert!(matches!(res, Err(SettlementError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_stale_commit_is_rejected() {
        let fx = setup().await;
        let a = bettor(&fx, "A", "India", 20).await;
        bettor(&fx, "B", "Australia", 10).await;

        // plan built against the current version, but the match moves on before it commits
        let current = fx.store.get_match(fx.fixture.id).await.unwrap().unwrap();
        let pool = fx.store.list_wagers_for_match(fx.fixture.id).await.unwrap();
        let stale = plan_settlement(
            &current,
            &pool,
            &[],
            &Outcome::Winner(String::from("India")),
            Uuid::new_v4(),
        );
        settle(&fx, Some("Australia"), false).await.unwrap();

        let res = fx.store.commit_settlement(&stale).await;
        assert!(matches!(res, Err(StoreError::VersionConflict { .. })));
        assert_eq!(points(&fx.store, a).await, Points::from_whole(-20));
    }

    #[tokio::test]
    async fn test_wager_from_other_instance_mid_settlement() {
        let fx = setup().await;
        let a = bettor(&fx, "A", "India", 20).await;
        let b = bettor(&fx, "B", "Australia", 10).await;
        let late = fx
            .store
            .insert_user(&NewUser {
                full_name: String::from("Late"),
                role: Role::User,
            })
            .await
            .unwrap();
        let late = CurrentUser::from(&late);

        // a second server instance shares the store but not the in-process locks
        let elsewhere = WagerService::new(fx.store.clone(), MatchLocks::new(), &[10, 20, 30]);

        // settlement has read the match and its pool...
        let current = fx.store.get_match(fx.fixture.id).await.unwrap().unwrap();
        let pool = fx.store.list_wagers_for_match(fx.fixture.id).await.unwrap();
        let plan = plan_settlement(
            &current,
            &pool,
            &[],
            &Outcome::Winner(String::from("India")),
            Uuid::new_v4(),
        );

        // ...when the other instance slips a wager in before the commit
        elsewhere
            .place(&late, fx.fixture.id, String::from("India"), 30)
            .await
            .unwrap();

        let res = fx.store.commit_settlement(&plan).await;
        assert!(matches!(res, Err(StoreError::VersionConflict { .. })));
        assert_eq!(points(&fx.store, a).await, Points::ZERO);

        // a retry sees the whole pool: 60 split 20:30 between A and Late
        settle(&fx, Some("India"), false).await.unwrap();
        assert_eq!(points(&fx.store, a).await, Points::from_whole(24));
        assert_eq!(points(&fx.store, late.id).await, Points::from_whole(36));
        assert_eq!(points(&fx.store, b).await, Points::from_whole(-10));

        let payouts = fx.store.list_payouts_for_match(fx.fixture.id).await.unwrap();
        assert_eq!(payouts.len(), 3);

        // and once resolved, neither instance can write to the match
        let res = elsewhere
            .place(&late, fx.fixture.id, String::from("Australia"), 10)
            .await;
        assert!(matches!(res, Err(WagerError::MatchClosed(_))));

        let res = fx
            .store
            .update_wager_by_user_and_match(late.id, fx.fixture.id, "Australia", 10)
            .await;
        assert!(matches!(res, Err(StoreError::MatchClosed(_))));
    }

    #[tokio::test]
    async fn test_concurrent_settlements_stay_consistent() {
        let fx = setup().await;
        let users = [
            bettor(&fx, "A", "India", 20).await,
            bettor(&fx, "B", "Australia", 10).await,
            bettor(&fx, "C", "India", 30).await,
            bettor(&fx, "D", "Australia", 30).await,
        ];

        let before = fx.store.get_match(fx.fixture.id).await.unwrap().unwrap();

        let outcomes = [Some("India"), Some("Australia"), None, Some("India")];
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let engine = fx.engine.clone();
                let admin = fx.admin;
                let match_id = fx.fixture.id;
                let winner = outcomes[i % outcomes.len()].map(str::to_string);
                tokio::spawn(
                    async move { engine.settle_match(&admin, match_id, winner, false).await },
                )
            })
            .collect();

        for handle in futures::future::join_all(handles).await {
            handle.unwrap().unwrap();
        }

        // whatever ended up recorded, the ledger must equal one clean application of it
        let fixture = fx.store.get_match(fx.fixture.id).await.unwrap().unwrap();
        assert_eq!(fixture.version, before.version + 16);

        let pool = fx.store.list_wagers_for_match(fixture.id).await.unwrap();
        let expected = match fixture.winner.as_deref() {
            Some(winner) => payout::distribute(&pool, winner),
            None => Vec::new(),
        };

        for user in users {
            let want: Points = expected
                .iter()
                .filter(|d| d.user_id == user)
                .map(|d| d.delta)
                .sum();
            assert_eq!(points(&fx.store, user).await, want);
        }
    }
}
