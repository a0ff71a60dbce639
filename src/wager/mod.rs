use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::instrument;

use crate::db::prelude::*;
use crate::util::lock::MatchLocks;

/// Wager placement and amendment, enforcing one wager per (user, match) and the window in which
/// a wager may change.
#[derive(Debug, Clone)]
pub struct WagerService {
    store: Arc<dyn Store>,
    locks: MatchLocks,
    allowed_amounts: Arc<[i64]>,
}

impl WagerService {
    pub fn new(store: Arc<dyn Store>, locks: MatchLocks, allowed_amounts: &[i64]) -> Self {
        Self {
            store,
            locks,
            allowed_amounts: allowed_amounts.into(),
        }
    }

    pub fn allowed_amounts(&self) -> &[i64] {
        &self.allowed_amounts
    }

    /// Places the actor's wager on a match, or amends it if one already exists.
    #[instrument(skip(self, actor), fields(user_id = %actor.id))]
    pub async fn place(
        &self,
        actor: &CurrentUser,
        match_id: MatchId,
        team: String,
        amount: i64,
    ) -> WagerResult<Wager> {
        let _guard = self.locks.lock(match_id).await;
        self.open_match(match_id, &team, amount).await?;

        if let Some(existing) = self.store.get_wager_for(actor.id, match_id).await? {
            tracing::debug!(wager_id = %existing.id, "wager exists, amending instead");
            return self.amend(actor.id, match_id, &team, amount).await;
        }

        let item = NewWager {
            user_id: actor.id,
            match_id,
            selected_team: team,
            amount,
        };

        match self.store.insert_wager(&item).await {
            Ok(wager) => {
                tracing::info!(wager_id = %wager.id, %match_id, amount, "wager placed");
                Ok(wager)
            }
            // another instance got there first; the unique key keeps it to one row
            Err(StoreError::DuplicateWager { .. }) => {
                self.amend(actor.id, match_id, &item.selected_team, amount)
                    .await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Changes team and amount on an existing wager owned by the actor.
    #[instrument(skip(self, actor), fields(user_id = %actor.id))]
    pub async fn update(
        &self,
        actor: &CurrentUser,
        wager_id: WagerId,
        team: String,
        amount: i64,
    ) -> WagerResult<Wager> {
        let wager = self
            .store
            .get_wager(wager_id)
            .await?
            .ok_or(WagerError::NotFound(wager_id))?;

        if wager.user_id != actor.id {
            return Err(WagerError::Unauthorized);
        }

        let _guard = self.locks.lock(wager.match_id).await;
        self.open_match(wager.match_id, &team, amount).await?;

        let updated = self
            .store
            .update_wager(wager_id, &team, amount)
            .await?
            .ok_or(WagerError::NotFound(wager_id))?;

        tracing::info!(%wager_id, match_id = %updated.match_id, amount, "wager updated");
        Ok(updated)
    }

    pub async fn list_for_match(&self, match_id: MatchId) -> WagerResult<Vec<Wager>> {
        Ok(self.store.list_wagers_for_match(match_id).await?)
    }

    pub async fn list_for_user(&self, user_id: UserId) -> WagerResult<Vec<Wager>> {
        Ok(self.store.list_wagers_for_user(user_id).await?)
    }

    pub async fn for_user_and_match(
        &self,
        user_id: UserId,
        match_id: MatchId,
    ) -> WagerResult<Option<Wager>> {
        Ok(self.store.get_wager_for(user_id, match_id).await?)
    }

    async fn amend(
        &self,
        user_id: UserId,
        match_id: MatchId,
        team: &str,
        amount: i64,
    ) -> WagerResult<Wager> {
        let wager = self
            .store
            .update_wager_by_user_and_match(user_id, match_id, team, amount)
            .await?
            .ok_or(WagerError::MatchNotFound(match_id))?;

        tracing::info!(wager_id = %wager.id, %match_id, amount, "wager amended");
        Ok(wager)
    }

    /// Loads the match and checks a wager of `amount` on `team` may be written to it right now.
    /// Callers hold the match lock.
    async fn open_match(&self, match_id: MatchId, team: &str, amount: i64) -> WagerResult<Match> {
        let fixture = self
            .store
            .get_match(match_id)
            .await?
            .ok_or(WagerError::MatchNotFound(match_id))?;

        if !fixture.has_team(team) {
            return Err(WagerError::InvalidTeam {
                team: team.to_string(),
                match_id,
            });
        }

        if !self.allowed_amounts.contains(&amount) {
            return Err(WagerError::InvalidAmount {
                amount,
                allowed: self.allowed_amounts.to_vec(),
            });
        }

        if !fixture.accepts_wagers(Utc::now()) {
            return Err(WagerError::MatchClosed(match_id));
        }

        Ok(fixture)
    }
}

pub type WagerResult<T> = core::result::Result<T, WagerError>;

#[derive(Debug, Error)]
pub enum WagerError {
    #[error("match {0} not found")]
    MatchNotFound(MatchId),

    #[error("wager {0} not found")]
    NotFound(WagerId),

    #[error("'{team}' is not playing in match {match_id}")]
    InvalidTeam { team: String, match_id: MatchId },

    #[error("{amount} is not an allowed wager amount (allowed: {allowed:?})")]
    InvalidAmount { amount: i64, allowed: Vec<i64> },

    #[error("match {0} is no longer accepting wagers")]
    MatchClosed(MatchId),

    #[error("wager belongs to another user")]
    Unauthorized,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[source] StoreError),
}

impl From<StoreError> for WagerError {
    /// The store re-checks the match on every wager write, so closure can surface from there too
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::MatchClosed(match_id) => WagerError::MatchClosed(match_id),
            StoreError::MatchNotFound(match_id) => WagerError::MatchNotFound(match_id),
            err => WagerError::StorageUnavailable(err),
        }
    }
}

#[cfg(test)]
mod test {
    use chrono::Duration;

    use super::*;
    use crate::settlement::SettlementEngine;

    struct Fixture {
        store: Arc<dyn Store>,
        wagers: WagerService,
        engine: SettlementEngine,
        admin: CurrentUser,
        punter: CurrentUser,
        fixture: Match,
    }

    async fn user(store: &Arc<dyn Store>, name: &str, role: Role) -> CurrentUser {
        let user = store
            .insert_user(&NewUser {
                full_name: name.to_string(),
                role,
            })
            .await
            .unwrap();

        CurrentUser::from(&user)
    }

    async fn fixture_starting_in(store: &Arc<dyn Store>, offset: Duration) -> Match {
        store
            .insert_match(&NewMatch {
                team1: String::from("India"),
                team2: String::from("Pakistan"),
                venue: String::from("Eden Gardens"),
                starts_at: Utc::now() + offset,
            })
            .await
            .unwrap()
    }

    async fn setup() -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let locks = MatchLocks::new();

        Fixture {
            wagers: WagerService::new(store.clone(), locks.clone(), &[10, 20, 30]),
            engine: SettlementEngine::new(store.clone(), locks),
            admin: user(&store, "Umpire", Role::Admin).await,
            punter: user(&store, "Punter", Role::User).await,
            fixture: fixture_starting_in(&store, Duration::days(2)).await,
            store,
        }
    }

    #[tokio::test]
    async fn test_repeat_placement_amends() {
        let fx = setup().await;

        let first = fx
            .wagers
            .place(&fx.punter, fx.fixture.id, String::from("India"), 10)
            .await
            .unwrap();
        let second = fx
            .wagers
            .place(&fx.punter, fx.fixture.id, String::from("Pakistan"), 30)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.selected_team, "Pakistan");
        assert_eq!(second.amount, 30);

        let on_match = fx.wagers.list_for_match(fx.fixture.id).await.unwrap();
        assert_eq!(on_match, vec![second]);
    }

    #[tokio::test]
    async fn test_concurrent_placements_keep_one_wager() {
        let fx = setup().await;

        let handles: Vec<_> = [10, 20, 30, 10, 20, 30]
            .into_iter()
            .map(|amount| {
                let wagers = fx.wagers.clone();
                let punter = fx.punter;
                let match_id = fx.fixture.id;
                tokio::spawn(async move {
                    wagers
                        .place(&punter, match_id, String::from("India"), amount)
                        .await
                })
            })
            .collect();

        for handle in futures::future::join_all(handles).await {
            handle.unwrap().unwrap();
        }

        let mine = fx.wagers.list_for_user(fx.punter.id).await.unwrap();
        assert_eq!(mine.len(), 1);
    }

    #[tokio::test]
    async fn test_placement_validation() {
        let fx = setup().await;

        let res = fx
            .wagers
            .place(&fx.punter, MatchId(77), String::from("India"), 10)
            .await;
        assert!(matches!(res, Err(WagerError::MatchNotFound(MatchId(77)))));

        let res = fx
            .wagers
            .place(&fx.punter, fx.fixture.id, String::from("England"), 10)
            .await;
        assert!(matches!(res, Err(WagerError::InvalidTeam { .. })));

        let res = fx
            .wagers
            .place(&fx.punter, fx.fixture.id, String::from("India"), 15)
            .await;
        assert!(matches!(res, Err(WagerError::InvalidAmount { amount: 15, .. })));

        let started = fixture_starting_in(&fx.store, Duration::hours(-1)).await;
        let res = fx
            .wagers
            .place(&fx.punter, started.id, String::from("India"), 10)
            .await;
        assert!(matches!(res, Err(WagerError::MatchClosed(_))));

        assert!(fx.wagers.list_for_user(fx.punter.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_requires_ownership() {
        let fx = setup().await;
        let wager = fx
            .wagers
            .place(&fx.punter, fx.fixture.id, String::from("India"), 20)
            .await
            .unwrap();

        let other = user(&fx.store, "Other", Role::User).await;
        let res = fx
            .wagers
            .update(&other, wager.id, String::from("Pakistan"), 30)
            .await;
        assert!(matches!(res, Err(WagerError::Unauthorized)));

        let res = fx
            .wagers
            .update(&fx.punter, WagerId(999), String::from("Pakistan"), 30)
            .await;
        assert!(matches!(res, Err(WagerError::NotFound(WagerId(999)))));

        let updated = fx
            .wagers
            .update(&fx.punter, wager.id, String::from("Pakistan"), 30)
            .await
            .unwrap();
        assert_eq!(updated.selected_team, "Pakistan");
        assert_eq!(updated.amount, 30);
    }

    #[tokio::test]
    async fn test_wager_frozen_after_resolution() {
        let fx = setup().await;
        let wager = fx
            .wagers
            .place(&fx.punter, fx.fixture.id, String::from("India"), 20)
            .await
            .unwrap();

        fx.engine
            .settle_match(&fx.admin, fx.fixture.id, Some(String::from("India")), false)
            .await
            .unwrap();

        let res = fx
            .wagers
            .update(&fx.punter, wager.id, String::from("Pakistan"), 30)
            .await;
        assert!(matches!(res, Err(WagerError::MatchClosed(_))));

        let res = fx
            .wagers
            .place(&fx.punter, fx.fixture.id, String::from("Pakistan"), 10)
            .await;
        assert!(matches!(res, Err(WagerError::MatchClosed(_))));

        let stored = fx
            .wagers
            .for_user_and_match(fx.punter.id, fx.fixture.id)
            .await
            .unwrap();
        assert_eq!(stored, Some(wager));
    }
}
