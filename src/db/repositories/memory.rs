use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::instrument;

use super::{SettlementCommit, Store};
use crate::db::models::fixture::{Match, MatchId, NewMatch};
use crate::db::models::ledger::{LedgerEntry, Payout, Points};
use crate::db::models::user::{NewUser, User, UserId};
use crate::db::models::wager::{NewWager, Wager, WagerId};
use crate::db::{StoreError, StoreResult};

/// Single-process store used when no database is configured, and as the store in tests.
///
/// Every method takes the state lock exactly once, so a settlement commit is observed either
/// entirely or not at all.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemState>,
}

#[derive(Debug, Default)]
struct MemState {
    last_user_id: i64,
    last_match_id: i64,
    last_wager_id: i64,

    users: BTreeMap<UserId, User>,
    matches: BTreeMap<MatchId, Match>,
    wagers: BTreeMap<WagerId, Wager>,
    payouts: BTreeMap<MatchId, Vec<Payout>>,
    scores: BTreeMap<UserId, Points>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemState {
    fn wager_for(&self, user_id: UserId, match_id: MatchId) -> Option<&Wager> {
        self.wagers
            .values()
            .find(|w| w.user_id == user_id && w.match_id == match_id)
    }

    fn wager_mut(&mut self, id: WagerId, selected_team: &str, amount: i64) -> Option<Wager> {
        let wager = self.wagers.get_mut(&id)?;
        wager.selected_team = selected_team.to_string();
        wager.amount = amount;
        wager.updated_at = Utc::now();

        Some(wager.clone())
    }

    /// Wager writes only land on an open match, and each one moves the match version on
    fn claim_open_match(&mut self, match_id: MatchId) -> StoreResult<()> {
        let fixture = self
            .matches
            .get_mut(&match_id)
            .ok_or(StoreError::MatchNotFound(match_id))?;

        if !fixture.accepts_wagers(Utc::now()) {
            return Err(StoreError::MatchClosed(match_id));
        }

        fixture.version += 1;
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn insert_user(&self, item: &NewUser) -> StoreResult<User> {
        let mut state = self.state.write().await;
        state.last_user_id += 1;

        let user = User {
            id: UserId(state.last_user_id),
            full_name: item.full_name.clone(),
            role: item.role,
            is_active: true,
        };
        state.users.insert(user.id, user.clone());

        Ok(user)
    }

    async fn get_user(&self, id: UserId) -> StoreResult<Option<User>> {
        Ok(self.state.read().await.users.get(&id).cloned())
    }

    async fn list_users(&self) -> StoreResult<Vec<User>> {
        Ok(self.state.read().await.users.values().cloned().collect())
    }

    async fn set_user_active(&self, id: UserId, active: bool) -> StoreResult<Option<User>> {
        let mut state = self.state.write().await;
        Ok(state.users.get_mut(&id).map(|user| {
            user.is_active = active;
            user.clone()
        }))
    }

    async fn insert_match(&self, item: &NewMatch) -> StoreResult<Match> {
        let mut state = self.state.write().await;
        state.last_match_id += 1;

        let fixture = Match {
            id: MatchId(state.last_match_id),
            team1: item.team1.trim().to_string(),
            team2: item.team2.trim().to_string(),
            venue: item.venue.trim().to_string(),
            starts_at: item.starts_at,
            winner: None,
            is_abandoned: false,
            version: 0,
        };
        state.matches.insert(fixture.id, fixture.clone());

        Ok(fixture)
    }

    async fn get_match(&self, id: MatchId) -> StoreResult<Option<Match>> {
        Ok(self.state.read().await.matches.get(&id).cloned())
    }

    async fn list_matches(&self) -> StoreResult<Vec<Match>> {
        Ok(self.state.read().await.matches.values().cloned().collect())
    }

    #[instrument(skip(self, item), fields(user_id = %item.user_id, match_id = %item.match_id))]
    async fn insert_wager(&self, item: &NewWager) -> StoreResult<Wager> {
        let mut state = self.state.write().await;
        if state.wager_for(item.user_id, item.match_id).is_some() {
            return Err(StoreError::DuplicateWager {
                user_id: item.user_id,
                match_id: item.match_id,
            });
        }

        state.claim_open_match(item.match_id)?;
        state.last_wager_id += 1;
        let now = Utc::now();
        let wager = Wager {
            id: WagerId(state.last_wager_id),
            user_id: item.user_id,
            match_id: item.match_id,
            selected_team: item.selected_team.clone(),
            amount: item.amount,
            created_at: now,
            updated_at: now,
        };
        state.wagers.insert(wager.id, wager.clone());

        Ok(wager)
    }

    async fn update_wager(
        &self,
        id: WagerId,
        selected_team: &str,
        amount: i64,
    ) -> StoreResult<Option<Wager>> {
        let mut state = self.state.write().await;
        let Some(match_id) = state.wagers.get(&id).map(|w| w.match_id) else {
            return Ok(None);
        };

        state.claim_open_match(match_id)?;
        Ok(state.wager_mut(id, selected_team, amount))
    }

    async fn update_wager_by_user_and_match(
        &self,
        user_id: UserId,
        match_id: MatchId,
        selected_team: &str,
        amount: i64,
    ) -> StoreResult<Option<Wager>> {
        let mut state = self.state.write().await;
        let Some(id) = state.wager_for(user_id, match_id).map(|w| w.id) else {
            return Ok(None);
        };

        state.claim_open_match(match_id)?;
        Ok(state.wager_mut(id, selected_team, amount))
    }

    async fn get_wager(&self, id: WagerId) -> StoreResult<Option<Wager>> {
        Ok(self.state.read().await.wagers.get(&id).cloned())
    }

    async fn get_wager_for(
        &self,
        user_id: UserId,
        match_id: MatchId,
    ) -> StoreResult<Option<Wager>> {
        Ok(self
            .state
            .read()
            .await
            .wager_for(user_id, match_id)
            .cloned())
    }

    async fn list_wagers_for_match(&self, match_id: MatchId) -> StoreResult<Vec<Wager>> {
        Ok(self
            .state
            .read()
            .await
            .wagers
            .values()
            .filter(|w| w.match_id == match_id)
            .cloned()
            .collect())
    }

    async fn list_wagers_for_user(&self, user_id: UserId) -> StoreResult<Vec<Wager>> {
        Ok(self
            .state
            .read()
            .await
            .wagers
            .values()
            .filter(|w| w.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_wagers(&self) -> StoreResult<Vec<Wager>> {
        Ok(self.state.read().await.wagers.values().cloned().collect())
    }

    async fn list_payouts_for_match(&self, match_id: MatchId) -> StoreResult<Vec<Payout>> {
        Ok(self
            .state
            .read()
            .await
            .payouts
            .get(&match_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_score(&self, user_id: UserId) -> StoreResult<Option<LedgerEntry>> {
        Ok(self
            .state
            .read()
            .await
            .scores
            .get(&user_id)
            .map(|points| LedgerEntry {
                user_id,
                points: *points,
            }))
    }

    async fn list_scores(&self) -> StoreResult<Vec<LedgerEntry>> {
        Ok(self
            .state
            .read()
            .await
            .scores
            .iter()
            .map(|(user_id, points)| LedgerEntry {
                user_id: *user_id,
                points: *points,
            })
            .collect())
    }

    #[instrument(
        skip(self, commit),
        fields(match_id = %commit.match_id, settlement_id = %commit.settlement_id)
    )]
    async fn commit_settlement(&self, commit: &SettlementCommit) -> StoreResult<Match> {
        let mut state = self.state.write().await;

        // validate everything before the first write
        let current = state
            .matches
            .get(&commit.match_id)
            .ok_or(StoreError::MatchNotFound(commit.match_id))?;

        if current.version != commit.expected_version {
            return Err(StoreError::VersionConflict {
                match_id: commit.match_id,
                expected: commit.expected_version,
            });
        }

        let mut updated = current.clone();
        updated.winner = commit.winner.clone();
        updated.is_abandoned = commit.is_abandoned;
        updated.version += 1;
        state.matches.insert(updated.id, updated.clone());

        if commit.payouts.is_empty() {
            state.payouts.remove(&commit.match_id);
        } else {
            state
                .payouts
                .insert(commit.match_id, commit.payouts.clone());
        }

        for (user_id, delta) in &commit.increments {
            *state.scores.entry(*user_id).or_default() += *delta;
        }

        Ok(updated)
    }
}

#[cfg(test)]
mod test {
    use chrono::Duration;
    use uuid::Uuid;

    use super::*;

    async fn seeded() -> (MemoryStore, User, Match) {
        let store = MemoryStore::new();
        let user = store
            .insert_user(&NewUser {
                full_name: String::from("Punter"),
                role: crate::db::models::user::Role::User,
            })
            .await
            .unwrap();
        let fixture = store
            .insert_match(&NewMatch {
                team1: String::from(" India "),
                team2: String::from("Sri Lanka"),
                venue: String::from("Galle"),
                starts_at: Utc::now() + Duration::days(1),
            })
            .await
            .unwrap();

        (store, user, fixture)
    }

    #[tokio::test]
    async fn test_one_wager_per_user_and_match() {
        let (store, user, fixture) = seeded().await;
        assert_eq!(fixture.team1, "India");

        let item = NewWager {
            user_id: user.id,
            match_id: fixture.id,
            selected_team: String::from("India"),
            amount: 10,
        };
        store.insert_wager(&item).await.unwrap();

        let res = store.insert_wager(&item).await;
        assert!(matches!(res, Err(StoreError::DuplicateWager { .. })));
        assert_eq!(store.list_wagers().await.unwrap().len(), 1);

        // only the successful write moved the version on
        let stored = store.get_match(fixture.id).await.unwrap().unwrap();
        assert_eq!(stored.version, fixture.version + 1);
    }

    #[tokio::test]
    async fn test_wager_writes_require_open_match() {
        let (store, user, fixture) = seeded().await;
        let other = store
            .insert_user(&NewUser {
                full_name: String::from("Late"),
                role: crate::db::models::user::Role::User,
            })
            .await
            .unwrap();

        let wager = store
            .insert_wager(&NewWager {
                user_id: user.id,
                match_id: fixture.id,
                selected_team: String::from("India"),
                amount: 10,
            })
            .await
            .unwrap();

        // settled without going through any wager-side lock
        let current = store.get_match(fixture.id).await.unwrap().unwrap();
        store
            .commit_settlement(&SettlementCommit {
                settlement_id: Uuid::new_v4(),
                match_id: fixture.id,
                expected_version: current.version,
                winner: Some(String::from("Sri Lanka")),
                is_abandoned: false,
                increments: Vec::new(),
                payouts: Vec::new(),
            })
            .await
            .unwrap();

        let res = store
            .insert_wager(&NewWager {
                user_id: other.id,
                match_id: fixture.id,
                selected_team: String::from("Sri Lanka"),
                amount: 30,
            })
            .await;
        assert!(matches!(res, Err(StoreError::MatchClosed(_))));

        let res = store.update_wager(wager.id, "Sri Lanka", 30).await;
        assert!(matches!(res, Err(StoreError::MatchClosed(_))));

        let res = store
            .update_wager_by_user_and_match(user.id, fixture.id, "Sri Lanka", 30)
            .await;
        assert!(matches!(res, Err(StoreError::MatchClosed(_))));

        assert_eq!(store.list_wagers().await.unwrap(), vec![wager]);

        let res = store
            .insert_wager(&NewWager {
                user_id: other.id,
                match_id: MatchId(404),
                selected_team: String::from("India"),
                amount: 10,
            })
            .await;
        assert!(matches!(res, Err(StoreError::MatchNotFound(MatchId(404)))));
    }

    #[tokio::test]
    async fn test_commit_checks_version() {
        let (store, user, fixture) = seeded().await;
        let commit = SettlementCommit {
            settlement_id: Uuid::new_v4(),
            match_id: fixture.id,
            expected_version: fixture.version,
            winner: Some(String::from("India")),
            is_abandoned: false,
            increments: vec![(user.id, Points::from_whole(5))],
            payouts: Vec::new(),
        };

        let updated = store.commit_settlement(&commit).await.unwrap();
        assert_eq!(updated.version, fixture.version + 1);

        // replaying the same commit is stale now and must not touch the ledger
        let res = store.commit_settlement(&commit).await;
        assert!(matches!(res, Err(StoreError::VersionConflict { .. })));

        let score = store.get_score(user.id).await.unwrap().unwrap();
        assert_eq!(score.points, Points::from_whole(5));
    }
}
