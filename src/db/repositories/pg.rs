use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Result as SqlxResult, Transaction};
use tracing::instrument;

use super::{SettlementCommit, Store};
use crate::db::models::fixture::{Match, MatchId, NewMatch};
use crate::db::models::ledger::{LedgerEntry, Payout, Points};
use crate::db::models::user::{NewUser, User, UserId};
use crate::db::models::wager::{NewWager, Wager, WagerId};
use crate::db::{StoreError, StoreResult};

pub mod sql_fragment {
    pub const USER_FIELDS: &str = r#"
        id,
        full_name,
        role,
        is_active
    "#;

    pub const MATCH_FIELDS: &str = r#"
        id,
        team1,
        team2,
        venue,
        starts_at,
        winner,
        is_abandoned,
        version
    "#;

    pub const WAGER_FIELDS: &str = r#"
        id,
        user_id,
        match_id,
        selected_team,
        amount,
        created_at,
        updated_at
    "#;

    pub const PAYOUT_FIELDS: &str = r#"
        settlement_id,
        match_id,
        wager_id,
        user_id,
        delta
    "#;
}

use sql_fragment::{MATCH_FIELDS, PAYOUT_FIELDS, USER_FIELDS, WAGER_FIELDS};

#[derive(Debug)]
pub struct PgStore {
    pool: &'static PgPool,
}

impl PgStore {
    pub fn new(pool: &'static PgPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self))]
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(self.pool).await?;
        Ok(())
    }
}

pub struct Tx {
    inner: Option<Transaction<'static, Postgres>>,
}

impl Tx {
    /// Runs `f` inside a transaction, committing on `Ok` and rolling back on `Err`.
    ///
    /// `f` hands the transaction back alongside its result so the outcome decides its fate.
    #[instrument(skip(pool, f))]
    pub async fn with_tx<F, Fut, T, E>(pool: &'static PgPool, f: F) -> Result<T, E>
    where
        F: FnOnce(Tx) -> Fut,
        Fut: Future<Output = (Tx, Result<T, E>)>,
        E: From<sqlx::Error> + core::fmt::Debug,
    {
        let tx = Self::begin(pool).await?;
        let (mut tx, result) = f(tx).await;

        match result {
            Ok(val) => {
                tx.commit().await?;
                Ok(val)
            }
            Err(e) => {
                tracing::trace!(error = ?e, "transacted query failure");
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::error!(error = ?rollback_err, "rollback failed");
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(pool))]
    pub async fn begin(pool: &'static PgPool) -> SqlxResult<Self> {
        let inner = pool.begin().await?;
        Ok(Self { inner: Some(inner) })
    }

    #[instrument(skip(self))]
    pub async fn commit(&mut self) -> SqlxResult<()> {
        if let Some(tx) = self.inner.take() {
            tx.commit().await
        } else {
            Err(sqlx::Error::Protocol(
                "Transaction already completed".into(),
            ))
        }
    }

    #[instrument(skip(self))]
    pub async fn rollback(&mut self) -> SqlxResult<()> {
        if let Some(tx) = self.inner.take() {
            tx.rollback().await
        } else {
            Err(sqlx::Error::Protocol(
                "Transaction already completed".into(),
            ))
        }
    }

    fn inner_mut(&mut self) -> SqlxResult<&mut Transaction<'static, Postgres>> {
        self.inner
            .as_mut()
            .ok_or_else(|| sqlx::Error::Protocol("Transaction already completed".into()))
    }

    /// Writes the outcome only if nobody committed since `expected_version` was read; the row
    /// lock taken here serializes concurrent commits for the same match.
    #[instrument(skip(self, winner))]
    pub async fn update_match_outcome(
        &mut self,
        match_id: MatchId,
        expected_version: i64,
        winner: Option<&str>,
        is_abandoned: bool,
    ) -> SqlxResult<Option<Match>> {
        sqlx::query_as::<_, Match>(&format!(
            r#"
            UPDATE matches
            SET winner = $3,
                is_abandoned = $4,
                version = version + 1
            WHERE id = $1
            AND version = $2
            RETURNING {MATCH_FIELDS}
            "#
        ))
        .bind(match_id)
        .bind(expected_version)
        .bind(winner)
        .bind(is_abandoned)
        .fetch_optional(&mut **self.inner_mut()?)
        .await
    }

    #[instrument(skip(self))]
    pub async fn delete_payouts(&mut self, match_id: MatchId) -> SqlxResult<u64> {
        let res = sqlx::query("DELETE FROM payout WHERE match_id = $1")
            .bind(match_id)
            .execute(&mut **self.inner_mut()?)
            .await?;

        Ok(res.rows_affected())
    }

    #[instrument(skip(self, payout), fields(wager_id = %payout.wager_id))]
    pub async fn insert_payout(&mut self, payout: &Payout) -> SqlxResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO payout ({PAYOUT_FIELDS})
            VALUES ($1, $2, $3, $4, $5)
            "#
        ))
        .bind(payout.settlement_id)
        .bind(payout.match_id)
        .bind(payout.wager_id)
        .bind(payout.user_id)
        .bind(payout.delta)
        .execute(&mut **self.inner_mut()?)
        .await?;

        Ok(())
    }

    /// Relative update; creates the ledger row on a user's first settlement
    #[instrument(skip(self))]
    pub async fn increment_score_by(
        &mut self,
        user_id: UserId,
        delta: Points,
    ) -> SqlxResult<LedgerEntry> {
        sqlx::query_as::<_, LedgerEntry>(
            r#"
            INSERT INTO score (
                user_id,
                points,
                created_at,
                updated_at
            )
            VALUES ($1, $2, NOW(), NOW())
            ON CONFLICT (user_id)
            DO UPDATE SET
                points = score.points + $2,
                updated_at = NOW()
            RETURNING
                user_id,
                points
            "#,
        )
        .bind(user_id)
        .bind(delta)
        .fetch_one(&mut **self.inner_mut()?)
        .await
    }

    /// Bumps the version of an open match, taking its row lock until the transaction ends.
    /// `None` if the match is missing, resolved or already started.
    #[instrument(skip(self))]
    pub async fn claim_open_match(&mut self, match_id: MatchId) -> SqlxResult<Option<i64>> {
        sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE matches
            SET version = version + 1
            WHERE id = $1
            AND winner IS NULL
            AND NOT is_abandoned
            AND starts_at > NOW()
            RETURNING version
            "#,
        )
        .bind(match_id)
        .fetch_optional(&mut **self.inner_mut()?)
        .await
    }

    pub async fn match_exists(&mut self, match_id: MatchId) -> SqlxResult<bool> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM matches WHERE id = $1)")
            .bind(match_id)
            .fetch_one(&mut **self.inner_mut()?)
            .await
    }

    pub async fn wager_match(&mut self, wager_id: WagerId) -> SqlxResult<Option<MatchId>> {
        sqlx::query_scalar::<_, MatchId>("SELECT match_id FROM wagers WHERE id = $1")
            .bind(wager_id)
            .fetch_optional(&mut **self.inner_mut()?)
            .await
    }

    #[instrument(skip(self, item), fields(user_id = %item.user_id, match_id = %item.match_id))]
    pub async fn insert_wager(&mut self, item: &NewWager) -> SqlxResult<Option<Wager>> {
        sqlx::query_as::<_, Wager>(&format!(
            r#"
            INSERT INTO wagers (
                user_id,
                match_id,
                selected_team,
                amount,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            ON CONFLICT (user_id, match_id)
            DO NOTHING
            RETURNING {WAGER_FIELDS}
            "#
        ))
        .bind(item.user_id)
        .bind(item.match_id)
        .bind(&item.selected_team)
        .bind(item.amount)
        .fetch_optional(&mut **self.inner_mut()?)
        .await
    }

    #[instrument(skip(self))]
    pub async fn update_wager(
        &mut self,
        wager_id: WagerId,
        selected_team: &str,
        amount: i64,
    ) -> SqlxResult<Option<Wager>> {
        sqlx::query_as::<_, Wager>(&format!(
            r#"
            UPDATE wagers
            SET selected_team = $2,
                amount = $3,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {WAGER_FIELDS}
            "#
        ))
        .bind(wager_id)
        .bind(selected_team)
        .bind(amount)
        .fetch_optional(&mut **self.inner_mut()?)
        .await
    }
}

async fn ensure_open_match(tx: &mut Tx, match_id: MatchId) -> StoreResult<()> {
    match tx.claim_open_match(match_id).await? {
        Some(version) => {
            tracing::trace!(%match_id, version, "claimed open match for wager write");
            Ok(())
        }
        None if tx.match_exists(match_id).await? => Err(StoreError::MatchClosed(match_id)),
        None => Err(StoreError::MatchNotFound(match_id)),
    }
}

async fn insert_open_wager(tx: &mut Tx, item: &NewWager) -> StoreResult<Wager> {
    ensure_open_match(tx, item.match_id).await?;

    // the rollback on `Err` also undoes the version bump
    tx.insert_wager(item)
        .await?
        .ok_or(StoreError::DuplicateWager {
            user_id: item.user_id,
            match_id: item.match_id,
        })
}

async fn update_open_wager(
    tx: &mut Tx,
    wager_id: WagerId,
    selected_team: &str,
    amount: i64,
) -> StoreResult<Option<Wager>> {
    let Some(match_id) = tx.wager_match(wager_id).await? else {
        return Ok(None);
    };

    ensure_open_match(tx, match_id).await?;
    Ok(tx.update_wager(wager_id, selected_team, amount).await?)
}

async fn apply_settlement(tx: &mut Tx, commit: &SettlementCommit) -> StoreResult<Match> {
    let updated = tx
        .update_match_outcome(
            commit.match_id,
            commit.expected_version,
            commit.winner.as_deref(),
            commit.is_abandoned,
        )
        .await?
        .ok_or(StoreError::VersionConflict {
            match_id: commit.match_id,
            expected: commit.expected_version,
        })?;

    let removed = tx.delete_payouts(commit.match_id).await?;
    tracing::debug!(removed, "cleared previous payouts");

    for payout in &commit.payouts {
        tx.insert_payout(payout).await?;
    }

    for (user_id, delta) in &commit.increments {
        let entry = tx.increment_score_by(*user_id, *delta).await?;
        tracing::debug!(
            user_id = %entry.user_id,
            total = %entry.points,
            %delta,
            "score incremented"
        );
    }

    Ok(updated)
}

#[async_trait]
impl Store for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip(self, item))]
    async fn insert_user(&self, item: &NewUser) -> StoreResult<User> {
        Ok(sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (full_name, role, is_active)
            VALUES ($1, $2, true)
            RETURNING {USER_FIELDS}
            "#
        ))
        .bind(&item.full_name)
        .bind(item.role.as_str())
        .fetch_one(self.pool)
        .await?)
    }

    #[instrument(skip(self))]
    async fn get_user(&self, id: UserId) -> StoreResult<Option<User>> {
        Ok(sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_FIELDS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await?)
    }

    #[instrument(skip(self))]
    async fn list_users(&self) -> StoreResult<Vec<User>> {
        Ok(sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_FIELDS} FROM users ORDER BY id ASC"
        ))
        .fetch_all(self.pool)
        .await?)
    }

    #[instrument(skip(self))]
    async fn set_user_active(&self, id: UserId, active: bool) -> StoreResult<Option<User>> {
        Ok(sqlx::query_as::<_, User>(&format!(
            r#"
            UPDATE users
            SET is_active = $2
            WHERE id = $1
            RETURNING {USER_FIELDS}
            "#
        ))
        .bind(id)
        .bind(active)
        .fetch_optional(self.pool)
        .await?)
    }

    #[instrument(skip(self, item))]
    async fn insert_match(&self, item: &NewMatch) -> StoreResult<Match> {
        Ok(sqlx::query_as::<_, Match>(&format!(
            r#"
            INSERT INTO matches (team1, team2, venue, starts_at)
            VALUES ($1, $2, $3, $4)
            RETURNING {MATCH_FIELDS}
            "#
        ))
        .bind(item.team1.trim())
        .bind(item.team2.trim())
        .bind(item.venue.trim())
        .bind(item.starts_at)
        .fetch_one(self.pool)
        .await?)
    }

    #[instrument(skip(self))]
    async fn get_match(&self, id: MatchId) -> StoreResult<Option<Match>> {
        Ok(sqlx::query_as::<_, Match>(&format!(
            "SELECT {MATCH_FIELDS} FROM matches WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await?)
    }

    #[instrument(skip(self))]
    async fn list_matches(&self) -> StoreResult<Vec<Match>> {
        Ok(sqlx::query_as::<_, Match>(&format!(
            "SELECT {MATCH_FIELDS} FROM matches ORDER BY id ASC"
        ))
        .fetch_all(self.pool)
        .await?)
    }

    #[instrument(skip(self, item), fields(user_id = %item.user_id, match_id = %item.match_id))]
    async fn insert_wager(&self, item: &NewWager) -> StoreResult<Wager> {
        Tx::with_tx(self.pool, |mut tx| async move {
            let result = insert_open_wager(&mut tx, item).await;
            (tx, result)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn update_wager(
        &self,
        id: WagerId,
        selected_team: &str,
        amount: i64,
    ) -> StoreResult<Option<Wager>> {
        Tx::with_tx(self.pool, |mut tx| async move {
            let result = update_open_wager(&mut tx, id, selected_team, amount).await;
            (tx, result)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn update_wager_by_user_and_match(
        &self,
        user_id: UserId,
        match_id: MatchId,
        selected_team: &str,
        amount: i64,
    ) -> StoreResult<Option<Wager>> {
        let existing = sqlx::query_scalar::<_, WagerId>(
            "SELECT id FROM wagers WHERE user_id = $1 AND match_id = $2",
        )
        .bind(user_id)
        .bind(match_id)
        .fetch_optional(self.pool)
        .await?;

        match existing {
            Some(id) => self.update_wager(id, selected_team, amount).await,
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn get_wager(&self, id: WagerId) -> StoreResult<Option<Wager>> {
        Ok(sqlx::query_as::<_, Wager>(&format!(
            "SELECT {WAGER_FIELDS} FROM wagers WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await?)
    }

    #[instrument(skip(self))]
    async fn get_wager_for(
        &self,
        user_id: UserId,
        match_id: MatchId,
    ) -> StoreResult<Option<Wager>> {
        Ok(sqlx::query_as::<_, Wager>(&format!(
            "SELECT {WAGER_FIELDS} FROM wagers WHERE user_id = $1 AND match_id = $2"
        ))
        .bind(user_id)
        .bind(match_id)
        .fetch_optional(self.pool)
        .await?)
    }

    #[instrument(skip(self))]
    async fn list_wagers_for_match(&self, match_id: MatchId) -> StoreResult<Vec<Wager>> {
        Ok(sqlx::query_as::<_, Wager>(&format!(
            "SELECT {WAGER_FIELDS} FROM wagers WHERE match_id = $1 ORDER BY id ASC"
        ))
        .bind(match_id)
        .fetch_all(self.pool)
        .await?)
    }

    #[instrument(skip(self))]
    async fn list_wagers_for_user(&self, user_id: UserId) -> StoreResult<Vec<Wager>> {
        Ok(sqlx::query_as::<_, Wager>(&format!(
            "SELECT {WAGER_FIELDS} FROM wagers WHERE user_id = $1 ORDER BY id ASC"
        ))
        .bind(user_id)
        .fetch_all(self.pool)
        .await?)
    }

    #[instrument(skip(self))]
    async fn list_wagers(&self) -> StoreResult<Vec<Wager>> {
        Ok(sqlx::query_as::<_, Wager>(&format!(
            "SELECT {WAGER_FIELDS} FROM wagers ORDER BY id ASC"
        ))
        .fetch_all(self.pool)
        .await?)
    }

    #[instrument(skip(self))]
    async fn list_payouts_for_match(&self, match_id: MatchId) -> StoreResult<Vec<Payout>> {
        Ok(sqlx::query_as::<_, Payout>(&format!(
            "SELECT {PAYOUT_FIELDS} FROM payout WHERE match_id = $1 ORDER BY wager_id ASC"
        ))
        .bind(match_id)
        .fetch_all(self.pool)
        .await?)
    }

    #[instrument(skip(self))]
    async fn get_score(&self, user_id: UserId) -> StoreResult<Option<LedgerEntry>> {
        Ok(sqlx::query_as::<_, LedgerEntry>(
            "SELECT user_id, points FROM score WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(self.pool)
        .await?)
    }

    #[instrument(skip(self))]
    async fn list_scores(&self) -> StoreResult<Vec<LedgerEntry>> {
        Ok(
            sqlx::query_as::<_, LedgerEntry>("SELECT user_id, points FROM score")
                .fetch_all(self.pool)
                .await?,
        )
    }

    #[instrument(
        skip(self, commit),
        fields(match_id = %commit.match_id, settlement_id = %commit.settlement_id)
    )]
    async fn commit_settlement(&self, commit: &SettlementCommit) -> StoreResult<Match> {
        Tx::with_tx(self.pool, |mut tx| async move {
            let result = apply_settlement(&mut tx, commit).await;
            (tx, result)
        })
        .await
    }
}
