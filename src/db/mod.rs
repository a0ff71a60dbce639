use std::sync::{Arc, LazyLock};

use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::instrument;

use crate::db::models::fixture::MatchId;
use crate::db::models::user::UserId;
use crate::util::env::{self, EnvErr, Var};
use crate::var;

pub mod models;
pub mod repositories;

pub mod prelude {
    pub use crate::db::{StoreError, StoreResult, store};

    pub use crate::db::models::fixture::{Match, MatchId, NewMatch};
    pub use crate::db::models::ledger::{LedgerEntry, POINT_SCALE, Payout, Points};
    pub use crate::db::models::user::{CurrentUser, NewUser, Role, User, UserId};
    pub use crate::db::models::wager::{NewWager, Wager, WagerId};

    pub use crate::db::repositories::memory::MemoryStore;
    pub use crate::db::repositories::pg::PgStore;
    pub use crate::db::repositories::{SettlementCommit, Store};
}

static STORE: LazyLock<OnceCell<Arc<dyn repositories::Store>>> = LazyLock::new(OnceCell::new);

/// Process-wide store, chosen once from configuration: PostgreSQL when `DATABASE_URL` is set,
/// otherwise the in-memory backend.
pub async fn store() -> StoreResult<Arc<dyn repositories::Store>> {
    STORE
        .get_or_try_init(|| async { open_store().await })
        .await
        .cloned()
}

#[instrument]
async fn open_store() -> StoreResult<Arc<dyn repositories::Store>> {
    match var!(Var::DatabaseUrl).await {
        Ok(url) => {
            tracing::info!("using postgres store");
            let pool = db_pool(url).await?;
            let store = repositories::pg::PgStore::new(pool);
            store.migrate().await?;

            Ok(Arc::new(store))
        }
        Err(EnvErr::Unset(_)) => {
            tracing::warn!("DATABASE_URL is not set, falling back to the in-memory store");
            Ok(Arc::new(repositories::memory::MemoryStore::new()))
        }
        Err(e) => Err(e.into()),
    }
}

static DB_POOL: LazyLock<OnceCell<PgPool>> = LazyLock::new(OnceCell::new);
async fn db_pool(url: &str) -> StoreResult<&'static PgPool> {
    Ok(DB_POOL
        .get_or_try_init(|| async { PgPool::connect(url).await })
        .await?)
}

pub type StoreResult<T> = core::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    SqlxError(#[from] sqlx::Error),

    #[error(transparent)]
    MigrateError(#[from] sqlx::migrate::MigrateError),

    #[error("{0}")]
    EnvError(#[from] env::EnvErr),

    #[error("match {0} does not exist")]
    MatchNotFound(MatchId),

    #[error("match {match_id} was modified concurrently (expected version {expected})")]
    VersionConflict { match_id: MatchId, expected: i64 },

    #[error("match {0} is no longer accepting wagers")]
    MatchClosed(MatchId),

    #[error("user {user_id} already has a wager on match {match_id}")]
    DuplicateWager { user_id: UserId, match_id: MatchId },
}
