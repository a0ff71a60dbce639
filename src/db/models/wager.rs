use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fixture::MatchId;
use super::user::UserId;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct WagerId(pub i64);

/// Base wager table model; unique on `(user_id, match_id)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Wager {
    pub id: WagerId,
    pub user_id: UserId,
    pub match_id: MatchId,
    pub selected_team: String,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWager {
    pub user_id: UserId,
    pub match_id: MatchId,
    pub selected_team: String,
    pub amount: i64,
}

impl From<i64> for WagerId {
    fn from(value: i64) -> Self {
        WagerId(value)
    }
}

impl fmt::Display for WagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
