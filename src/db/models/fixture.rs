use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct MatchId(pub i64);

/// Base match table model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Match {
    pub id: MatchId,
    pub team1: String,
    pub team2: String,
    pub venue: String,
    pub starts_at: DateTime<Utc>,
    pub winner: Option<String>,
    pub is_abandoned: bool,
    /// Bumped on every settlement commit
    pub version: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewMatch {
    pub team1: String,
    pub team2: String,
    pub venue: String,
    pub starts_at: DateTime<Utc>,
}

impl Match {
    pub fn is_resolved(&self) -> bool {
        self.winner.is_some() || self.is_abandoned
    }

    pub fn has_team(&self, team: &str) -> bool {
        self.team1 == team || self.team2 == team
    }

    /// Wagers may only be placed or changed while this holds
    pub fn accepts_wagers(&self, now: DateTime<Utc>) -> bool {
        !self.is_resolved() && self.starts_at > now
    }
}

impl NewMatch {
    pub fn validate(&self) -> Result<(), String> {
        let (team1, team2) = (self.team1.trim(), self.team2.trim());
        if team1.is_empty() || team2.is_empty() {
            return Err(String::from("team names must not be empty"));
        }

        if team1 == team2 {
            return Err(format!("a match needs two different teams, got '{team1}' twice"));
        }

        if self.venue.trim().is_empty() {
            return Err(String::from("venue must not be empty"));
        }

        Ok(())
    }
}

impl From<i64> for MatchId {
    fn from(value: i64) -> Self {
        MatchId(value)
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
