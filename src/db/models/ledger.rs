use core::fmt;
use core::iter::Sum;
use core::ops::{Add, AddAssign, Neg, Sub};

use serde::{Serialize, Serializer};
use uuid::Uuid;

use super::fixture::MatchId;
use super::user::UserId;
use super::wager::WagerId;

/// Number of stored units per whole point.
pub const POINT_SCALE: i64 = 100;

/// Fixed-point score value stored as hundredths of a point.
///
/// Payouts are proportional, so they rarely land on whole numbers; keeping the ledger in
/// integer hundredths means an applied delta can always be negated exactly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type)]
#[sqlx(transparent)]
pub struct Points(pub i64);

impl Points {
    pub const ZERO: Points = Points(0);

    pub const fn from_whole(points: i64) -> Self {
        Points(points * POINT_SCALE)
    }

    pub const fn hundredths(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / POINT_SCALE as f64
    }
}

impl Serialize for Points {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl Add for Points {
    type Output = Points;

    fn add(self, rhs: Self) -> Self::Output {
        Points(self.0 + rhs.0)
    }
}

impl AddAssign for Points {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Points {
    type Output = Points;

    fn sub(self, rhs: Self) -> Self::Output {
        Points(self.0 - rhs.0)
    }
}

impl Neg for Points {
    type Output = Points;

    fn neg(self) -> Self::Output {
        Points(-self.0)
    }
}

impl Sum for Points {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Points::ZERO, Add::add)
    }
}

impl fmt::Display for Points {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let scale = POINT_SCALE as u64;
        write!(f, "{sign}{}.{:02}", abs / scale, abs % scale)
    }
}

/// Base score table model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub user_id: UserId,
    pub points: Points,
}

/// The exact delta one settlement applied to one wager's owner.
///
/// The payout rows stored for a match always describe the ledger effect of the outcome
/// currently recorded on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Payout {
    pub settlement_id: Uuid,
    pub match_id: MatchId,
    pub wager_id: WagerId,
    pub user_id: UserId,
    pub delta: Points,
}
