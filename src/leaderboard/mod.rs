use std::collections::HashMap;

use serde::Serialize;
use tracing::instrument;

use crate::db::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedEntry {
    pub rank: i64,
    pub user_id: UserId,
    pub full_name: String,
    pub total_points: Points,
    pub winning_bets_count: i64,
    pub total_bets_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WagerStatus {
    Won,
    Lost,
    Void,
    Pending,
}

impl WagerStatus {
    pub fn classify(wager: &Wager, fixture: Option<&Match>) -> Self {
        match fixture {
            Some(m) if m.is_abandoned => WagerStatus::Void,
            Some(Match {
                winner: Some(winner),
                ..
            }) if *winner == wager.selected_team => WagerStatus::Won,
            Some(Match {
                winner: Some(_), ..
            }) => WagerStatus::Lost,
            _ => WagerStatus::Pending,
        }
    }
}

/// Ranks every user by ledger total; ties go to the lower user id.
pub fn rank(
    users: &[User],
    scores: &[LedgerEntry],
    wagers: &[Wager],
    matches: &[Match],
) -> Vec<RankedEntry> {
    let totals: HashMap<UserId, Points> = scores.iter().map(|s| (s.user_id, s.points)).collect();
    let fixtures: HashMap<MatchId, &Match> = matches.iter().map(|m| (m.id, m)).collect();

    let mut counts: HashMap<UserId, (i64, i64)> = HashMap::new();
    for wager in wagers {
        let status = WagerStatus::classify(wager, fixtures.get(&wager.match_id).copied());
        let (won, total) = counts.entry(wager.user_id).or_default();
        *total += 1;
        if status == WagerStatus::Won {
            *won += 1;
        }
    }

    let mut entries: Vec<RankedEntry> = users
        .iter()
        .map(|user| {
            let (won, total) = counts.get(&user.id).copied().unwrap_or_default();
            RankedEntry {
                rank: 0,
                user_id: user.id,
                full_name: user.full_name.clone(),
                total_points: totals.get(&user.id).copied().unwrap_or_default(),
                winning_bets_count: won,
                total_bets_count: total,
            }
        })
        .collect();

    entries.sort_by(|a, b| {
        b.total_points
            .cmp(&a.total_points)
            .then(a.user_id.cmp(&b.user_id))
    });

    for (idx, entry) in entries.iter_mut().enumerate() {
        entry.rank = idx as i64 + 1;
    }

    entries
}

/// Snapshot of the leaderboard, recomputed from the store on every call.
#[instrument(skip(store))]
pub async fn project(store: &dyn Store) -> StoreResult<Vec<RankedEntry>> {
    let users = store.list_users().await?;
    let scores = store.list_scores().await?;
    let wagers = store.list_wagers().await?;
    let matches = store.list_matches().await?;

    let entries = rank(&users, &scores, &wagers, &matches);
    tracing::debug!(entries = entries.len(), "projected leaderboard");

    Ok(entries)
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use chrono::{Duration, Utc};

    use super::*;
    use crate::settlement::SettlementEngine;
    use crate::util::lock::MatchLocks;

    fn user(id: i64, name: &str) -> User {
        User {
            id: UserId(id),
            full_name: name.to_string(),
            role: Role::User,
            is_active: true,
        }
    }

    fn score(id: i64, points: i64) -> LedgerEntry {
        LedgerEntry {
            user_id: UserId(id),
            points: Points::from_whole(points),
        }
    }

    #[test]
    fn test_rank_orders_and_breaks_ties_by_id() {
        let users = [
            user(1, "Ash"),
            user(2, "Bea"),
            user(3, "Cal"),
            user(4, "Dev"),
        ];
        let scores = [score(1, 10), score(2, 40), score(3, 10)];

        let ranked = rank(&users, &scores, &[], &[]);
        let order: Vec<(i64, i64)> = ranked.iter().map(|e| (e.rank, e.user_id.0)).collect();

        assert_eq!(order, vec![(1, 2), (2, 1), (3, 3), (4, 4)]);
        assert_eq!(ranked[3].total_points, Points::ZERO);
    }

    #[test]
    fn test_wager_classification() {
        let now = Utc::now();
        let fixture = |id: i64, winner: Option<&str>, abandoned: bool| Match {
            id: MatchId(id),
            team1: String::from("India"),
            team2: String::from("England"),
            venue: String::from("Lord's"),
            starts_at: now,
            winner: winner.map(str::to_string),
            is_abandoned: abandoned,
            version: 1,
        };
        let wager = |id: i64, match_id: i64, team: &str| Wager {
            id: WagerId(id),
            user_id: UserId(1),
            match_id: MatchId(match_id),
            selected_team: team.to_string(),
            amount: 10,
            created_at: now,
            updated_at: now,
        };

        let matches = [
            fixture(1, Some("India"), false),
            fixture(2, Some("England"), false),
            fixture(3, None, true),
            fixture(4, None, false),
        ];
        let wagers = [
            wager(1, 1, "India"),
            wager(2, 2, "India"),
            wager(3, 3, "India"),
            wager(4, 4, "India"),
        ];

        let statuses: Vec<WagerStatus> = wagers
            .iter()
            .map(|w| WagerStatus::classify(w, matches.iter().find(|m| m.id == w.match_id)))
            .collect();
        assert_eq!(
            statuses,
            vec![
                WagerStatus::Won,
                WagerStatus::Lost,
                WagerStatus::Void,
                WagerStatus::Pending
            ]
        );

        let ranked = rank(&[user(1, "Ash")], &[], &wagers, &matches);
        assert_eq!(ranked[0].winning_bets_count, 1);
        assert_eq!(ranked[0].total_bets_count, 4);
    }

    #[tokio::test]
    async fn test_project_after_settlement() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let engine = SettlementEngine::new(store.clone(), MatchLocks::new());

        let admin = store
            .insert_user(&NewUser {
                full_name: String::from("Umpire"),
                role: Role::Admin,
            })
            .await
            .unwrap();
        let a = store
            .insert_user(&NewUser {
                full_name: String::from("A"),
                role: Role::User,
            })
            .await
            .unwrap();
        let b = store
            .insert_user(&NewUser {
                full_name: String::from("B"),
                role: Role::User,
            })
            .await
            .unwrap();

        let fixture = store
            .insert_match(&NewMatch {
                team1: String::from("India"),
                team2: String::from("Australia"),
                venue: String::from("MCG"),
                starts_at: Utc::now() + Duration::days(1),
            })
            .await
            .unwrap();

        for (user, team, amount) in [(&a, "India", 20), (&b, "Australia", 10)] {
            store
                .insert_wager(&NewWager {
                    user_id: user.id,
                    match_id: fixture.id,
                    selected_team: team.to_string(),
                    amount,
                })
                .await
                .unwrap();
        }

        engine
            .settle_match(
                &CurrentUser::from(&admin),
                fixture.id,
                Some(String::from("India")),
                false,
            )
            .await
            .unwrap();

        let board = project(store.as_ref()).await.unwrap();
        let summary: Vec<(i64, &str, Points, i64, i64)> = board
            .iter()
            .map(|e| {
                (
                    e.rank,
                    e.full_name.as_str(),
                    e.total_points,
                    e.winning_bets_count,
                    e.total_bets_count,
                )
            })
            .collect();

        assert_eq!(
            summary,
            vec![
                (1, "A", Points::from_whole(30), 1, 1),
                (2, "Umpire", Points::ZERO, 0, 0),
                (3, "B", Points::from_whole(-10), 0, 1),
            ]
        );
    }
}
