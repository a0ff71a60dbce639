use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use chrono::Utc;
use http::StatusCode;
use serde::Deserialize;
use tracing::instrument;

use crate::api::server::{AppState, JsonResult, RouteError};
use crate::db::prelude::*;
use crate::leaderboard::{self, RankedEntry};

type Created<T> = core::result::Result<(StatusCode, Json<T>), RouteError>;

fn require_admin(actor: &CurrentUser) -> Result<(), RouteError> {
    match actor.is_admin() {
        true => Ok(()),
        false => Err(RouteError::Forbidden),
    }
}

// ---
//  leaderboard
// ---

#[instrument(skip(state))]
pub async fn leaderboard(State(state): State<Arc<AppState>>) -> JsonResult<Vec<RankedEntry>> {
    Ok(Json(leaderboard::project(state.store.as_ref()).await?))
}

// ---
//  matches
// ---

#[derive(Debug, Deserialize)]
pub struct DeclareOutcome {
    pub winner: Option<String>,
    #[serde(default)]
    pub is_abandoned: bool,
}

#[instrument(skip(state, actor), fields(actor = %actor.id))]
pub async fn declare_winner(
    State(state): State<Arc<AppState>>,
    actor: CurrentUser,
    Path(id): Path<MatchId>,
    Json(body): Json<DeclareOutcome>,
) -> JsonResult<Match> {
    let settled = state
        .engine
        .settle_match(&actor, id, body.winner, body.is_abandoned)
        .await?;

    Ok(Json(settled))
}

/// Matches still taking wagers, soonest first
#[instrument(skip(state))]
pub async fn upcoming_matches(State(state): State<Arc<AppState>>) -> JsonResult<Vec<Match>> {
    let now = Utc::now();
    let mut upcoming: Vec<Match> = state
        .store
        .list_matches()
        .await?
        .into_iter()
        .filter(|m| m.accepts_wagers(now))
        .collect();

    upcoming.sort_by(|a, b| a.starts_at.cmp(&b.starts_at).then(a.id.cmp(&b.id)));
    Ok(Json(upcoming))
}

/// Every match, resolved ones included, so a recorded winner can still be changed
#[instrument(skip(state))]
pub async fn all_matches(State(state): State<Arc<AppState>>) -> JsonResult<Vec<Match>> {
    let mut matches = state.store.list_matches().await?;
    matches.sort_by(|a, b| a.starts_at.cmp(&b.starts_at).then(a.id.cmp(&b.id)));

    Ok(Json(matches))
}

#[instrument(skip(state))]
pub async fn match_by_id(
    State(state): State<Arc<AppState>>,
    Path(id): Path<MatchId>,
) -> JsonResult<Match> {
    let fixture = state
        .store
        .get_match(id)
        .await?
        .ok_or(RouteError::MatchNotFound(id))?;

    Ok(Json(fixture))
}

#[instrument(skip(state, actor, item), fields(actor = %actor.id))]
pub async fn create_match(
    State(state): State<Arc<AppState>>,
    actor: CurrentUser,
    Json(item): Json<NewMatch>,
) -> Created<Match> {
    require_admin(&actor)?;
    item.validate().map_err(RouteError::InvalidMatch)?;

    let item = NewMatch {
        team1: item.team1.trim().to_string(),
        team2: item.team2.trim().to_string(),
        venue: item.venue.trim().to_string(),
        starts_at: item.starts_at,
    };

    let fixture = state.store.insert_match(&item).await?;
    tracing::info!(
        match_id = %fixture.id,
        team1 = %fixture.team1,
        team2 = %fixture.team2,
        "match created"
    );

    Ok((StatusCode::CREATED, Json(fixture)))
}

// ---
//  wagers
// ---

#[derive(Debug, Deserialize)]
pub struct PlaceWager {
    pub match_id: MatchId,
    pub team: String,
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct AmendWager {
    pub team: String,
    pub amount: i64,
}

#[instrument(skip(state, actor), fields(actor = %actor.id))]
pub async fn place_wager(
    State(state): State<Arc<AppState>>,
    actor: CurrentUser,
    Json(body): Json<PlaceWager>,
) -> JsonResult<Wager> {
    let wager = state
        .wagers
        .place(&actor, body.match_id, body.team, body.amount)
        .await?;

    Ok(Json(wager))
}

#[instrument(skip(state, actor), fields(actor = %actor.id))]
pub async fn update_wager(
    State(state): State<Arc<AppState>>,
    actor: CurrentUser,
    Path(id): Path<WagerId>,
    Json(body): Json<AmendWager>,
) -> JsonResult<Wager> {
    let wager = state
        .wagers
        .update(&actor, id, body.team, body.amount)
        .await?;

    Ok(Json(wager))
}

#[instrument(skip(state, actor), fields(actor = %actor.id))]
pub async fn wagers_on_match(
    State(state): State<Arc<AppState>>,
    actor: CurrentUser,
    Path(id): Path<MatchId>,
) -> JsonResult<Vec<Wager>> {
    require_admin(&actor)?;
    state
        .store
        .get_match(id)
        .await?
        .ok_or(RouteError::MatchNotFound(id))?;

    Ok(Json(state.wagers.list_for_match(id).await?))
}

#[instrument(skip(state, actor), fields(actor = %actor.id))]
pub async fn my_wagers(
    State(state): State<Arc<AppState>>,
    actor: CurrentUser,
) -> JsonResult<Vec<Wager>> {
    Ok(Json(state.wagers.list_for_user(actor.id).await?))
}

#[instrument(skip(state, actor), fields(actor = %actor.id))]
pub async fn my_wager_for_match(
    State(state): State<Arc<AppState>>,
    actor: CurrentUser,
    Path(match_id): Path<MatchId>,
) -> JsonResult<Option<Wager>> {
    Ok(Json(
        state.wagers.for_user_and_match(actor.id, match_id).await?,
    ))
}

pub async fn wager_amounts(State(state): State<Arc<AppState>>) -> Json<Vec<i64>> {
    Json(state.wagers.allowed_amounts().to_vec())
}

// ---
//  users
// ---

#[instrument(skip(state, actor), fields(actor = %actor.id))]
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    actor: CurrentUser,
) -> JsonResult<Vec<User>> {
    require_admin(&actor)?;
    Ok(Json(state.store.list_users().await?))
}

#[instrument(skip(state, actor, item), fields(actor = %actor.id))]
pub async fn create_user(
    State(state): State<Arc<AppState>>,
    actor: CurrentUser,
    Json(item): Json<NewUser>,
) -> Created<User> {
    require_admin(&actor)?;

    let full_name = item.full_name.trim();
    if full_name.is_empty() {
        return Err(RouteError::InvalidUser(String::from("full_name must not be empty")));
    }

    let user = state
        .store
        .insert_user(&NewUser {
            full_name: full_name.to_string(),
            role: item.role,
        })
        .await?;
    tracing::info!(user_id = %user.id, role = %user.role, "user created");

    Ok((StatusCode::CREATED, Json(user)))
}

/// Deactivated users keep their ledger entry and stay on the leaderboard
#[instrument(skip(state, actor), fields(actor = %actor.id))]
pub async fn deactivate_user(
    State(state): State<Arc<AppState>>,
    actor: CurrentUser,
    Path(id): Path<UserId>,
) -> JsonResult<User> {
    require_admin(&actor)?;

    let user = state
        .store
        .set_user_active(id, false)
        .await?
        .ok_or(RouteError::UserNotFound(id))?;
    tracing::info!(user_id = %id, "user deactivated");

    Ok(Json(user))
}
