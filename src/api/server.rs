use std::net::SocketAddr;
use std::net::{IpAddr, Ipv4Addr};
use std::num::ParseIntError;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{MatchedPath, Request};
use axum::middleware::{self, Next, from_fn};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use http::StatusCode;
use ring::hmac::Key;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::instrument;

use crate::api::handler::*;
use crate::api::middleware::verify_identity::{identity_key, verify_identity};
use crate::api::middleware::{MiddlewareErr, cors};
use crate::db::prelude::*;
use crate::settlement::{SettlementEngine, SettlementError};
use crate::util::env::{self, EnvErr, Var};
use crate::util::lock::MatchLocks;
use crate::var;
use crate::wager::{WagerError, WagerService};

pub type JsonResult<T> = core::result::Result<Json<T>, RouteError>;

#[derive(Clone, Debug)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub engine: SettlementEngine,
    pub wagers: WagerService,
    pub identity_key: Key,
}

impl AppState {
    /// Settlement and wager placement share one lock registry so they serialize per match
    pub fn new(store: Arc<dyn Store>, identity_secret: &str, allowed_amounts: &[i64]) -> Self {
        let locks = MatchLocks::new();

        Self {
            engine: SettlementEngine::new(store.clone(), locks.clone()),
            wagers: WagerService::new(store.clone(), locks, allowed_amounts),
            identity_key: identity_key(identity_secret),
            store,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        .route("/leaderboard", get(leaderboard))
        //
        // matches
        .route("/matches", get(upcoming_matches).post(create_match))
        .route("/matches/all", get(all_matches))
        .route("/matches/{id}", get(match_by_id))
        .route("/matches/{id}/winner", put(declare_winner))
        .route("/matches/{id}/wagers", get(wagers_on_match))
        //
        // wagers
        .route("/wagers", get(my_wagers).post(place_wager))
        .route("/wagers/amounts", get(wager_amounts))
        .route("/wagers/{id}", put(update_wager))
        .route("/wagers/match/{match_id}", get(my_wager_for_match))
        //
        // users
        .route("/users", get(list_users).post(create_user))
        .route("/users/{id}/deactivate", put(deactivate_user))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            verify_identity,
        ));

    Router::new()
        .route("/", get(|| async { Response::new(Body::empty()) }))
        .nest("/api", api_routes)
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                let method = req.method();
                let uri = req.uri();

                let matched_path = req
                    .extensions()
                    .get::<MatchedPath>()
                    .map(|matched| matched.as_str());

                tracing::debug_span!("api_request", ?method, ?uri, ?matched_path)
            }),
        )
        .layer(from_fn(log_route_errors))
        .with_state(state)
}

#[instrument(skip(tx))]
async fn serve(tx: UnboundedSender<SocketAddr>) -> ServerResult<()> {
    let config = env::env().await?;
    let store = store().await?;
    tracing::info!(backend = store.backend(), "store ready");

    let state = Arc::new(AppState::new(
        store,
        &config.identity_secret,
        &config.wager_amounts,
    ));
    let app = router(state).layer(cors().await?);

    let port = var!(Var::ServerApiPort).await?.parse::<u16>()?;
    let socket_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port);
    let listener = tokio::net::TcpListener::bind(socket_addr).await?;

    // nobody listening for readiness isn't a reason to stop serving
    _ = tx.send(socket_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Custom error trace handler for `RouteError`-type responses
#[instrument(skip(request, next), fields(uri = request.uri().to_string()))]
async fn log_route_errors(request: Request, next: Next) -> Response {
    let res = next.run(request).await;
    if let Some(err) = res.extensions().get::<Arc<RouteError>>() {
        tracing::error!(error = ?err, "error occurred inside route handler");
    }

    res
}

#[instrument(skip_all)]
pub async fn start_server(
    tx: UnboundedSender<SocketAddr>,
    mut rx: UnboundedReceiver<SocketAddr>,
) -> ServerResult<Vec<JoinHandle<()>>> {
    tracing::info!("starting server");
    let server_handle = tokio::task::spawn(async move {
        if let Err(e) = serve(tx).await {
            tracing::error!(error = ?e, "server exited with an error");
        }
    });

    let logging_handle = tokio::task::spawn(async move {
        if let Some(addr) = rx.recv().await {
            tracing::info!(
                server_url = &format!("http://127.0.0.1:{}", addr.port()),
                "server ready"
            );
        }
    });

    Ok(vec![server_handle, logging_handle])
}

pub type ServerResult<T> = core::result::Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    EnvError(#[from] EnvErr),

    #[error(transparent)]
    StoreError(#[from] StoreError),

    #[error(transparent)]
    MiddlewareError(#[from] MiddlewareErr),

    #[error("invalid SERVER_API_PORT: {0}")]
    InvalidPort(#[from] ParseIntError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Settlement(#[from] SettlementError),

    #[error(transparent)]
    Wager(#[from] WagerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    AuthError(StatusCode),

    #[error("admin role required")]
    Forbidden,

    #[error("match {0} not found")]
    MatchNotFound(MatchId),

    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("invalid match: {0}")]
    InvalidMatch(String),

    #[error("invalid user: {0}")]
    InvalidUser(String),
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            message: String,
        }

        let status = match &self {
            RouteError::Settlement(err) => match err {
                SettlementError::NotFound(_) => StatusCode::NOT_FOUND,
                SettlementError::InvalidOutcome(_) => StatusCode::UNPROCESSABLE_ENTITY,
                SettlementError::Unauthorized => StatusCode::FORBIDDEN,
                SettlementError::Conflict(_) => StatusCode::CONFLICT,
                SettlementError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            },

            RouteError::Wager(err) => match err {
                WagerError::MatchNotFound(_) | WagerError::NotFound(_) => StatusCode::NOT_FOUND,
                WagerError::InvalidTeam { .. } | WagerError::InvalidAmount { .. } => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                WagerError::MatchClosed(_) => StatusCode::CONFLICT,
                WagerError::Unauthorized => StatusCode::FORBIDDEN,
                WagerError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            },

            RouteError::Store(StoreError::DuplicateWager { .. }) => StatusCode::CONFLICT,
            RouteError::Store(StoreError::VersionConflict { .. }) => StatusCode::CONFLICT,
            RouteError::Store(StoreError::MatchNotFound(_)) => StatusCode::NOT_FOUND,
            RouteError::Store(StoreError::MatchClosed(_)) => StatusCode::CONFLICT,
            RouteError::Store(StoreError::EnvError(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            RouteError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,

            RouteError::AuthError(status) => status.to_owned(),
            RouteError::Forbidden => StatusCode::FORBIDDEN,
            RouteError::MatchNotFound(_) | RouteError::UserNotFound(_) => StatusCode::NOT_FOUND,
            RouteError::InvalidMatch(_) | RouteError::InvalidUser(_) => StatusCode::BAD_REQUEST,
        };

        let message = match &self {
            RouteError::AuthError(StatusCode::FORBIDDEN) => String::from("user is deactivated"),
            RouteError::AuthError(_) => String::from("invalid identity headers"),
            // don't hand driver errors to clients
            _ if status.is_server_error() => String::from("storage unavailable"),
            err => err.to_string(),
        };

        let mut response = (status, Json(ErrorResponse { message })).into_response();
        if status.is_server_error() {
            response.extensions_mut().insert(Arc::new(self));
        }

        response
    }
}
