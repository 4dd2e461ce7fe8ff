use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use trueque::{
    AppConfig, ChatMessage, Database, Evaluation, ExpirationSweeper, NegotiationChannel,
    Notifier, Proposal, ProposalStore, ReputationService, ReputationSnapshot, SqlGarmentCatalog,
    TracingSink, TradeError, TradeRole, WebhookSink,
};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "trueque-server")]
#[command(about = "Barter marketplace core: proposals, negotiation chat, reputation")]
struct Args {
    /// Path to a TOML config file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long, env = "TRUEQUE_DATABASE_URL")]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AppConfig::load_with_env_overrides(path)?,
        None => {
            let mut config = AppConfig::default();
            config.apply_env_overrides();
            config
        }
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(url) = args.database_url {
        config.database.url = url;
    }
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .init();

    let db = Database::new(&config.database.url).await?;

    let sink: Arc<dyn trueque::NotificationSink> = match &config.notifications.webhook_url {
        Some(url) => Arc::new(WebhookSink::new(url.clone())),
        None => Arc::new(TracingSink),
    };
    let notifier = Notifier::new(sink, trueque::EventBus::new());

    let catalog = Arc::new(SqlGarmentCatalog::new(db.clone()));
    let store = Arc::new(ProposalStore::new(
        db.clone(),
        catalog,
        notifier.clone(),
        config.trade.clone(),
    ));
    let chat = NegotiationChannel::new(db.clone(), notifier.clone());
    let reputation = ReputationService::new(db.clone(), config.reputation.clone(), notifier.clone());

    if config.sweeper.enabled {
        let sweeper = ExpirationSweeper::new(
            store.clone(),
            db.clone(),
            notifier.clone(),
            config.trade.clone(),
            config.sweeper.clone(),
        );
        sweeper.spawn();
        tracing::info!(
            "Expiration sweeper running every {}s",
            config.sweeper.interval_seconds
        );
    }

    let app_state = AppState {
        store,
        chat,
        reputation,
    };

    let app = Router::new()
        .route("/proposals", post(create_proposal))
        .route("/proposals/:proposal_id", get(get_proposal))
        .route("/proposals/:proposal_id/accept", post(accept_proposal))
        .route("/proposals/:proposal_id/reject", post(reject_proposal))
        .route("/proposals/:proposal_id/cancel", post(cancel_proposal))
        .route("/proposals/:proposal_id/complete", post(complete_proposal))
        .route(
            "/proposals/:proposal_id/messages",
            get(list_messages).post(post_message),
        )
        .route("/proposals/:proposal_id/read", post(mark_read))
        .route("/proposals/:proposal_id/evaluations", post(submit_evaluation))
        .route("/users/:user_id/proposals", get(list_proposals))
        .route("/users/:user_id/reputation", get(get_reputation))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let listener = TcpListener::bind(config.server_address()).await?;
    tracing::info!("trueque server listening on {}", config.server_address());

    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Clone)]
struct AppState {
    store: Arc<ProposalStore>,
    chat: NegotiationChannel,
    reputation: ReputationService,
}

type ApiError = (StatusCode, Json<serde_json::Value>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn api_error(e: TradeError) -> ApiError {
    let status = match &e {
        TradeError::NotAuthorized(_) | TradeError::InvalidGarmentOwnership { .. } => {
            StatusCode::FORBIDDEN
        }
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        e if e.is_state_conflict() => StatusCode::CONFLICT,
        TradeError::ProposalLimitExceeded { .. } => StatusCode::CONFLICT,
        TradeError::Validation(_)
        | TradeError::SelfTradeNotAllowed
        | TradeError::DuplicateProposal
        | TradeError::Serialization(_)
        | TradeError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("Request failed: {}", e);
    } else {
        tracing::debug!("Request rejected: {}", e);
    }
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}

#[derive(Deserialize)]
struct CreateProposalRequest {
    proposer_id: Uuid,
    offered_garment_id: Uuid,
    requested_garment_id: Uuid,
    message: Option<String>,
}

async fn create_proposal(
    State(state): State<AppState>,
    Json(request): Json<CreateProposalRequest>,
) -> ApiResult<Proposal> {
    state
        .store
        .create(
            request.proposer_id,
            request.offered_garment_id,
            request.requested_garment_id,
            request.message.as_deref(),
        )
        .await
        .map(Json)
        .map_err(api_error)
}

async fn get_proposal(
    State(state): State<AppState>,
    Path(proposal_id): Path<Uuid>,
) -> ApiResult<Proposal> {
    state.store.get(proposal_id).await.map(Json).map_err(api_error)
}

#[derive(Deserialize)]
struct ActorRequest {
    user_id: Uuid,
    message: Option<String>,
}

async fn accept_proposal(
    State(state): State<AppState>,
    Path(proposal_id): Path<Uuid>,
    Json(request): Json<ActorRequest>,
) -> ApiResult<Proposal> {
    state
        .store
        .accept(request.user_id, proposal_id, request.message.as_deref())
        .await
        .map(Json)
        .map_err(api_error)
}

async fn reject_proposal(
    State(state): State<AppState>,
    Path(proposal_id): Path<Uuid>,
    Json(request): Json<ActorRequest>,
) -> ApiResult<Proposal> {
    state
        .store
        .reject(request.user_id, proposal_id)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn cancel_proposal(
    State(state): State<AppState>,
    Path(proposal_id): Path<Uuid>,
    Json(request): Json<ActorRequest>,
) -> ApiResult<Proposal> {
    state
        .store
        .cancel(request.user_id, proposal_id)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn complete_proposal(
    State(state): State<AppState>,
    Path(proposal_id): Path<Uuid>,
    Json(request): Json<ActorRequest>,
) -> ApiResult<Proposal> {
    state
        .store
        .complete(request.user_id, proposal_id)
        .await
        .map(Json)
        .map_err(api_error)
}

#[derive(Deserialize)]
struct PostMessageRequest {
    sender_id: Uuid,
    body: String,
}

async fn post_message(
    State(state): State<AppState>,
    Path(proposal_id): Path<Uuid>,
    Json(request): Json<PostMessageRequest>,
) -> ApiResult<ChatMessage> {
    state
        .chat
        .post(proposal_id, request.sender_id, &request.body)
        .await
        .map(Json)
        .map_err(api_error)
}

#[derive(Deserialize)]
struct UserQuery {
    user_id: Uuid,
}

async fn list_messages(
    State(state): State<AppState>,
    Path(proposal_id): Path<Uuid>,
    Query(query): Query<UserQuery>,
) -> ApiResult<Vec<ChatMessage>> {
    state
        .chat
        .list(proposal_id, query.user_id)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn mark_read(
    State(state): State<AppState>,
    Path(proposal_id): Path<Uuid>,
    Json(request): Json<ActorRequest>,
) -> ApiResult<serde_json::Value> {
    state
        .chat
        .mark_read(proposal_id, request.user_id)
        .await
        .map(|newly_read| Json(serde_json::json!({ "newly_read": newly_read })))
        .map_err(api_error)
}

#[derive(Deserialize)]
struct SubmitEvaluationRequest {
    evaluator_id: Uuid,
    overall_score: u8,
    #[serde(default)]
    dimension_scores: HashMap<String, u8>,
}

async fn submit_evaluation(
    State(state): State<AppState>,
    Path(proposal_id): Path<Uuid>,
    Json(request): Json<SubmitEvaluationRequest>,
) -> ApiResult<Evaluation> {
    state
        .reputation
        .submit(
            request.evaluator_id,
            proposal_id,
            request.overall_score,
            request.dimension_scores,
        )
        .await
        .map(Json)
        .map_err(api_error)
}

#[derive(Deserialize)]
struct RoleQuery {
    role: Option<TradeRole>,
}

async fn list_proposals(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<RoleQuery>,
) -> ApiResult<Vec<Proposal>> {
    state
        .store
        .list_for(user_id, query.role.unwrap_or(TradeRole::Either))
        .await
        .map(Json)
        .map_err(api_error)
}

async fn get_reputation(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<ReputationSnapshot> {
    state.reputation.get(user_id).await.map(Json).map_err(api_error)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}
