use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use super::controller::{PipelineController, PipelineSettings, TransitionOutcome};
use super::models::*;
use super::store::LeadStore;
use super::validation::validate_new_lead;
use crate::errors::{PipelineError, StoreError};

// ── Shared application state ──────────────────────────────────────────

/// A board and whether its first load has finished.
struct BoardSlot {
    controller: Arc<PipelineController>,
    loaded: OnceCell<()>,
}

impl BoardSlot {
    /// Nobody outside the map holds it and it has nothing in progress.
    fn is_evictable(self: &Arc<Self>) -> bool {
        Arc::strong_count(self) == 1
            && Arc::strong_count(&self.controller) == 1
            && self.loaded.initialized()
            && self.controller.is_idle()
    }
}

/// One pipeline controller per account id, created and loaded on first use.
///
/// Every session of an account shares its controller whatever the role,
/// so in-flight stage changes are tracked once per board. The role only
/// matters for deletes and is passed along per request.
pub struct AppState {
    pub store: Arc<dyn LeadStore>,
    pub settings: PipelineSettings,
    boards: Mutex<HashMap<AccountId, Arc<BoardSlot>>>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(store: Arc<dyn LeadStore>, settings: PipelineSettings) -> Self {
        Self {
            store,
            settings,
            boards: Mutex::new(HashMap::new()),
        }
    }

    fn boards(&self) -> MutexGuard<'_, HashMap<AccountId, Arc<BoardSlot>>> {
        self.boards.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The controller for `account`, loading its board the first time.
    ///
    /// The map lock is only held to find or insert the slot; the load runs
    /// outside it so one slow account does not stall the others. A failed
    /// first load is not retried here; the board reports it through
    /// `load_error` until the client asks for a reload.
    pub async fn controller(&self, account: &Account) -> Arc<PipelineController> {
        let slot = {
            let mut boards = self.boards();
            match boards.get(&account.id) {
                Some(slot) => slot.clone(),
                None => {
                    let before = boards.len();
                    boards.retain(|_, slot| !slot.is_evictable());
                    if boards.len() < before {
                        tracing::debug!(evicted = before - boards.len(), "Dropped idle boards");
                    }
                    let slot = Arc::new(BoardSlot {
                        controller: Arc::new(PipelineController::new(
                            account.clone(),
                            self.store.clone(),
                            self.settings.clone(),
                        )),
                        loaded: OnceCell::new(),
                    });
                    boards.insert(account.id.clone(), slot.clone());
                    slot
                }
            }
        };

        slot.loaded
            .get_or_init(|| async {
                // failure is already recorded on the board and broadcast
                let _ = slot.controller.load().await;
            })
            .await;
        slot.controller.clone()
    }

    /// The controller for `account_id` if its board is already loaded.
    pub fn loaded_controller(&self, account_id: &AccountId) -> Option<Arc<PipelineController>> {
        self.boards()
            .get(account_id)
            .filter(|slot| slot.loaded.initialized())
            .map(|slot| slot.controller.clone())
    }

    /// Number of boards currently held in memory.
    pub fn board_count(&self) -> usize {
        self.boards().len()
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct MoveLeadRequest {
    pub stage: Stage,
}

#[derive(Deserialize)]
pub struct DeleteLeadQuery {
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Deserialize)]
pub struct CreateFieldRequest {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateFieldRequest {
    #[serde(default)]
    pub value: Option<String>,
}

/// Public contact form submission. Anything beyond these fields is ignored.
#[derive(Deserialize)]
pub struct IntakeRequest {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Serialize)]
pub struct StageChangeResponse {
    pub lead: Lead,
    /// False when the lead was already in the requested stage.
    pub changed: bool,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    PreconditionRequired(String),
    BadGateway(String),
    GatewayTimeout(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::PreconditionRequired(msg) => (StatusCode::PRECONDITION_REQUIRED, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::GatewayTimeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let msg = err.to_string();
        match err {
            StoreError::Conflict(_) => ApiError::Conflict(msg),
            StoreError::PermissionDenied(_) => ApiError::Forbidden(msg),
            StoreError::Timeout(_) => ApiError::GatewayTimeout(msg),
            StoreError::Unavailable(_) | StoreError::Rejected(_) => ApiError::BadGateway(msg),
            StoreError::Database(_) => ApiError::Internal(msg),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let msg = err.to_string();
        match err {
            PipelineError::LeadNotFound { .. } | PipelineError::CustomFieldNotFound { .. } => {
                ApiError::NotFound(msg)
            }
            PipelineError::Validation(_) => ApiError::BadRequest(msg),
            PipelineError::TransitionInFlight { .. } | PipelineError::ZeroRowsAffected { .. } => {
                ApiError::Conflict(msg)
            }
            PipelineError::ConfirmationRequired { .. } => ApiError::PreconditionRequired(msg),
            PipelineError::LoadFailed(_) | PipelineError::TransitionFailed { .. } => {
                ApiError::BadGateway(msg)
            }
            PipelineError::Store(inner) => inner.into(),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/board", get(get_board))
        .route("/api/board/reload", post(reload_board))
        .route("/api/leads", post(create_lead))
        .route(
            "/api/leads/{id}",
            get(get_lead).patch(update_lead).delete(delete_lead),
        )
        .route("/api/leads/{id}/stage", patch(move_lead))
        .route(
            "/api/leads/{id}/fields",
            get(list_fields).post(create_field),
        )
        .route("/api/fields/{id}", patch(update_field).delete(delete_field))
        .route("/api/intake/{account_id}", post(submit_intake))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn get_board(State(state): State<SharedState>, account: Account) -> impl IntoResponse {
    Json(state.controller(&account).await.board())
}

async fn reload_board(
    State(state): State<SharedState>,
    account: Account,
) -> Result<impl IntoResponse, ApiError> {
    let controller = state.controller(&account).await;
    controller.load().await?;
    Ok(Json(controller.board()))
}

async fn create_lead(
    State(state): State<SharedState>,
    account: Account,
    Json(draft): Json<LeadDraft>,
) -> Result<impl IntoResponse, ApiError> {
    let lead = state.controller(&account).await.create_lead(draft).await?;
    Ok((StatusCode::CREATED, Json(lead)))
}

async fn get_lead(
    State(state): State<SharedState>,
    account: Account,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = LeadId::from(id);
    let lead = state
        .controller(&account)
        .await
        .lead(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Lead {} not found", id)))?;
    Ok(Json(lead))
}

async fn update_lead(
    State(state): State<SharedState>,
    account: Account,
    Path(id): Path<String>,
    Json(draft): Json<LeadDraft>,
) -> Result<impl IntoResponse, ApiError> {
    let lead = state
        .controller(&account)
        .await
        .update_lead_details(&LeadId::from(id), draft)
        .await?;
    Ok(Json(lead))
}

async fn move_lead(
    State(state): State<SharedState>,
    account: Account,
    Path(id): Path<String>,
    Json(req): Json<MoveLeadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = LeadId::from(id);
    let controller = state.controller(&account).await;
    let outcome = controller.request_stage_transition(&id, req.stage).await?;
    let lead = controller
        .lead(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Lead {} not found", id)))?;
    Ok(Json(StageChangeResponse {
        lead,
        changed: matches!(outcome, TransitionOutcome::Moved { .. }),
    }))
}

async fn delete_lead(
    State(state): State<SharedState>,
    account: Account,
    Path(id): Path<String>,
    Query(query): Query<DeleteLeadQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .controller(&account)
        .await
        .delete_lead_as(account.role, &LeadId::from(id), query.confirm)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_fields(
    State(state): State<SharedState>,
    account: Account,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let fields = state
        .controller(&account)
        .await
        .custom_fields(&LeadId::from(id))
        .await?;
    Ok(Json(fields))
}

async fn create_field(
    State(state): State<SharedState>,
    account: Account,
    Path(id): Path<String>,
    Json(req): Json<CreateFieldRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let field = state
        .controller(&account)
        .await
        .add_custom_field(&LeadId::from(id), &req.name, req.value.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(field)))
}

async fn update_field(
    State(state): State<SharedState>,
    account: Account,
    Path(id): Path<String>,
    Json(req): Json<UpdateFieldRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let field = state
        .controller(&account)
        .await
        .set_custom_field(&CustomFieldId::from(id), req.value.as_deref())
        .await?;
    Ok(Json(field))
}

async fn delete_field(
    State(state): State<SharedState>,
    account: Account,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .controller(&account)
        .await
        .remove_custom_field(&CustomFieldId::from(id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Unauthenticated lead capture for an account's contact form. The lead
/// always starts in `New`. A board already open for the account picks it
/// up live; otherwise it appears on the next load.
async fn submit_intake(
    State(state): State<SharedState>,
    Path(account_id): Path<String>,
    Json(req): Json<IntakeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = account_id.trim();
    if account_id.is_empty() {
        return Err(ApiError::BadRequest("Account id is required".into()));
    }
    let owner = AccountId::from(account_id);
    let draft = LeadDraft {
        company: req.company,
        message: req.message,
        stage: Some(Stage::New),
        ..LeadDraft::new(req.name, req.email)
    };

    let lead = match state.loaded_controller(&owner) {
        Some(controller) => controller.create_lead(draft).await?,
        None => {
            let new_lead = validate_new_lead(&draft, &state.settings.currency)?;
            let limit = state.settings.request_timeout;
            tokio::time::timeout(limit, state.store.insert_lead(&owner, &new_lead))
                .await
                .unwrap_or(Err(StoreError::Timeout(limit)))?
        }
    };
    tracing::info!(account = %owner, lead = %lead.id, "Intake lead received");
    Ok((StatusCode::CREATED, Json(serde_json::json!({"id": lead.id}))))
}

// ── Tests ─────────────────────────────────────────────────────────────
