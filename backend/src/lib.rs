use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use draw_core::{
    selectable_actors, validate_name, CommitPlan, DrawError, DrawSession, Participant,
    ParticipantId, ParticipantPatch, SessionState, ShuffleTicket,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

pub mod config;
pub mod error;
pub mod retry;
pub mod store;
pub mod ticket;

use config::Config;
use error::ApiError;
use retry::{retry_with_backoff, RetryPolicy};
use store::{MarkOutcome, MemoryStore, ParticipantStore, StoreError};
use ticket::Ticket;

#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn ParticipantStore>,
    sessions: Arc<RwLock<HashMap<ParticipantId, SessionSlot>>>,
    /// Commits hold it shared; reset and clear hold it exclusively, so a bulk
    /// roster change never lands between the two writes of a draw.
    roster_gate: Arc<RwLock<()>>,
    config: Arc<Config>,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(MemoryStore::default(), Config::default())
    }
}

impl AppState {
    pub fn new(store: impl ParticipantStore + 'static, config: Config) -> Self {
        Self {
            store: Arc::new(store),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            roster_gate: Arc::new(RwLock::new(())),
            config: Arc::new(config),
        }
    }

    /// Memory-only roster unless `persist_path` is set.
    pub async fn from_config(config: Config) -> Self {
        match &config.persist_path {
            Some(path) => Self::new(MemoryStore::with_persistence(path.clone()).await, config),
            None => Self::new(MemoryStore::default(), config),
        }
    }

    /// Live sessions hold roster snapshots that a reset or clear makes meaningless.
    async fn discard_sessions(&self) {
        let mut sessions = self.sessions.write().await;
        let discarded = sessions.len();
        sessions.clear();
        info!(discarded, "discarded live sessions");
    }
}

struct SessionSlot {
    session: DrawSession,
    rng: ChaCha8Rng,
    ticket: Option<Ticket>,
    channel: broadcast::Sender<SessionView>,
}

impl SessionSlot {
    fn new(session: DrawSession, rng: ChaCha8Rng) -> Self {
        let (tx, _) = broadcast::channel(32);
        Self {
            session,
            rng,
            ticket: None,
            channel: tx,
        }
    }

    fn view(&self) -> SessionView {
        SessionView::of(&self.session)
    }

    /// Push the current view to WebSocket subscribers and return it.
    fn publish(&self) -> SessionView {
        let view = self.view();
        let _ = self.channel.send(view.clone());
        view
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionView {
    pub actor: Option<Participant>,
    pub state: SessionState,
    pub pool: Vec<Participant>,
    pub pending: Option<Participant>,
    pub committed_target: Option<Participant>,
    pub shuffled: bool,
    pub shuffling: bool,
}

impl SessionView {
    fn of(session: &DrawSession) -> Self {
        Self {
            actor: session.actor().cloned(),
            state: session.state(),
            pool: session.pool().to_vec(),
            pending: session.pending().cloned(),
            committed_target: session.committed_target().cloned(),
            shuffled: session.is_shuffled(),
            shuffling: session.is_shuffling(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/participants", get(list_participants))
        .route("/actors", get(list_actors))
        .route(
            "/session/:id",
            get(get_session).post(enter_session).delete(exit_session),
        )
        .route("/session/:id/shuffle", post(shuffle_pool))
        .route("/session/:id/select", post(select_target))
        .route("/session/:id/confirm", post(confirm_draw))
        .route("/session/:id/cancel", post(cancel_session))
        .route("/session/:id/ticket", get(get_ticket))
        .route("/session/:id/ticket.svg", get(get_ticket_svg))
        .route("/ws/session/:id", get(ws_handler))
        .route("/admin/login", post(admin_login))
        .route(
            "/admin/participants",
            post(add_participant).delete(clear_participants),
        )
        .route("/admin/reset", post(reset_draws))
        .with_state(state)
}

#[derive(Deserialize)]
struct EnterParams {
    seed: Option<u64>,
}

#[derive(Deserialize)]
struct SelectRequest {
    target_id: ParticipantId,
}

#[derive(Deserialize)]
struct AddRequest {
    name: String,
}

/// Illegal transitions are dropped: the caller answers with the unchanged view.
fn drive<T>(actor_id: ParticipantId, result: Result<T, DrawError>) -> Result<Option<T>, ApiError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_ignorable() => {
            debug!(actor_id, error = %err, "ignored session action");
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

async fn list_participants(State(state): State<AppState>) -> Result<Json<Vec<Participant>>, ApiError> {
    Ok(Json(state.store.list().await?))
}

async fn list_actors(State(state): State<AppState>) -> Result<Json<Vec<Participant>>, ApiError> {
    let roster = state.store.list().await?;
    Ok(Json(selectable_actors(&roster)))
}

async fn get_session(
    State(state): State<AppState>,
    Path(actor_id): Path<ParticipantId>,
) -> Json<SessionView> {
    let sessions = state.sessions.read().await;
    let view = match sessions.get(&actor_id) {
        Some(slot) => slot.view(),
        None => SessionView::of(&DrawSession::new()),
    };
    Json(view)
}

async fn enter_session(
    State(state): State<AppState>,
    Path(actor_id): Path<ParticipantId>,
    Query(params): Query<EnterParams>,
) -> Result<Json<SessionView>, ApiError> {
    let roster = state.store.list().await?;
    let mut rng = params
        .seed
        .map(ChaCha8Rng::seed_from_u64)
        .unwrap_or_else(ChaCha8Rng::from_entropy);

    let mut sessions = state.sessions.write().await;
    let slot = match sessions.entry(actor_id) {
        Entry::Occupied(occupied) => {
            let slot = occupied.into_mut();
            if let Some(entered) = drive(actor_id, slot.session.enter(actor_id, &roster, &mut rng))? {
                slot.rng = rng;
                slot.ticket = None;
                info!(actor_id, state = ?entered, pool = slot.session.pool().len(), "session entered");
            }
            slot
        }
        // a slot only exists for an actor that entered successfully
        Entry::Vacant(vacant) => {
            let mut session = DrawSession::new();
            let entered = session.enter(actor_id, &roster, &mut rng)?;
            info!(actor_id, state = ?entered, pool = session.pool().len(), "session entered");
            vacant.insert(SessionSlot::new(session, rng))
        }
    };
    Ok(Json(slot.publish()))
}

async fn shuffle_pool(
    State(state): State<AppState>,
    Path(actor_id): Path<ParticipantId>,
) -> Result<Json<SessionView>, ApiError> {
    let (view, ticket) = {
        let mut sessions = state.sessions.write().await;
        let slot = sessions
            .get_mut(&actor_id)
            .ok_or(ApiError::NotFound("no active session"))?;
        let ticket = drive(actor_id, slot.session.start_shuffle())?;
        (slot.publish(), ticket)
    };

    if let Some(ticket) = ticket {
        debug!(actor_id, steps = state.config.shuffle_steps, "shuffle started");
        tokio::spawn(run_shuffle(state.clone(), actor_id, ticket));
    }
    Ok(Json(view))
}

/// Plays the shuffle steps on a fixed interval. Once started it runs to the end;
/// steps for a session that was left or replaced are dropped.
async fn run_shuffle(state: AppState, actor_id: ParticipantId, ticket: ShuffleTicket) {
    for _ in 0..state.config.shuffle_steps {
        tokio::time::sleep(state.config.shuffle_step_delay).await;

        let mut sessions = state.sessions.write().await;
        let Some(slot) = sessions.get_mut(&actor_id) else {
            debug!(actor_id, "shuffle abandoned, session gone");
            return;
        };
        if let Err(err) = slot.session.shuffle_step(ticket, &mut slot.rng) {
            debug!(actor_id, error = %err, "shuffle abandoned");
            return;
        }
        slot.publish();
    }

    let mut sessions = state.sessions.write().await;
    if let Some(slot) = sessions.get_mut(&actor_id) {
        match slot.session.finish_shuffle(ticket) {
            Ok(()) => {
                slot.publish();
                debug!(actor_id, "shuffle finished");
            }
            Err(err) => debug!(actor_id, error = %err, "shuffle result dropped"),
        }
    }
}

async fn select_target(
    State(state): State<AppState>,
    Path(actor_id): Path<ParticipantId>,
    Json(payload): Json<SelectRequest>,
) -> Result<Json<SessionView>, ApiError> {
    let mut sessions = state.sessions.write().await;
    let slot = sessions
        .get_mut(&actor_id)
        .ok_or(ApiError::NotFound("no active session"))?;
    let selected = slot.session.select(payload.target_id).map(|p| p.id);
    if let Some(target_id) = drive(actor_id, selected)? {
        debug!(actor_id, target_id, "candidate selected");
    }
    Ok(Json(slot.publish()))
}

enum CommitOutcome {
    Committed,
    TargetTaken,
}

struct CommitFailure {
    target_claimed: bool,
    error: StoreError,
}

/// Target first, through the conditional update, then the actor. Both writes are
/// safe to repeat, so each is retried on its own.
async fn commit_draw(
    store: &dyn ParticipantStore,
    policy: &RetryPolicy,
    plan: &CommitPlan,
) -> Result<CommitOutcome, CommitFailure> {
    let mut target_claimed = plan.target_claimed;
    if !target_claimed {
        let outcome = retry_with_backoff(
            policy,
            move || store.mark_picked(plan.target_id),
            StoreError::is_transient,
        )
        .await
        .map_err(|error| CommitFailure {
            target_claimed: false,
            error,
        })?;
        if outcome == MarkOutcome::AlreadyPicked {
            return Ok(CommitOutcome::TargetTaken);
        }
        target_claimed = true;
    }

    retry_with_backoff(
        policy,
        move || store.update_fields(plan.actor_id, ParticipantPatch::drawn(plan.target_name.clone())),
        StoreError::is_transient,
    )
    .await
    .map_err(|error| CommitFailure {
        target_claimed,
        error,
    })?;
    Ok(CommitOutcome::Committed)
}

async fn confirm_draw(
    State(state): State<AppState>,
    Path(actor_id): Path<ParticipantId>,
) -> Result<Json<SessionView>, ApiError> {
    let _gate = state.roster_gate.read().await;
    let plan = {
        let mut sessions = state.sessions.write().await;
        let slot = sessions
            .get_mut(&actor_id)
            .ok_or(ApiError::NotFound("no active session"))?;
        match drive(actor_id, slot.session.begin_commit())? {
            Some(plan) => plan,
            None => return Ok(Json(slot.view())),
        }
    };

    let outcome = commit_draw(state.store.as_ref(), &state.config.commit_retry, &plan).await;

    let mut sessions = state.sessions.write().await;
    let Some(slot) = sessions.get_mut(&actor_id) else {
        warn!(actor_id, "session discarded while committing");
        return Err(ApiError::NotFound("session ended"));
    };
    match outcome {
        Ok(CommitOutcome::Committed) => {
            let target = slot.session.complete_commit()?.clone();
            let drawer = slot
                .session
                .actor()
                .map(|a| a.name.clone())
                .unwrap_or_default();
            slot.ticket = Some(Ticket::issue(drawer, target.name.clone()));
            info!(actor_id, target_id = target.id, "draw committed");
            Ok(Json(slot.publish()))
        }
        Ok(CommitOutcome::TargetTaken) => {
            let next = slot.session.target_taken()?;
            warn!(actor_id, target_id = plan.target_id, state = ?next, "target taken by another session");
            slot.publish();
            Err(ApiError::Conflict("target was drawn by someone else"))
        }
        Err(failure) => {
            if failure.target_claimed {
                slot.session.record_target_claimed()?;
            }
            slot.session.abort_commit()?;
            slot.publish();
            Err(failure.error.into())
        }
    }
}

async fn cancel_session(
    State(state): State<AppState>,
    Path(actor_id): Path<ParticipantId>,
) -> Result<Json<SessionView>, ApiError> {
    let mut sessions = state.sessions.write().await;
    let slot = sessions
        .get_mut(&actor_id)
        .ok_or(ApiError::NotFound("no active session"))?;
    if let Some(next) = drive(actor_id, slot.session.cancel())? {
        debug!(actor_id, state = ?next, "session cancelled");
    }
    Ok(Json(slot.publish()))
}

async fn exit_session(
    State(state): State<AppState>,
    Path(actor_id): Path<ParticipantId>,
) -> Result<Json<SessionView>, ApiError> {
    let mut sessions = state.sessions.write().await;
    let slot = sessions
        .get_mut(&actor_id)
        .ok_or(ApiError::NotFound("no active session"))?;
    if drive(actor_id, slot.session.exit())?.is_some() {
        slot.ticket = None;
        debug!(actor_id, "session exited");
    }
    Ok(Json(slot.publish()))
}

async fn ticket_for(state: &AppState, actor_id: ParticipantId) -> Result<Ticket, ApiError> {
    let sessions = state.sessions.read().await;
    sessions
        .get(&actor_id)
        .filter(|slot| slot.session.state() == SessionState::Committed)
        .and_then(|slot| slot.ticket.clone())
        .ok_or(ApiError::NotFound("no ticket"))
}

async fn get_ticket(
    State(state): State<AppState>,
    Path(actor_id): Path<ParticipantId>,
) -> Result<Json<Ticket>, ApiError> {
    Ok(Json(ticket_for(&state, actor_id).await?))
}

async fn get_ticket_svg(
    State(state): State<AppState>,
    Path(actor_id): Path<ParticipantId>,
) -> Result<impl IntoResponse, ApiError> {
    let ticket = ticket_for(&state, actor_id).await?;
    Ok(([(header::CONTENT_TYPE, "image/svg+xml")], ticket.to_svg()))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(actor_id): Path<ParticipantId>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, actor_id))
}

async fn send_view(
    sender: &mut SplitSink<WebSocket, Message>,
    view: &SessionView,
) -> Result<(), axum::Error> {
    match serde_json::to_string(view) {
        Ok(text) => sender.send(Message::Text(text)).await,
        Err(err) => {
            warn!(error = %err, "could not encode session view");
            Ok(())
        }
    }
}

async fn handle_socket(stream: WebSocket, state: AppState, actor_id: ParticipantId) {
    let (mut sender, mut receiver) = stream.split();

    let subscription = {
        let sessions = state.sessions.read().await;
        sessions
            .get(&actor_id)
            .map(|slot| (slot.view(), slot.channel.subscribe()))
    };
    let Some((snapshot, mut rx)) = subscription else {
        let _ = sender.send(Message::Text("unknown session".into())).await;
        return;
    };
    if send_view(&mut sender, &snapshot).await.is_err() {
        return;
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(view) => {
                    if send_view(&mut sender, &view).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(actor_id, skipped, "session subscriber lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    debug!(actor_id, "session socket closed");
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let provided = headers
        .get("x-admin-password")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided != state.config.admin_password {
        warn!("admin password rejected");
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

async fn admin_login(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    require_admin(&state, &headers)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_participant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AddRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let name = validate_name(&payload.name)?;
    let participant = state.store.insert(name.to_string()).await?;
    info!(id = participant.id, name = %participant.name, "participant added");
    Ok((StatusCode::CREATED, Json(participant)))
}

async fn reset_draws(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Participant>>, ApiError> {
    require_admin(&state, &headers)?;
    let _gate = state.roster_gate.write().await;
    state.store.reset_all().await?;
    state.discard_sessions().await;
    info!("draw state reset");
    Ok(Json(state.store.list().await?))
}

async fn clear_participants(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    require_admin(&state, &headers)?;
    let _gate = state.roster_gate.write().await;
    state.store.delete_all().await?;
    state.discard_sessions().await;
    info!("roster cleared");
    Ok(StatusCode::NO_CONTENT)
}
