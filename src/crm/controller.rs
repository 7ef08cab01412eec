//! Lead pipeline controller.
//!
//! Owns the in-memory lead collection for one account and runs every
//! mutation against the store. Stage changes are optimistic: the new stage
//! is visible on the board immediately, and undone if the store does not
//! confirm it. At most one stage change per lead is in flight at a time;
//! further requests for that lead are rejected until it settles.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::board;
use super::events::{PipelineEvent, broadcast_event};
use super::models::*;
use super::store::LeadStore;
use super::validation::{
    CurrencyFormat, normalize_field_value, validate_field_name, validate_fields, validate_new_lead,
};
use crate::errors::{PipelineError, StoreError};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tunables for a controller, usually taken from `[pipeline]` and `[currency]`.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Upper bound on a single store round trip. Elapsing counts as a failure.
    pub request_timeout: Duration,
    /// Re-read the whole collection after a confirmed stage change.
    pub reload_after_transition: bool,
    pub currency: CurrencyFormat,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            reload_after_transition: false,
            currency: CurrencyFormat::default(),
        }
    }
}

/// What a stage change request ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The store confirmed the move.
    Moved { from: Stage, to: Stage },
    /// The persisted stage already matched; nothing was written.
    Unchanged { stage: Stage },
}

struct TrackedLead {
    lead: Lead,
    /// Last stage the store confirmed. Differs from `lead.stage` only while
    /// a change is in flight.
    persisted_stage: Stage,
}

impl TrackedLead {
    fn confirmed(lead: Lead) -> Self {
        Self {
            persisted_stage: lead.stage,
            lead,
        }
    }
}

#[derive(Default)]
struct BoardState {
    leads: Vec<TrackedLead>,
    custom_fields: HashMap<LeadId, Vec<CustomField>>,
    in_flight: HashSet<LeadId>,
    load_error: Option<String>,
}

impl BoardState {
    fn find(&self, id: &LeadId) -> Option<&TrackedLead> {
        self.leads.iter().find(|t| &t.lead.id == id)
    }

    fn find_mut(&mut self, id: &LeadId) -> Option<&mut TrackedLead> {
        self.leads.iter_mut().find(|t| &t.lead.id == id)
    }

    fn find_field_mut(&mut self, id: &CustomFieldId) -> Option<&mut CustomField> {
        self.custom_fields
            .values_mut()
            .flat_map(|fields| fields.iter_mut())
            .find(|f| &f.id == id)
    }
}

pub struct PipelineController {
    account: Account,
    store: Arc<dyn LeadStore>,
    settings: PipelineSettings,
    state: Mutex<BoardState>,
    events: broadcast::Sender<String>,
}

impl PipelineController {
    pub fn new(account: Account, store: Arc<dyn LeadStore>, settings: PipelineSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            account,
            store,
            settings,
            state: Mutex::new(BoardState::default()),
            events,
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    /// Receive serialized `PipelineEvent`s for this board.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.events.subscribe()
    }

    // ── Views ─────────────────────────────────────────────────────────

    /// The stage-partitioned board, derived from the current collection.
    pub fn board(&self) -> BoardView {
        let state = self.lock();
        let leads: Vec<Lead> = state.leads.iter().map(|t| t.lead.clone()).collect();
        let mut pending: Vec<LeadId> = state.in_flight.iter().cloned().collect();
        pending.sort();
        board::partition(self.account.id.clone(), &leads, pending, state.load_error.clone())
    }

    pub fn leads(&self) -> Vec<Lead> {
        self.lock().leads.iter().map(|t| t.lead.clone()).collect()
    }

    pub fn lead(&self, id: &LeadId) -> Option<Lead> {
        self.lock().find(id).map(|t| t.lead.clone())
    }

    pub fn is_pending(&self, id: &LeadId) -> bool {
        self.lock().in_flight.contains(id)
    }

    /// No event subscribers and no stage change in flight.
    pub fn is_idle(&self) -> bool {
        self.events.receiver_count() == 0 && self.lock().in_flight.is_empty()
    }

    // ── Load ──────────────────────────────────────────────────────────

    /// Replace the collection with the store's leads for this account.
    ///
    /// Leads with a stage change in flight keep their optimistic stage. On
    /// failure the board is emptied rather than left showing stale data.
    pub async fn load(&self) -> Result<usize, PipelineError> {
        match self.round_trip(self.store.list_leads(&self.account.id)).await {
            Ok(leads) => {
                let count = self.replace_collection(leads);
                info!(account = %self.account.id, count, "Loaded leads");
                self.emit(PipelineEvent::BoardLoaded { count });
                Ok(count)
            }
            Err(e) => {
                {
                    let mut state = self.lock();
                    state.leads.clear();
                    state.custom_fields.clear();
                    state.load_error = Some(e.to_string());
                }
                Err(self.fail(PipelineError::LoadFailed(e), None))
            }
        }
    }

    /// Re-read the collection after a confirmed stage change. The move
    /// already stands, so a failed read keeps the current board.
    async fn refresh_after_transition(&self) {
        match self.round_trip(self.store.list_leads(&self.account.id)).await {
            Ok(leads) => {
                let count = self.replace_collection(leads);
                debug!(account = %self.account.id, count, "Refreshed leads after stage change");
                self.emit(PipelineEvent::BoardLoaded { count });
            }
            Err(e) => {
                warn!(account = %self.account.id, error = %e, "Refresh after stage change failed");
                self.emit(PipelineEvent::error(
                    format!("Board could not be refreshed: {}", e),
                    None,
                ));
            }
        }
    }

    /// Swap in freshly read leads. In-flight leads keep their optimistic stage.
    fn replace_collection(&self, leads: Vec<Lead>) -> usize {
        let count = leads.len();
        let mut state = self.lock();
        let optimistic: HashMap<LeadId, Stage> = state
            .leads
            .iter()
            .filter(|t| state.in_flight.contains(&t.lead.id))
            .map(|t| (t.lead.id.clone(), t.lead.stage))
            .collect();
        state.leads = leads
            .into_iter()
            .map(|lead| {
                let mut tracked = TrackedLead::confirmed(lead);
                if let Some(stage) = optimistic.get(&tracked.lead.id) {
                    tracked.lead.stage = *stage;
                }
                tracked
            })
            .collect();
        let present: HashSet<LeadId> = state.leads.iter().map(|t| t.lead.id.clone()).collect();
        state.custom_fields.retain(|id, _| present.contains(id));
        state.load_error = None;
        count
    }

    // ── Stage transitions ─────────────────────────────────────────────

    /// Move a lead to `target`, optimistically.
    ///
    /// The board shows `target` as soon as this is called. If the store
    /// rejects the write, reports no affected row, times out, or this future
    /// is dropped before it answers, the lead goes back to its prior stage.
    pub async fn request_stage_transition(
        &self,
        lead_id: &LeadId,
        target: Stage,
    ) -> Result<TransitionOutcome, PipelineError> {
        let started = {
            let mut state = self.lock();
            if state.in_flight.contains(lead_id) {
                Err(PipelineError::TransitionInFlight { id: lead_id.clone() })
            } else if let Some(tracked) = state.find_mut(lead_id) {
                let prior = tracked.lead.stage;
                let persisted = tracked.persisted_stage;
                let name = tracked.lead.name.clone();
                tracked.lead.stage = target;
                if persisted != target {
                    state.in_flight.insert(lead_id.clone());
                }
                Ok((prior, persisted, name))
            } else {
                Err(PipelineError::LeadNotFound { id: lead_id.clone() })
            }
        };
        let (prior, persisted, name) = started.map_err(|e| self.fail(e, Some(lead_id)))?;

        if persisted == target {
            debug!(lead = %lead_id, stage = %target, "Stage already persisted, skipping write");
            return Ok(TransitionOutcome::Unchanged { stage: target });
        }

        info!(lead = %lead_id, from = %prior, to = %target, "Moving lead");
        self.emit(PipelineEvent::LeadMoved {
            lead_id: lead_id.clone(),
            from: prior,
            to: target,
        });

        let pending = PendingTransition {
            controller: self,
            lead_id: lead_id.clone(),
            prior,
            target,
            settled: false,
        };
        let at = Utc::now();
        let result = self
            .round_trip(self.store.update_stage(lead_id, &self.account.id, target, at))
            .await;

        match result {
            Ok(outcome) if !outcome.is_noop() => {
                pending.commit(at);
                info!(lead = %lead_id, stage = %target, "Stage change confirmed");
                self.emit(PipelineEvent::success(
                    format!("Lead \"{}\" moved to \"{}\"", name, target),
                    Some(lead_id.clone()),
                ));
                if self.settings.reload_after_transition {
                    self.refresh_after_transition().await;
                }
                Ok(TransitionOutcome::Moved {
                    from: prior,
                    to: target,
                })
            }
            Ok(_) => {
                pending.restore("no matching lead was updated");
                Err(self.fail(
                    PipelineError::ZeroRowsAffected {
                        id: lead_id.clone(),
                        operation: "stage update",
                    },
                    Some(lead_id),
                ))
            }
            Err(source) => {
                pending.restore(&source.to_string());
                Err(self.fail(
                    PipelineError::TransitionFailed {
                        id: lead_id.clone(),
                        name,
                        target,
                        source,
                    },
                    Some(lead_id),
                ))
            }
        }
    }

    // ── Create / update / delete ──────────────────────────────────────

    /// Insert a lead for this account. It lands in the stage the draft
    /// names, `New` by default.
    pub async fn create_lead(&self, draft: LeadDraft) -> Result<Lead, PipelineError> {
        let new_lead =
            validate_new_lead(&draft, &self.settings.currency).map_err(|e| self.fail(e, None))?;

        let lead = self
            .round_trip(self.store.insert_lead(&self.account.id, &new_lead))
            .await
            .map_err(|e| self.fail(e.into(), None))?;

        {
            let mut state = self.lock();
            state.leads.retain(|t| t.lead.id != lead.id);
            state.leads.insert(0, TrackedLead::confirmed(lead.clone()));
        }
        info!(lead = %lead.id, stage = %lead.stage, "Created lead");
        self.emit(PipelineEvent::LeadCreated { lead: lead.clone() });
        self.emit(PipelineEvent::success(
            format!("Lead \"{}\" created", lead.name),
            Some(lead.id.clone()),
        ));
        Ok(lead)
    }

    /// Save every editable field from a full-record draft.
    ///
    /// Fields are applied locally only after the store confirms. A draft
    /// whose stage differs from the lead's current stage then goes through
    /// `request_stage_transition`.
    pub async fn update_lead_details(
        &self,
        lead_id: &LeadId,
        draft: LeadDraft,
    ) -> Result<Lead, PipelineError> {
        let fields = validate_fields(&draft, &self.settings.currency)
            .map_err(|e| self.fail(e, Some(lead_id)))?;
        self.require_lead(lead_id)?;

        let at = Utc::now();
        let outcome = self
            .round_trip(self.store.update_fields(lead_id, &self.account.id, &fields, at))
            .await
            .map_err(|e| self.fail(e.into(), Some(lead_id)))?;
        if outcome.is_noop() {
            return Err(self.fail(
                PipelineError::ZeroRowsAffected {
                    id: lead_id.clone(),
                    operation: "update",
                },
                Some(lead_id),
            ));
        }

        let updated = {
            let mut state = self.lock();
            state.find_mut(lead_id).map(|tracked| {
                tracked.lead.apply_fields(&fields, at);
                tracked.lead.clone()
            })
        };
        let updated = updated.ok_or_else(|| {
            self.fail(PipelineError::LeadNotFound { id: lead_id.clone() }, Some(lead_id))
        })?;
        info!(lead = %lead_id, "Updated lead details");
        self.emit(PipelineEvent::LeadUpdated {
            lead: updated.clone(),
        });
        self.emit(PipelineEvent::success(
            format!("Lead \"{}\" updated", updated.name),
            Some(lead_id.clone()),
        ));

        match draft.stage {
            Some(stage) if stage != updated.stage => {
                self.request_stage_transition(lead_id, stage).await?;
                self.lead(lead_id)
                    .ok_or_else(|| PipelineError::LeadNotFound { id: lead_id.clone() })
            }
            _ => Ok(updated),
        }
    }

    /// Permanently delete a lead. Nothing happens without `confirmed`.
    pub async fn delete_lead(&self, lead_id: &LeadId, confirmed: bool) -> Result<(), PipelineError> {
        self.delete_lead_as(self.account.role, lead_id, confirmed).await
    }

    /// `delete_lead` with the role of the session asking for it, which the
    /// store uses to decide whose leads may be removed.
    pub async fn delete_lead_as(
        &self,
        role: Role,
        lead_id: &LeadId,
        confirmed: bool,
    ) -> Result<(), PipelineError> {
        if !confirmed {
            return Err(self.fail(
                PipelineError::ConfirmationRequired { id: lead_id.clone() },
                Some(lead_id),
            ));
        }
        let name = self.require_lead(lead_id)?;
        if self.is_pending(lead_id) {
            return Err(self.fail(
                PipelineError::TransitionInFlight { id: lead_id.clone() },
                Some(lead_id),
            ));
        }

        let outcome = self
            .round_trip(
                self.store
                    .delete_lead(lead_id, &Account::new(self.account.id.clone(), role)),
            )
            .await
            .map_err(|e| self.fail(e.into(), Some(lead_id)))?;
        if outcome.is_noop() {
            return Err(self.fail(
                PipelineError::ZeroRowsAffected {
                    id: lead_id.clone(),
                    operation: "delete",
                },
                Some(lead_id),
            ));
        }

        {
            let mut state = self.lock();
            state.leads.retain(|t| &t.lead.id != lead_id);
            state.custom_fields.remove(lead_id);
        }
        info!(lead = %lead_id, "Deleted lead");
        self.emit(PipelineEvent::LeadDeleted {
            lead_id: lead_id.clone(),
        });
        self.emit(PipelineEvent::success(
            format!("Lead \"{}\" deleted", name),
            Some(lead_id.clone()),
        ));
        Ok(())
    }

    // ── Custom fields ─────────────────────────────────────────────────

    /// Fetch a lead's custom fields, oldest first, and cache them.
    pub async fn custom_fields(&self, lead_id: &LeadId) -> Result<Vec<CustomField>, PipelineError> {
        self.require_lead(lead_id)?;
        let fields = self
            .round_trip(self.store.list_custom_fields(lead_id, &self.account.id))
            .await
            .map_err(|e| self.fail(e.into(), Some(lead_id)))?;
        self.lock()
            .custom_fields
            .insert(lead_id.clone(), fields.clone());
        Ok(fields)
    }

    pub async fn add_custom_field(
        &self,
        lead_id: &LeadId,
        name: &str,
        value: Option<&str>,
    ) -> Result<CustomField, PipelineError> {
        let name = validate_field_name(name).map_err(|e| self.fail(e, Some(lead_id)))?;
        let value = normalize_field_value(value);
        self.require_lead(lead_id)?;

        let field = self
            .round_trip(self.store.insert_custom_field(
                lead_id,
                &self.account.id,
                &name,
                value.as_deref(),
            ))
            .await
            .map_err(|e| self.fail(e.into(), Some(lead_id)))?;

        self.lock()
            .custom_fields
            .entry(lead_id.clone())
            .or_default()
            .push(field.clone());
        debug!(lead = %lead_id, field = %field.name, "Added custom field");
        Ok(field)
    }

    /// Change a cached custom field's value. Blank values are stored as none.
    pub async fn set_custom_field(
        &self,
        field_id: &CustomFieldId,
        value: Option<&str>,
    ) -> Result<CustomField, PipelineError> {
        let value = normalize_field_value(value);
        let lead_id = self.field_owner(field_id)?;

        let outcome = self
            .round_trip(self.store.update_custom_field(
                field_id,
                &self.account.id,
                value.as_deref(),
            ))
            .await
            .map_err(|e| self.fail(e.into(), Some(&lead_id)))?;
        if outcome.is_noop() {
            return Err(self.fail(
                PipelineError::ZeroRowsAffected {
                    id: lead_id.clone(),
                    operation: "custom field update",
                },
                Some(&lead_id),
            ));
        }

        let updated = {
            let mut state = self.lock();
            state.find_field_mut(field_id).map(|field| {
                field.value = value;
                field.clone()
            })
        };
        updated.ok_or_else(|| {
            self.fail(
                PipelineError::CustomFieldNotFound {
                    id: field_id.clone(),
                },
                Some(&lead_id),
            )
        })
    }

    pub async fn remove_custom_field(&self, field_id: &CustomFieldId) -> Result<(), PipelineError> {
        let lead_id = self.field_owner(field_id)?;
        let outcome = self
            .round_trip(self.store.delete_custom_field(field_id, &self.account.id))
            .await
            .map_err(|e| self.fail(e.into(), Some(&lead_id)))?;
        if outcome.is_noop() {
            return Err(self.fail(
                PipelineError::ZeroRowsAffected {
                    id: lead_id.clone(),
                    operation: "custom field delete",
                },
                Some(&lead_id),
            ));
        }

        if let Some(fields) = self.lock().custom_fields.get_mut(&lead_id) {
            fields.retain(|f| &f.id != field_id);
        }
        debug!(lead = %lead_id, field = %field_id, "Removed custom field");
        Ok(())
    }

    // ── Internals ─────────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PipelineEvent) {
        broadcast_event(&self.events, &event);
    }

    /// Report a failure to subscribers and hand it back to the caller.
    fn fail(&self, err: PipelineError, lead_id: Option<&LeadId>) -> PipelineError {
        warn!(account = %self.account.id, error = %err, "Pipeline operation failed");
        self.emit(PipelineEvent::error(err.to_string(), lead_id.cloned()));
        err
    }

    /// Name of a lead present in the collection.
    fn require_lead(&self, lead_id: &LeadId) -> Result<String, PipelineError> {
        let name = self.lock().find(lead_id).map(|t| t.lead.name.clone());
        name.ok_or_else(|| {
            self.fail(PipelineError::LeadNotFound { id: lead_id.clone() }, Some(lead_id))
        })
    }

    /// Lead a cached custom field belongs to.
    fn field_owner(&self, field_id: &CustomFieldId) -> Result<LeadId, PipelineError> {
        let owner = self.lock().find_field_mut(field_id).map(|f| f.lead_id.clone());
        owner.ok_or_else(|| {
            self.fail(
                PipelineError::CustomFieldNotFound {
                    id: field_id.clone(),
                },
                None,
            )
        })
    }

    async fn round_trip<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let limit = self.settings.request_timeout;
        tokio::time::timeout(limit, call)
            .await
            .unwrap_or(Err(StoreError::Timeout(limit)))
    }
}

/// An optimistic stage change awaiting the store.
///
/// Settles exactly once: `commit` records the new persisted stage,
/// `restore` puts the prior stage back. Dropping it unsettled restores.
/// The in-flight mark is cleared either way.
struct PendingTransition<'a> {
    controller: &'a PipelineController,
    lead_id: LeadId,
    prior: Stage,
    target: Stage,
    settled: bool,
}

impl PendingTransition<'_> {
    fn commit(mut self, at: DateTime<Utc>) {
        self.settled = true;
        let mut state = self.controller.lock();
        state.in_flight.remove(&self.lead_id);
        if let Some(tracked) = state.find_mut(&self.lead_id) {
            tracked.lead.stage = self.target;
            tracked.lead.updated_at = at;
            tracked.persisted_stage = self.target;
        }
    }

    fn restore(mut self, reason: &str) {
        self.settled = true;
        self.revert(reason);
    }

    fn revert(&self, reason: &str) {
        let reverted = {
            let mut state = self.controller.lock();
            state.in_flight.remove(&self.lead_id);
            match state.find_mut(&self.lead_id) {
                // only undo our own optimistic value
                Some(tracked) if tracked.lead.stage == self.target => {
                    tracked.lead.stage = self.prior;
                    true
                }
                _ => false,
            }
        };
        if reverted {
            warn!(lead = %self.lead_id, to = %self.prior, reason, "Reverted stage change");
            self.controller.emit(PipelineEvent::LeadMoveReverted {
                lead_id: self.lead_id.clone(),
                from: self.target,
                to: self.prior,
                reason: reason.to_string(),
            });
        }
    }
}

impl Drop for PendingTransition<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.revert("stage change was cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::store::WriteOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    // ── Scripted fake store ───────────────────────────────────────────

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum WriteMode {
        Apply,
        Fail,
        ZeroRows,
    }

    /// Holds `update_stage` until the test releases it.
    #[derive(Default)]
    struct Gate {
        entered: Notify,
        release: Notify,
    }

    struct FakeStore {
        leads: std::sync::Mutex<Vec<Lead>>,
        fields: std::sync::Mutex<Vec<CustomField>>,
        mode: std::sync::Mutex<WriteMode>,
        fail_list: AtomicBool,
        gate: Option<Arc<Gate>>,
        stage_calls: AtomicUsize,
        write_calls: AtomicUsize,
        last_owner: std::sync::Mutex<Option<AccountId>>,
    }

    impl FakeStore {
        fn new(leads: Vec<Lead>) -> Self {
            Self {
                leads: std::sync::Mutex::new(leads),
                fields: std::sync::Mutex::new(Vec::new()),
                mode: std::sync::Mutex::new(WriteMode::Apply),
                fail_list: AtomicBool::new(false),
                gate: None,
                stage_calls: AtomicUsize::new(0),
                write_calls: AtomicUsize::new(0),
                last_owner: std::sync::Mutex::new(None),
            }
        }

        fn gated(leads: Vec<Lead>, gate: Arc<Gate>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new(leads)
            }
        }

        fn set_mode(&self, mode: WriteMode) {
            *self.mode.lock().unwrap() = mode;
        }

        fn stored_stage(&self, id: &str) -> Option<Stage> {
            self.leads
                .lock()
                .unwrap()
                .iter()
                .find(|l| l.id.as_str() == id)
                .map(|l| l.stage)
        }

        fn scripted_write(&self, owner: &AccountId) -> Result<WriteMode, StoreError> {
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_owner.lock().unwrap() = Some(owner.clone());
            match *self.mode.lock().unwrap() {
                WriteMode::Fail => Err(StoreError::Unavailable("network error".into())),
                mode => Ok(mode),
            }
        }

        fn apply<F: FnOnce(&mut Lead)>(&self, id: &LeadId, owner: &AccountId, f: F) -> u64 {
            let mut leads = self.leads.lock().unwrap();
            match leads
                .iter_mut()
                .find(|l| &l.id == id && &l.owner_id == owner)
            {
                Some(lead) => {
                    f(lead);
                    1
                }
                None => 0,
            }
        }
    }

    #[async_trait]
    impl LeadStore for FakeStore {
        async fn list_leads(&self, owner: &AccountId) -> Result<Vec<Lead>, StoreError> {
            if self.fail_list.load(Ordering::SeqCst) {
                return Err(StoreError::PermissionDenied("row level security".into()));
            }
            Ok(self
                .leads
                .lock()
                .unwrap()
                .iter()
                .filter(|l| &l.owner_id == owner)
                .cloned()
                .collect())
        }

        async fn insert_lead(&self, owner: &AccountId, new: &NewLead) -> Result<Lead, StoreError> {
            self.scripted_write(owner)?;
            let now = Utc::now();
            let mut lead = lead_in(&LeadId::generate().to_string(), new.stage);
            lead.owner_id = owner.clone();
            lead.apply_fields(&new.fields, now);
            lead.created_at = now;
            self.leads.lock().unwrap().insert(0, lead.clone());
            Ok(lead)
        }

        async fn update_stage(
            &self,
            lead_id: &LeadId,
            owner: &AccountId,
            stage: Stage,
            at: DateTime<Utc>,
        ) -> Result<WriteOutcome, StoreError> {
            self.stage_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
            if self.scripted_write(owner)? == WriteMode::ZeroRows {
                return Ok(WriteOutcome::new(0));
            }
            Ok(WriteOutcome::new(self.apply(lead_id, owner, |l| {
                l.stage = stage;
                l.updated_at = at;
            })))
        }

        async fn update_fields(
            &self,
            lead_id: &LeadId,
            owner: &AccountId,
            fields: &LeadFields,
            at: DateTime<Utc>,
        ) -> Result<WriteOutcome, StoreError> {
            if self.scripted_write(owner)? == WriteMode::ZeroRows {
                return Ok(WriteOutcome::new(0));
            }
            Ok(WriteOutcome::new(
                self.apply(lead_id, owner, |l| l.apply_fields(fields, at)),
            ))
        }

        async fn delete_lead(&self, lead_id: &LeadId, account: &Account) -> Result<WriteOutcome, StoreError> {
            if self.scripted_write(&account.id)? == WriteMode::ZeroRows {
                return Ok(WriteOutcome::new(0));
            }
            let mut leads = self.leads.lock().unwrap();
            let before = leads.len();
            leads.retain(|l| !(&l.id == lead_id && l.owner_id == account.id));
            Ok(WriteOutcome::new((before - leads.len()) as u64))
        }

        async fn list_custom_fields(
            &self,
            lead_id: &LeadId,
            _owner: &AccountId,
        ) -> Result<Vec<CustomField>, StoreError> {
            Ok(self
                .fields
                .lock()
                .unwrap()
                .iter()
                .filter(|f| &f.lead_id == lead_id)
                .cloned()
                .collect())
        }

        async fn insert_custom_field(
            &self,
            lead_id: &LeadId,
            owner: &AccountId,
            name: &str,
            value: Option<&str>,
        ) -> Result<CustomField, StoreError> {
            self.scripted_write(owner)?;
            let mut fields = self.fields.lock().unwrap();
            if fields.iter().any(|f| &f.lead_id == lead_id && f.name == name) {
                return Err(StoreError::Conflict(format!("duplicate field {}", name)));
            }
            let field = CustomField {
                id: CustomFieldId::generate(),
                lead_id: lead_id.clone(),
                name: name.to_string(),
                value: value.map(str::to_string),
                created_at: Utc::now(),
            };
            fields.push(field.clone());
            Ok(field)
        }

        async fn update_custom_field(
            &self,
            field_id: &CustomFieldId,
            owner: &AccountId,
            value: Option<&str>,
        ) -> Result<WriteOutcome, StoreError> {
            self.scripted_write(owner)?;
            let mut fields = self.fields.lock().unwrap();
            match fields.iter_mut().find(|f| &f.id == field_id) {
                Some(f) => {
                    f.value = value.map(str::to_string);
                    Ok(WriteOutcome::new(1))
                }
                None => Ok(WriteOutcome::new(0)),
            }
        }

        async fn delete_custom_field(
            &self,
            field_id: &CustomFieldId,
            owner: &AccountId,
        ) -> Result<WriteOutcome, StoreError> {
            self.scripted_write(owner)?;
            let mut fields = self.fields.lock().unwrap();
            let before = fields.len();
            fields.retain(|f| &f.id != field_id);
            Ok(WriteOutcome::new((before - fields.len()) as u64))
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────

    fn owner() -> Account {
        Account::affiliate("acct-1")
    }

    fn lead_in(id: &str, stage: Stage) -> Lead {
        let now = Utc::now();
        Lead {
            id: LeadId::from(id),
            owner_id: owner().id,
            name: format!("Lead {}", id),
            email: format!("{}@example.com", id),
            phone: None,
            company: None,
            message: None,
            source: None,
            value_cents: None,
            probability: None,
            expected_close_date: None,
            last_contact_at: None,
            next_follow_up_at: None,
            stage,
            created_at: now,
            updated_at: now,
        }
    }

    fn named(id: &str, name: &str, stage: Stage) -> Lead {
        Lead {
            name: name.to_string(),
            ..lead_in(id, stage)
        }
    }

    async fn loaded(store: Arc<FakeStore>) -> PipelineController {
        let ctrl = PipelineController::new(owner(), store, PipelineSettings::default());
        ctrl.load().await.unwrap();
        ctrl
    }

    fn drain(rx: &mut broadcast::Receiver<String>) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            events.push(serde_json::from_str(&msg).unwrap());
        }
        events
    }

    fn notices(events: &[PipelineEvent]) -> Vec<(crate::crm::events::NoticeLevel, String)> {
        events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Notice { level, message, .. } => Some((*level, message.clone())),
                _ => None,
            })
            .collect()
    }

    fn stage_of(ctrl: &PipelineController, id: &str) -> Stage {
        ctrl.lead(&LeadId::from(id)).unwrap().stage
    }

    // ── Load ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_load_replaces_collection_owner_scoped() {
        let mut foreign = lead_in("x", Stage::New);
        foreign.owner_id = AccountId::from("acct-2");
        let store = Arc::new(FakeStore::new(vec![
            lead_in("b", Stage::Won),
            lead_in("a", Stage::New),
            foreign,
        ]));
        let ctrl = loaded(store).await;

        let ids: Vec<String> = ctrl.leads().iter().map(|l| l.id.to_string()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        let board = ctrl.board();
        assert_eq!(board.total_leads(), 2);
        assert_eq!(board.stage_of(&LeadId::from("b")), Some(Stage::Won));
        assert!(board.load_error.is_none());
    }

    #[tokio::test]
    async fn test_load_failure_shows_empty_board_and_error() {
        let store = Arc::new(FakeStore::new(vec![lead_in("a", Stage::New)]));
        let ctrl = loaded(store.clone()).await;
        let mut rx = ctrl.subscribe();

        store.fail_list.store(true, Ordering::SeqCst);
        let err = ctrl.load().await.unwrap_err();
        assert!(matches!(err, PipelineError::LoadFailed(StoreError::PermissionDenied(_))));

        let board = ctrl.board();
        assert_eq!(board.total_leads(), 0);
        assert!(board.load_error.unwrap().contains("row level security"));
        let notes = notices(&drain(&mut rx));
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].0, crate::crm::events::NoticeLevel::Error);
    }

    // ── Transitions ───────────────────────────────────────────────────

    #[tokio::test]
    async fn test_transition_is_optimistic_then_confirmed() {
        let gate = Arc::new(Gate::default());
        let store = Arc::new(FakeStore::gated(
            vec![named("l1", "Ana", Stage::New)],
            gate.clone(),
        ));
        let ctrl = loaded(store.clone()).await;
        let mut rx = ctrl.subscribe();
        let l1 = LeadId::from("l1");

        let (result, _) = tokio::join!(ctrl.request_stage_transition(&l1, Stage::Meeting), async {
            gate.entered.notified().await;
            // store has not answered yet
            assert_eq!(stage_of(&ctrl, "l1"), Stage::Meeting);
            let board = ctrl.board();
            assert_eq!(board.stage_of(&l1), Some(Stage::Meeting));
            assert_eq!(board.pending, vec![l1.clone()]);
            gate.release.notify_one();
        });

        assert_eq!(
            result.unwrap(),
            TransitionOutcome::Moved {
                from: Stage::New,
                to: Stage::Meeting
            }
        );
        assert_eq!(stage_of(&ctrl, "l1"), Stage::Meeting);
        assert_eq!(store.stored_stage("l1"), Some(Stage::Meeting));
        assert!(!ctrl.is_pending(&l1));

        let notes = notices(&drain(&mut rx));
        assert_eq!(notes.len(), 1);
        assert!(notes[0].1.contains("Ana"));
        assert!(notes[0].1.contains("Meeting"));
    }

    #[tokio::test]
    async fn test_transition_failure_reverts_to_prior_stage() {
        let gate = Arc::new(Gate::default());
        let store = Arc::new(FakeStore::gated(
            vec![named("l2", "Bruno", Stage::InProgress)],
            gate.clone(),
        ));
        store.set_mode(WriteMode::Fail);
        let ctrl = loaded(store.clone()).await;
        let mut rx = ctrl.subscribe();
        let l2 = LeadId::from("l2");

        let (result, _) = tokio::join!(ctrl.request_stage_transition(&l2, Stage::Won), async {
            gate.entered.notified().await;
            assert_eq!(stage_of(&ctrl, "l2"), Stage::Won);
            gate.release.notify_one();
        });

        match result {
            Err(PipelineError::TransitionFailed { name, target, .. }) => {
                assert_eq!(name, "Bruno");
                assert_eq!(target, Stage::Won);
            }
            other => panic!("Expected TransitionFailed, got {:?}", other),
        }
        assert_eq!(stage_of(&ctrl, "l2"), Stage::InProgress);
        assert_eq!(store.stored_stage("l2"), Some(Stage::InProgress));

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::LeadMoveReverted { from: Stage::Won, to: Stage::InProgress, .. }
        )));
        let notes = notices(&events);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].0, crate::crm::events::NoticeLevel::Error);
        assert!(notes[0].1.contains("Bruno"));
    }

    #[tokio::test]
    async fn test_zero_rows_affected_reverts() {
        let store = Arc::new(FakeStore::new(vec![lead_in("a", Stage::New)]));
        store.set_mode(WriteMode::ZeroRows);
        let ctrl = loaded(store.clone()).await;

        let err = ctrl
            .request_stage_transition(&LeadId::from("a"), Stage::Won)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ZeroRowsAffected { .. }));
        assert_eq!(stage_of(&ctrl, "a"), Stage::New);
    }

    #[tokio::test]
    async fn test_transition_to_persisted_stage_skips_write() {
        let store = Arc::new(FakeStore::new(vec![lead_in("a", Stage::Meeting)]));
        let ctrl = loaded(store.clone()).await;
        let mut rx = ctrl.subscribe();

        let outcome = ctrl
            .request_stage_transition(&LeadId::from("a"), Stage::Meeting)
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Unchanged { stage: Stage::Meeting });
        assert_eq!(store.stage_calls.load(Ordering::SeqCst), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_second_transition_on_same_lead_is_rejected_while_in_flight() {
        let gate = Arc::new(Gate::default());
        let store = Arc::new(FakeStore::gated(vec![lead_in("l3", Stage::New)], gate.clone()));
        let ctrl = loaded(store.clone()).await;
        let l3 = LeadId::from("l3");

        let (first, _) = tokio::join!(ctrl.request_stage_transition(&l3, Stage::Lost), async {
            gate.entered.notified().await;
            let second = ctrl.request_stage_transition(&l3, Stage::Lost).await;
            assert!(matches!(second, Err(PipelineError::TransitionInFlight { .. })));
            let other = ctrl.request_stage_transition(&l3, Stage::Won).await;
            assert!(matches!(other, Err(PipelineError::TransitionInFlight { .. })));
            assert_eq!(store.stage_calls.load(Ordering::SeqCst), 1);
            // the rejected request did not touch the optimistic stage
            assert_eq!(stage_of(&ctrl, "l3"), Stage::Lost);
            gate.release.notify_one();
        });

        assert!(first.is_ok());
        assert_eq!(store.stage_calls.load(Ordering::SeqCst), 1);
        assert_eq!(stage_of(&ctrl, "l3"), Stage::Lost);
    }

    #[tokio::test]
    async fn test_transitions_on_different_leads_run_concurrently() {
        let gate = Arc::new(Gate::default());
        let store = Arc::new(FakeStore::gated(
            vec![lead_in("a", Stage::New), lead_in("b", Stage::New)],
            gate.clone(),
        ));
        let ctrl = loaded(store.clone()).await;

        let lead_a = LeadId::from("a");
        let (a, _) = tokio::join!(
            ctrl.request_stage_transition(&lead_a, Stage::Won),
            async {
                gate.entered.notified().await;
                // b is not blocked by a's in-flight change; both wait on the store
                let lead_b = LeadId::from("b");
                let (b, _) = tokio::join!(
                    ctrl.request_stage_transition(&lead_b, Stage::Lost),
                    async {
                        gate.entered.notified().await;
                        assert_eq!(store.stage_calls.load(Ordering::SeqCst), 2);
                        gate.release.notify_waiters();
                    }
                );
                assert!(b.is_ok());
            }
        );
        assert!(a.is_ok());
        assert_eq!(stage_of(&ctrl, "a"), Stage::Won);
        assert_eq!(stage_of(&ctrl, "b"), Stage::Lost);
    }

    #[tokio::test]
    async fn test_transition_is_scoped_by_owner() {
        let store = Arc::new(FakeStore::new(vec![lead_in("a", Stage::New)]));
        let ctrl = loaded(store.clone()).await;
        // the row now belongs to someone else
        store.leads.lock().unwrap()[0].owner_id = AccountId::from("acct-2");

        let err = ctrl
            .request_stage_transition(&LeadId::from("a"), Stage::Won)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ZeroRowsAffected { .. }));
        assert_eq!(store.stored_stage("a"), Some(Stage::New));
        assert_eq!(*store.last_owner.lock().unwrap(), Some(owner().id));
        assert_eq!(stage_of(&ctrl, "a"), Stage::New);
    }

    #[tokio::test]
    async fn test_dropped_transition_restores_prior_stage() {
        let gate = Arc::new(Gate::default());
        let store = Arc::new(FakeStore::gated(vec![lead_in("a", Stage::Meeting)], gate.clone()));
        let ctrl = loaded(store.clone()).await;
        let id = LeadId::from("a");

        tokio::select! {
            _ = ctrl.request_stage_transition(&id, Stage::Won) => panic!("store should still be blocked"),
            _ = gate.entered.notified() => {}
        }

        assert_eq!(stage_of(&ctrl, "a"), Stage::Meeting);
        assert!(!ctrl.is_pending(&id));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let gate = Arc::new(Gate::default());
        let store = Arc::new(FakeStore::gated(vec![lead_in("a", Stage::New)], gate));
        let settings = PipelineSettings {
            request_timeout: Duration::from_millis(50),
            ..PipelineSettings::default()
        };
        let ctrl = PipelineController::new(owner(), store, settings);
        ctrl.load().await.unwrap();

        let err = ctrl
            .request_stage_transition(&LeadId::from("a"), Stage::Won)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::TransitionFailed {
                source: StoreError::Timeout(_),
                ..
            }
        ));
        assert_eq!(stage_of(&ctrl, "a"), Stage::New);
    }

    #[tokio::test]
    async fn test_reload_keeps_optimistic_stage_of_in_flight_lead() {
        let gate = Arc::new(Gate::default());
        let store = Arc::new(FakeStore::gated(
            vec![lead_in("a", Stage::New), lead_in("b", Stage::New)],
            gate.clone(),
        ));
        let ctrl = loaded(store.clone()).await;

        let lead_a = LeadId::from("a");
        let (result, _) = tokio::join!(
            ctrl.request_stage_transition(&lead_a, Stage::Won),
            async {
                gate.entered.notified().await;
                ctrl.load().await.unwrap();
                assert_eq!(stage_of(&ctrl, "a"), Stage::Won);
                assert_eq!(stage_of(&ctrl, "b"), Stage::New);
                gate.release.notify_one();
            }
        );
        assert!(result.is_ok());
        assert_eq!(stage_of(&ctrl, "a"), Stage::Won);
    }

    #[tokio::test]
    async fn test_unknown_lead_is_rejected() {
        let ctrl = loaded(Arc::new(FakeStore::new(vec![]))).await;
        let err = ctrl
            .request_stage_transition(&LeadId::from("ghost"), Stage::Won)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::LeadNotFound { .. }));
    }

    // ── Create / update / delete ──────────────────────────────────────

    #[tokio::test]
    async fn test_create_lead_lands_in_new_bucket() {
        let store = Arc::new(FakeStore::new(vec![lead_in("old", Stage::Won)]));
        let ctrl = loaded(store).await;

        let lead = ctrl
            .create_lead(LeadDraft::new("Ana", "ana@x.com"))
            .await
            .unwrap();
        assert!(!lead.id.as_str().is_empty());
        assert_eq!(lead.name, "Ana");
        assert_eq!(lead.email, "ana@x.com");
        assert_eq!(lead.stage, Stage::New);
        assert_eq!(lead.owner_id, owner().id);

        let board = ctrl.board();
        assert_eq!(board.column(Stage::New).unwrap().leads, vec![lead.clone()]);
        assert_eq!(ctrl.leads()[0].id, lead.id);
    }

    #[tokio::test]
    async fn test_create_lead_with_stage_and_currency_text() {
        let ctrl = loaded(Arc::new(FakeStore::new(vec![]))).await;
        let draft = LeadDraft::new("Bo", "bo@x.com")
            .with_stage(Stage::Meeting)
            .with_value(MoneyInput::Text("R$ 2.500,00".into()));
        let lead = ctrl.create_lead(draft).await.unwrap();
        assert_eq!(lead.stage, Stage::Meeting);
        assert_eq!(lead.value_cents, Some(250_000));
        assert_eq!(ctrl.board().column(Stage::Meeting).unwrap().summary.total_value_cents, 250_000);
    }

    #[tokio::test]
    async fn test_create_lead_validation_failure_skips_store() {
        let store = Arc::new(FakeStore::new(vec![]));
        let ctrl = loaded(store.clone()).await;
        let err = ctrl
            .create_lead(LeadDraft::new("", "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(ref v) if v.len() == 2));
        assert_eq!(store.write_calls.load(Ordering::SeqCst), 0);
        assert!(ctrl.leads().is_empty());
    }

    #[tokio::test]
    async fn test_create_lead_failure_leaves_collection_unchanged() {
        let store = Arc::new(FakeStore::new(vec![]));
        let ctrl = loaded(store.clone()).await;
        store.set_mode(WriteMode::Fail);
        let err = ctrl
            .create_lead(LeadDraft::new("Ana", "ana@x.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Store(StoreError::Unavailable(_))));
        assert!(ctrl.leads().is_empty());
    }

    #[tokio::test]
    async fn test_update_lead_details_keeps_stage_unless_asked() {
        let store = Arc::new(FakeStore::new(vec![named("a", "Ana", Stage::InProgress)]));
        let ctrl = loaded(store.clone()).await;
        let id = LeadId::from("a");

        let draft = LeadDraft {
            probability: Some(70),
            ..LeadDraft::new("Ana Maria", "ana@x.com").with_company("Acme")
        };
        let lead = ctrl.update_lead_details(&id, draft).await.unwrap();
        assert_eq!(lead.name, "Ana Maria");
        assert_eq!(lead.company.as_deref(), Some("Acme"));
        assert_eq!(lead.probability, Some(70));
        assert_eq!(lead.stage, Stage::InProgress);
        assert_eq!(store.stage_calls.load(Ordering::SeqCst), 0);

        let moved = ctrl
            .update_lead_details(&id, LeadDraft::new("Ana Maria", "ana@x.com").with_stage(Stage::Won))
            .await
            .unwrap();
        assert_eq!(moved.stage, Stage::Won);
        assert_eq!(store.stored_stage("a"), Some(Stage::Won));
    }

    #[tokio::test]
    async fn test_update_lead_details_zero_rows_is_failure() {
        let store = Arc::new(FakeStore::new(vec![named("a", "Ana", Stage::New)]));
        let ctrl = loaded(store.clone()).await;
        store.set_mode(WriteMode::ZeroRows);

        let err = ctrl
            .update_lead_details(&LeadId::from("a"), LeadDraft::new("Other", "o@x.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ZeroRowsAffected { .. }));
        assert_eq!(ctrl.lead(&LeadId::from("a")).unwrap().name, "Ana");
    }

    #[tokio::test]
    async fn test_delete_requires_confirmation() {
        let store = Arc::new(FakeStore::new(vec![lead_in("a", Stage::New)]));
        let ctrl = loaded(store.clone()).await;

        let err = ctrl.delete_lead(&LeadId::from("a"), false).await.unwrap_err();
        assert!(matches!(err, PipelineError::ConfirmationRequired { .. }));
        assert_eq!(store.write_calls.load(Ordering::SeqCst), 0);
        assert_eq!(ctrl.leads().len(), 1);

        ctrl.delete_lead(&LeadId::from("a"), true).await.unwrap();
        assert!(ctrl.leads().is_empty());
        assert!(store.stored_stage("a").is_none());
    }

    #[tokio::test]
    async fn test_delete_failure_leaves_collection_unchanged() {
        let store = Arc::new(FakeStore::new(vec![lead_in("a", Stage::New)]));
        let ctrl = loaded(store.clone()).await;
        store.set_mode(WriteMode::ZeroRows);

        let err = ctrl.delete_lead(&LeadId::from("a"), true).await.unwrap_err();
        assert!(matches!(err, PipelineError::ZeroRowsAffected { .. }));
        assert_eq!(ctrl.leads().len(), 1);

        store.set_mode(WriteMode::Fail);
        assert!(ctrl.delete_lead(&LeadId::from("a"), true).await.is_err());
        assert_eq!(ctrl.leads().len(), 1);
    }

    // ── Custom fields ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_custom_field_lifecycle() {
        let store = Arc::new(FakeStore::new(vec![lead_in("a", Stage::New)]));
        let ctrl = loaded(store.clone()).await;
        let id = LeadId::from("a");

        let budget = ctrl
            .add_custom_field(&id, " Budget ", Some("10k"))
            .await
            .unwrap();
        assert_eq!(budget.name, "Budget");

        let dup = ctrl.add_custom_field(&id, "Budget", None).await.unwrap_err();
        assert!(matches!(dup, PipelineError::Store(StoreError::Conflict(_))));

        let blank = ctrl.set_custom_field(&budget.id, Some("   ")).await.unwrap();
        assert_eq!(blank.value, None);

        assert_eq!(ctrl.custom_fields(&id).await.unwrap().len(), 1);
        ctrl.remove_custom_field(&budget.id).await.unwrap();
        assert!(ctrl.custom_fields(&id).await.unwrap().is_empty());

        let missing = ctrl.set_custom_field(&budget.id, Some("x")).await.unwrap_err();
        assert!(matches!(missing, PipelineError::CustomFieldNotFound { .. }));
    }

    #[tokio::test]
    async fn test_custom_field_requires_known_lead_and_name() {
        let ctrl = loaded(Arc::new(FakeStore::new(vec![lead_in("a", Stage::New)]))).await;
        let err = ctrl
            .add_custom_field(&LeadId::from("ghost"), "Budget", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::LeadNotFound { .. }));
        let err = ctrl
            .add_custom_field(&LeadId::from("a"), "  ", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    // ── Reload after transition ───────────────────────────────────────

    fn reloading() -> PipelineSettings {
        PipelineSettings {
            reload_after_transition: true,
            ..PipelineSettings::default()
        }
    }

    #[tokio::test]
    async fn test_reload_after_transition_picks_up_store_changes() {
        let store = Arc::new(FakeStore::new(vec![lead_in("a", Stage::New)]));
        let ctrl = PipelineController::new(owner(), store.clone(), reloading());
        ctrl.load().await.unwrap();
        // written by another session
        store.leads.lock().unwrap().push(lead_in("b", Stage::Lost));
        let mut rx = ctrl.subscribe();

        ctrl.request_stage_transition(&LeadId::from("a"), Stage::Won)
            .await
            .unwrap();

        assert_eq!(stage_of(&ctrl, "a"), Stage::Won);
        assert_eq!(stage_of(&ctrl, "b"), Stage::Lost);
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(e, PipelineEvent::BoardLoaded { count: 2 }))
        );
    }

    #[tokio::test]
    async fn test_failed_reload_after_transition_keeps_board() {
        let store = Arc::new(FakeStore::new(vec![named("a", "Ana", Stage::New)]));
        let ctrl = PipelineController::new(owner(), store.clone(), reloading());
        ctrl.load().await.unwrap();
        store.fail_list.store(true, Ordering::SeqCst);
        let mut rx = ctrl.subscribe();

        let outcome = ctrl
            .request_stage_transition(&LeadId::from("a"), Stage::Won)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            TransitionOutcome::Moved {
                from: Stage::New,
                to: Stage::Won
            }
        );
        assert_eq!(stage_of(&ctrl, "a"), Stage::Won);
        assert_eq!(store.stored_stage("a"), Some(Stage::Won));
        assert_eq!(ctrl.board().load_error, None);

        let notes = notices(&drain(&mut rx));
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].0, crate::crm::events::NoticeLevel::Success);
        assert_eq!(notes[1].0, crate::crm::events::NoticeLevel::Error);
        assert!(notes[1].1.contains("refreshed"));
    }

    #[tokio::test]
    async fn test_idle_tracks_subscribers_and_in_flight() {
        let gate = Arc::new(Gate::default());
        let store = Arc::new(FakeStore::gated(vec![lead_in("a", Stage::New)], gate.clone()));
        let ctrl = loaded(store).await;
        assert!(ctrl.is_idle());

        let rx = ctrl.subscribe();
        assert!(!ctrl.is_idle());
        drop(rx);
        assert!(ctrl.is_idle());

        let a = LeadId::from("a");
        let (result, _) = tokio::join!(ctrl.request_stage_transition(&a, Stage::Won), async {
            gate.entered.notified().await;
            assert!(!ctrl.is_idle());
            gate.release.notify_one();
        });
        result.unwrap();
        assert!(ctrl.is_idle());
    }
}
