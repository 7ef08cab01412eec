//! Persistence contract consumed by the pipeline controller.
//!
//! Every write is scoped by the owning account so a request for another
//! account's lead changes nothing and reports zero affected rows. Permission
//! rules beyond ownership (roles) are the store's business, not the
//! controller's.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::{
    Account, AccountId, CustomField, CustomFieldId, Lead, LeadFields, LeadId, NewLead, Stage,
};
use crate::errors::StoreError;

/// Result of a scoped write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub affected_rows: u64,
}

impl WriteOutcome {
    pub fn new(affected_rows: u64) -> Self {
        Self { affected_rows }
    }

    pub fn is_noop(&self) -> bool {
        self.affected_rows == 0
    }
}

#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Leads owned by `owner`, newest first.
    async fn list_leads(&self, owner: &AccountId) -> Result<Vec<Lead>, StoreError>;

    async fn insert_lead(&self, owner: &AccountId, lead: &NewLead) -> Result<Lead, StoreError>;

    /// Set the stage and last-modified time of one lead, matched by id and owner.
    async fn update_stage(
        &self,
        lead_id: &LeadId,
        owner: &AccountId,
        stage: Stage,
        at: DateTime<Utc>,
    ) -> Result<WriteOutcome, StoreError>;

    /// Overwrite the editable fields of one lead, matched by id and owner.
    async fn update_fields(
        &self,
        lead_id: &LeadId,
        owner: &AccountId,
        fields: &LeadFields,
        at: DateTime<Utc>,
    ) -> Result<WriteOutcome, StoreError>;

    /// Permanently delete one lead and its custom fields.
    async fn delete_lead(&self, lead_id: &LeadId, account: &Account) -> Result<WriteOutcome, StoreError>;

    /// Custom fields of a lead owned by `owner`, oldest first.
    async fn list_custom_fields(
        &self,
        lead_id: &LeadId,
        owner: &AccountId,
    ) -> Result<Vec<CustomField>, StoreError>;

    /// Fails with `StoreError::Conflict` if the lead already has a field with this name.
    async fn insert_custom_field(
        &self,
        lead_id: &LeadId,
        owner: &AccountId,
        name: &str,
        value: Option<&str>,
    ) -> Result<CustomField, StoreError>;

    async fn update_custom_field(
        &self,
        field_id: &CustomFieldId,
        owner: &AccountId,
        value: Option<&str>,
    ) -> Result<WriteOutcome, StoreError>;

    async fn delete_custom_field(
        &self,
        field_id: &CustomFieldId,
        owner: &AccountId,
    ) -> Result<WriteOutcome, StoreError>;
}
