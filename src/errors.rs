//! Typed error hierarchy for the lead pipeline.
//!
//! Two enums cover the two layers:
//! - `StoreError`: failures reported by the persistence collaborator
//! - `PipelineError`: controller operation failures surfaced to the user

use std::time::Duration;

use thiserror::Error;

use crate::crm::models::{CustomFieldId, LeadId, Stage};

/// Errors from a `LeadStore` round trip.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Persistence service unavailable: {0}")]
    Unavailable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Rejected by persistence service: {0}")]
    Rejected(String),

    #[error("Conflicting record: {0}")]
    Conflict(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

/// Errors from pipeline controller operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Lead {id} not found")]
    LeadNotFound { id: LeadId },

    #[error("Lead {id} already has a stage change in flight")]
    TransitionInFlight { id: LeadId },

    #[error("Invalid lead: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Deleting lead {id} requires confirmation")]
    ConfirmationRequired { id: LeadId },

    #[error("No record was changed for lead {id} during {operation}")]
    ZeroRowsAffected { id: LeadId, operation: &'static str },

    #[error("Failed to load leads: {0}")]
    LoadFailed(#[source] StoreError),

    #[error("Failed to move \"{name}\" to \"{target}\": {source}")]
    TransitionFailed {
        id: LeadId,
        name: String,
        target: Stage,
        #[source]
        source: StoreError,
    },

    #[error("Custom field {id} not found")]
    CustomFieldNotFound { id: CustomFieldId },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Validation(vec![message.into()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_timeout_carries_duration() {
        let err = StoreError::Timeout(Duration::from_secs(10));
        match &err {
            StoreError::Timeout(d) => assert_eq!(d.as_secs(), 10),
            _ => panic!("Expected Timeout"),
        }
        assert!(err.to_string().contains("10s"));
    }

    #[test]
    fn pipeline_error_converts_from_store_error() {
        let inner = StoreError::PermissionDenied("row level security".into());
        let err: PipelineError = inner.into();
        match &err {
            PipelineError::Store(StoreError::PermissionDenied(msg)) => {
                assert_eq!(msg, "row level security");
            }
            _ => panic!("Expected PipelineError::Store(PermissionDenied(..))"),
        }
    }

    #[test]
    fn transition_failed_names_lead_and_stage() {
        let err = PipelineError::TransitionFailed {
            id: LeadId::from("lead-1"),
            name: "Ana".into(),
            target: Stage::Won,
            source: StoreError::Unavailable("connection reset".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("Ana"));
        assert!(msg.contains("Won"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn validation_error_joins_messages() {
        let err = PipelineError::Validation(vec!["Name is required".into(), "Email is invalid".into()]);
        assert_eq!(err.to_string(), "Invalid lead: Name is required; Email is invalid");
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::Rejected("x".into()));
        assert_std_error(&PipelineError::LeadNotFound { id: LeadId::from("x") });
    }
}
