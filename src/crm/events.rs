use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::models::{BoardView, Lead, LeadId, Stage};

/// Severity of a user-facing notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Success,
    Info,
    Error,
}

/// Board change or notice pushed to subscribers of one account's board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PipelineEvent {
    /// Full board, sent first to each new stream subscriber.
    BoardSnapshot {
        board: BoardView,
    },
    BoardLoaded {
        count: usize,
    },
    LeadCreated {
        lead: Lead,
    },
    LeadMoved {
        lead_id: LeadId,
        from: Stage,
        to: Stage,
    },
    /// An optimistic move was undone because the store did not confirm it.
    LeadMoveReverted {
        lead_id: LeadId,
        from: Stage,
        to: Stage,
        reason: String,
    },
    LeadUpdated {
        lead: Lead,
    },
    LeadDeleted {
        lead_id: LeadId,
    },
    Notice {
        level: NoticeLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lead_id: Option<LeadId>,
    },
}

impl PipelineEvent {
    pub fn success(message: impl Into<String>, lead_id: Option<LeadId>) -> Self {
        Self::Notice {
            level: NoticeLevel::Success,
            message: message.into(),
            lead_id,
        }
    }

    pub fn error(message: impl Into<String>, lead_id: Option<LeadId>) -> Self {
        Self::Notice {
            level: NoticeLevel::Error,
            message: message.into(),
            lead_id,
        }
    }
}

/// Serialize and broadcast an event to every subscriber.
/// Returns silently even if nobody is listening.
pub fn broadcast_event(tx: &broadcast::Sender<String>, event: &PipelineEvent) {
    match serde_json::to_string(event) {
        Ok(json) => {
            let _ = tx.send(json); // no receivers is fine
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize pipeline event");
        }
    }
}
