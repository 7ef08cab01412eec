use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Fresh random identifier (UUID v4).
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Opaque lead identifier assigned by the store.
    LeadId
);
string_id!(
    /// Identifier of the account (profile) that owns leads.
    AccountId
);
string_id!(CustomFieldId);

// ── Pipeline stage ────────────────────────────────────────────────────

/// Sales-funnel stage of a lead.
///
/// The order is display order only. Any stage may move to any other stage,
/// including backwards and out of `Won`/`Lost`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    New,
    InProgress,
    Meeting,
    Won,
    Lost,
}

impl Stage {
    /// All stages in board order.
    pub const ALL: [Stage; 5] = [
        Stage::New,
        Stage::InProgress,
        Stage::Meeting,
        Stage::Won,
        Stage::Lost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::InProgress => "in_progress",
            Self::Meeting => "meeting",
            Self::Won => "won",
            Self::Lost => "lost",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::New => "New",
            Self::InProgress => "In Progress",
            Self::Meeting => "Meeting",
            Self::Won => "Won",
            Self::Lost => "Lost",
        }
    }

    /// Column index on the board.
    pub fn position(&self) -> usize {
        match self {
            Self::New => 0,
            Self::InProgress => 1,
            Self::Meeting => 2,
            Self::Won => 3,
            Self::Lost => 4,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Stage {
    type Err = String;

    /// Accepts the wire name (`in_progress`) or the label (`In Progress`),
    /// case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "new" => Ok(Self::New),
            "in_progress" | "inprogress" => Ok(Self::InProgress),
            "meeting" => Ok(Self::Meeting),
            "won" => Ok(Self::Won),
            "lost" => Ok(Self::Lost),
            _ => Err(format!(
                "Invalid stage: {}. Valid values: new, in_progress, meeting, won, lost",
                s
            )),
        }
    }
}

// ── Accounts ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Superadmin,
    #[default]
    Affiliate,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Superadmin => "superadmin",
            Self::Affiliate => "affiliate",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "superadmin" => Ok(Self::Superadmin),
            "affiliate" => Ok(Self::Affiliate),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// The signed-in account every lead operation is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub role: Role,
}

impl Account {
    pub fn new(id: impl Into<AccountId>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    pub fn affiliate(id: impl Into<AccountId>) -> Self {
        Self::new(id, Role::Affiliate)
    }

    pub fn superadmin(id: impl Into<AccountId>) -> Self {
        Self::new(id, Role::Superadmin)
    }
}

// ── Leads ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub owner_id: AccountId,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub message: Option<String>,
    pub source: Option<String>,
    /// Estimated deal value in cents of the account currency.
    pub value_cents: Option<i64>,
    /// Win probability, 0-100.
    pub probability: Option<u8>,
    pub expected_close_date: Option<NaiveDate>,
    pub last_contact_at: Option<DateTime<Utc>>,
    pub next_follow_up_at: Option<DateTime<Utc>>,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    /// Overwrite every editable field, leaving id, owner, stage and
    /// creation time alone.
    pub(crate) fn apply_fields(&mut self, fields: &LeadFields, updated_at: DateTime<Utc>) {
        self.name = fields.name.clone();
        self.email = fields.email.clone();
        self.phone = fields.phone.clone();
        self.company = fields.company.clone();
        self.message = fields.message.clone();
        self.source = fields.source.clone();
        self.value_cents = fields.value_cents;
        self.probability = fields.probability;
        self.expected_close_date = fields.expected_close_date;
        self.last_contact_at = fields.last_contact_at;
        self.next_follow_up_at = fields.next_follow_up_at;
        self.updated_at = updated_at;
    }
}

/// Monetary value as typed by a user: either a plain number or
/// formatted currency text such as `"R$ 1.234,56"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MoneyInput {
    Amount(f64),
    Text(String),
}

/// Unvalidated lead input from a form, the CLI or an API request.
///
/// Also used for edits: the edit form submits the full record, and a
/// `stage` that differs from the current one becomes a stage transition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadDraft {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub value: Option<MoneyInput>,
    #[serde(default)]
    pub probability: Option<u8>,
    #[serde(default)]
    pub expected_close_date: Option<NaiveDate>,
    #[serde(default)]
    pub last_contact_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_follow_up_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stage: Option<Stage>,
}

impl LeadDraft {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            ..Self::default()
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    pub fn with_value(mut self, value: MoneyInput) -> Self {
        self.value = Some(value);
        self
    }
}

/// Validated, normalized editable fields of a lead.
#[derive(Debug, Clone, PartialEq)]
pub struct LeadFields {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub message: Option<String>,
    pub source: Option<String>,
    pub value_cents: Option<i64>,
    pub probability: Option<u8>,
    pub expected_close_date: Option<NaiveDate>,
    pub last_contact_at: Option<DateTime<Utc>>,
    pub next_follow_up_at: Option<DateTime<Utc>>,
}

/// A validated lead ready for insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLead {
    pub fields: LeadFields,
    pub stage: Stage,
}

// ── Custom fields ─────────────────────────────────────────────────────

/// Free-form key/value attached to a lead, kept outside the typed schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomField {
    pub id: CustomFieldId,
    pub lead_id: LeadId,
    pub name: String,
    pub value: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ── Board view types ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardView {
    pub account_id: AccountId,
    pub columns: Vec<ColumnView>,
    /// Leads whose stage change is awaiting the store.
    pub pending: Vec<LeadId>,
    /// Set when the last load failed; columns are empty in that case.
    pub load_error: Option<String>,
}

impl BoardView {
    /// Column for `stage`. `None` only for a view that was deserialized
    /// without it.
    pub fn column(&self, stage: Stage) -> Option<&ColumnView> {
        self.columns.iter().find(|c| c.stage == stage)
    }

    pub fn total_leads(&self) -> usize {
        self.columns.iter().map(|c| c.leads.len()).sum()
    }

    /// Stage bucket containing `id`, if any.
    pub fn stage_of(&self, id: &LeadId) -> Option<Stage> {
        self.columns
            .iter()
            .find(|c| c.leads.iter().any(|l| &l.id == id))
            .map(|c| c.stage)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnView {
    pub stage: Stage,
    pub label: String,
    pub leads: Vec<Lead>,
    pub summary: ColumnSummary,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSummary {
    pub count: usize,
    /// Leads with a positive value.
    pub valued_count: usize,
    pub total_value_cents: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_round_trips_through_wire_name() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_str(stage.as_str()).unwrap(), stage);
        }
    }

    #[test]
    fn stage_parses_labels_case_insensitively() {
        assert_eq!(Stage::from_str("In Progress").unwrap(), Stage::InProgress);
        assert_eq!(Stage::from_str("MEETING").unwrap(), Stage::Meeting);
        assert_eq!(Stage::from_str("in-progress").unwrap(), Stage::InProgress);
    }

    #[test]
    fn stage_rejects_unknown_value() {
        let err = Stage::from_str("archived").unwrap_err();
        assert!(err.contains("archived"));
    }

    #[test]
    fn stage_positions_follow_board_order() {
        for (i, stage) in Stage::ALL.iter().enumerate() {
            assert_eq!(stage.position(), i);
        }
        assert_eq!(Stage::default(), Stage::New);
    }

    #[test]
    fn stage_serializes_snake_case() {
        let json = serde_json::to_string(&Stage::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn money_input_accepts_number_or_text() {
        let n: MoneyInput = serde_json::from_str("1500.5").unwrap();
        assert_eq!(n, MoneyInput::Amount(1500.5));
        let t: MoneyInput = serde_json::from_str("\"R$ 1.500,50\"").unwrap();
        assert_eq!(t, MoneyInput::Text("R$ 1.500,50".into()));
    }

    #[test]
    fn lead_draft_deserializes_with_only_required_fields() {
        let draft: LeadDraft =
            serde_json::from_str(r#"{"name": "Ana", "email": "ana@x.com"}"#).unwrap();
        assert_eq!(draft, LeadDraft::new("Ana", "ana@x.com"));
    }

    #[test]
    fn role_parses() {
        assert_eq!(Role::from_str("superadmin").unwrap(), Role::Superadmin);
        assert_eq!(Role::from_str("Affiliate").unwrap(), Role::Affiliate);
        assert!(Role::from_str("guest").is_err());
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(LeadId::generate(), LeadId::generate());
    }

    #[test]
    fn column_lookup_tolerates_partial_views() {
        let view: BoardView = serde_json::from_value(serde_json::json!({
            "account_id": "acct",
            "columns": [{
                "stage": "won",
                "label": "Won",
                "leads": [],
                "summary": {"count": 0, "valued_count": 0, "total_value_cents": 0}
            }],
            "pending": [],
            "load_error": null
        }))
        .unwrap();
        assert!(view.column(Stage::New).is_none());
        assert_eq!(view.column(Stage::Won).unwrap().label, "Won");
    }
}
