use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;
use super::store::{LeadStore, WriteOutcome};
use crate::errors::StoreError;

const LEAD_COLUMNS: &str = "id, owner_id, name, email, phone, company, message, source, value_cents, probability, expected_close_date, last_contact_at, next_follow_up_at, stage, created_at, updated_at";

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

/// Async-safe handle to the CRM database.
///
/// Wraps `CrmDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<CrmDb>>,
}

impl DbHandle {
    pub fn new(db: CrmDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&CrmDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// Typed store errors raised inside `CrmDb` travel through `anyhow` and are
/// recovered here; everything else is a database failure.
fn into_store_error(err: anyhow::Error) -> StoreError {
    match err.downcast::<StoreError>() {
        Ok(store_err) => store_err,
        Err(other) => StoreError::Database(other),
    }
}

pub struct CrmDb {
    conn: Connection,
}

impl CrmDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS leads (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    email TEXT NOT NULL,
                    phone TEXT,
                    company TEXT,
                    message TEXT,
                    source TEXT,
                    value_cents INTEGER,
                    probability INTEGER CHECK (probability BETWEEN 0 AND 100),
                    expected_close_date TEXT,
                    last_contact_at TEXT,
                    next_follow_up_at TEXT,
                    stage TEXT NOT NULL DEFAULT 'new'
                        CHECK (stage IN ('new', 'in_progress', 'meeting', 'won', 'lost')),
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS lead_custom_fields (
                    id TEXT PRIMARY KEY,
                    lead_id TEXT NOT NULL REFERENCES leads(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    value TEXT,
                    created_at TEXT NOT NULL,
                    UNIQUE(lead_id, name)
                );

                CREATE INDEX IF NOT EXISTS idx_leads_owner ON leads(owner_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_custom_fields_lead ON lead_custom_fields(lead_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Lead CRUD ─────────────────────────────────────────────────────

    pub fn list_leads(&self, owner: &AccountId) -> Result<Vec<Lead>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {LEAD_COLUMNS} FROM leads WHERE owner_id = ?1
                 ORDER BY created_at DESC, rowid DESC"
            ))
            .context("Failed to prepare list_leads")?;
        let rows = stmt
            .query_map(params![owner.as_str()], LeadRow::from_row)
            .context("Failed to query leads")?;
        let mut leads = Vec::new();
        for row in rows {
            let r = row.context("Failed to read lead row")?;
            leads.push(r.into_lead()?);
        }
        Ok(leads)
    }

    pub fn get_lead(&self, id: &LeadId) -> Result<Option<Lead>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
                params![id.as_str()],
                LeadRow::from_row,
            )
            .optional()
            .context("Failed to query lead")?;
        row.map(LeadRow::into_lead).transpose()
    }

    pub fn insert_lead(&self, owner: &AccountId, lead: &NewLead) -> Result<Lead> {
        let id = LeadId::generate();
        let now = timestamp(&Utc::now());
        let f = &lead.fields;
        self.conn
            .execute(
                "INSERT INTO leads (id, owner_id, name, email, phone, company, message, source, value_cents, probability, expected_close_date, last_contact_at, next_follow_up_at, stage, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
                params![
                    id.as_str(),
                    owner.as_str(),
                    f.name,
                    f.email,
                    f.phone,
                    f.company,
                    f.message,
                    f.source,
                    f.value_cents,
                    f.probability,
                    f.expected_close_date.map(|d| d.to_string()),
                    f.last_contact_at.as_ref().map(timestamp),
                    f.next_follow_up_at.as_ref().map(timestamp),
                    lead.stage.as_str(),
                    now,
                ],
            )
            .context("Failed to insert lead")?;
        self.get_lead(&id)?.context("Lead not found after insert")
    }

    pub fn update_stage(
        &self,
        id: &LeadId,
        owner: &AccountId,
        stage: Stage,
        at: &DateTime<Utc>,
    ) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE leads SET stage = ?1, updated_at = ?2 WHERE id = ?3 AND owner_id = ?4",
                params![stage.as_str(), timestamp(at), id.as_str(), owner.as_str()],
            )
            .context("Failed to update lead stage")
    }

    pub fn update_fields(
        &self,
        id: &LeadId,
        owner: &AccountId,
        f: &LeadFields,
        at: &DateTime<Utc>,
    ) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE leads SET name = ?1, email = ?2, phone = ?3, company = ?4, message = ?5, source = ?6,
                    value_cents = ?7, probability = ?8, expected_close_date = ?9, last_contact_at = ?10,
                    next_follow_up_at = ?11, updated_at = ?12
                 WHERE id = ?13 AND owner_id = ?14",
                params![
                    f.name,
                    f.email,
                    f.phone,
                    f.company,
                    f.message,
                    f.source,
                    f.value_cents,
                    f.probability,
                    f.expected_close_date.map(|d| d.to_string()),
                    f.last_contact_at.as_ref().map(timestamp),
                    f.next_follow_up_at.as_ref().map(timestamp),
                    timestamp(at),
                    id.as_str(),
                    owner.as_str(),
                ],
            )
            .context("Failed to update lead fields")
    }

    /// Superadmins may delete any lead; everyone else only their own.
    pub fn delete_lead(&self, id: &LeadId, account: &Account) -> Result<usize> {
        let count = match account.role {
            Role::Superadmin => self
                .conn
                .execute("DELETE FROM leads WHERE id = ?1", params![id.as_str()]),
            Role::Affiliate => self.conn.execute(
                "DELETE FROM leads WHERE id = ?1 AND owner_id = ?2",
                params![id.as_str(), account.id.as_str()],
            ),
        }
        .context("Failed to delete lead")?;
        Ok(count)
    }

    // ── Custom fields ─────────────────────────────────────────────────

    fn owns_lead(&self, lead_id: &LeadId, owner: &AccountId) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM leads WHERE id = ?1 AND owner_id = ?2",
                params![lead_id.as_str(), owner.as_str()],
                |row| row.get(0),
            )
            .context("Failed to check lead ownership")
    }

    pub fn list_custom_fields(&self, lead_id: &LeadId, owner: &AccountId) -> Result<Vec<CustomField>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT f.id, f.lead_id, f.name, f.value, f.created_at
                 FROM lead_custom_fields f JOIN leads l ON l.id = f.lead_id
                 WHERE f.lead_id = ?1 AND l.owner_id = ?2
                 ORDER BY f.created_at, f.rowid",
            )
            .context("Failed to prepare list_custom_fields")?;
        let rows = stmt
            .query_map(params![lead_id.as_str(), owner.as_str()], CustomFieldRow::from_row)
            .context("Failed to query custom fields")?;
        let mut fields = Vec::new();
        for row in rows {
            let r = row.context("Failed to read custom field row")?;
            fields.push(r.into_custom_field()?);
        }
        Ok(fields)
    }

    pub fn insert_custom_field(
        &self,
        lead_id: &LeadId,
        owner: &AccountId,
        name: &str,
        value: Option<&str>,
    ) -> Result<CustomField> {
        if !self.owns_lead(lead_id, owner)? {
            return Err(StoreError::PermissionDenied(format!(
                "lead {} is not owned by account {}",
                lead_id, owner
            ))
            .into());
        }
        let exists: bool = self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM lead_custom_fields WHERE lead_id = ?1 AND name = ?2",
            params![lead_id.as_str(), name],
            |row| row.get(0),
        )?;
        if exists {
            return Err(StoreError::Conflict(format!(
                "lead {} already has a field named '{}'",
                lead_id, name
            ))
            .into());
        }

        let id = CustomFieldId::generate();
        let created_at = Utc::now();
        self.conn
            .execute(
                "INSERT INTO lead_custom_fields (id, lead_id, name, value, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.as_str(), lead_id.as_str(), name, value, timestamp(&created_at)],
            )
            .context("Failed to insert custom field")?;
        Ok(CustomField {
            id,
            lead_id: lead_id.clone(),
            name: name.to_string(),
            value: value.map(str::to_string),
            created_at: parse_timestamp(&timestamp(&created_at))?,
        })
    }

    pub fn update_custom_field(
        &self,
        field_id: &CustomFieldId,
        owner: &AccountId,
        value: Option<&str>,
    ) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE lead_custom_fields SET value = ?1
                 WHERE id = ?2 AND lead_id IN (SELECT id FROM leads WHERE owner_id = ?3)",
                params![value, field_id.as_str(), owner.as_str()],
            )
            .context("Failed to update custom field")
    }

    pub fn delete_custom_field(&self, field_id: &CustomFieldId, owner: &AccountId) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM lead_custom_fields
                 WHERE id = ?1 AND lead_id IN (SELECT id FROM leads WHERE owner_id = ?2)",
                params![field_id.as_str(), owner.as_str()],
            )
            .context("Failed to delete custom field")
    }
}

// ── LeadStore over the async handle ───────────────────────────────────

#[async_trait]
impl LeadStore for DbHandle {
    async fn list_leads(&self, owner: &AccountId) -> Result<Vec<Lead>, StoreError> {
        let owner = owner.clone();
        self.call(move |db| db.list_leads(&owner))
            .await
            .map_err(into_store_error)
    }

    async fn insert_lead(&self, owner: &AccountId, lead: &NewLead) -> Result<Lead, StoreError> {
        let owner = owner.clone();
        let lead = lead.clone();
        self.call(move |db| db.insert_lead(&owner, &lead))
            .await
            .map_err(into_store_error)
    }

    async fn update_stage(
        &self,
        lead_id: &LeadId,
        owner: &AccountId,
        stage: Stage,
        at: DateTime<Utc>,
    ) -> Result<WriteOutcome, StoreError> {
        let (lead_id, owner) = (lead_id.clone(), owner.clone());
        self.call(move |db| db.update_stage(&lead_id, &owner, stage, &at))
            .await
            .map(|n| WriteOutcome::new(n as u64))
            .map_err(into_store_error)
    }

    async fn update_fields(
        &self,
        lead_id: &LeadId,
        owner: &AccountId,
        fields: &LeadFields,
        at: DateTime<Utc>,
    ) -> Result<WriteOutcome, StoreError> {
        let (lead_id, owner, fields) = (lead_id.clone(), owner.clone(), fields.clone());
        self.call(move |db| db.update_fields(&lead_id, &owner, &fields, &at))
            .await
            .map(|n| WriteOutcome::new(n as u64))
            .map_err(into_store_error)
    }

    async fn delete_lead(&self, lead_id: &LeadId, account: &Account) -> Result<WriteOutcome, StoreError> {
        let (lead_id, account) = (lead_id.clone(), account.clone());
        self.call(move |db| db.delete_lead(&lead_id, &account))
            .await
            .map(|n| WriteOutcome::new(n as u64))
            .map_err(into_store_error)
    }

    async fn list_custom_fields(
        &self,
        lead_id: &LeadId,
        owner: &AccountId,
    ) -> Result<Vec<CustomField>, StoreError> {
        let (lead_id, owner) = (lead_id.clone(), owner.clone());
        self.call(move |db| db.list_custom_fields(&lead_id, &owner))
            .await
            .map_err(into_store_error)
    }

    async fn insert_custom_field(
        &self,
        lead_id: &LeadId,
        owner: &AccountId,
        name: &str,
        value: Option<&str>,
    ) -> Result<CustomField, StoreError> {
        let (lead_id, owner) = (lead_id.clone(), owner.clone());
        let name = name.to_string();
        let value = value.map(str::to_string);
        self.call(move |db| db.insert_custom_field(&lead_id, &owner, &name, value.as_deref()))
            .await
            .map_err(into_store_error)
    }

    async fn update_custom_field(
        &self,
        field_id: &CustomFieldId,
        owner: &AccountId,
        value: Option<&str>,
    ) -> Result<WriteOutcome, StoreError> {
        let (field_id, owner) = (field_id.clone(), owner.clone());
        let value = value.map(str::to_string);
        self.call(move |db| db.update_custom_field(&field_id, &owner, value.as_deref()))
            .await
            .map(|n| WriteOutcome::new(n as u64))
            .map_err(into_store_error)
    }

    async fn delete_custom_field(
        &self,
        field_id: &CustomFieldId,
        owner: &AccountId,
    ) -> Result<WriteOutcome, StoreError> {
        let (field_id, owner) = (field_id.clone(), owner.clone());
        self.call(move |db| db.delete_custom_field(&field_id, &owner))
            .await
            .map(|n| WriteOutcome::new(n as u64))
            .map_err(into_store_error)
    }
}

// ── Row conversion ────────────────────────────────────────────────────

/// Intermediate row struct for reading leads from SQLite before converting
/// stage / date / timestamp strings into typed values.
struct LeadRow {
    id: String,
    owner_id: String,
    name: String,
    email: String,
    phone: Option<String>,
    company: Option<String>,
    message: Option<String>,
    source: Option<String>,
    value_cents: Option<i64>,
    probability: Option<u8>,
    expected_close_date: Option<String>,
    last_contact_at: Option<String>,
    next_follow_up_at: Option<String>,
    stage: String,
    created_at: String,
    updated_at: String,
}

impl LeadRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            name: row.get(2)?,
            email: row.get(3)?,
            phone: row.get(4)?,
            company: row.get(5)?,
            message: row.get(6)?,
            source: row.get(7)?,
            value_cents: row.get(8)?,
            probability: row.get(9)?,
            expected_close_date: row.get(10)?,
            last_contact_at: row.get(11)?,
            next_follow_up_at: row.get(12)?,
            stage: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }

    fn into_lead(self) -> Result<Lead> {
        let stage = Stage::from_str(&self.stage)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse lead stage")?;
        let expected_close_date = self
            .expected_close_date
            .as_deref()
            .map(|d| NaiveDate::from_str(d).with_context(|| format!("Invalid date '{}'", d)))
            .transpose()?;

        Ok(Lead {
            id: LeadId::new(self.id),
            owner_id: AccountId::new(self.owner_id),
            name: self.name,
            email: self.email,
            phone: self.phone,
            company: self.company,
            message: self.message,
            source: self.source,
            value_cents: self.value_cents,
            probability: self.probability,
            expected_close_date,
            last_contact_at: self.last_contact_at.as_deref().map(parse_timestamp).transpose()?,
            next_follow_up_at: self.next_follow_up_at.as_deref().map(parse_timestamp).transpose()?,
            stage,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

struct CustomFieldRow {
    id: String,
    lead_id: String,
    name: String,
    value: Option<String>,
    created_at: String,
}

impl CustomFieldRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            lead_id: row.get(1)?,
            name: row.get(2)?,
            value: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn into_custom_field(self) -> Result<CustomField> {
        Ok(CustomField {
            id: CustomFieldId::new(self.id),
            lead_id: LeadId::new(self.lead_id),
            name: self.name,
            value: self.value,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
