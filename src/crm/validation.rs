//! Input validation and normalization for lead forms.
//!
//! All problems in a draft are collected so a form can show them together.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::models::{LeadDraft, LeadFields, MoneyInput, NewLead};
use crate::errors::PipelineError;

static EMAIL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}$").unwrap());

/// How currency text typed by users is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyFormat {
    /// ISO code of the account currency, informational.
    #[serde(default = "default_currency_code")]
    pub code: String,
    #[serde(default = "default_decimal_separator")]
    pub decimal_separator: char,
}

fn default_currency_code() -> String {
    "BRL".to_string()
}

fn default_decimal_separator() -> char {
    ','
}

impl Default for CurrencyFormat {
    fn default() -> Self {
        Self {
            code: default_currency_code(),
            decimal_separator: default_decimal_separator(),
        }
    }
}

pub fn is_plausible_email(email: &str) -> bool {
    EMAIL_REGEX.is_match(email.trim())
}

/// Convert user-typed currency text into cents.
///
/// Everything except digits and the decimal separator is dropped, the last
/// separator splits units from the fraction, and fractions longer than two
/// digits are rounded half-up. Returns `Ok(None)` for blank input.
pub fn parse_currency(text: &str, format: &CurrencyFormat) -> Result<Option<i64>, String> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    if text.contains('-') {
        return Err(format!("Value must not be negative: {}", text));
    }

    let sep = format.decimal_separator;
    let kept: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == sep)
        .collect();
    if !kept.chars().any(|c| c.is_ascii_digit()) {
        return Err(format!("Value has no digits: {}", text));
    }

    let (units, fraction) = match kept.rfind(sep) {
        Some(idx) => (&kept[..idx], &kept[idx + sep.len_utf8()..]),
        None => (kept.as_str(), ""),
    };
    let units: String = units.chars().filter(|c| c.is_ascii_digit()).collect();
    let units: i64 = if units.is_empty() {
        0
    } else {
        units
            .parse()
            .map_err(|_| format!("Value is too large: {}", text))?
    };

    let digits: Vec<u32> = fraction.chars().filter_map(|c| c.to_digit(10)).collect();
    let mut cents = i64::from(digits.first().copied().unwrap_or(0)) * 10
        + i64::from(digits.get(1).copied().unwrap_or(0));
    if digits.get(2).is_some_and(|d| *d >= 5) {
        cents += 1;
    }

    units
        .checked_mul(100)
        .and_then(|v| v.checked_add(cents))
        .map(Some)
        .ok_or_else(|| format!("Value is too large: {}", text))
}

/// Normalize a money input of either shape into cents.
pub fn normalize_money(input: &MoneyInput, format: &CurrencyFormat) -> Result<Option<i64>, String> {
    match input {
        MoneyInput::Text(text) => parse_currency(text, format),
        MoneyInput::Amount(amount) => {
            if !amount.is_finite() {
                return Err("Value must be a finite number".to_string());
            }
            if *amount < 0.0 {
                return Err(format!("Value must not be negative: {}", amount));
            }
            let cents = (amount * 100.0).round();
            // i64::MAX as f64 rounds up to 2^63, which does not fit
            if cents >= i64::MAX as f64 {
                return Err(format!("Value is too large: {}", amount));
            }
            Ok(Some(cents as i64))
        }
    }
}

/// Render cents for display, e.g. `BRL 1.234,56` or `USD 1,234.56`.
pub fn format_currency(cents: i64, format: &CurrencyFormat) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    let group = if format.decimal_separator == ',' { '.' } else { ',' };

    let units = (abs / 100).to_string();
    let mut grouped = String::with_capacity(units.len() + units.len() / 3);
    for (i, digit) in units.chars().enumerate() {
        if i > 0 && (units.len() - i) % 3 == 0 {
            grouped.push(group);
        }
        grouped.push(digit);
    }

    format!(
        "{} {}{}{}{:02}",
        format.code,
        sign,
        grouped,
        format.decimal_separator,
        abs % 100
    )
}

fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Validate every editable field of a draft.
pub fn validate_fields(draft: &LeadDraft, format: &CurrencyFormat) -> Result<LeadFields, PipelineError> {
    let mut errors = Vec::new();

    let name = draft.name.trim().to_string();
    if name.is_empty() {
        errors.push("Name is required".to_string());
    }

    let email = draft.email.trim().to_string();
    if email.is_empty() {
        errors.push("Email is required".to_string());
    } else if !is_plausible_email(&email) {
        errors.push(format!("Email is not a valid address: {}", email));
    }

    if let Some(p) = draft.probability
        && p > 100
    {
        errors.push(format!("Probability must be between 0 and 100, got {}", p));
    }

    let value_cents = match &draft.value {
        Some(input) => match normalize_money(input, format) {
            Ok(v) => v,
            Err(e) => {
                errors.push(e);
                None
            }
        },
        None => None,
    };

    if !errors.is_empty() {
        return Err(PipelineError::Validation(errors));
    }

    Ok(LeadFields {
        name,
        email,
        phone: clean(&draft.phone),
        company: clean(&draft.company),
        message: clean(&draft.message),
        source: clean(&draft.source),
        value_cents,
        probability: draft.probability,
        expected_close_date: draft.expected_close_date,
        last_contact_at: draft.last_contact_at,
        next_follow_up_at: draft.next_follow_up_at,
    })
}

/// Validate a draft for insertion; the stage defaults to `New`.
pub fn validate_new_lead(draft: &LeadDraft, format: &CurrencyFormat) -> Result<NewLead, PipelineError> {
    Ok(NewLead {
        fields: validate_fields(draft, format)?,
        stage: draft.stage.unwrap_or_default(),
    })
}

/// Trimmed custom field name; blank names are rejected.
pub fn validate_field_name(name: &str) -> Result<String, PipelineError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(PipelineError::invalid("Field name is required"));
    }
    Ok(name.to_string())
}

/// Blank custom field values are stored as none.
pub fn normalize_field_value(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}
