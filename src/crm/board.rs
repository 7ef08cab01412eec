//! Partitioning a lead collection into stage columns.

use super::models::{AccountId, BoardView, ColumnSummary, ColumnView, Lead, LeadId, Stage};

/// Build the board for a lead collection.
///
/// Every stage gets a column, in board order, even when empty. Each lead
/// appears in exactly the column of its current stage, keeping the order
/// of the input.
pub fn partition(
    account_id: AccountId,
    leads: &[Lead],
    pending: Vec<LeadId>,
    load_error: Option<String>,
) -> BoardView {
    let columns = Stage::ALL
        .iter()
        .map(|&stage| {
            let column_leads: Vec<Lead> = leads
                .iter()
                .filter(|l| l.stage == stage)
                .cloned()
                .collect();
            ColumnView {
                stage,
                label: stage.label().to_string(),
                summary: summarize(&column_leads),
                leads: column_leads,
            }
        })
        .collect();

    BoardView {
        account_id,
        columns,
        pending,
        load_error,
    }
}

/// Count and value totals for one column. Only positive values are summed.
pub fn summarize(leads: &[Lead]) -> ColumnSummary {
    let mut summary = ColumnSummary {
        count: leads.len(),
        ..ColumnSummary::default()
    };
    for value in leads.iter().filter_map(|l| l.value_cents).filter(|v| *v > 0) {
        summary.valued_count += 1;
        summary.total_value_cents = summary.total_value_cents.saturating_add(value);
    }
    summary
}
