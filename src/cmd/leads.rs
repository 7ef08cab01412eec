//! Terminal board commands: `multitalk leads`.
//!
//! Every subcommand opens the account's board the same way the server does:
//! one `PipelineController` over the SQLite store, loaded before acting.

use anyhow::{Context, Result, bail};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use multitalk::config::MultitalkToml;
use multitalk::crm::controller::{PipelineController, TransitionOutcome};
use multitalk::crm::db::{CrmDb, DbHandle};
use multitalk::crm::models::{Account, BoardView, LeadDraft, LeadId, MoneyInput, Role, Stage};
use multitalk::crm::validation::{CurrencyFormat, format_currency};

use super::super::{LeadsCommands, SessionArgs};

pub async fn cmd_leads(
    project_dir: &Path,
    config: &MultitalkToml,
    command: LeadsCommands,
    yes: bool,
) -> Result<()> {
    let account = session_account(command.session())?;
    let controller = open_board(project_dir, config, account).await?;

    match command {
        LeadsCommands::List { stage, json, .. } => {
            let stage = stage
                .as_deref()
                .map(Stage::from_str)
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let board = controller.board();
            if json {
                println!("{}", serde_json::to_string_pretty(&board)?);
            } else {
                print_board(&board, stage, &config.currency);
            }
        }
        LeadsCommands::Add {
            name,
            email,
            phone,
            company,
            source,
            message,
            value,
            probability,
            stage,
            ..
        } => {
            let stage = stage
                .as_deref()
                .map(Stage::from_str)
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let draft = LeadDraft {
                phone,
                company,
                source,
                message,
                value: value.map(MoneyInput::Text),
                probability,
                stage,
                ..LeadDraft::new(name, email)
            };
            let lead = controller.create_lead(draft).await?;
            println!(
                "{} lead \"{}\" in {} ({})",
                console::style("Created").green().bold(),
                lead.name,
                lead.stage,
                lead.id
            );
        }
        LeadsCommands::Move { id, stage, .. } => {
            let target = Stage::from_str(&stage).map_err(anyhow::Error::msg)?;
            let lead_id = resolve_lead_id(&controller, &id)?;
            let name = lead_name(&controller, &lead_id);
            match controller.request_stage_transition(&lead_id, target).await? {
                TransitionOutcome::Moved { from, to } => println!(
                    "{} \"{}\" from {} to {}",
                    console::style("Moved").green().bold(),
                    name,
                    from,
                    to
                ),
                TransitionOutcome::Unchanged { stage } => println!(
                    "{}",
                    console::style(format!("\"{}\" is already in {}", name, stage)).dim()
                ),
            }
        }
        LeadsCommands::Delete { id, .. } => {
            let lead_id = resolve_lead_id(&controller, &id)?;
            let name = lead_name(&controller, &lead_id);

            if !yes {
                if !console::user_attended() {
                    bail!(
                        "Refusing to delete lead \"{}\" without confirmation; pass --yes",
                        name
                    );
                }
                let confirm = dialoguer::Confirm::new()
                    .with_prompt(format!(
                        "Delete lead \"{}\"? This cannot be undone",
                        name
                    ))
                    .default(false)
                    .interact()
                    .unwrap_or(false);

                if !confirm {
                    println!("Deletion cancelled.");
                    return Ok(());
                }
            }

            controller.delete_lead(&lead_id, true).await?;
            println!(
                "{} lead \"{}\"",
                console::style("Deleted").red().bold(),
                name
            );
        }
    }

    Ok(())
}

fn session_account(session: &SessionArgs) -> Result<Account> {
    let id = session.account.trim();
    if id.is_empty() {
        bail!("--account must not be empty");
    }
    let role = Role::from_str(&session.role).map_err(anyhow::Error::msg)?;
    Ok(Account::new(id, role))
}

async fn open_board(
    project_dir: &Path,
    config: &MultitalkToml,
    account: Account,
) -> Result<PipelineController> {
    let db_path = config.database_path(project_dir);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let db = CrmDb::new(&db_path)?;

    let controller = PipelineController::new(
        account,
        Arc::new(DbHandle::new(db)),
        config.pipeline_settings(),
    );
    controller.load().await?;
    Ok(controller)
}

/// Accept a full id or a prefix matching exactly one of the account's leads.
fn resolve_lead_id(controller: &PipelineController, given: &str) -> Result<LeadId> {
    let given = given.trim();
    if given.is_empty() {
        bail!("Lead id must not be empty");
    }

    let matches: Vec<LeadId> = controller
        .leads()
        .into_iter()
        .map(|lead| lead.id)
        .filter(|id| id.as_str().starts_with(given))
        .collect();

    if let Some(exact) = matches.iter().find(|id| id.as_str() == given) {
        return Ok(exact.clone());
    }
    match matches.len() {
        0 => bail!("No lead matching '{}' on this board", given),
        1 => Ok(matches[0].clone()),
        n => bail!("'{}' matches {} leads; use a longer id", given, n),
    }
}

fn lead_name(controller: &PipelineController, id: &LeadId) -> String {
    controller
        .lead(id)
        .map(|lead| lead.name)
        .unwrap_or_else(|| id.to_string())
}

fn print_board(board: &BoardView, only: Option<Stage>, currency: &CurrencyFormat) {
    println!();
    println!(
        "{}",
        console::style(format!("Lead board for {}", board.account_id))
            .bold()
            .cyan()
    );

    for column in &board.columns {
        if only.is_some_and(|stage| stage != column.stage) {
            continue;
        }

        println!();
        println!(
            "{} ({})  {}",
            console::style(&column.label).bold(),
            column.summary.count,
            console::style(format_currency(column.summary.total_value_cents, currency)).dim()
        );

        if column.leads.is_empty() {
            println!("  {}", console::style("(empty)").dim());
            continue;
        }

        for lead in &column.leads {
            let short_id: String = lead.id.as_str().chars().take(8).collect();
            let mut line = format!("  {}  {} <{}>", short_id, lead.name, lead.email);
            if let Some(company) = &lead.company {
                line.push_str(&format!("  {}", company));
            }
            if let Some(cents) = lead.value_cents {
                line.push_str(&format!("  {}", format_currency(cents, currency)));
            }
            println!("{}", line);
        }
    }
    println!();
}
