//! Project setup: `multitalk init`.

use anyhow::{Context, Result};
use std::path::Path;

use multitalk::config::{CONFIG_FILE, MultitalkToml, config_dir};
use multitalk::crm::db::CrmDb;

pub fn cmd_init(project_dir: &Path, config: &MultitalkToml) -> Result<()> {
    let dir = config_dir(project_dir);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let config_path = dir.join(CONFIG_FILE);
    if config_path.exists() {
        println!("Keeping existing {}", config_path.display());
    } else {
        MultitalkToml::default().save(&config_path)?;
        println!("Created {}", config_path.display());
    }

    let db_path = config.database_path(project_dir);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    CrmDb::new(&db_path)?;
    println!("Lead database ready at {}", db_path.display());

    println!();
    println!("Next steps:");
    println!("  multitalk leads add --account <id> \"Ana Souza\" ana@example.com");
    println!("  multitalk serve");

    Ok(())
}
