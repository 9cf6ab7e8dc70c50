//! Map subcommand: edit the category to calendar table.
//!
//! Changes take effect on the next round, which lists every calendar in full
//! and migrates existing events whose category now routes elsewhere.

use clap::Subcommand;

use calsync_core::sync::CalendarMapping;
use calsync_core::Config;

use super::CliResult;

#[derive(Subcommand)]
pub enum MapAction {
    /// Show every category mapping
    List {
        #[arg(long)]
        json: bool,
    },
    /// Route a category to a remote calendar
    Set {
        /// Category id
        category: String,
        /// Remote calendar id
        calendar_id: String,
        /// Display name of the calendar
        name: Option<String>,
    },
    /// Remove a category mapping
    Remove {
        /// Category id
        category: String,
    },
}

pub fn run(action: MapAction) -> CliResult {
    let mut config = Config::load()?;
    match action {
        MapAction::List { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&config.mappings)?);
                return Ok(());
            }
            if config.mappings.is_empty() {
                println!("No category mappings.");
            }
            for (category, mapping) in &config.mappings {
                if mapping.calendar_name.is_empty() {
                    println!("{category} -> {}", mapping.calendar_id);
                } else {
                    println!(
                        "{category} -> {} ({})",
                        mapping.calendar_id, mapping.calendar_name
                    );
                }
            }
            if let Some(default) = &config.graph.default_calendar_id {
                println!("(default) -> {default}");
            }
        }
        MapAction::Set {
            category,
            calendar_id,
            name,
        } => {
            let previous = config
                .mappings
                .insert(
                    category.clone(),
                    CalendarMapping::new(&calendar_id, name.unwrap_or_default()),
                );
            config.save()?;
            match previous {
                Some(old) if old.calendar_id != calendar_id => println!(
                    "{category}: {} -> {calendar_id} (events migrate on next sync)",
                    old.calendar_id
                ),
                _ => println!("{category} -> {calendar_id}"),
            }
        }
        MapAction::Remove { category } => {
            if config.mappings.remove(&category).is_none() {
                return Err(format!("no mapping for category: {category}").into());
            }
            config.save()?;
            println!("Removed mapping for {category}");
        }
    }
    Ok(())
}
