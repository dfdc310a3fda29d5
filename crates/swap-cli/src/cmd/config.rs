use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use std::path::Path;
use swap_core::config::{CoordinatorConfig, WarnLevel};

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective configuration, defaults filled in
    Show,
    /// Check .swap/config.yaml for problems
    Validate,
}

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    let config = CoordinatorConfig::load(root).context("failed to load config")?;

    match subcmd {
        ConfigSubcommand::Show => {
            if json {
                print_json(&config)?;
            } else {
                print!("{}", serde_yaml::to_string(&config)?);
            }
        }
        ConfigSubcommand::Validate => {
            let warnings = config.validate();
            if json {
                print_json(&serde_json::json!({
                    "valid": !warnings.iter().any(|w| w.level == WarnLevel::Error),
                    "warnings": warnings,
                }))?;
            } else if warnings.is_empty() {
                println!("Config is valid.");
            } else {
                for w in &warnings {
                    let prefix = match w.level {
                        WarnLevel::Warning => "warning",
                        WarnLevel::Error => "error",
                    };
                    println!("[{prefix}] {}", w.message);
                }
            }
            if warnings.iter().any(|w| w.level == WarnLevel::Error) {
                anyhow::bail!("config validation found errors");
            }
        }
    }

    Ok(())
}
