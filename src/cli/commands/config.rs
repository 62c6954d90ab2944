//! Config Command
//!
//! Usage:
//!   testflow config show [-g] [-f json]
//!   testflow config path
//!   testflow config init [-g] [--force]

use crate::cli::ui::Output;
use crate::config::ConfigLoader;
use crate::types::Result;

/// Show configuration
pub fn show(global: bool, format: &str) -> Result<()> {
    if !global {
        // Merged effective config
        return ConfigLoader::show_config(format == "json");
    }

    match ConfigLoader::global_config_path() {
        Some(global_path) if global_path.exists() => {
            let content = std::fs::read_to_string(&global_path)?;
            println!("# Global Config: {}\n", global_path.display());
            println!("{}", content);
        }
        Some(_) => {
            println!("No global config found.");
            println!("Run 'testflow config init --global' to create one.");
        }
        None => println!("Cannot determine global config directory."),
    }
    Ok(())
}

/// Show configuration paths
pub fn path() -> Result<()> {
    ConfigLoader::show_path();
    Ok(())
}

pub fn init(global: bool, force: bool) -> Result<()> {
    let output = Output::new();

    if global {
        let dir = ConfigLoader::init_global(force)?;
        output.success("Initialized global configuration");
        output.field("Directory:", &dir.display().to_string());
        if let Some(config_path) = ConfigLoader::global_config_path() {
            output.field("Config:", &config_path.display().to_string());
        }
    } else {
        let dir = ConfigLoader::init_project(force)?;
        output.success("Initialized project configuration");
        output.field("Directory:", &dir.display().to_string());
        output.field(
            "Config:",
            &ConfigLoader::project_config_path().display().to_string(),
        );
    }
    Ok(())
}
