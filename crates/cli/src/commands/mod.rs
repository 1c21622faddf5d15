//! Command implementations.

mod info;
mod run;
mod validate;

use std::path::Path;

use anyhow::Result;
use contracts::RunBlueprint;

use crate::error::CliError;

pub use info::run_info;
pub use run::run_engine;
pub use validate::run_validate;

/// Load and validate a blueprint
fn load_blueprint(path: &Path) -> Result<RunBlueprint> {
    if !path.exists() {
        return Err(CliError::config_not_found(path.display().to_string()).into());
    }
    config_loader::ConfigLoader::load_from_path(path)
        .map_err(|e| anyhow::Error::from(CliError::config_invalid(e.to_string())))
}
