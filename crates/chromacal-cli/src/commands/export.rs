//! `chromacal export` — write the observation store to a portable file.

use std::path::Path;

use chromacal_core::{ChromacalConfig, Result};

use super::Workspace;

/// Run the export command.
pub fn run(
    workspace: &Workspace,
    config: &ChromacalConfig,
    output: &Path,
    state: Option<&Path>,
) -> Result<()> {
    let (store, refiner) = workspace.load(config)?;
    let id = chromacal_core::save_store(&store, output)?;
    println!(
        "Exported {} observations from {} sessions to {} (snapshot {id})",
        store.len(),
        store.sessions().len(),
        output.display()
    );
    if let Some(path) = state {
        chromacal_core::save_state(&refiner.state(), path)?;
        println!("Assignments written to {}", path.display());
    }
    Ok(())
}
