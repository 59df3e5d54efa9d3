//! `chromacal status` — assignment overview.

use chromacal_core::{ChromacalConfig, EvaluationStatus, PixelAssignment, PixelId, Result};

use super::{Workspace, pct};

/// Run the status command.
pub fn run(
    workspace: &Workspace,
    config: &ChromacalConfig,
    pixel: Option<u32>,
    all: bool,
) -> Result<()> {
    let (store, refiner) = workspace.load(config)?;

    if let Some(p) = pixel {
        let pixel = PixelId(p);
        println!(
            "{pixel}: {} observations over {} sessions",
            store.query_by_pixel(pixel).len(),
            store.session_count(pixel)
        );
        match refiner.query_assignment(pixel) {
            Ok(a) => print_row(a),
            // Per-pixel conditions are reported, not fatal.
            Err(e) => println!("  {e}"),
        }
        return Ok(());
    }

    println!(
        "{} observations, {} sessions, {} pixels, {} labels",
        store.len(),
        store.sessions().len(),
        store.pixels().len(),
        store.labels().len()
    );
    for (state, count) in refiner.count_by_state() {
        println!("  {state:<10} {count}");
    }

    let snapshot = refiner.snapshot();
    let unresolved = snapshot
        .iter()
        .filter(|a| a.status == EvaluationStatus::Unresolved)
        .count();
    if unresolved > 0 {
        println!("  {unresolved} unresolved: use `chromacal finalize <pixel> <tile>` to override");
    }

    if all && !snapshot.is_empty() {
        println!();
        println!(
            "  {:<8} {:<10} {:<8} {:>8} {:>10}  {}",
            "Pixel", "State", "Tile", "Conf", "Alpha", "Status"
        );
        for a in &snapshot {
            print_row(a);
        }
    }
    Ok(())
}

fn print_row(a: &PixelAssignment) {
    let status = match &a.status {
        EvaluationStatus::Ambiguous { candidates } => format!(
            "ambiguous: {}",
            candidates.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", ")
        ),
        EvaluationStatus::NotEvaluated => "not evaluated".into(),
        EvaluationStatus::InsufficientData => "insufficient data".into(),
        EvaluationStatus::Supported => "supported".into(),
        EvaluationStatus::Unresolved => "unresolved".into(),
    };
    println!(
        "  {:<8} {:<10} {:<8} {:>8} {:>10.2e}  {}",
        a.pixel_id.to_string(),
        a.state.to_string(),
        a.tile_id.map(|t| t.to_string()).unwrap_or_else(|| "-".into()),
        pct(a.confidence),
        a.alpha_used,
        status
    );
}
