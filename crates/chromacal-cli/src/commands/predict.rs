//! `chromacal predict` — per-tile colour confidences for a live image.

use std::path::Path;

use chromacal_core::{ChromacalConfig, Classifier, ColorVector, Result, TileReport};

use super::{Workspace, pct};

/// Run the predict command.
pub fn run(
    workspace: &Workspace,
    config: &ChromacalConfig,
    image: &Path,
    output: Option<&Path>,
) -> Result<()> {
    let (store, refiner) = workspace.load(config)?;
    let classifier = Classifier::new(config);
    let sync = classifier.sync(&store, &refiner);
    if classifier.registry().is_empty() {
        println!("No finalized pixels yet: ingest sessions and run `chromacal review` first.");
        return Ok(());
    }
    log::info!("{} tile indexes built", sync.rebuilt.len());

    let live: Vec<ColorVector> = serde_json::from_str(&std::fs::read_to_string(image)?)?;
    let reports = classifier.predict(&live);
    print_reports(&reports, config.prediction.percentile);

    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&reports)?)?;
        println!("\nReports written to {}", path.display());
    }
    Ok(())
}

fn print_reports(reports: &[TileReport], percentile: f64) {
    println!("P{percentile} confidence per tile (* = best, ? = no evidence)");
    for report in reports {
        let best = report.best().map(|b| b.color_label.clone());
        let cells: Vec<String> = report
            .results
            .iter()
            .map(|r| {
                let mark = if r.no_evidence {
                    "?"
                } else if Some(&r.color_label) == best.as_ref() {
                    "*"
                } else {
                    " "
                };
                format!("{}{} {}", mark, r.color_label, pct(r.aggregated_confidence))
            })
            .collect();
        println!(
            "  {:<8} {:>3} px  {}",
            report.tile_id.to_string(),
            report.pixels.len(),
            cells.join("  ")
        );
    }
}
