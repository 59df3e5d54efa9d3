//! `chromacal review` — accept or reject converged pixels.
//!
//! Answers are read on a background thread so the prompt loop can react to
//! Ctrl+C: an interrupted review returns the pixel to `Active` (nothing is
//! lost) and saves every decision made so far.

use std::io::BufRead;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use chromacal_core::{
    ChromacalConfig, ChromacalError, Confirmation, PixelId, Result, ReviewDecision, TileId,
};

use super::{Workspace, pct};

const POLL: Duration = Duration::from_millis(100);

/// Map a typed answer to a confirmation. `None` means skip.
fn parse_answer(line: &str) -> Option<Option<Confirmation>> {
    match line.trim().to_lowercase().as_str() {
        "a" | "y" | "yes" | "accept" => Some(Some(Confirmation::Accept)),
        "r" | "n" | "no" | "reject" => Some(Some(Confirmation::Reject)),
        "s" | "skip" | "" => Some(None),
        "q" | "quit" => Some(Some(Confirmation::Cancel)),
        _ => None,
    }
}

/// Run the review command.
pub fn run(workspace: &Workspace, config: &ChromacalConfig, accept_all: bool) -> Result<()> {
    let (_, mut refiner) = workspace.load(config)?;
    let requests = refiner.pending_reviews();
    if requests.is_empty() {
        println!("No pixels awaiting review.");
        return Ok(());
    }

    let (decision_tx, decisions) = mpsc::channel::<ReviewDecision>();

    if accept_all {
        for r in &requests {
            let _ = decision_tx.send(ReviewDecision {
                pixel: r.pixel,
                tile: r.tile,
                confirmation: Confirmation::Accept,
            });
        }
    } else {
        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = interrupted.clone();
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
            .map_err(|e| ChromacalError::Io(std::io::Error::other(e)))?;

        let (line_tx, lines) = mpsc::channel::<String>();
        std::thread::spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        });

        println!("{} pixel(s) to review. [a]ccept, [r]eject, [s]kip, [q]uit", requests.len());
        'requests: for r in &requests {
            println!(
                "  {:<8} -> {:<8} confidence {}  alpha {:.2e}",
                r.pixel.to_string(),
                r.tile.to_string(),
                pct(r.confidence),
                r.alpha_used
            );
            loop {
                if interrupted.load(Ordering::SeqCst) {
                    println!("\n  interrupted: {} returned to active", r.pixel);
                    let _ = decision_tx.send(cancel(r.pixel, r.tile));
                    break 'requests;
                }
                match lines.recv_timeout(POLL) {
                    Ok(line) => match parse_answer(&line) {
                        Some(Some(Confirmation::Cancel)) => {
                            let _ = decision_tx.send(cancel(r.pixel, r.tile));
                            break 'requests;
                        }
                        Some(Some(confirmation)) => {
                            let _ = decision_tx.send(ReviewDecision {
                                pixel: r.pixel,
                                tile: r.tile,
                                confirmation,
                            });
                            break;
                        }
                        Some(None) => break,
                        None => println!("  answer a, r, s or q"),
                    },
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        // stdin closed: leave the rest converged.
                        break 'requests;
                    }
                }
            }
        }
    }
    drop(decision_tx);

    let mut finalized = 0usize;
    for (pixel, outcome) in refiner.apply_decisions(&decisions) {
        match outcome {
            Ok(state) => {
                log::debug!("{pixel} -> {state}");
                finalized += usize::from(state == chromacal_core::AssignmentState::Finalized);
            }
            Err(e) => eprintln!("  {e}"),
        }
    }
    workspace.save_state(&refiner)?;
    println!(
        "{finalized} pixel(s) finalized, {} still awaiting review",
        refiner.pending_reviews().len()
    );
    Ok(())
}

fn cancel(pixel: PixelId, tile: TileId) -> ReviewDecision {
    ReviewDecision {
        pixel,
        tile,
        confirmation: Confirmation::Cancel,
    }
}

/// Run the finalize command: manual override for one pixel.
pub fn finalize(
    workspace: &Workspace,
    config: &ChromacalConfig,
    pixel: u32,
    tile: u32,
) -> Result<()> {
    let (_, mut refiner) = workspace.load(config)?;
    refiner.track(PixelId(pixel));
    refiner.force_finalize(PixelId(pixel), TileId(tile))?;
    workspace.save_state(&refiner)?;
    println!("{} finalized on {}", PixelId(pixel), TileId(tile));
    Ok(())
}
