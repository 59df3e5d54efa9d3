//! Iterative pixel → tile assignment with decreasing tolerance for ambiguity.
//!
//! Each pixel moves through `Pending → Active → Converged → Finalized`:
//!
//! ```text
//!  Pending ──first session──▶ Active ──N sessions above 1-α──▶ Converged
//!                              ▲  ▲                              │   │
//!                              │  └──── reject / cancel / lost ──┘   │ accept
//!                              │                                     ▼
//!                              └──────────── (never) ─────────── Finalized
//! ```
//!
//! Statistical work (per-session evaluation) and human review are decoupled:
//! the refiner publishes a [`ReviewRequest`] whenever a pixel converges and
//! consumes [`ReviewDecision`]s without blocking. Reads for display
//! ([`Refiner::snapshot`]) never mutate state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};

use serde::{Deserialize, Serialize};

use crate::config::{CalibrationConfig, ChromacalConfig};
use crate::error::{ChromacalError, Result};
use crate::significance::{Significance, SignificanceEngine};
use crate::store::SampleStore;
use crate::types::{PixelId, SessionId, TileId};

/// Lifecycle of a pixel assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssignmentState {
    /// Known to the refiner, not observed yet.
    Pending,
    /// Accumulating evidence.
    Active,
    /// Evidence cleared the bar; awaiting external confirmation.
    Converged,
    /// Confirmed. Immutable for the rest of the run.
    Finalized,
}

impl std::fmt::Display for AssignmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Converged => write!(f, "converged"),
            Self::Finalized => write!(f, "finalized"),
        }
    }
}

/// Outcome of the most recent evaluation of a pixel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EvaluationStatus {
    NotEvaluated,
    InsufficientData,
    Ambiguous { candidates: Vec<TileId> },
    Supported,
    /// Alpha reached its floor without convergence.
    Unresolved,
}

/// Current belief about which tile a pixel belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PixelAssignment {
    pub pixel_id: PixelId,
    /// Held best candidate, if any.
    pub tile_id: Option<TileId>,
    pub confidence: f64,
    pub alpha_used: f64,
    pub state: AssignmentState,
    /// Consecutive sessions in which the held tile cleared `1 - alpha_used`.
    pub streak: u32,
    /// Sessions that evaluated this pixel.
    pub rounds: u32,
    pub status: EvaluationStatus,
}

impl PixelAssignment {
    fn new(pixel_id: PixelId, alpha: f64) -> Self {
        Self {
            pixel_id,
            tile_id: None,
            confidence: 0.0,
            alpha_used: alpha,
            state: AssignmentState::Pending,
            streak: 0,
            rounds: 0,
            status: EvaluationStatus::NotEvaluated,
        }
    }
}

/// External verdict on a converged pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confirmation {
    /// `Converged → Finalized`.
    Accept,
    /// `Converged → Active`, alpha reset to its initial value.
    Reject,
    /// The review was abandoned: `Converged → Active`, nothing else changes.
    Cancel,
}

/// Published when a pixel converges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub pixel: PixelId,
    pub tile: TileId,
    pub confidence: f64,
    pub alpha_used: f64,
}

/// Reviewer's answer to a [`ReviewRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub pixel: PixelId,
    /// Tile the reviewer saw. A decision about a tile the pixel no longer
    /// holds is stale and rejected.
    pub tile: TileId,
    pub confirmation: Confirmation,
}

/// Per-session summary of a refinement round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundReport {
    pub session: Option<SessionId>,
    pub evaluated: usize,
    pub converged: Vec<PixelId>,
    pub insufficient: usize,
    pub ambiguous: usize,
    pub unresolved: usize,
}

/// Serializable refiner state, so review decisions survive restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefinerState {
    pub assignments: Vec<PixelAssignment>,
    pub applied_sessions: Vec<SessionId>,
}

/// Drives calibration rounds and owns every [`PixelAssignment`].
pub struct Refiner {
    config: CalibrationConfig,
    engine: SignificanceEngine,
    workers: usize,
    assignments: BTreeMap<PixelId, PixelAssignment>,
    applied: BTreeSet<SessionId>,
    applied_order: Vec<SessionId>,
    review_tx: Option<Sender<ReviewRequest>>,
}

impl Refiner {
    pub fn new(config: &ChromacalConfig) -> Self {
        Self {
            config: config.calibration.clone(),
            engine: SignificanceEngine::from_config(&config.calibration),
            workers: config.worker_count(),
            assignments: BTreeMap::new(),
            applied: BTreeSet::new(),
            applied_order: Vec::new(),
            review_tx: None,
        }
    }

    /// Resume from a previously exported state.
    pub fn restore(config: &ChromacalConfig, state: RefinerState) -> Self {
        let mut refiner = Self::new(config);
        refiner.applied = state.applied_sessions.iter().copied().collect();
        refiner.applied_order = state.applied_sessions;
        refiner.assignments = state
            .assignments
            .into_iter()
            .map(|a| (a.pixel_id, a))
            .collect();
        refiner
    }

    pub fn state(&self) -> RefinerState {
        RefinerState {
            assignments: self.assignments.values().cloned().collect(),
            applied_sessions: self.applied_order.clone(),
        }
    }

    /// Register a pixel before any session has observed it.
    pub fn track(&mut self, pixel: PixelId) {
        let alpha = self.config.initial_alpha;
        self.assignments
            .entry(pixel)
            .or_insert_with(|| PixelAssignment::new(pixel, alpha));
    }

    /// Receive a [`ReviewRequest`] for every pixel that converges from now on.
    /// Pixels already converged are announced immediately.
    pub fn subscribe(&mut self) -> Receiver<ReviewRequest> {
        let (tx, rx) = std::sync::mpsc::channel();
        for request in self.pending_reviews() {
            let _ = tx.send(request);
        }
        self.review_tx = Some(tx);
        rx
    }

    // -----------------------------------------------------------------------
    // Refinement rounds
    // -----------------------------------------------------------------------

    /// Run one round per store session not yet applied, in ingest order.
    pub fn refine(&mut self, store: &SampleStore) -> Vec<RoundReport> {
        let pending: Vec<SessionId> = store
            .sessions()
            .iter()
            .copied()
            .filter(|s| !self.applied.contains(s))
            .collect();
        pending
            .into_iter()
            .map(|session| self.refine_session(store, session))
            .collect()
    }

    fn refine_session(&mut self, store: &SampleStore, session: SessionId) -> RoundReport {
        let pixels: Vec<PixelId> = store
            .query_by_session(session)
            .iter()
            .map(|o| o.pixel_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|p| {
                self.assignments
                    .get(p)
                    .is_none_or(|a| a.state != AssignmentState::Finalized)
            })
            .collect();

        let evaluations = self.evaluate_parallel(store, session, &pixels);

        let mut report = RoundReport {
            session: Some(session),
            evaluated: evaluations.len(),
            ..Default::default()
        };
        for (pixel, significance) in evaluations {
            let converged = self.apply(pixel, &significance);
            match &self.assignments[&pixel].status {
                EvaluationStatus::InsufficientData => report.insufficient += 1,
                EvaluationStatus::Ambiguous { .. } => report.ambiguous += 1,
                EvaluationStatus::Unresolved => report.unresolved += 1,
                _ => {}
            }
            if converged {
                report.converged.push(pixel);
            }
        }

        self.applied.insert(session);
        self.applied_order.push(session);
        log::info!(
            "refined {session}: {} pixels, {} converged, {} insufficient, {} ambiguous, \
             {} unresolved",
            report.evaluated,
            report.converged.len(),
            report.insufficient,
            report.ambiguous,
            report.unresolved
        );
        report
    }

    /// Evaluate pixels independently across worker threads.
    fn evaluate_parallel(
        &self,
        store: &SampleStore,
        session: SessionId,
        pixels: &[PixelId],
    ) -> Vec<(PixelId, Significance)> {
        let engine = &self.engine;
        let evaluate = |chunk: &[PixelId]| -> Vec<(PixelId, Significance)> {
            chunk
                .iter()
                .map(|&p| {
                    let observations = store.query_by_pixel_through(p, session);
                    (p, engine.evaluate(&observations))
                })
                .collect()
        };

        if self.workers <= 1 || pixels.len() < 2 * self.workers {
            return evaluate(pixels);
        }

        let chunk_size = pixels.len().div_ceil(self.workers);
        std::thread::scope(|s| {
            let handles: Vec<_> = pixels
                .chunks(chunk_size)
                .map(|chunk| s.spawn(move || evaluate(chunk)))
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        })
    }

    /// Fold one evaluation into a pixel's assignment. Returns whether the pixel
    /// converged in this round.
    fn apply(&mut self, pixel: PixelId, significance: &Significance) -> bool {
        let cfg = &self.config;
        let a = self
            .assignments
            .entry(pixel)
            .or_insert_with(|| PixelAssignment::new(pixel, cfg.initial_alpha));

        match a.state {
            AssignmentState::Finalized => return false,
            AssignmentState::Pending => {
                log::debug!("{pixel}: pending -> active");
                a.state = AssignmentState::Active;
            }
            AssignmentState::Active | AssignmentState::Converged => {}
        }
        a.rounds += 1;

        let previous = a.tile_id;
        match significance {
            Significance::InsufficientData => {
                a.status = EvaluationStatus::InsufficientData;
                a.streak = 0;
            }
            Significance::Ambiguous { candidates, .. } => {
                a.status = EvaluationStatus::Ambiguous {
                    candidates: candidates.clone(),
                };
                a.streak = 0;
            }
            Significance::Best { best, scores } => {
                // Displacing the held tile requires significance at the
                // current (shrinking) alpha.
                let accept = match previous {
                    None => true,
                    Some(held) => held == best.tile || best.p_value < a.alpha_used,
                };
                if accept {
                    a.tile_id = Some(best.tile);
                    a.confidence = best.confidence;
                } else {
                    a.confidence = scores
                        .iter()
                        .find(|s| Some(s.tile) == previous)
                        .map_or(0.0, |s| s.confidence);
                }
                let supported = accept && best.confidence > 1.0 - a.alpha_used;
                a.streak = match (supported, previous == a.tile_id) {
                    (false, _) => 0,
                    (true, true) => a.streak + 1,
                    (true, false) => 1,
                };
                a.status = EvaluationStatus::Supported;
            }
        }

        match a.state {
            AssignmentState::Active => {
                if a.streak >= cfg.convergence_rounds && a.tile_id.is_some() {
                    a.state = AssignmentState::Converged;
                    log::info!(
                        "{pixel}: converged on {:?} (confidence {:.4}, alpha {:.2e})",
                        a.tile_id,
                        a.confidence,
                        a.alpha_used
                    );
                    let request = ReviewRequest {
                        pixel,
                        tile: a.tile_id.unwrap_or(TileId(0)),
                        confidence: a.confidence,
                        alpha_used: a.alpha_used,
                    };
                    if let Some(tx) = &self.review_tx
                        && tx.send(request).is_err()
                    {
                        log::debug!("review channel closed; dropping subscriber");
                        self.review_tx = None;
                    }
                    return true;
                }
                let decayed = (a.alpha_used * cfg.decay_factor).max(cfg.alpha_floor);
                a.alpha_used = decayed.min(a.alpha_used);
                if a.alpha_used <= cfg.alpha_floor {
                    if a.status != EvaluationStatus::Unresolved {
                        log::warn!(
                            "{pixel}: alpha reached floor {:.2e} unconverged",
                            cfg.alpha_floor
                        );
                    }
                    a.status = EvaluationStatus::Unresolved;
                }
            }
            AssignmentState::Converged => {
                if a.streak == 0 || previous != a.tile_id {
                    log::info!("{pixel}: lost support, converged -> active");
                    a.state = AssignmentState::Active;
                }
            }
            AssignmentState::Pending | AssignmentState::Finalized => {}
        }
        false
    }

    // -----------------------------------------------------------------------
    // Confirmation
    // -----------------------------------------------------------------------

    /// Apply an external verdict to a converged pixel.
    pub fn confirm(
        &mut self,
        pixel: PixelId,
        confirmation: Confirmation,
    ) -> Result<AssignmentState> {
        let initial_alpha = self.config.initial_alpha;
        let a = self
            .assignments
            .get_mut(&pixel)
            .ok_or(ChromacalError::UnknownPixel(pixel))?;
        if a.state != AssignmentState::Converged {
            return Err(ChromacalError::InvalidTransition {
                pixel,
                state: a.state.to_string(),
                action: match confirmation {
                    Confirmation::Accept => "accept",
                    Confirmation::Reject => "reject",
                    Confirmation::Cancel => "cancel review of",
                },
            });
        }
        match confirmation {
            Confirmation::Accept => {
                a.state = AssignmentState::Finalized;
                log::info!("{pixel}: finalized on {:?}", a.tile_id);
            }
            Confirmation::Reject => {
                a.state = AssignmentState::Active;
                a.alpha_used = initial_alpha;
                a.streak = 0;
                a.tile_id = None;
                a.confidence = 0.0;
                log::info!("{pixel}: rejected, alpha reset to {initial_alpha}");
            }
            Confirmation::Cancel => {
                a.state = AssignmentState::Active;
                log::debug!("{pixel}: review cancelled");
            }
        }
        Ok(a.state)
    }

    /// Apply a reviewer decision, refusing decisions about a tile the pixel
    /// no longer holds.
    pub fn decide(&mut self, decision: &ReviewDecision) -> Result<AssignmentState> {
        let held = self
            .assignments
            .get(&decision.pixel)
            .ok_or(ChromacalError::UnknownPixel(decision.pixel))?;
        if held.tile_id != Some(decision.tile) {
            return Err(ChromacalError::InvalidTransition {
                pixel: decision.pixel,
                state: format!("holding {:?}", held.tile_id),
                action: "apply stale decision to",
            });
        }
        self.confirm(decision.pixel, decision.confirmation)
    }

    /// Drain every decision currently queued without blocking.
    pub fn apply_decisions(
        &mut self,
        decisions: &Receiver<ReviewDecision>,
    ) -> Vec<(PixelId, Result<AssignmentState>)> {
        let mut results = Vec::new();
        loop {
            match decisions.try_recv() {
                Ok(decision) => {
                    let outcome = self.decide(&decision);
                    if let Err(e) = &outcome {
                        log::warn!("review decision ignored: {e}");
                    }
                    results.push((decision.pixel, outcome));
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        results
    }

    /// Finalize a pixel onto a tile chosen by the operator, bypassing the
    /// statistics. Used for pixels stuck `Unresolved`.
    pub fn force_finalize(&mut self, pixel: PixelId, tile: TileId) -> Result<()> {
        let a = self
            .assignments
            .get_mut(&pixel)
            .ok_or(ChromacalError::UnknownPixel(pixel))?;
        if a.state == AssignmentState::Finalized {
            return Err(ChromacalError::InvalidTransition {
                pixel,
                state: a.state.to_string(),
                action: "override",
            });
        }
        log::info!("{pixel}: manually finalized on {tile}");
        a.tile_id = Some(tile);
        a.state = AssignmentState::Finalized;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Current assignment for one pixel, or the reason there is none.
    pub fn query_assignment(&self, pixel: PixelId) -> Result<&PixelAssignment> {
        let a = self
            .assignments
            .get(&pixel)
            .ok_or(ChromacalError::UnknownPixel(pixel))?;
        match (&a.state, &a.status) {
            (AssignmentState::Finalized | AssignmentState::Converged, _) => Ok(a),
            (AssignmentState::Pending, _)
            | (_, EvaluationStatus::NotEvaluated | EvaluationStatus::InsufficientData) => {
                Err(ChromacalError::InsufficientData { pixel })
            }
            (_, EvaluationStatus::Ambiguous { candidates }) => Err(ChromacalError::Ambiguous {
                pixel,
                candidates: candidates.clone(),
            }),
            (_, EvaluationStatus::Unresolved) => Err(ChromacalError::Unresolved { pixel }),
            (_, EvaluationStatus::Supported) => Ok(a),
        }
    }

    pub fn assignment(&self, pixel: PixelId) -> Option<&PixelAssignment> {
        self.assignments.get(&pixel)
    }

    /// Every `Active` or `Converged` assignment, for display.
    pub fn snapshot(&self) -> Vec<PixelAssignment> {
        self.assignments
            .values()
            .filter(|a| {
                matches!(
                    a.state,
                    AssignmentState::Active | AssignmentState::Converged
                )
            })
            .cloned()
            .collect()
    }

    /// Converged pixels awaiting a verdict.
    pub fn pending_reviews(&self) -> Vec<ReviewRequest> {
        self.assignments
            .values()
            .filter(|a| a.state == AssignmentState::Converged)
            .filter_map(|a| {
                a.tile_id.map(|tile| ReviewRequest {
                    pixel: a.pixel_id,
                    tile,
                    confidence: a.confidence,
                    alpha_used: a.alpha_used,
                })
            })
            .collect()
    }

    /// Finalized pixels grouped by tile, pixel ids ascending.
    pub fn finalized_by_tile(&self) -> BTreeMap<TileId, Vec<PixelId>> {
        let mut out: BTreeMap<TileId, Vec<PixelId>> = BTreeMap::new();
        for a in self.assignments.values() {
            if let (AssignmentState::Finalized, Some(tile)) = (a.state, a.tile_id) {
                out.entry(tile).or_default().push(a.pixel_id);
            }
        }
        out
    }

    pub fn count_by_state(&self) -> BTreeMap<String, usize> {
        let mut out = BTreeMap::new();
        for a in self.assignments.values() {
            *out.entry(a.state.to_string()).or_insert(0) += 1;
        }
        out
    }

    pub fn applied_sessions(&self) -> &[SessionId] {
        &self.applied_order
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
