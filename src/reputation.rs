use crate::config::ReputationConfig;
use crate::database::Database;
use crate::model::{Evaluation, ProposalState, ReputationSnapshot};
use crate::notify::{Notification, NotificationKind, Notifier, TradeEvent};
use crate::{ProposalId, Result, TradeError, UserId};
use chrono::Utc;
use std::collections::HashMap;

/// Consumes completed proposals and evaluations and maintains each user's
/// weighted reputation snapshot.
#[derive(Clone)]
pub struct ReputationService {
    db: Database,
    config: ReputationConfig,
    notifier: Notifier,
}

impl ReputationService {
    pub fn new(db: Database, config: ReputationConfig, notifier: Notifier) -> Self {
        Self {
            db,
            config,
            notifier,
        }
    }

    pub async fn submit(
        &self,
        evaluator_id: UserId,
        proposal_id: ProposalId,
        overall_score: u8,
        dimension_scores: HashMap<String, u8>,
    ) -> Result<Evaluation> {
        let proposal = self
            .db
            .get_proposal(proposal_id)
            .await?
            .ok_or(TradeError::ProposalNotFound(proposal_id))?;

        if proposal.state != ProposalState::Completed {
            return Err(TradeError::NotEligible(format!(
                "Proposal {} is {}, not completed",
                proposal_id, proposal.state
            )));
        }
        let evaluated_id = proposal.counterparty(evaluator_id).ok_or_else(|| {
            TradeError::NotEligible(format!(
                "User {evaluator_id} is not a party to proposal {proposal_id}"
            ))
        })?;

        for dimension in dimension_scores.keys() {
            if !self.config.dimension_weights.contains_key(dimension) {
                return Err(TradeError::Validation(format!(
                    "Unknown evaluation dimension: {dimension}"
                )));
            }
        }

        let evaluation = Evaluation::new(
            proposal_id,
            evaluator_id,
            evaluated_id,
            overall_score,
            dimension_scores,
        );
        evaluation.validate()?;
        self.db.create_evaluation(&evaluation).await?;

        tracing::info!(
            "Evaluation stored: {} scored {} on proposal {}",
            evaluator_id,
            evaluated_id,
            proposal_id
        );

        // The evaluation itself is committed; a failed recompute leaves a
        // stale snapshot that the next evaluation event repairs.
        match self.recompute(evaluated_id).await {
            Ok(snapshot) => {
                self.notifier.events().publish_user(
                    evaluated_id,
                    TradeEvent::ReputationUpdated {
                        user_id: evaluated_id,
                        score: snapshot.score,
                    },
                );
            }
            Err(e) => {
                tracing::warn!(
                    "Reputation recompute for {} failed (will retry on next evaluation): {}",
                    evaluated_id,
                    e
                );
            }
        }

        self.notifier.dispatch(
            evaluated_id,
            Notification::new(
                NotificationKind::EvaluationReceived,
                proposal_id,
                "New evaluation",
                "Your swap partner left you an evaluation.",
            ),
        );

        Ok(evaluation)
    }

    pub async fn get(&self, user_id: UserId) -> Result<ReputationSnapshot> {
        Ok(self
            .db
            .get_reputation(user_id)
            .await?
            .unwrap_or_else(|| ReputationSnapshot::empty(user_id)))
    }

    /// Recomputes the snapshot from the full evaluation set; idempotent for a
    /// fixed set of evaluations.
    pub async fn recompute(&self, user_id: UserId) -> Result<ReputationSnapshot> {
        let evaluations = self.db.evaluations_for(user_id).await?;

        let snapshot = if evaluations.is_empty() {
            ReputationSnapshot::empty(user_id)
        } else {
            let total: f64 = evaluations
                .iter()
                .map(|e| {
                    blended_score(
                        e,
                        self.config.overall_blend,
                        &self.config.dimension_weights,
                    )
                })
                .sum();
            ReputationSnapshot {
                user_id,
                score: round_half_up_2(total / evaluations.len() as f64),
                evaluation_count: evaluations.len() as i64,
                updated_at: Utc::now(),
            }
        };

        self.db.upsert_reputation(&snapshot).await?;
        Ok(snapshot)
    }
}

/// Blends the direct overall score with the weighted mean of the per-dimension
/// scores. Evaluations without dimension scores fall back to the overall score.
fn blended_score(evaluation: &Evaluation, blend: f64, weights: &HashMap<String, f64>) -> f64 {
    let overall = evaluation.overall_score as f64;
    match weighted_dimension_mean(&evaluation.dimension_scores, weights) {
        Some(composite) => blend * overall + (1.0 - blend) * composite,
        None => overall,
    }
}

/// Weighted mean over the dimensions present, with weights renormalized so a
/// partial evaluation is not penalized for the dimensions it skipped.
fn weighted_dimension_mean(
    scores: &HashMap<String, u8>,
    weights: &HashMap<String, f64>,
) -> Option<f64> {
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    for (dimension, score) in scores {
        let weight = weights.get(dimension).copied()?;
        weighted_sum += weight * *score as f64;
        weight_total += weight;
    }
    if weight_total > 0.0 {
        Some(weighted_sum / weight_total)
    } else {
        None
    }
}

/// Deterministic round-half-up to 2 decimals (scores are never negative).
fn round_half_up_2(value: f64) -> f64 {
    (value * 100.0 + 0.5).floor() / 100.0
}
