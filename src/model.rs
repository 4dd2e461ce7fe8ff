use crate::{GarmentId, MessageId, ProposalId, Result, TradeError, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingState {
    Available,
    InNegotiation,
    Swapped,
    Withdrawn,
}

impl BindingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingState::Available => "available",
            BindingState::InNegotiation => "in_negotiation",
            BindingState::Swapped => "swapped",
            BindingState::Withdrawn => "withdrawn",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "available" => Ok(BindingState::Available),
            "in_negotiation" => Ok(BindingState::InNegotiation),
            "swapped" => Ok(BindingState::Swapped),
            "withdrawn" => Ok(BindingState::Withdrawn),
            other => Err(TradeError::Validation(format!(
                "Invalid binding state: {other}"
            ))),
        }
    }
}

impl fmt::Display for BindingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Garment {
    pub id: GarmentId,
    pub owner_id: UserId,
    pub title: String,
    pub binding_state: BindingState,
    /// Proposal holding the exclusive reservation, set iff `InNegotiation`.
    pub reserved_by: Option<ProposalId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Garment {
    pub fn new(owner_id: UserId, title: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id,
            title,
            binding_state: BindingState::Available,
            reserved_by: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    Pending,
    Accepted,
    Rejected,
    Cancelled,
    Expired,
    Completed,
}

impl ProposalState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProposalState::Rejected
                | ProposalState::Cancelled
                | ProposalState::Expired
                | ProposalState::Completed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalState::Pending => "pending",
            ProposalState::Accepted => "accepted",
            ProposalState::Rejected => "rejected",
            ProposalState::Cancelled => "cancelled",
            ProposalState::Expired => "expired",
            ProposalState::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ProposalState::Pending),
            "accepted" => Ok(ProposalState::Accepted),
            "rejected" => Ok(ProposalState::Rejected),
            "cancelled" => Ok(ProposalState::Cancelled),
            "expired" => Ok(ProposalState::Expired),
            "completed" => Ok(ProposalState::Completed),
            other => Err(TradeError::Validation(format!(
                "Invalid proposal state: {other}"
            ))),
        }
    }
}

impl fmt::Display for ProposalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosureReason {
    Rejected,
    Cancelled,
    Expired,
    /// Rejected as a side effect of a competing proposal being accepted.
    LostToAcceptedTrade,
    Completed,
}

impl ClosureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClosureReason::Rejected => "rejected",
            ClosureReason::Cancelled => "cancelled",
            ClosureReason::Expired => "expired",
            ClosureReason::LostToAcceptedTrade => "lost_to_accepted_trade",
            ClosureReason::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "rejected" => Ok(ClosureReason::Rejected),
            "cancelled" => Ok(ClosureReason::Cancelled),
            "expired" => Ok(ClosureReason::Expired),
            "lost_to_accepted_trade" => Ok(ClosureReason::LostToAcceptedTrade),
            "completed" => Ok(ClosureReason::Completed),
            other => Err(TradeError::Validation(format!(
                "Invalid closure reason: {other}"
            ))),
        }
    }
}

/// Capability required by an operation on a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeRole {
    Proposer,
    Receiver,
    Either,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub offered_garment_id: GarmentId,
    pub requested_garment_id: GarmentId,
    pub proposer_id: UserId,
    pub receiver_id: UserId,
    pub state: ProposalState,
    pub closure_reason: Option<ClosureReason>,
    pub proposer_confirmed_at: Option<DateTime<Utc>>,
    pub receiver_confirmed_at: Option<DateTime<Utc>>,
    pub reminded_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Proposal {
    pub fn new(
        proposer_id: UserId,
        receiver_id: UserId,
        offered_garment_id: GarmentId,
        requested_garment_id: GarmentId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            offered_garment_id,
            requested_garment_id,
            proposer_id,
            receiver_id,
            state: ProposalState::Pending,
            closure_reason: None,
            proposer_confirmed_at: None,
            receiver_confirmed_at: None,
            reminded_at: None,
            version: 0,
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn is_party(&self, user_id: UserId) -> bool {
        user_id == self.proposer_id || user_id == self.receiver_id
    }

    pub fn counterparty(&self, user_id: UserId) -> Option<UserId> {
        if user_id == self.proposer_id {
            Some(self.receiver_id)
        } else if user_id == self.receiver_id {
            Some(self.proposer_id)
        } else {
            None
        }
    }

    pub fn references(&self, garment_id: GarmentId) -> bool {
        garment_id == self.offered_garment_id || garment_id == self.requested_garment_id
    }

    /// Per-operation capability check; callers name the role the operation
    /// requires rather than dispatching on the caller's identity.
    pub fn authorize(&self, user_id: UserId, required: TradeRole) -> Result<()> {
        let allowed = match required {
            TradeRole::Proposer => user_id == self.proposer_id,
            TradeRole::Receiver => user_id == self.receiver_id,
            TradeRole::Either => self.is_party(user_id),
        };
        if allowed {
            Ok(())
        } else {
            Err(TradeError::NotAuthorized(format!(
                "User {} is not the {:?} of proposal {}",
                user_id,
                required,
                self.id
            )))
        }
    }

    fn guard(&self, expected: &[ProposalState], action: &'static str) -> Result<()> {
        if expected.contains(&self.state) {
            Ok(())
        } else {
            Err(TradeError::InvalidStateTransition {
                proposal_id: self.id,
                state: self.state,
                action,
            })
        }
    }

    pub fn accept(&mut self) -> Result<()> {
        self.guard(&[ProposalState::Pending], "accepted")?;
        self.state = ProposalState::Accepted;
        self.touch();
        Ok(())
    }

    pub fn reject(&mut self, reason: ClosureReason) -> Result<()> {
        self.guard(&[ProposalState::Pending], "rejected")?;
        self.state = ProposalState::Rejected;
        self.closure_reason = Some(reason);
        self.touch();
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.guard(
            &[ProposalState::Pending, ProposalState::Accepted],
            "cancelled",
        )?;
        self.state = ProposalState::Cancelled;
        self.closure_reason = Some(ClosureReason::Cancelled);
        self.touch();
        Ok(())
    }

    pub fn expire(&mut self) -> Result<()> {
        self.guard(&[ProposalState::Pending], "expired")?;
        self.state = ProposalState::Expired;
        self.closure_reason = Some(ClosureReason::Expired);
        self.touch();
        Ok(())
    }

    /// Records one party's completion confirmation. Returns `true` once both
    /// parties have confirmed, at which point the state flips to `Completed`.
    pub fn confirm_completion(&mut self, user_id: UserId) -> Result<bool> {
        self.guard(&[ProposalState::Accepted], "completed")?;
        let now = Utc::now();
        if user_id == self.proposer_id {
            self.proposer_confirmed_at.get_or_insert(now);
        } else if user_id == self.receiver_id {
            self.receiver_confirmed_at.get_or_insert(now);
        }
        self.touch();
        if self.proposer_confirmed_at.is_some() && self.receiver_confirmed_at.is_some() {
            self.state = ProposalState::Completed;
            self.closure_reason = Some(ClosureReason::Completed);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub proposal_id: ProposalId,
    /// `None` for system messages posted on state transitions.
    pub sender_id: Option<UserId>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn from_user(proposal_id: ProposalId, sender_id: UserId, body: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            proposal_id,
            sender_id: Some(sender_id),
            body,
            created_at: Utc::now(),
        }
    }

    pub fn from_system(proposal_id: ProposalId, body: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            proposal_id,
            sender_id: None,
            body,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: Uuid,
    pub proposal_id: ProposalId,
    pub evaluator_id: UserId,
    pub evaluated_id: UserId,
    pub overall_score: u8,
    pub dimension_scores: HashMap<String, u8>,
    pub created_at: DateTime<Utc>,
}

impl Evaluation {
    pub fn new(
        proposal_id: ProposalId,
        evaluator_id: UserId,
        evaluated_id: UserId,
        overall_score: u8,
        dimension_scores: HashMap<String, u8>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            proposal_id,
            evaluator_id,
            evaluated_id,
            overall_score,
            dimension_scores,
            created_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=5).contains(&self.overall_score) {
            return Err(TradeError::Validation(
                "Overall score must be between 1 and 5".to_string(),
            ));
        }
        for (dimension, score) in &self.dimension_scores {
            if !(1..=5).contains(score) {
                return Err(TradeError::Validation(format!(
                    "Score for dimension '{dimension}' must be between 1 and 5"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationSnapshot {
    pub user_id: UserId,
    /// Weighted mean over all received evaluations, rounded to 2 decimals.
    pub score: f64,
    pub evaluation_count: i64,
    pub updated_at: DateTime<Utc>,
}

impl ReputationSnapshot {
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            score: 0.0,
            evaluation_count: 0,
            updated_at: Utc::now(),
        }
    }
}
