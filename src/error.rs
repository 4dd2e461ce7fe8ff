use crate::model::{BindingState, ProposalState};
use crate::{GarmentId, ProposalId, UserId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TradeError>;

#[derive(Error, Debug)]
pub enum TradeError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Garment {garment_id} is not owned by user {user_id}")]
    InvalidGarmentOwnership { garment_id: GarmentId, user_id: UserId },

    #[error("Both garments belong to the same user")]
    SelfTradeNotAllowed,

    #[error("A pending proposal for this garment pair already exists")]
    DuplicateProposal,

    #[error("Garment {garment_id} already has {cap} pending proposals")]
    ProposalLimitExceeded { garment_id: GarmentId, cap: u32 },

    #[error("Proposal {proposal_id} cannot be {action} while {state}")]
    InvalidStateTransition {
        proposal_id: ProposalId,
        state: ProposalState,
        action: &'static str,
    },

    #[error("Proposal {0} was modified concurrently")]
    ConcurrentModification(ProposalId),

    #[error("Garment {garment_id} is already reserved by proposal {held_by}")]
    AlreadyReserved {
        garment_id: GarmentId,
        held_by: ProposalId,
    },

    #[error("Garment {garment_id} is {state}, not available")]
    GarmentUnavailable {
        garment_id: GarmentId,
        state: BindingState,
    },

    #[error("Chat for proposal {proposal_id} is not open (proposal is {state})")]
    ChatNotOpen {
        proposal_id: ProposalId,
        state: ProposalState,
    },

    #[error("Not eligible to evaluate: {0}")]
    NotEligible(String),

    #[error("User {evaluator_id} already evaluated proposal {proposal_id}")]
    DuplicateEvaluation {
        proposal_id: ProposalId,
        evaluator_id: UserId,
    },

    #[error("Proposal not found: {0}")]
    ProposalNotFound(ProposalId),

    #[error("Garment not found: {0}")]
    GarmentNotFound(GarmentId),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TradeError {
    /// True for errors in the state-conflict class: the request was well formed
    /// and authorized, but the aggregate is no longer in a state that permits it.
    pub fn is_state_conflict(&self) -> bool {
        matches!(
            self,
            TradeError::InvalidStateTransition { .. }
                | TradeError::ConcurrentModification(_)
                | TradeError::AlreadyReserved { .. }
                | TradeError::GarmentUnavailable { .. }
                | TradeError::ChatNotOpen { .. }
                | TradeError::NotEligible(_)
                | TradeError::DuplicateEvaluation { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TradeError::ProposalNotFound(_) | TradeError::GarmentNotFound(_)
        )
    }
}

impl From<serde_json::Error> for TradeError {
    fn from(err: serde_json::Error) -> Self {
        TradeError::Serialization(err.to_string())
    }
}

impl From<uuid::Error> for TradeError {
    fn from(err: uuid::Error) -> Self {
        TradeError::Validation(err.to_string())
    }
}
