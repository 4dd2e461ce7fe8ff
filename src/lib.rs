//! # trueque - Peer-to-Peer Clothing Barter Core
//!
//! Users list garments and negotiate direct swaps ("trueques") instead of
//! money. This crate owns the trade-proposal lifecycle and everything that
//! hangs off it.
//!
//! ## Architecture
//!
//! - **Proposal Store**: finite-state workflow for trade proposals, including
//!   the atomic cascade that rejects competing offers when a trade is accepted
//! - **Garment Ledger**: exclusivity marker preventing double-commitment of an
//!   item (Available / InNegotiation / Swapped / Withdrawn)
//! - **Negotiation Channel**: per-proposal chat, open only while a proposal is
//!   accepted, with read receipts and real-time fan-out
//! - **Expiration Sweeper**: background task force-expiring stale pending
//!   proposals from their persisted deadlines
//! - **Reputation Aggregator**: weighted score recomputed from post-swap
//!   evaluations
//! - **Notification Sink**: fire-and-forget push to an external collaborator

pub mod chat;
pub mod config;
pub mod database;
pub mod error;
pub mod ledger;
pub mod model;
pub mod notify;
pub mod reputation;
pub mod store;
pub mod sweeper;

pub use chat::NegotiationChannel;
pub use config::AppConfig;
pub use database::Database;
pub use error::{Result, TradeError};
pub use ledger::{GarmentCatalog, GarmentLedger, SqlGarmentCatalog};
pub use model::{
    BindingState, ChatMessage, ClosureReason, Evaluation, Garment, Proposal, ProposalState,
    ReputationSnapshot, TradeRole,
};
pub use notify::{
    EventBus, Notification, NotificationKind, NotificationSink, Notifier, TracingSink, TradeEvent,
    WebhookSink,
};
pub use reputation::ReputationService;
pub use store::ProposalStore;
pub use sweeper::{ExpirationSweeper, SweepReport};

pub type UserId = uuid::Uuid;
pub type GarmentId = uuid::Uuid;
pub type ProposalId = uuid::Uuid;
pub type MessageId = uuid::Uuid;
