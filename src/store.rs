use crate::chat::NegotiationChannel;
use crate::config::TradeConfig;
use crate::database::Database;
use crate::ledger::{GarmentCatalog, GarmentLedger};
use crate::model::{BindingState, ClosureReason, Proposal, ProposalState, TradeRole};
use crate::notify::{Notification, NotificationKind, Notifier, TradeEvent};
use crate::{GarmentId, ProposalId, Result, TradeError, UserId};
use std::collections::HashMap;
use std::sync::Arc;

/// One async mutex per proposal so mutations on the same aggregate are
/// serialized (simultaneous accept and cancel cannot both read Pending).
#[derive(Clone, Default)]
struct LockRegistry {
    inner: Arc<parking_lot::Mutex<HashMap<ProposalId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl LockRegistry {
    fn for_proposal(&self, proposal_id: ProposalId) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .lock()
            .entry(proposal_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Terminal proposals take no further mutations; drop their lock entry.
    fn discard(&self, proposal_id: ProposalId) {
        self.inner.lock().remove(&proposal_id);
    }
}

/// The trade-proposal state machine. All garment binding-state changes happen
/// as side effects of transitions made here.
pub struct ProposalStore {
    db: Database,
    ledger: GarmentLedger,
    catalog: Arc<dyn GarmentCatalog>,
    chat: NegotiationChannel,
    notifier: Notifier,
    config: TradeConfig,
    locks: LockRegistry,
}

impl ProposalStore {
    pub fn new(
        db: Database,
        catalog: Arc<dyn GarmentCatalog>,
        notifier: Notifier,
        config: TradeConfig,
    ) -> Self {
        let ledger = GarmentLedger::new(db.clone());
        let chat = NegotiationChannel::new(db.clone(), notifier.clone());
        Self {
            db,
            ledger,
            catalog,
            chat,
            notifier,
            config,
            locks: LockRegistry::default(),
        }
    }

    pub fn ledger(&self) -> &GarmentLedger {
        &self.ledger
    }

    /// System chat messages are post-commit side effects; a failure here must
    /// not turn an already-committed transition into an error for the caller.
    async fn post_system(&self, proposal: &Proposal, body: &str) {
        if let Err(e) = self.chat.post_system(proposal, body).await {
            tracing::warn!(
                "Failed to post system message for proposal {}: {}",
                proposal.id,
                e
            );
        }
    }

    pub async fn get(&self, proposal_id: ProposalId) -> Result<Proposal> {
        self.db
            .get_proposal(proposal_id)
            .await?
            .ok_or(TradeError::ProposalNotFound(proposal_id))
    }

    pub async fn list_for(&self, user_id: UserId, role: TradeRole) -> Result<Vec<Proposal>> {
        self.db.list_proposals_for(user_id, role).await
    }

    /// Creates a pending proposal. Garments stay Available: multiple pending
    /// offers may compete until one is accepted.
    pub async fn create(
        &self,
        proposer_id: UserId,
        offered_garment_id: GarmentId,
        requested_garment_id: GarmentId,
        opening_message: Option<&str>,
    ) -> Result<Proposal> {
        if offered_garment_id == requested_garment_id {
            return Err(TradeError::Validation(
                "Offered and requested garments must differ".to_string(),
            ));
        }

        let offered = self.ledger.get(offered_garment_id).await?;
        let requested = self.ledger.get(requested_garment_id).await?;

        if !self
            .catalog
            .is_owned_by(offered_garment_id, proposer_id)
            .await?
        {
            return Err(TradeError::InvalidGarmentOwnership {
                garment_id: offered_garment_id,
                user_id: proposer_id,
            });
        }
        if offered.owner_id == requested.owner_id {
            return Err(TradeError::SelfTradeNotAllowed);
        }

        let receiver_id = requested.owner_id;
        let proposal = Proposal::new(
            proposer_id,
            receiver_id,
            offered_garment_id,
            requested_garment_id,
        );

        // Availability, cap check and insert share a transaction so a racing
        // accept cannot slip a reservation in underneath, and concurrent
        // creates cannot overshoot the pending limit.
        let mut tx = self.db.begin().await?;
        for garment_id in [offered_garment_id, requested_garment_id] {
            let garment = Database::get_garment_on(&mut tx, garment_id)
                .await?
                .ok_or(TradeError::GarmentNotFound(garment_id))?;
            if garment.binding_state != BindingState::Available {
                return Err(TradeError::GarmentUnavailable {
                    garment_id,
                    state: garment.binding_state,
                });
            }
        }
        if Database::pending_pair_exists_on(&mut tx, offered_garment_id, requested_garment_id)
            .await?
        {
            return Err(TradeError::DuplicateProposal);
        }
        let pending = Database::count_pending_for_garment_on(&mut tx, requested_garment_id).await?;
        if pending >= self.config.max_pending_per_garment as i64 {
            return Err(TradeError::ProposalLimitExceeded {
                garment_id: requested_garment_id,
                cap: self.config.max_pending_per_garment,
            });
        }
        Database::create_proposal_on(&mut tx, &proposal).await?;
        if let Some(body) = opening_message {
            let body = body.trim();
            if !body.is_empty() {
                let message =
                    crate::model::ChatMessage::from_user(proposal.id, proposer_id, body.to_string());
                Database::create_message_on(&mut tx, &message).await?;
            }
        }
        tx.commit().await?;

        tracing::info!(
            "Proposal {} created: {} offers {} for {}",
            proposal.id,
            proposer_id,
            offered_garment_id,
            requested_garment_id
        );
        self.notifier.broadcast(
            proposal.id,
            &[proposer_id, receiver_id],
            TradeEvent::ProposalCreated {
                proposal_id: proposal.id,
                proposer_id,
                receiver_id,
            },
        );
        self.notifier.dispatch(
            receiver_id,
            Notification::new(
                NotificationKind::ProposalReceived,
                proposal.id,
                "New trade proposal",
                format!("Someone offered a swap for '{}'", requested.title),
            ),
        );

        Ok(proposal)
    }

    /// Accepts a pending proposal. The acceptance, both garment reservations
    /// and the cascading rejection of every competing pending proposal on
    /// either garment commit as one transaction; any conflict rolls the whole
    /// unit back and the caller retries.
    pub async fn accept(
        &self,
        receiver_id: UserId,
        proposal_id: ProposalId,
        message: Option<&str>,
    ) -> Result<Proposal> {
        let lock = self.locks.for_proposal(proposal_id);
        let _guard = lock.lock().await;

        let mut tx = self.db.begin().await?;
        let mut proposal = Database::get_proposal_on(&mut tx, proposal_id)
            .await?
            .ok_or(TradeError::ProposalNotFound(proposal_id))?;

        proposal.authorize(receiver_id, TradeRole::Receiver)?;
        proposal.accept()?;

        GarmentLedger::reserve_exclusive_on(&mut tx, proposal.offered_garment_id, proposal_id)
            .await?;
        GarmentLedger::reserve_exclusive_on(&mut tx, proposal.requested_garment_id, proposal_id)
            .await?;

        let competitors = Database::pending_referencing_on(
            &mut tx,
            proposal.offered_garment_id,
            proposal.requested_garment_id,
            proposal_id,
        )
        .await?;

        let mut cascaded = Vec::with_capacity(competitors.len());
        for mut competitor in competitors {
            competitor.reject(ClosureReason::LostToAcceptedTrade)?;
            Database::update_proposal_on(&mut tx, &mut competitor).await?;
            cascaded.push(competitor);
        }

        Database::update_proposal_on(&mut tx, &mut proposal).await?;
        tx.commit().await?;

        tracing::info!(
            "Proposal {} accepted; {} competing proposals cascaded",
            proposal_id,
            cascaded.len()
        );

        self.post_system(&proposal, "Proposal accepted. The negotiation chat is open.")
            .await;
        if let Some(body) = message {
            if !body.trim().is_empty() {
                if let Err(e) = self.chat.post(proposal_id, receiver_id, body).await {
                    tracing::warn!("Acceptance message for {} not posted: {}", proposal_id, e);
                }
            }
        }

        self.notifier.broadcast(
            proposal_id,
            &[proposal.proposer_id, proposal.receiver_id],
            TradeEvent::ProposalStateChanged {
                proposal_id,
                state: ProposalState::Accepted,
                closure_reason: None,
            },
        );
        self.notifier.dispatch(
            proposal.proposer_id,
            Notification::new(
                NotificationKind::ProposalAccepted,
                proposal_id,
                "Proposal accepted",
                "Your trade proposal was accepted. The negotiation chat is open.",
            ),
        );

        for competitor in &cascaded {
            self.post_system(
                competitor,
                "Negotiation closed: another trade involving this garment was accepted.",
            )
            .await;
            self.notifier.broadcast(
                competitor.id,
                &[competitor.proposer_id, competitor.receiver_id],
                TradeEvent::ProposalStateChanged {
                    proposal_id: competitor.id,
                    state: ProposalState::Rejected,
                    closure_reason: Some(ClosureReason::LostToAcceptedTrade),
                },
            );
            self.notifier.dispatch(
                competitor.proposer_id,
                Notification::new(
                    NotificationKind::ProposalRejected,
                    competitor.id,
                    "Proposal closed",
                    "A competing trade for one of the garments was accepted.",
                ),
            );
            self.locks.discard(competitor.id);
        }

        Ok(proposal)
    }

    pub async fn reject(&self, receiver_id: UserId, proposal_id: ProposalId) -> Result<Proposal> {
        let lock = self.locks.for_proposal(proposal_id);
        let _guard = lock.lock().await;

        let mut proposal = self.get(proposal_id).await?;
        proposal.authorize(receiver_id, TradeRole::Receiver)?;
        proposal.reject(ClosureReason::Rejected)?;
        self.db.update_proposal(&mut proposal).await?;

        tracing::info!("Proposal {} rejected by receiver", proposal_id);
        self.post_system(&proposal, "Negotiation closed: proposal rejected.")
            .await;
        self.notifier.broadcast(
            proposal_id,
            &[proposal.proposer_id, proposal.receiver_id],
            TradeEvent::ProposalStateChanged {
                proposal_id,
                state: ProposalState::Rejected,
                closure_reason: Some(ClosureReason::Rejected),
            },
        );
        self.notifier.dispatch(
            proposal.proposer_id,
            Notification::new(
                NotificationKind::ProposalRejected,
                proposal_id,
                "Proposal rejected",
                "Your trade proposal was declined.",
            ),
        );
        self.locks.discard(proposal_id);

        Ok(proposal)
    }

    /// Either party may cancel while the proposal is pending or accepted.
    /// Cancelling an accepted proposal releases both garment reservations.
    pub async fn cancel(&self, caller_id: UserId, proposal_id: ProposalId) -> Result<Proposal> {
        let lock = self.locks.for_proposal(proposal_id);
        let _guard = lock.lock().await;

        let mut proposal = self.get(proposal_id).await?;
        proposal.authorize(caller_id, TradeRole::Either)?;
        let was_accepted = proposal.state == ProposalState::Accepted;
        proposal.cancel()?;

        if was_accepted {
            let mut tx = self.db.begin().await?;
            Database::update_proposal_on(&mut tx, &mut proposal).await?;
            GarmentLedger::release_on(&mut tx, proposal.offered_garment_id, proposal_id).await?;
            GarmentLedger::release_on(&mut tx, proposal.requested_garment_id, proposal_id).await?;
            tx.commit().await?;
        } else {
            self.db.update_proposal(&mut proposal).await?;
        }

        tracing::info!("Proposal {} cancelled by {}", proposal_id, caller_id);
        self.post_system(&proposal, "Negotiation closed: proposal cancelled.")
            .await;
        self.notifier.broadcast(
            proposal_id,
            &[proposal.proposer_id, proposal.receiver_id],
            TradeEvent::ProposalStateChanged {
                proposal_id,
                state: ProposalState::Cancelled,
                closure_reason: Some(ClosureReason::Cancelled),
            },
        );
        if let Some(counterparty) = proposal.counterparty(caller_id) {
            self.notifier.dispatch(
                counterparty,
                Notification::new(
                    NotificationKind::ProposalCancelled,
                    proposal_id,
                    "Proposal cancelled",
                    "The other party cancelled the trade.",
                ),
            );
        }
        self.locks.discard(proposal_id);

        Ok(proposal)
    }

    /// Records the caller's completion confirmation. Once both parties have
    /// confirmed, the proposal completes and both garments become Swapped.
    pub async fn complete(&self, caller_id: UserId, proposal_id: ProposalId) -> Result<Proposal> {
        let lock = self.locks.for_proposal(proposal_id);
        let _guard = lock.lock().await;

        let mut proposal = self.get(proposal_id).await?;
        proposal.authorize(caller_id, TradeRole::Either)?;
        let had_confirmed = (caller_id == proposal.proposer_id
            && proposal.proposer_confirmed_at.is_some())
            || (caller_id == proposal.receiver_id && proposal.receiver_confirmed_at.is_some());
        let completed = proposal.confirm_completion(caller_id)?;

        if completed {
            let mut tx = self.db.begin().await?;
            Database::update_proposal_on(&mut tx, &mut proposal).await?;
            GarmentLedger::mark_swapped_on(&mut tx, proposal.offered_garment_id, proposal_id)
                .await?;
            GarmentLedger::mark_swapped_on(&mut tx, proposal.requested_garment_id, proposal_id)
                .await?;
            tx.commit().await?;

            tracing::info!("Proposal {} completed; garments swapped", proposal_id);
            self.post_system(&proposal, "Swap completed. Both parties may now evaluate.")
                .await;
            self.notifier.broadcast(
                proposal_id,
                &[proposal.proposer_id, proposal.receiver_id],
                TradeEvent::ProposalStateChanged {
                    proposal_id,
                    state: ProposalState::Completed,
                    closure_reason: Some(ClosureReason::Completed),
                },
            );
            for party in [proposal.proposer_id, proposal.receiver_id] {
                self.notifier.dispatch(
                    party,
                    Notification::new(
                        NotificationKind::SwapCompleted,
                        proposal_id,
                        "Swap completed",
                        "The trade is complete. Leave an evaluation for your swap partner.",
                    ),
                );
            }
            self.locks.discard(proposal_id);
        } else {
            self.db.update_proposal(&mut proposal).await?;
            if !had_confirmed {
                self.post_system(
                    &proposal,
                    "One party confirmed the swap. Waiting for the other confirmation.",
                )
                .await;
            }
        }

        Ok(proposal)
    }

    /// Sweeper entry point; runs through the same state-machine guards as the
    /// manual transitions.
    pub async fn expire(&self, proposal_id: ProposalId) -> Result<Proposal> {
        let lock = self.locks.for_proposal(proposal_id);
        let _guard = lock.lock().await;

        let mut proposal = self.get(proposal_id).await?;
        proposal.expire()?;
        self.db.update_proposal(&mut proposal).await?;

        // Pending proposals hold no reservation; these are held-by-guarded
        // no-ops that leave garments bound to other accepted trades alone.
        self.ledger
            .release(proposal.offered_garment_id, proposal_id)
            .await?;
        self.ledger
            .release(proposal.requested_garment_id, proposal_id)
            .await?;

        tracing::info!("Proposal {} expired after inactivity", proposal_id);
        self.post_system(&proposal, "Negotiation closed: expired.")
            .await;
        self.notifier.broadcast(
            proposal_id,
            &[proposal.proposer_id, proposal.receiver_id],
            TradeEvent::ProposalStateChanged {
                proposal_id,
                state: ProposalState::Expired,
                closure_reason: Some(ClosureReason::Expired),
            },
        );
        for party in [proposal.proposer_id, proposal.receiver_id] {
            self.notifier.dispatch(
                party,
                Notification::new(
                    NotificationKind::ProposalExpired,
                    proposal_id,
                    "Proposal expired",
                    "The trade proposal expired without an answer.",
                ),
            );
        }
        self.locks.discard(proposal_id);

        Ok(proposal)
    }
}
