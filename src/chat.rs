use crate::database::Database;
use crate::model::{ChatMessage, Proposal, ProposalState};
use crate::notify::{Notification, NotificationKind, Notifier, TradeEvent};
use crate::{ProposalId, Result, TradeError, UserId};
use chrono::Utc;

const MAX_MESSAGE_LEN: usize = 2000;

/// Per-proposal message log, open only while the proposal is accepted.
#[derive(Clone)]
pub struct NegotiationChannel {
    db: Database,
    notifier: Notifier,
}

impl NegotiationChannel {
    pub fn new(db: Database, notifier: Notifier) -> Self {
        Self { db, notifier }
    }

    /// Posts a user message. The state check is made at send time without
    /// taking the proposal lock; a racing terminal transition simply fails
    /// the send with `ChatNotOpen`.
    pub async fn post(
        &self,
        proposal_id: ProposalId,
        sender_id: UserId,
        body: &str,
    ) -> Result<ChatMessage> {
        let body = body.trim();
        if body.is_empty() {
            return Err(TradeError::Validation(
                "Message body cannot be empty".to_string(),
            ));
        }
        if body.len() > MAX_MESSAGE_LEN {
            return Err(TradeError::Validation(format!(
                "Message body exceeds {MAX_MESSAGE_LEN} characters"
            )));
        }

        let proposal = self.load(proposal_id).await?;
        if !proposal.is_party(sender_id) {
            return Err(TradeError::NotAuthorized(format!(
                "User {sender_id} is not a party to proposal {proposal_id}"
            )));
        }
        if proposal.state != ProposalState::Accepted {
            return Err(TradeError::ChatNotOpen {
                proposal_id,
                state: proposal.state,
            });
        }

        let message = ChatMessage::from_user(proposal_id, sender_id, body.to_string());
        self.db.create_message(&message).await?;
        self.db
            .touch_proposal_activity(proposal_id, message.created_at)
            .await?;

        self.notifier.broadcast(
            proposal_id,
            &[proposal.proposer_id, proposal.receiver_id],
            TradeEvent::MessagePosted {
                proposal_id,
                message_id: message.id,
                sender_id: Some(sender_id),
            },
        );
        if let Some(counterparty) = proposal.counterparty(sender_id) {
            self.notifier.dispatch(
                counterparty,
                Notification::new(
                    NotificationKind::MessageReceived,
                    proposal_id,
                    "New message",
                    truncate(body, 120),
                ),
            );
        }

        tracing::debug!("Message {} posted to proposal {}", message.id, proposal_id);
        Ok(message)
    }

    /// System messages bypass the gate; posted by the store on transitions.
    pub(crate) async fn post_system(&self, proposal: &Proposal, body: &str) -> Result<ChatMessage> {
        let message = ChatMessage::from_system(proposal.id, body.to_string());
        self.db.create_message(&message).await?;

        self.notifier.broadcast(
            proposal.id,
            &[proposal.proposer_id, proposal.receiver_id],
            TradeEvent::MessagePosted {
                proposal_id: proposal.id,
                message_id: message.id,
                sender_id: None,
            },
        );
        Ok(message)
    }

    pub async fn list(
        &self,
        proposal_id: ProposalId,
        requester_id: UserId,
    ) -> Result<Vec<ChatMessage>> {
        let proposal = self.load(proposal_id).await?;
        if !proposal.is_party(requester_id) {
            return Err(TradeError::NotAuthorized(format!(
                "User {requester_id} is not a party to proposal {proposal_id}"
            )));
        }
        self.db.list_messages(proposal_id).await
    }

    /// Idempotent: marks every message not authored by the reader as read.
    /// Returns the number of newly read messages.
    pub async fn mark_read(&self, proposal_id: ProposalId, reader_id: UserId) -> Result<u64> {
        let proposal = self.load(proposal_id).await?;
        if !proposal.is_party(reader_id) {
            return Err(TradeError::NotAuthorized(format!(
                "User {reader_id} is not a party to proposal {proposal_id}"
            )));
        }
        self.db
            .mark_messages_read(proposal_id, reader_id, Utc::now())
            .await
    }

    pub async fn unread_count(&self, proposal_id: ProposalId, reader_id: UserId) -> Result<i64> {
        let proposal = self.load(proposal_id).await?;
        if !proposal.is_party(reader_id) {
            return Err(TradeError::NotAuthorized(format!(
                "User {reader_id} is not a party to proposal {proposal_id}"
            )));
        }
        self.db.unread_count(proposal_id, reader_id).await
    }

    async fn load(&self, proposal_id: ProposalId) -> Result<Proposal> {
        self.db
            .get_proposal(proposal_id)
            .await?
            .ok_or(TradeError::ProposalNotFound(proposal_id))
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}
