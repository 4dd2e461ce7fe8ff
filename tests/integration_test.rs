use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::NamedTempFile;
use trueque::{
    AppConfig, BindingState, ClosureReason, Database, EventBus, ExpirationSweeper, Garment,
    GarmentLedger, NegotiationChannel, Notifier, ProposalState, ProposalStore, ReputationService,
    Result, SqlGarmentCatalog, TracingSink, TradeError, TradeRole,
};
use uuid::Uuid;

struct TestEnv {
    db: Database,
    store: Arc<ProposalStore>,
    chat: NegotiationChannel,
    reputation: ReputationService,
    sweeper: ExpirationSweeper,
    // Holds the database file open for the lifetime of the test.
    _db_file: NamedTempFile,
}

async fn setup() -> Result<TestEnv> {
    let db_file = NamedTempFile::new().unwrap();
    let db_url = format!("sqlite://{}", db_file.path().to_string_lossy());
    let db = Database::new(&db_url).await?;

    let config = AppConfig::default();
    let notifier = Notifier::new(Arc::new(TracingSink), EventBus::new());
    let catalog = Arc::new(SqlGarmentCatalog::new(db.clone()));
    let store = Arc::new(ProposalStore::new(
        db.clone(),
        catalog,
        notifier.clone(),
        config.trade.clone(),
    ));
    let chat = NegotiationChannel::new(db.clone(), notifier.clone());
    let reputation = ReputationService::new(db.clone(), config.reputation.clone(), notifier.clone());
    let sweeper = ExpirationSweeper::new(
        store.clone(),
        db.clone(),
        notifier.clone(),
        config.trade.clone(),
        config.sweeper.clone(),
    );

    Ok(TestEnv {
        db,
        store,
        chat,
        reputation,
        sweeper,
        _db_file: db_file,
    })
}

async fn add_garment(db: &Database, owner: Uuid, title: &str) -> Result<Garment> {
    let garment = Garment::new(owner, title.to_string());
    db.create_garment(&garment).await?;
    Ok(garment)
}

async fn backdate_proposal(db: &Database, proposal_id: Uuid, days: i64) -> Result<()> {
    sqlx::query("UPDATE proposals SET created_at = ? WHERE id = ?")
        .bind(Utc::now() - Duration::days(days))
        .bind(proposal_id.to_string())
        .execute(db.pool())
        .await?;
    Ok(())
}

/// Drives a proposal from creation to Completed for evaluation tests.
async fn completed_swap(env: &TestEnv, proposer: Uuid, receiver: Uuid) -> Result<Uuid> {
    let offered = add_garment(&env.db, proposer, "offered").await?;
    let requested = add_garment(&env.db, receiver, "requested").await?;
    let proposal = env
        .store
        .create(proposer, offered.id, requested.id, None)
        .await?;
    env.store.accept(receiver, proposal.id, None).await?;
    env.store.complete(proposer, proposal.id).await?;
    env.store.complete(receiver, proposal.id).await?;
    Ok(proposal.id)
}

#[tokio::test]
async fn test_full_swap_lifecycle() -> Result<()> {
    let env = setup().await?;
    let (u1, u2, u3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

    let a = add_garment(&env.db, u1, "denim jacket").await?;
    let b = add_garment(&env.db, u2, "wool coat").await?;
    let c = add_garment(&env.db, u3, "linen shirt").await?;

    // U1 proposes A<->B, U3 competes with C<->B.
    let p1 = env.store.create(u1, a.id, b.id, Some("interested?")).await?;
    let p2 = env.store.create(u3, c.id, b.id, None).await?;
    assert_eq!(p1.state, ProposalState::Pending);
    assert_eq!(env.db.get_garment(a.id).await?.unwrap().binding_state, BindingState::Available);

    // Accepting A<->B locks both garments and cascades the competitor.
    let p1 = env.store.accept(u2, p1.id, Some("deal")).await?;
    assert_eq!(p1.state, ProposalState::Accepted);
    let garment_a = env.db.get_garment(a.id).await?.unwrap();
    let garment_b = env.db.get_garment(b.id).await?.unwrap();
    assert_eq!(garment_a.binding_state, BindingState::InNegotiation);
    assert_eq!(garment_b.binding_state, BindingState::InNegotiation);
    assert_eq!(garment_a.reserved_by, Some(p1.id));

    let p2 = env.store.get(p2.id).await?;
    assert_eq!(p2.state, ProposalState::Rejected);
    assert_eq!(p2.closure_reason, Some(ClosureReason::LostToAcceptedTrade));
    assert_eq!(env.db.get_garment(c.id).await?.unwrap().binding_state, BindingState::Available);

    // Negotiation chat is open for both parties.
    env.chat.post(p1.id, u1, "when can we meet?").await?;
    env.chat.post(p1.id, u2, "saturday works").await?;

    // Completion needs both confirmations.
    let p1 = env.store.complete(u1, p1.id).await?;
    assert_eq!(p1.state, ProposalState::Accepted);
    let p1 = env.store.complete(u2, p1.id).await?;
    assert_eq!(p1.state, ProposalState::Completed);
    assert_eq!(env.db.get_garment(a.id).await?.unwrap().binding_state, BindingState::Swapped);
    assert_eq!(env.db.get_garment(b.id).await?.unwrap().binding_state, BindingState::Swapped);

    // Evaluation rolls into the counterparty's reputation.
    env.reputation.submit(u1, p1.id, 5, HashMap::new()).await?;
    let snapshot = env.reputation.get(u2).await?;
    assert_eq!(snapshot.score, 5.0);
    assert_eq!(snapshot.evaluation_count, 1);

    Ok(())
}

#[tokio::test]
async fn test_create_proposal_validations() -> Result<()> {
    let env = setup().await?;
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
    let a = add_garment(&env.db, u1, "a").await?;
    let b = add_garment(&env.db, u2, "b").await?;
    let b2 = add_garment(&env.db, u2, "b2").await?;

    // Offering someone else's garment.
    let err = env.store.create(u1, b.id, a.id, None).await.unwrap_err();
    assert!(matches!(err, TradeError::InvalidGarmentOwnership { .. }));

    // Both garments share an owner.
    let err = env.store.create(u2, b.id, b2.id, None).await.unwrap_err();
    assert!(matches!(err, TradeError::SelfTradeNotAllowed));

    // Same garment on both sides.
    let err = env.store.create(u1, a.id, a.id, None).await.unwrap_err();
    assert!(matches!(err, TradeError::Validation(_)));

    // Duplicate pending pair.
    env.store.create(u1, a.id, b.id, None).await?;
    let err = env.store.create(u1, a.id, b.id, None).await.unwrap_err();
    assert!(matches!(err, TradeError::DuplicateProposal));

    Ok(())
}

#[tokio::test]
async fn test_pending_cap_per_garment() -> Result<()> {
    let env = setup().await?;
    let owner = Uuid::new_v4();
    let wanted = add_garment(&env.db, owner, "sought-after coat").await?;

    // Default cap is 3 pending proposals against the same requested garment.
    for _ in 0..3 {
        let bidder = Uuid::new_v4();
        let offered = add_garment(&env.db, bidder, "offer").await?;
        env.store.create(bidder, offered.id, wanted.id, None).await?;
    }

    let bidder = Uuid::new_v4();
    let offered = add_garment(&env.db, bidder, "late offer").await?;
    let err = env
        .store
        .create(bidder, offered.id, wanted.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::ProposalLimitExceeded { cap: 3, .. }));

    Ok(())
}

#[tokio::test]
async fn test_accept_authorization_and_state_guards() -> Result<()> {
    let env = setup().await?;
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
    let a = add_garment(&env.db, u1, "a").await?;
    let b = add_garment(&env.db, u2, "b").await?;
    let p = env.store.create(u1, a.id, b.id, None).await?;

    // Only the receiver may accept.
    let err = env.store.accept(u1, p.id, None).await.unwrap_err();
    assert!(matches!(err, TradeError::NotAuthorized(_)));

    env.store.accept(u2, p.id, None).await?;

    // A second accept hits the state guard.
    let err = env.store.accept(u2, p.id, None).await.unwrap_err();
    assert!(err.is_state_conflict());

    // Reject is only valid from Pending.
    let err = env.store.reject(u2, p.id).await.unwrap_err();
    assert!(err.is_state_conflict());

    Ok(())
}

#[tokio::test]
async fn test_cancel_accepted_releases_garments() -> Result<()> {
    let env = setup().await?;
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
    let a = add_garment(&env.db, u1, "a").await?;
    let b = add_garment(&env.db, u2, "b").await?;
    let p = env.store.create(u1, a.id, b.id, None).await?;
    env.store.accept(u2, p.id, None).await?;

    let p = env.store.cancel(u1, p.id).await?;
    assert_eq!(p.state, ProposalState::Cancelled);
    assert_eq!(env.db.get_garment(a.id).await?.unwrap().binding_state, BindingState::Available);
    assert_eq!(env.db.get_garment(b.id).await?.unwrap().binding_state, BindingState::Available);

    // Chat closed again after cancellation.
    let err = env.chat.post(p.id, u1, "hello?").await.unwrap_err();
    assert!(matches!(err, TradeError::ChatNotOpen { .. }));

    Ok(())
}

#[tokio::test]
async fn test_chat_gating_and_read_receipts() -> Result<()> {
    let env = setup().await?;
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
    let outsider = Uuid::new_v4();
    let a = add_garment(&env.db, u1, "a").await?;
    let b = add_garment(&env.db, u2, "b").await?;
    let p = env.store.create(u1, a.id, b.id, Some("opening note")).await?;

    // Chat opens only once the proposal is accepted.
    let err = env.chat.post(p.id, u1, "too early").await.unwrap_err();
    assert!(matches!(err, TradeError::ChatNotOpen { .. }));

    env.store.accept(u2, p.id, None).await?;
    env.chat.post(p.id, u1, "first message").await?;

    let err = env.chat.post(p.id, outsider, "let me in").await.unwrap_err();
    assert!(matches!(err, TradeError::NotAuthorized(_)));
    let err = env.chat.list(p.id, outsider).await.unwrap_err();
    assert!(matches!(err, TradeError::NotAuthorized(_)));

    // Opening note, acceptance system message, and the chat message.
    let messages = env.chat.list(p.id, u2).await?;
    assert!(messages.len() >= 3);
    assert!(messages.iter().any(|m| m.sender_id.is_none()));
    assert_eq!(messages.first().unwrap().body, "opening note");

    // mark_read is idempotent and clears the unread counter.
    assert!(env.chat.unread_count(p.id, u2).await? > 0);
    let first = env.chat.mark_read(p.id, u2).await?;
    assert!(first > 0);
    let second = env.chat.mark_read(p.id, u2).await?;
    assert_eq!(second, 0);
    assert_eq!(env.chat.unread_count(p.id, u2).await?, 0);

    // Empty bodies are rejected before any state check.
    let err = env.chat.post(p.id, u1, "   ").await.unwrap_err();
    assert!(matches!(err, TradeError::Validation(_)));

    Ok(())
}

#[tokio::test]
async fn test_sweeper_expires_stale_pending() -> Result<()> {
    let env = setup().await?;
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
    let a = add_garment(&env.db, u1, "a").await?;
    let b = add_garment(&env.db, u2, "b").await?;
    let stale = env.store.create(u1, a.id, b.id, None).await?;
    backdate_proposal(&env.db, stale.id, 8).await?;

    let fresh_garment = add_garment(&env.db, u1, "fresh").await?;
    let other = add_garment(&env.db, Uuid::new_v4(), "other").await?;
    let fresh = env
        .store
        .create(u1, fresh_garment.id, other.id, None)
        .await?;

    let report = env.sweeper.run_once().await?;
    assert_eq!(report.expired, 1);
    assert_eq!(report.failed, 0);

    let stale = env.store.get(stale.id).await?;
    assert_eq!(stale.state, ProposalState::Expired);
    assert_eq!(stale.closure_reason, Some(ClosureReason::Expired));
    assert_eq!(env.db.get_garment(a.id).await?.unwrap().binding_state, BindingState::Available);

    // Fresh proposals are untouched and the expired one refuses acceptance.
    assert_eq!(env.store.get(fresh.id).await?.state, ProposalState::Pending);
    let err = env.store.accept(u2, stale.id, None).await.unwrap_err();
    assert!(err.is_state_conflict());

    Ok(())
}

#[tokio::test]
async fn test_sweeper_reminder_window() -> Result<()> {
    let env = setup().await?;
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
    let a = add_garment(&env.db, u1, "a").await?;
    let b = add_garment(&env.db, u2, "b").await?;
    // Six days old: deadline in under 48 hours.
    let closing = env.store.create(u1, a.id, b.id, None).await?;
    backdate_proposal(&env.db, closing.id, 6).await?;

    let c = add_garment(&env.db, u1, "c").await?;
    let d = add_garment(&env.db, Uuid::new_v4(), "d").await?;
    // Two days old: well outside the warning window.
    let recent = env.store.create(u1, c.id, d.id, None).await?;
    backdate_proposal(&env.db, recent.id, 2).await?;

    let soon: Vec<_> = env.sweeper.expiring_soon().await?;
    assert_eq!(soon.len(), 1);
    assert_eq!(soon[0].id, closing.id);

    // Reminders fire once per proposal.
    let report = env.sweeper.run_once().await?;
    assert_eq!(report.expired, 0);
    assert_eq!(report.reminded, 1);
    let report = env.sweeper.run_once().await?;
    assert_eq!(report.reminded, 0);

    Ok(())
}

#[tokio::test]
async fn test_release_guard_protects_other_reservation() -> Result<()> {
    let env = setup().await?;
    let (u1, u2, u3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let a = add_garment(&env.db, u1, "a").await?;
    let b = add_garment(&env.db, u2, "b").await?;
    let c = add_garment(&env.db, u3, "c").await?;

    let p1 = env.store.create(u1, a.id, b.id, None).await?;
    let p2 = env.store.create(u3, c.id, b.id, None).await?;
    env.store.accept(u2, p2.id, None).await?;

    // A stale release from the cascaded proposal must not free garment B,
    // which is now bound to the accepted trade.
    let ledger = GarmentLedger::new(env.db.clone());
    ledger.release(b.id, p1.id).await?;
    let garment_b = env.db.get_garment(b.id).await?.unwrap();
    assert_eq!(garment_b.binding_state, BindingState::InNegotiation);
    assert_eq!(garment_b.reserved_by, Some(p2.id));

    Ok(())
}

#[tokio::test]
async fn test_reserve_exclusive_is_idempotent() -> Result<()> {
    let env = setup().await?;
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
    let a = add_garment(&env.db, u1, "a").await?;
    let b = add_garment(&env.db, u2, "b").await?;
    let p = env.store.create(u1, a.id, b.id, None).await?;
    env.store.accept(u2, p.id, None).await?;

    let ledger = GarmentLedger::new(env.db.clone());
    // Re-reserving for the holder is a no-op.
    ledger.reserve_exclusive(a.id, p.id).await?;

    // Any other proposal is refused.
    let err = ledger.reserve_exclusive(a.id, Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, TradeError::AlreadyReserved { held_by, .. } if held_by == p.id));
    assert!(!ledger.check_available(a.id).await?);

    Ok(())
}

#[tokio::test]
async fn test_duplicate_evaluation_leaves_snapshot_unchanged() -> Result<()> {
    let env = setup().await?;
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
    let proposal_id = completed_swap(&env, u1, u2).await?;

    env.reputation.submit(u1, proposal_id, 4, HashMap::new()).await?;
    let before = env.reputation.get(u2).await?;

    let err = env
        .reputation
        .submit(u1, proposal_id, 1, HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::DuplicateEvaluation { .. }));

    let after = env.reputation.get(u2).await?;
    assert_eq!(before.score, after.score);
    assert_eq!(before.evaluation_count, after.evaluation_count);

    Ok(())
}

#[tokio::test]
async fn test_evaluation_eligibility() -> Result<()> {
    let env = setup().await?;
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
    let a = add_garment(&env.db, u1, "a").await?;
    let b = add_garment(&env.db, u2, "b").await?;
    let pending = env.store.create(u1, a.id, b.id, None).await?;

    // Proposal not completed.
    let err = env
        .reputation
        .submit(u1, pending.id, 5, HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::NotEligible(_)));

    let proposal_id = completed_swap(&env, Uuid::new_v4(), Uuid::new_v4()).await?;

    // Evaluator must be a party.
    let err = env
        .reputation
        .submit(u1, proposal_id, 5, HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::NotEligible(_)));

    Ok(())
}

#[tokio::test]
async fn test_evaluation_score_validation() -> Result<()> {
    let env = setup().await?;
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
    let proposal_id = completed_swap(&env, u1, u2).await?;

    let err = env
        .reputation
        .submit(u1, proposal_id, 6, HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::Validation(_)));

    let unknown = HashMap::from([("style_points".to_string(), 5u8)]);
    let err = env
        .reputation
        .submit(u1, proposal_id, 5, unknown)
        .await
        .unwrap_err();
    assert!(matches!(err, TradeError::Validation(_)));

    Ok(())
}

#[tokio::test]
async fn test_reputation_weighted_average() -> Result<()> {
    let env = setup().await?;
    let (u1, u2, u3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

    let first = completed_swap(&env, u1, u2).await?;
    let second = completed_swap(&env, u3, u2).await?;

    // Overall 5 blended with an all-4 dimension composite: 0.5*5 + 0.5*4 = 4.5.
    let dims = HashMap::from([
        ("item_condition".to_string(), 4u8),
        ("communication".to_string(), 4u8),
        ("punctuality".to_string(), 4u8),
    ]);
    env.reputation.submit(u1, first, 5, dims).await?;
    // No dimensions: contributes the overall score directly.
    env.reputation.submit(u3, second, 4, HashMap::new()).await?;

    let snapshot = env.reputation.get(u2).await?;
    assert_eq!(snapshot.evaluation_count, 2);
    assert_eq!(snapshot.score, 4.25);

    Ok(())
}

#[tokio::test]
async fn test_list_proposals_by_role() -> Result<()> {
    let env = setup().await?;
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
    let a = add_garment(&env.db, u1, "a").await?;
    let b = add_garment(&env.db, u2, "b").await?;
    env.store.create(u1, a.id, b.id, None).await?;

    assert_eq!(env.store.list_for(u1, TradeRole::Proposer).await?.len(), 1);
    assert_eq!(env.store.list_for(u1, TradeRole::Receiver).await?.len(), 0);
    assert_eq!(env.store.list_for(u2, TradeRole::Receiver).await?.len(), 1);
    assert_eq!(env.store.list_for(u2, TradeRole::Either).await?.len(), 1);
    assert_eq!(env.store.list_for(Uuid::new_v4(), TradeRole::Either).await?.len(), 0);

    Ok(())
}

#[tokio::test]
async fn test_concurrent_accept_and_cancel_serialize() -> Result<()> {
    let env = setup().await?;
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
    let a = add_garment(&env.db, u1, "a").await?;
    let b = add_garment(&env.db, u2, "b").await?;
    let p = env.store.create(u1, a.id, b.id, None).await?;

    let accept = {
        let store = env.store.clone();
        let id = p.id;
        tokio::spawn(async move { store.accept(u2, id, None).await })
    };
    let cancel = {
        let store = env.store.clone();
        let id = p.id;
        tokio::spawn(async move { store.cancel(u1, id).await })
    };

    let accept_result = accept.await.unwrap();
    let cancel_result = cancel.await.unwrap();

    // Serialized on the per-proposal lock: cancel wins over an accepted
    // proposal (cancel is legal from Accepted), but accept can never follow
    // a cancellation.
    match (&accept_result, &cancel_result) {
        (Ok(_), Ok(_)) => {
            let p = env.store.get(p.id).await?;
            assert_eq!(p.state, ProposalState::Cancelled);
            assert_eq!(
                env.db.get_garment(a.id).await?.unwrap().binding_state,
                BindingState::Available
            );
        }
        (Ok(_), Err(e)) | (Err(e), Ok(_)) => assert!(e.is_state_conflict()),
        (Err(_), Err(_)) => panic!("one of the two transitions must win"),
    }

    Ok(())
}
