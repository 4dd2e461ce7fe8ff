use crate::model::{
    BindingState, ChatMessage, ClosureReason, Evaluation, Garment, Proposal, ProposalState,
    ReputationSnapshot, TradeRole,
};
use crate::{GarmentId, ProposalId, Result, TradeError, UserId};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::from_str(database_url)?
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal),
        )
        .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS garments (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                title TEXT NOT NULL,
                binding_state TEXT NOT NULL DEFAULT 'available',
                reserved_by TEXT,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS proposals (
                id TEXT PRIMARY KEY,
                offered_garment_id TEXT NOT NULL,
                requested_garment_id TEXT NOT NULL,
                proposer_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                state TEXT NOT NULL,
                closure_reason TEXT,
                proposer_confirmed_at DATETIME,
                receiver_confirmed_at DATETIME,
                reminded_at DATETIME,
                version INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL,
                last_activity_at DATETIME NOT NULL,
                FOREIGN KEY (offered_garment_id) REFERENCES garments(id),
                FOREIGN KEY (requested_garment_id) REFERENCES garments(id)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                proposal_id TEXT NOT NULL,
                sender_id TEXT,
                body TEXT NOT NULL,
                created_at DATETIME NOT NULL,
                FOREIGN KEY (proposal_id) REFERENCES proposals(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS message_reads (
                message_id TEXT NOT NULL,
                reader_id TEXT NOT NULL,
                read_at DATETIME NOT NULL,
                PRIMARY KEY (message_id, reader_id),
                FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS evaluations (
                id TEXT PRIMARY KEY,
                proposal_id TEXT NOT NULL,
                evaluator_id TEXT NOT NULL,
                evaluated_id TEXT NOT NULL,
                overall_score INTEGER NOT NULL,
                dimension_scores TEXT NOT NULL,
                created_at DATETIME NOT NULL,
                UNIQUE (proposal_id, evaluator_id),
                FOREIGN KEY (proposal_id) REFERENCES proposals(id)
            );

            CREATE TABLE IF NOT EXISTS reputation_snapshots (
                user_id TEXT PRIMARY KEY,
                score REAL NOT NULL,
                evaluation_count INTEGER NOT NULL,
                updated_at DATETIME NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_garments_owner ON garments(owner_id);
            CREATE INDEX IF NOT EXISTS idx_proposals_state ON proposals(state);
            CREATE INDEX IF NOT EXISTS idx_proposals_proposer ON proposals(proposer_id);
            CREATE INDEX IF NOT EXISTS idx_proposals_receiver ON proposals(receiver_id);
            CREATE INDEX IF NOT EXISTS idx_proposals_offered ON proposals(offered_garment_id);
            CREATE INDEX IF NOT EXISTS idx_proposals_requested ON proposals(requested_garment_id);
            CREATE INDEX IF NOT EXISTS idx_messages_proposal ON messages(proposal_id);
            CREATE INDEX IF NOT EXISTS idx_evaluations_evaluated ON evaluations(evaluated_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    // ---- garments ----

    pub async fn create_garment(&self, garment: &Garment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO garments (id, owner_id, title, binding_state, reserved_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(garment.id.to_string())
        .bind(garment.owner_id.to_string())
        .bind(&garment.title)
        .bind(garment.binding_state.as_str())
        .bind(garment.reserved_by.map(|id| id.to_string()))
        .bind(garment.created_at)
        .bind(garment.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_garment(&self, garment_id: GarmentId) -> Result<Option<Garment>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_garment_on(&mut conn, garment_id).await
    }

    pub(crate) async fn get_garment_on(
        conn: &mut SqliteConnection,
        garment_id: GarmentId,
    ) -> Result<Option<Garment>> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_id, title, binding_state, reserved_by, created_at, updated_at
            FROM garments WHERE id = ?
            "#,
        )
        .bind(garment_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

        row.map(|r| garment_from_row(&r)).transpose()
    }

    pub(crate) async fn set_garment_binding_on(
        conn: &mut SqliteConnection,
        garment_id: GarmentId,
        state: BindingState,
        reserved_by: Option<ProposalId>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE garments SET binding_state = ?, reserved_by = ?, updated_at = ? WHERE id = ?
            "#,
        )
        .bind(state.as_str())
        .bind(reserved_by.map(|id| id.to_string()))
        .bind(Utc::now())
        .bind(garment_id.to_string())
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    // ---- proposals ----

    pub(crate) async fn create_proposal_on(
        conn: &mut SqliteConnection,
        proposal: &Proposal,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO proposals (
                id, offered_garment_id, requested_garment_id, proposer_id, receiver_id,
                state, closure_reason, proposer_confirmed_at, receiver_confirmed_at,
                reminded_at, version, created_at, last_activity_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(proposal.id.to_string())
        .bind(proposal.offered_garment_id.to_string())
        .bind(proposal.requested_garment_id.to_string())
        .bind(proposal.proposer_id.to_string())
        .bind(proposal.receiver_id.to_string())
        .bind(proposal.state.as_str())
        .bind(proposal.closure_reason.map(|r| r.as_str()))
        .bind(proposal.proposer_confirmed_at)
        .bind(proposal.receiver_confirmed_at)
        .bind(proposal.reminded_at)
        .bind(proposal.version)
        .bind(proposal.created_at)
        .bind(proposal.last_activity_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    pub async fn get_proposal(&self, proposal_id: ProposalId) -> Result<Option<Proposal>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_proposal_on(&mut conn, proposal_id).await
    }

    pub(crate) async fn get_proposal_on(
        conn: &mut SqliteConnection,
        proposal_id: ProposalId,
    ) -> Result<Option<Proposal>> {
        let row = sqlx::query(&format!(
            "{PROPOSAL_COLUMNS} FROM proposals WHERE id = ?"
        ))
        .bind(proposal_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

        row.map(|r| proposal_from_row(&r)).transpose()
    }

    /// Version-guarded write. Bumps the proposal's version on success and
    /// fails with `ConcurrentModification` if the row changed underneath.
    pub async fn update_proposal(&self, proposal: &mut Proposal) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::update_proposal_on(&mut conn, proposal).await
    }

    pub(crate) async fn update_proposal_on(
        conn: &mut SqliteConnection,
        proposal: &mut Proposal,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE proposals
            SET state = ?, closure_reason = ?, proposer_confirmed_at = ?,
                receiver_confirmed_at = ?, reminded_at = ?, last_activity_at = ?,
                version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(proposal.state.as_str())
        .bind(proposal.closure_reason.map(|r| r.as_str()))
        .bind(proposal.proposer_confirmed_at)
        .bind(proposal.receiver_confirmed_at)
        .bind(proposal.reminded_at)
        .bind(proposal.last_activity_at)
        .bind(proposal.id.to_string())
        .bind(proposal.version)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TradeError::ConcurrentModification(proposal.id));
        }
        proposal.version += 1;
        Ok(())
    }

    pub async fn list_proposals_for(&self, user_id: UserId, role: TradeRole) -> Result<Vec<Proposal>> {
        let query = match role {
            TradeRole::Proposer => format!(
                "{PROPOSAL_COLUMNS} FROM proposals WHERE proposer_id = ?1 ORDER BY last_activity_at DESC"
            ),
            TradeRole::Receiver => format!(
                "{PROPOSAL_COLUMNS} FROM proposals WHERE receiver_id = ?1 ORDER BY last_activity_at DESC"
            ),
            TradeRole::Either => format!(
                "{PROPOSAL_COLUMNS} FROM proposals WHERE proposer_id = ?1 OR receiver_id = ?1 ORDER BY last_activity_at DESC"
            ),
        };

        let rows = sqlx::query(&query)
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(proposal_from_row).collect()
    }

    pub(crate) async fn count_pending_for_garment_on(
        conn: &mut SqliteConnection,
        garment_id: GarmentId,
    ) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM proposals WHERE requested_garment_id = ? AND state = 'pending'",
        )
        .bind(garment_id.to_string())
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.try_get("n")?)
    }

    pub(crate) async fn pending_pair_exists_on(
        conn: &mut SqliteConnection,
        offered: GarmentId,
        requested: GarmentId,
    ) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM proposals
            WHERE offered_garment_id = ? AND requested_garment_id = ? AND state = 'pending'
            "#,
        )
        .bind(offered.to_string())
        .bind(requested.to_string())
        .fetch_one(&mut *conn)
        .await?;

        let n: i64 = row.try_get("n")?;
        Ok(n > 0)
    }

    /// All pending proposals (other than `exclude`) referencing either garment.
    pub(crate) async fn pending_referencing_on(
        conn: &mut SqliteConnection,
        garment_a: GarmentId,
        garment_b: GarmentId,
        exclude: ProposalId,
    ) -> Result<Vec<Proposal>> {
        let rows = sqlx::query(&format!(
            r#"
            {PROPOSAL_COLUMNS} FROM proposals
            WHERE state = 'pending' AND id != ?1
              AND (offered_garment_id IN (?2, ?3) OR requested_garment_id IN (?2, ?3))
            "#
        ))
        .bind(exclude.to_string())
        .bind(garment_a.to_string())
        .bind(garment_b.to_string())
        .fetch_all(&mut *conn)
        .await?;

        rows.iter().map(proposal_from_row).collect()
    }

    pub async fn stale_pending(&self, cutoff: DateTime<Utc>) -> Result<Vec<Proposal>> {
        let rows = sqlx::query(&format!(
            "{PROPOSAL_COLUMNS} FROM proposals WHERE state = 'pending' AND created_at <= ? ORDER BY created_at ASC"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(proposal_from_row).collect()
    }

    /// Pending proposals created inside `(older_than, newer_than]`, i.e. the
    /// ones whose deadline is close but not yet past.
    pub async fn pending_created_between(
        &self,
        older_than: DateTime<Utc>,
        newer_than: DateTime<Utc>,
    ) -> Result<Vec<Proposal>> {
        let rows = sqlx::query(&format!(
            r#"
            {PROPOSAL_COLUMNS} FROM proposals
            WHERE state = 'pending' AND created_at <= ? AND created_at > ?
            ORDER BY created_at ASC
            "#
        ))
        .bind(older_than)
        .bind(newer_than)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(proposal_from_row).collect()
    }

    pub async fn mark_reminded(&self, proposal_id: ProposalId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE proposals SET reminded_at = ? WHERE id = ?")
            .bind(at)
            .bind(proposal_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Bumps `last_activity_at` without touching the version counter; chat
    /// traffic must not fail state transitions that are in flight.
    pub async fn touch_proposal_activity(
        &self,
        proposal_id: ProposalId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE proposals SET last_activity_at = ? WHERE id = ?")
            .bind(at)
            .bind(proposal_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ---- messages ----

    pub async fn create_message(&self, message: &ChatMessage) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::create_message_on(&mut conn, message).await
    }

    pub(crate) async fn create_message_on(
        conn: &mut SqliteConnection,
        message: &ChatMessage,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, proposal_id, sender_id, body, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(message.id.to_string())
        .bind(message.proposal_id.to_string())
        .bind(message.sender_id.map(|id| id.to_string()))
        .bind(&message.body)
        .bind(message.created_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    pub async fn list_messages(&self, proposal_id: ProposalId) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, proposal_id, sender_id, body, created_at
            FROM messages WHERE proposal_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(proposal_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    /// Inserts read receipts for every message in the proposal not authored by
    /// the reader. Idempotent: already-read messages are skipped.
    pub async fn mark_messages_read(
        &self,
        proposal_id: ProposalId,
        reader_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO message_reads (message_id, reader_id, read_at)
            SELECT m.id, ?1, ?2 FROM messages m
            WHERE m.proposal_id = ?3 AND (m.sender_id IS NULL OR m.sender_id != ?1)
            "#,
        )
        .bind(reader_id.to_string())
        .bind(at)
        .bind(proposal_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn unread_count(&self, proposal_id: ProposalId, reader_id: UserId) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM messages m
            WHERE m.proposal_id = ?1 AND (m.sender_id IS NULL OR m.sender_id != ?2)
              AND NOT EXISTS (
                  SELECT 1 FROM message_reads r
                  WHERE r.message_id = m.id AND r.reader_id = ?2
              )
            "#,
        )
        .bind(proposal_id.to_string())
        .bind(reader_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("n")?)
    }

    // ---- evaluations & reputation ----

    pub async fn create_evaluation(&self, evaluation: &Evaluation) -> Result<()> {
        let dimension_scores = serde_json::to_string(&evaluation.dimension_scores)?;
        let result = sqlx::query(
            r#"
            INSERT INTO evaluations (
                id, proposal_id, evaluator_id, evaluated_id, overall_score, dimension_scores, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(evaluation.id.to_string())
        .bind(evaluation.proposal_id.to_string())
        .bind(evaluation.evaluator_id.to_string())
        .bind(evaluation.evaluated_id.to_string())
        .bind(evaluation.overall_score as i64)
        .bind(dimension_scores)
        .bind(evaluation.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(TradeError::DuplicateEvaluation {
                    proposal_id: evaluation.proposal_id,
                    evaluator_id: evaluation.evaluator_id,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn evaluations_for(&self, evaluated_id: UserId) -> Result<Vec<Evaluation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, proposal_id, evaluator_id, evaluated_id, overall_score, dimension_scores, created_at
            FROM evaluations WHERE evaluated_id = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(evaluated_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(evaluation_from_row).collect()
    }

    pub async fn upsert_reputation(&self, snapshot: &ReputationSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reputation_snapshots (user_id, score, evaluation_count, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id) DO UPDATE SET score = ?2, evaluation_count = ?3, updated_at = ?4
            "#,
        )
        .bind(snapshot.user_id.to_string())
        .bind(snapshot.score)
        .bind(snapshot.evaluation_count)
        .bind(snapshot.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_reputation(&self, user_id: UserId) -> Result<Option<ReputationSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, score, evaluation_count, updated_at
            FROM reputation_snapshots WHERE user_id = ?
            "#,
        )
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| snapshot_from_row(&r)).transpose()
    }
}

const PROPOSAL_COLUMNS: &str = "SELECT id, offered_garment_id, requested_garment_id, proposer_id, \
     receiver_id, state, closure_reason, proposer_confirmed_at, receiver_confirmed_at, \
     reminded_at, version, created_at, last_activity_at";

fn parse_uuid(row: &SqliteRow, column: &str) -> Result<Uuid> {
    let value: String = row.try_get(column)?;
    Ok(Uuid::parse_str(&value)?)
}

fn parse_uuid_opt(row: &SqliteRow, column: &str) -> Result<Option<Uuid>> {
    let value: Option<String> = row.try_get(column)?;
    value.map(|s| Uuid::parse_str(&s).map_err(Into::into)).transpose()
}

fn garment_from_row(row: &SqliteRow) -> Result<Garment> {
    let state: String = row.try_get("binding_state")?;
    Ok(Garment {
        id: parse_uuid(row, "id")?,
        owner_id: parse_uuid(row, "owner_id")?,
        title: row.try_get("title")?,
        binding_state: BindingState::parse(&state)?,
        reserved_by: parse_uuid_opt(row, "reserved_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn proposal_from_row(row: &SqliteRow) -> Result<Proposal> {
    let state: String = row.try_get("state")?;
    let closure_reason: Option<String> = row.try_get("closure_reason")?;
    Ok(Proposal {
        id: parse_uuid(row, "id")?,
        offered_garment_id: parse_uuid(row, "offered_garment_id")?,
        requested_garment_id: parse_uuid(row, "requested_garment_id")?,
        proposer_id: parse_uuid(row, "proposer_id")?,
        receiver_id: parse_uuid(row, "receiver_id")?,
        state: ProposalState::parse(&state)?,
        closure_reason: closure_reason.as_deref().map(ClosureReason::parse).transpose()?,
        proposer_confirmed_at: row.try_get("proposer_confirmed_at")?,
        receiver_confirmed_at: row.try_get("receiver_confirmed_at")?,
        reminded_at: row.try_get("reminded_at")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        last_activity_at: row.try_get("last_activity_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<ChatMessage> {
    Ok(ChatMessage {
        id: parse_uuid(row, "id")?,
        proposal_id: parse_uuid(row, "proposal_id")?,
        sender_id: parse_uuid_opt(row, "sender_id")?,
        body: row.try_get("body")?,
        created_at: row.try_get("created_at")?,
    })
}

fn evaluation_from_row(row: &SqliteRow) -> Result<Evaluation> {
    let overall_score: i64 = row.try_get("overall_score")?;
    let dimension_scores: String = row.try_get("dimension_scores")?;
    Ok(Evaluation {
        id: parse_uuid(row, "id")?,
        proposal_id: parse_uuid(row, "proposal_id")?,
        evaluator_id: parse_uuid(row, "evaluator_id")?,
        evaluated_id: parse_uuid(row, "evaluated_id")?,
        overall_score: overall_score as u8,
        dimension_scores: serde_json::from_str(&dimension_scores)?,
        created_at: row.try_get("created_at")?,
    })
}

fn snapshot_from_row(row: &SqliteRow) -> Result<ReputationSnapshot> {
    Ok(ReputationSnapshot {
        user_id: parse_uuid(row, "user_id")?,
        score: row.try_get("score")?,
        evaluation_count: row.try_get("evaluation_count")?,
        updated_at: row.try_get("updated_at")?,
    })
}
