use crate::database::Database;
use crate::model::{BindingState, Garment};
use crate::{GarmentId, ProposalId, Result, TradeError, UserId};
use async_trait::async_trait;
use sqlx::SqliteConnection;

/// Seam to the garment catalog collaborator. The core only needs ownership
/// checks; listing, browsing and editing garments live outside this crate.
#[async_trait]
pub trait GarmentCatalog: Send + Sync {
    async fn is_owned_by(&self, garment_id: GarmentId, user_id: UserId) -> Result<bool>;
}

/// Catalog backed by the local garments table.
pub struct SqlGarmentCatalog {
    db: Database,
}

impl SqlGarmentCatalog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl GarmentCatalog for SqlGarmentCatalog {
    async fn is_owned_by(&self, garment_id: GarmentId, user_id: UserId) -> Result<bool> {
        match self.db.get_garment(garment_id).await? {
            Some(garment) => Ok(garment.owner_id == user_id),
            None => Err(TradeError::GarmentNotFound(garment_id)),
        }
    }
}

/// Owns each garment's binding state. Only the proposal store calls the
/// mutating entry points; the `_on` variants run on a caller-supplied
/// connection so reservations join the store's transactions.
#[derive(Clone)]
pub struct GarmentLedger {
    db: Database,
}

impl GarmentLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(&self, garment_id: GarmentId) -> Result<Garment> {
        self.db
            .get_garment(garment_id)
            .await?
            .ok_or(TradeError::GarmentNotFound(garment_id))
    }

    pub async fn check_available(&self, garment_id: GarmentId) -> Result<bool> {
        Ok(self.get(garment_id).await?.binding_state == BindingState::Available)
    }

    /// Like `check_available` but surfaces the offending state.
    pub async fn ensure_available(&self, garment_id: GarmentId) -> Result<Garment> {
        let garment = self.get(garment_id).await?;
        if garment.binding_state != BindingState::Available {
            return Err(TradeError::GarmentUnavailable {
                garment_id,
                state: garment.binding_state,
            });
        }
        Ok(garment)
    }

    pub async fn reserve_exclusive(
        &self,
        garment_id: GarmentId,
        proposal_id: ProposalId,
    ) -> Result<()> {
        let mut conn = self.db.pool().acquire().await?;
        Self::reserve_exclusive_on(&mut conn, garment_id, proposal_id).await
    }

    /// Idempotent for the holding proposal; `AlreadyReserved` when another
    /// proposal holds the garment.
    pub(crate) async fn reserve_exclusive_on(
        conn: &mut SqliteConnection,
        garment_id: GarmentId,
        proposal_id: ProposalId,
    ) -> Result<()> {
        let garment = Database::get_garment_on(conn, garment_id)
            .await?
            .ok_or(TradeError::GarmentNotFound(garment_id))?;

        match garment.reserved_by {
            Some(holder) if holder == proposal_id => return Ok(()),
            Some(holder) => {
                return Err(TradeError::AlreadyReserved {
                    garment_id,
                    held_by: holder,
                })
            }
            None => {}
        }

        if garment.binding_state != BindingState::Available {
            return Err(TradeError::GarmentUnavailable {
                garment_id,
                state: garment.binding_state,
            });
        }

        Database::set_garment_binding_on(
            conn,
            garment_id,
            BindingState::InNegotiation,
            Some(proposal_id),
        )
        .await
    }

    pub async fn release(&self, garment_id: GarmentId, proposal_id: ProposalId) -> Result<()> {
        let mut conn = self.db.pool().acquire().await?;
        Self::release_on(&mut conn, garment_id, proposal_id).await
    }

    /// No-op unless the garment is held by exactly this proposal, so a stale
    /// release never disturbs a garment bound to a different accepted trade.
    pub(crate) async fn release_on(
        conn: &mut SqliteConnection,
        garment_id: GarmentId,
        proposal_id: ProposalId,
    ) -> Result<()> {
        let garment = Database::get_garment_on(conn, garment_id)
            .await?
            .ok_or(TradeError::GarmentNotFound(garment_id))?;

        if garment.reserved_by != Some(proposal_id) {
            return Ok(());
        }

        Database::set_garment_binding_on(conn, garment_id, BindingState::Available, None).await
    }

    pub(crate) async fn mark_swapped_on(
        conn: &mut SqliteConnection,
        garment_id: GarmentId,
        proposal_id: ProposalId,
    ) -> Result<()> {
        let garment = Database::get_garment_on(conn, garment_id)
            .await?
            .ok_or(TradeError::GarmentNotFound(garment_id))?;

        if garment.reserved_by != Some(proposal_id) {
            return Err(TradeError::AlreadyReserved {
                garment_id,
                held_by: garment.reserved_by.unwrap_or(proposal_id),
            });
        }

        Database::set_garment_binding_on(conn, garment_id, BindingState::Swapped, None).await
    }
}
