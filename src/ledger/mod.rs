//! Ledger reconciler: quantity aggregates (product stock, account balance)
//! are derived from an append-only history of signed deltas. The cached
//! `current_quantity` is a denormalized convenience; the delta history is
//! the source of truth and every write resums it in full.

use bigdecimal::BigDecimal;
use chrono::Utc;
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction as SqlxTransaction};
use tracing::debug;
use uuid::Uuid;

use crate::db::models::{LedgerAccount, LedgerDelta};
use crate::db::queries;
use crate::error::AppError;

/// Transient recomputed view for consistency audits; never persisted.
#[derive(Debug, Serialize)]
pub struct ReconciledView {
    pub account_id: Uuid,
    pub cached_quantity: BigDecimal,
    pub recomputed_quantity: BigDecimal,
    pub consistent: bool,
}

#[derive(Clone)]
pub struct Reconciler {
    pool: PgPool,
}

impl Reconciler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Read path: full replay without locks. Used for audits and for
    /// recovering a corrupted cached field.
    pub async fn recompute(&self, account_id: Uuid) -> Result<ReconciledView, AppError> {
        let account = queries::get_account(&self.pool, account_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("ledger account {}", account_id)))?;

        let recomputed = queries::sum_deltas(&self.pool, account_id).await?;
        let consistent = recomputed == account.current_quantity;

        Ok(ReconciledView {
            account_id,
            cached_quantity: account.current_quantity,
            recomputed_quantity: recomputed,
            consistent,
        })
    }

    /// Write path: under the account's exclusive row lock, append the delta,
    /// resum the full history and persist the new total. Runs inside the
    /// caller's transaction so a failure anywhere rolls back the delta too;
    /// a delta without its resum must never survive.
    pub async fn apply_delta(
        &self,
        executor: &mut SqlxTransaction<'_, Postgres>,
        account_id: Uuid,
        amount: BigDecimal,
        reason: &str,
    ) -> Result<LedgerAccount, AppError> {
        let account = queries::lock_account(executor, account_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("ledger account {}", account_id)))?;

        self.append_and_resum(executor, &account, amount, reason).await
    }

    /// Same write path, addressing the aggregate by (kind, owner) as the
    /// event consumers do.
    pub async fn apply_delta_by_owner(
        &self,
        executor: &mut SqlxTransaction<'_, Postgres>,
        kind: &str,
        owner_ref: &str,
        amount: BigDecimal,
        reason: &str,
    ) -> Result<LedgerAccount, AppError> {
        let account = queries::lock_account_by_owner(executor, kind, owner_ref)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("ledger account {}/{}", kind, owner_ref))
            })?;

        self.append_and_resum(executor, &account, amount, reason).await
    }

    async fn append_and_resum(
        &self,
        executor: &mut SqlxTransaction<'_, Postgres>,
        account: &LedgerAccount,
        amount: BigDecimal,
        reason: &str,
    ) -> Result<LedgerAccount, AppError> {
        let delta = LedgerDelta {
            id: Uuid::new_v4(),
            account_id: account.id,
            amount,
            reason: reason.to_string(),
            created_at: Utc::now(),
        };
        queries::insert_delta(executor, &delta).await?;

        let total = queries::sum_deltas_in_tx(executor, account.id).await?;
        let updated = queries::update_account_quantity(executor, account.id, &total).await?;

        debug!(
            account_id = %account.id,
            delta = %delta.amount,
            total = %updated.current_quantity,
            reason,
            "ledger delta applied"
        );

        Ok(updated)
    }
}
