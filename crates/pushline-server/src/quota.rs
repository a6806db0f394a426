//! Monthly push quota: reset-on-read plus an atomic conditional increment.

use time::OffsetDateTime;

use pushline_core::{PlanTable, next_month_start};
use pushline_storage::{DynStorage, QuotaDecision};

use crate::error::ApiError;

/// Admit one push against the owner's monthly ceiling, or reject with 429.
///
/// A lapsed reset boundary is applied first and persists even when the
/// current request is later rejected. The increment itself is conditional
/// inside the storage backend, so concurrent pushes at the ceiling can never
/// overshoot it.
pub async fn check_and_consume(
    storage: &DynStorage,
    plans: &PlanTable,
    user_id: &str,
) -> Result<(), ApiError> {
    let account = storage.accounts().get_or_create_account(user_id).await?;

    let now = OffsetDateTime::now_utc();
    if account.pushes_reset_at <= now {
        storage
            .accounts()
            .reset_usage(user_id, next_month_start(now))
            .await?;
        tracing::info!(user_id = %user_id, "Monthly push counter reset");
    }

    let limit = plans.limits(account.plan).pushes;
    match storage
        .accounts()
        .try_consume_push(user_id, account.plan, limit)
        .await?
    {
        QuotaDecision::Admitted { .. } => Ok(()),
        QuotaDecision::Exceeded { plan, used, limit } => {
            Err(ApiError::QuotaExceeded { plan, used, limit })
        }
    }
}
