// src/messaging/recovery.rs

use crate::error::StoreError;
use crate::models::RequeueFilter;
use crate::store::MessagingStore;

/// Put failed messages back in the queue. No gateway call happens here; the
/// next dispatch run picks them up. Running it again with nothing newly
/// failed changes nothing.
pub async fn requeue_failed(
    store: &dyn MessagingStore,
    filter: &RequeueFilter,
) -> Result<u64, StoreError> {
    let n = store.requeue_failed(filter).await?;

    tracing::info!(
        requeued = n,
        trigger_type = ?filter.trigger_type,
        include_permanent = filter.include_permanent,
        "Requeued failed messages"
    );

    Ok(n)
}
