use std::sync::Arc;
use std::time::Duration;

use margo_transport::{Address, BulkHandle, BulkOp};

use crate::error::MargoError;
use crate::instance::Instance;

/// Split a transfer of size `size` into `ceil(size / chunk_size)`
/// independent sub-transfers issued in parallel. All sub-requests are
/// collected and waited on regardless of individual failure — the
/// first error code wins, but none are ever dropped silently.
#[allow(clippy::too_many_arguments)]
pub async fn chunked_transfer(
    instance: &Arc<Instance>,
    op: BulkOp,
    origin_addr: Address,
    origin: BulkHandle,
    origin_offset: usize,
    local: BulkHandle,
    local_offset: usize,
    size: usize,
    chunk_size: usize,
    timeout: Option<Duration>,
) -> Result<(), MargoError> {
    if chunk_size == 0 {
        return Err(MargoError::InvalidArgument("chunk_size must be non-zero".into()));
    }
    let chunk_count = size.div_ceil(chunk_size);
    let mut futures = Vec::with_capacity(chunk_count);

    for i in 0..chunk_count {
        let start = i * chunk_size;
        let len = chunk_size.min(size - start);
        let instance = instance.clone();
        let origin_addr = origin_addr.clone();
        let origin = origin.clone();
        let local = local.clone();
        futures.push(async move {
            instance
                .bulk_transfer_one(op, origin_addr, origin, origin_offset + start, local, local_offset + start, len, timeout)
                .await
        });
    }

    let results = futures::future::join_all(futures).await;
    let mut first_error = None;
    for result in results {
        if let Err(e) = result {
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
