use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use margo_transport::TransportError;
use parking_lot::Mutex;

use crate::abt::Eventual;
use crate::error::MargoError;
use crate::instance::Instance;
use crate::timer::TimerId;

/// One pending asynchronous operation.
/// `forward`/`respond`/`bulk_transfer` all build one of these, submit
/// to the transport with a completion callback that settles
/// `eventual`, then `.await` it — this *is* "suspend the caller on the
/// eventual" in an async-native runtime. Exactly one outstanding
/// eventual per live request, enforced by construction: nothing else
/// holds a reference to it.
pub(crate) struct PendingRequest {
    eventual: Arc<Eventual<Result<Vec<u8>, TransportError>>>,
    timer_id: Mutex<Option<TimerId>>,
    timer_armed_at_all: AtomicBool,
}

impl PendingRequest {
    fn new() -> Self {
        Self {
            eventual: Arc::new(Eventual::new()),
            timer_id: Mutex::new(None),
            timer_armed_at_all: AtomicBool::new(false),
        }
    }
}

/// Drive one request end to end: install an optional timer, call
/// `submit` with the completion sink it must hand to the transport,
/// suspend on the result, then apply the cancellation/timeout rewrite:
/// if the timer fires before the transport completes, the result is
/// always reported as a timeout regardless of what the best-effort
/// cancel eventually produces.
///
/// `arm_cancel` is called if the timer fires first; it must issue the
/// transport's best-effort cancel for whatever operation `submit`
/// started (a handle-scoped cancel for forward/respond, a bulk-token
/// cancel for bulk transfers).
pub(crate) async fn drive<S, C>(
    instance: &Instance,
    timeout: Option<Duration>,
    submit: S,
    arm_cancel: C,
) -> Result<Vec<u8>, MargoError>
where
    S: FnOnce(margo_transport::CompletionSink) -> Result<(), TransportError>,
    C: FnOnce() + Send + 'static,
{
    let request = Arc::new(PendingRequest::new());
    instance.finalize_state().incr_pending();

    if let Some(duration) = timeout {
        let req_for_timer = request.clone();
        let deadline = Instant::now() + duration;
        let id = instance.timers().arm(
            deadline,
            None,
            Box::new(move || {
                // The timer beat the transport: detach ourselves from
                // the request's bookkeeping first, then best-effort cancel.
                *req_for_timer.timer_id.lock() = None;
                arm_cancel();
                // `arm_cancel` is best-effort and transport-specific — it may
                // never itself resolve this request (e.g. a loopback peer
                // that never calls respond). Settle the eventual here so the
                // waiter always wakes once the deadline passes, independent
                // of whether the transport follows up with its own completion.
                req_for_timer.eventual.set(Err(TransportError::Cancelled));
            }),
        );
        *request.timer_id.lock() = Some(id);
        request.timer_armed_at_all.store(true, Ordering::SeqCst);
        instance.diagnostics().record_timer_armed();
    }

    let req_for_completion = request.clone();
    let sink: margo_transport::CompletionSink = Box::new(move |result| {
        req_for_completion.eventual.set(result);
    });

    if let Err(e) = submit(sink) {
        if let Some(id) = request.timer_id.lock().take() {
            instance.timers().cancel(id);
        }
        instance.finalize_state().decr_pending_triggers_finalize();
        return Err(e.into());
    }

    let result = request.eventual.wait().await;

    let timer_won = if request.timer_armed_at_all.load(Ordering::SeqCst) {
        match request.timer_id.lock().take() {
            // Timer hadn't fired: transport completion arrived first. Cancel
            // and destroy the timer before signalling.
            Some(id) => {
                instance.timers().cancel(id);
                false
            }
            // Timer already fired (and took itself out of the map): it won.
            None => true,
        }
    } else {
        false
    };

    let triggers_finalize = instance.finalize_state().decr_pending_triggers_finalize();
    if triggers_finalize {
        instance.drive_finalize_from_last_operation();
    }

    match result {
        Ok(bytes) => Ok(bytes),
        Err(_) if timer_won => Err(MargoError::Timeout),
        Err(e) => Err(e.into()),
    }
}

/// §4.2 `wait_any`: given several in-flight request futures (e.g. several
/// calls to [`crate::Instance::forward`] not yet awaited), return the
/// index and result of whichever completes first. The spec describes
/// this as "poll each for completion in order ... a bounded yield loop
/// until at least one request's eventual is set" — `select_all` is that
/// same polling loop, built into `futures` rather than hand-rolled here.
pub async fn wait_any<F>(requests: Vec<F>) -> (usize, F::Output)
where
    F: std::future::Future + Unpin,
{
    let (result, index, _still_pending) = futures::future::select_all(requests).await;
    (index, result)
}
