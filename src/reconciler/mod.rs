//! The agent's control loops and the scheduler driving them.
//!
//! Every reconciler implements [`Reconciler`]: one idempotent
//! converge-to-desired-state routine, re-driven on a fixed cadence by
//! [`run`]. Reconcilers never call each other; each one bails out or
//! requeues when its preconditions (key published, link created, ...)
//! are not met yet and relies on a sibling catching up.

pub mod cni;
pub mod identity;
pub mod interface;
pub mod key;
pub mod route;

pub use cni::CniConfigReconciler;
pub use identity::IdentityReconciler;
pub use interface::InterfaceReconciler;
pub use key::KeyReconciler;
pub use route::RouteReconciler;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, Instrument};

use crate::Result;

/// Cadence reconcilers are re-driven at.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Delay before rechecking a precondition that is not met yet.
pub const PRECONDITION_WAIT: Duration = Duration::from_millis(100);

/// Outcome of a successful reconcile cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// The cycle converged; run again on the next tick.
    pub fn done() -> Self {
        Self::default()
    }

    /// Run again after `delay` instead of waiting for the next tick.
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }
}

/// One control loop.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Short name used in logs and spans
    fn name(&self) -> &'static str;

    /// Execute one converge cycle
    async fn reconcile(&self) -> Result<Action>;
}

// Correlation id tying together all log lines of one cycle.
fn sync_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

/// Drive one reconciler until `shutdown` fires.
///
/// The first cycle runs immediately; afterwards cycles run every
/// `interval`, or sooner when a cycle asks to be requeued. Errors are
/// logged and retried on the next tick. A panicking cycle is contained:
/// it is logged and the loop keeps running.
pub async fn run(reconciler: Arc<dyn Reconciler>, interval: Duration, shutdown: CancellationToken) {
    let mut delay = Duration::ZERO;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        let span = info_span!(
            "reconcile",
            controller = reconciler.name(),
            sync_id = %sync_id(),
        );
        let cycle = AssertUnwindSafe(reconciler.reconcile())
            .catch_unwind()
            .instrument(span);

        delay = match cycle.await {
            Ok(Ok(action)) => action.requeue_after.unwrap_or(interval),
            Ok(Err(err)) => {
                error!(
                    controller = reconciler.name(),
                    error = %err,
                    "Reconcile failed"
                );
                interval
            }
            Err(_panic) => {
                error!(
                    controller = reconciler.name(),
                    "Reconcile panicked, retrying on the next tick"
                );
                interval
            }
        };
    }

    debug!(controller = reconciler.name(), "Reconciler stopped");
}
