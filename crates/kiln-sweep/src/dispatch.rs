//! Concurrent fan-out of independent invocations.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use kiln_types::{KilnError, KilnResult};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};
use tracing::{debug, warn};

/// How many invocations may run at once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// `None` starts every input immediately.
    pub max_concurrent_tasks: Option<usize>,
}

impl DispatchConfig {
    pub fn with_max_concurrent_tasks(mut self, n: usize) -> Self {
        self.max_concurrent_tasks = Some(n.max(1));
        self
    }

    fn permits(&self, inputs: usize) -> usize {
        self.max_concurrent_tasks
            .unwrap_or(inputs)
            .clamp(1, Semaphore::MAX_PERMITS)
    }
}

/// Results of a fan-out, yielded as each invocation finishes.
///
/// Dropping it aborts every invocation still waiting or running.
pub struct Completions<R> {
    set: JoinSet<KilnResult<R>>,
    indices: HashMap<Id, usize>,
}

impl<R: Send + 'static> Completions<R> {
    /// Next finished invocation as `(input index, result)`, or `None` once all
    /// have been yielded.
    pub async fn next(&mut self) -> Option<(usize, KilnResult<R>)> {
        loop {
            let (id, result) = match self.set.join_next_with_id().await? {
                Ok(done) => done,
                Err(e) => {
                    let what = if e.is_panic() { "panicked" } else { "was cancelled" };
                    (e.id(), Err(KilnError::Internal(format!("invocation {what}: {e}"))))
                }
            };
            match self.indices.remove(&id) {
                Some(index) => return Some((index, result)),
                None => warn!("Dispatch task {} finished without a known input", id),
            }
        }
    }
}

/// Start `f` on every input and return a handle that yields results in
/// completion order. A panicking invocation surfaces as an internal error for
/// its index; no invocation is retried.
pub fn dispatch_all<T, R, F, Fut>(inputs: Vec<T>, config: &DispatchConfig, f: F) -> Completions<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = KilnResult<R>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(config.permits(inputs.len())));
    let mut set = JoinSet::new();
    let mut indices = HashMap::with_capacity(inputs.len());
    debug!("Dispatching {} invocations", inputs.len());

    for (index, input) in inputs.into_iter().enumerate() {
        let invocation = f(input);
        let semaphore = semaphore.clone();
        let handle = set.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| KilnError::Internal(e.to_string()))?;
            invocation.await
        });
        indices.insert(handle.id(), index);
    }

    Completions { set, indices }
}
