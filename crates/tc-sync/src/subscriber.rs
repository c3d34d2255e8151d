//! Change callbacks and per-invocation results

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tc_core::Dataset;
use tracing::warn;

/// Invoked with the dataset whose origin changed
pub type ChangeCallback = Arc<dyn Fn(&Dataset) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by `start_watching`, used to unregister one callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub(crate) u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber#{}", self.0)
    }
}

/// What one callback invocation returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackOutcome {
    pub subscriber: SubscriberId,
    pub result: Result<(), String>,
}

impl CallbackOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Run every callback; a failing or panicking one does not stop the rest
pub(crate) fn notify_all(dataset: &Dataset, callbacks: &[(SubscriberId, ChangeCallback)]) -> Vec<CallbackOutcome> {
    callbacks
        .iter()
        .map(|(id, callback)| {
            let result = match catch_unwind(AssertUnwindSafe(|| callback(dataset))) {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(format!("{:#}", e)),
                Err(_) => Err("callback panicked".to_string()),
            };
            if let Err(e) = &result {
                warn!("Change callback {} for {} failed: {}", id, dataset, e);
            }
            CallbackOutcome {
                subscriber: *id,
                result,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn callback<F>(f: F) -> ChangeCallback
    where
        F: Fn(&Dataset) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    #[test]
    fn failures_are_isolated() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let callbacks: Vec<(SubscriberId, ChangeCallback)> = vec![
            (SubscriberId(1), callback(|_| anyhow::bail!("disk full"))),
            (SubscriberId(2), callback(|_| panic!("boom"))),
            (
                SubscriberId(3),
                callback(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            ),
        ];

        let outcomes = notify_all(&Dataset::new("a.xlsx", "S"), &callbacks);
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].result, Err("disk full".to_string()));
        assert!(!outcomes[1].is_ok());
        assert!(outcomes[2].is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
