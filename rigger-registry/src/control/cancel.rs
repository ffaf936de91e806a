//! Cooperative cancellation with "first error wins" semantics.

use std::{error::Error, fmt::Display, sync::Mutex};

/// Returned by tasks that stopped because their pass was canceled.
///
/// A pass reports its first real error instead of this, when it has one.
#[derive(Clone, Debug)]
pub struct Canceled {}

impl Display for Canceled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "canceled")
    }
}
impl Error for Canceled {}

pub fn canceled() -> anyhow::Error {
    Canceled {}.into()
}

pub fn is_canceled(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.is::<Canceled>())
}

/// Single-assignment error slot shared by the tasks of a pass.
#[derive(Default)]
pub struct FirstError {
    slot: Mutex<Option<anyhow::Error>>,
}

impl FirstError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `error` if it is the first one. A cancellation that got here
    /// first is replaced by a real error.
    pub fn record(&self, error: anyhow::Error) {
        let mut slot = self.slot.lock().expect("mutex poisoned");
        let replace = match slot.as_ref() {
            None => true,
            Some(existing) => is_canceled(existing) && !is_canceled(&error),
        };
        if replace {
            *slot = Some(error);
        }
    }

    pub fn into_inner(self) -> Option<anyhow::Error> {
        self.slot.into_inner().expect("mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Context as _};

    #[test]
    fn canceled_is_found_through_context() {
        let e = Err::<(), _>(canceled())
            .context("while creating bucket")
            .unwrap_err();
        assert!(is_canceled(&e));
        assert!(!is_canceled(&anyhow!("boom")));
    }

    #[test]
    fn first_real_error_wins() {
        let slot = FirstError::new();
        slot.record(canceled());
        slot.record(anyhow!("first"));
        slot.record(anyhow!("second"));
        slot.record(canceled());
        assert_eq!(slot.into_inner().unwrap().to_string(), "first");
    }
}
