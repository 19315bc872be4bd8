use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

/// Terminal error signal of a flow.
///
/// Errors are delivered at most once per subscriber and are clonable so that
/// processors can broadcast them and composite containers can collect them;
/// dynamic payloads sit behind an [`Arc`].
#[derive(Debug, Clone, Error)]
pub enum FlowError {
    /// A second subscription was handed to a subscriber that already holds one.
    #[error("a second subscription was attached to an already-subscribed subscriber")]
    AlreadySubscribed,
    /// `request(0)` was issued; demand must be positive.
    #[error("request amount must be positive")]
    ZeroRequest,
    /// Upstream produced more items than the outstanding demand.
    #[error("upstream produced more items than the outstanding demand")]
    Overflow,
    /// No signal arrived within the configured window.
    #[error("no signal within {0:?}")]
    Timeout(Duration),
    /// Several concurrent errors, in arrival order.
    #[error(transparent)]
    Composite(CompositeError),
    /// A user-supplied fallible callback failed.
    #[error("{0}")]
    User(Arc<dyn std::error::Error + Send + Sync + 'static>),
    /// A plain-text error raised through [`FlowError::message`].
    #[error("{0}")]
    Message(Arc<str>),
}

impl FlowError {
    /// Wraps an arbitrary error value.
    pub fn user(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::User(Arc::new(err))
    }

    /// Builds an error from a plain message.
    pub fn message(msg: impl AsRef<str>) -> Self {
        Self::Message(Arc::from(msg.as_ref()))
    }

    /// Collapses a batch of errors: one error stays itself, several become a
    /// [`CompositeError`] preserving arrival order.
    pub fn composite(mut errors: Vec<FlowError>) -> Self {
        if errors.len() == 1 {
            errors.pop().unwrap()
        } else {
            Self::Composite(CompositeError { errors })
        }
    }
}

/// Container for errors that occurred concurrently (e.g. `merge` with delayed
/// errors), in arrival order.
#[derive(Debug, Clone, Default)]
pub struct CompositeError {
    errors: Vec<FlowError>,
}

impl CompositeError {
    pub fn errors(&self) -> &[FlowError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<FlowError> {
        self.errors
    }
}

impl fmt::Display for CompositeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} concurrent errors:", self.errors.len())?;
        for (i, e) in self.errors.iter().enumerate() {
            write!(f, " [{i}] {e};")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompositeError {}

/// Arrival-ordered error accumulator for coordinators running with delayed
/// errors. Push is serialized by a mutex; the error path is cold.
#[derive(Default)]
pub(crate) struct ErrorBag {
    errors: Mutex<Vec<FlowError>>,
}

impl ErrorBag {
    pub(crate) fn push(&self, err: FlowError) {
        self.errors.lock().unwrap().push(err);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.errors.lock().unwrap().is_empty()
    }

    /// Drains the bag into a terminal error, if any error arrived.
    pub(crate) fn take(&self) -> Option<FlowError> {
        let mut guard = self.errors.lock().unwrap();
        if guard.is_empty() {
            None
        } else {
            Some(FlowError::composite(std::mem::take(&mut *guard)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A single delayed error must not be wrapped into a composite
    #[test]
    fn test_composite_collapse() {
        let e = FlowError::composite(vec![FlowError::Overflow]);
        assert!(matches!(e, FlowError::Overflow));

        let e = FlowError::composite(vec![FlowError::Overflow, FlowError::ZeroRequest]);
        match e {
            FlowError::Composite(c) => assert_eq!(c.errors().len(), 2),
            other => panic!("expected composite, got {other:?}"),
        }
    }

    /// Arrival order is preserved by the bag
    #[test]
    fn test_bag_order() {
        let bag = ErrorBag::default();
        bag.push(FlowError::message("first"));
        bag.push(FlowError::message("second"));
        match bag.take().unwrap() {
            FlowError::Composite(c) => {
                assert_eq!(c.errors()[0].to_string(), "first");
                assert_eq!(c.errors()[1].to_string(), "second");
            }
            other => panic!("expected composite, got {other:?}"),
        }
        assert!(bag.take().is_none());
    }
}
