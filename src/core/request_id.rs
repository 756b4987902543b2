//! Backend request-id generation.
//!
//! Every managed server gets its own generator so that ids written to one
//! backend never depend on traffic to another. The composer's correlation
//! ids (uuid) are a separate scheme; these ids exist only on the backend
//! wire.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::protocol::RequestId;

/// Prefixed sequential request-id generator.
pub struct RequestIdGenerator {
    counter: AtomicU64,
    prefix: String,
}

impl RequestIdGenerator {
    /// Create a generator whose ids carry the given prefix, typically the
    /// owning server's id.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            counter: AtomicU64::new(1),
            prefix: prefix.into(),
        }
    }

    pub fn next_id(&self) -> RequestId {
        let num = self.counter.fetch_add(1, Ordering::SeqCst);
        RequestId::String(format!("{}-{}", self.prefix, num))
    }

    pub fn current_value(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_sequential_ids() {
        let generator = RequestIdGenerator::with_prefix("calc");

        assert_eq!(generator.next_id(), RequestId::String("calc-1".into()));
        assert_eq!(generator.next_id(), RequestId::String("calc-2".into()));
        assert_eq!(generator.current_value(), 3);
    }

    #[test]
    fn test_generators_are_independent() {
        let a = RequestIdGenerator::with_prefix("a");
        let b = RequestIdGenerator::with_prefix("b");

        let _ = a.next_id();
        let _ = a.next_id();

        assert_eq!(b.next_id(), RequestId::String("b-1".into()));
    }
}
