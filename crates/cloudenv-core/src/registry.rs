// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handler registry.
//!
//! Handlers are collected by [`HandlerRegistryBuilder`] and resolved by target at dispatch
//! time. [`HandlerRegistryBuilder::build`] proves at startup that every target has exactly
//! one handler, so routing never depends on registration order.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::envelope::ContinuationTarget;
use crate::error::{CoreError, Result};
use crate::handler::{Erased, ErasedHandler, PhaseHandler};

/// Immutable map from target to its handler.
pub struct HandlerRegistry<T> {
    handlers: HashMap<T, Arc<dyn ErasedHandler<T>>>,
}

impl<T: ContinuationTarget> HandlerRegistry<T> {
    /// Start collecting handlers.
    pub fn builder() -> HandlerRegistryBuilder<T> {
        HandlerRegistryBuilder {
            handlers: Vec::new(),
        }
    }

    pub(crate) fn resolve(&self, target: T) -> Option<Arc<dyn ErasedHandler<T>>> {
        self.handlers.get(&target).cloned()
    }

    /// Whether a handler is registered for `target`.
    pub fn contains(&self, target: T) -> bool {
        self.handlers.contains_key(&target)
    }

    /// Name of the handler registered for `target`.
    pub fn handler_name(&self, target: T) -> Option<&'static str> {
        self.handlers.get(&target).map(|h| h.name())
    }

    /// Number of routed targets.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no target is routed.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Collects handlers before routing is fixed.
pub struct HandlerRegistryBuilder<T> {
    handlers: Vec<Arc<dyn ErasedHandler<T>>>,
}

impl<T: ContinuationTarget> HandlerRegistryBuilder<T> {
    /// Add a handler.
    pub fn register<H: PhaseHandler<T>>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(Erased(handler)));
        self
    }

    /// Build the registry, requiring a handler for every target.
    pub fn build(self) -> Result<HandlerRegistry<T>> {
        self.route(true)
    }

    /// Build the registry, leaving unclaimed targets unrouted.
    pub fn build_partial(self) -> Result<HandlerRegistry<T>> {
        self.route(false)
    }

    fn route(self, exhaustive: bool) -> Result<HandlerRegistry<T>> {
        let mut routed = HashMap::new();

        for &target in T::all() {
            let mut claimants = self.handlers.iter().filter(|h| h.can_handle(target));
            let Some(first) = claimants.next() else {
                if exhaustive {
                    return Err(CoreError::MissingHandler {
                        target: target.as_str(),
                    });
                }
                continue;
            };
            if let Some(second) = claimants.next() {
                return Err(CoreError::AmbiguousHandler {
                    target: target.as_str(),
                    first: first.name(),
                    second: second.name(),
                });
            }
            debug!(workflow = target.as_str(), handler = first.name(), "Routed continuation target");
            routed.insert(target, Arc::clone(first));
        }

        Ok(HandlerRegistry { handlers: routed })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::envelope::ContinuationResult;
    use crate::envelope::tests::TestTarget;
    use crate::handler::{DispatchContext, HandlerError};

    struct Fixed(TestTarget, &'static str);

    #[async_trait]
    impl PhaseHandler<TestTarget> for Fixed {
        type Input = ();

        fn target(&self) -> TestTarget {
            self.0
        }

        fn name(&self) -> &'static str {
            self.1
        }

        async fn continue_phase(
            &self,
            _input: (),
            _ctx: &DispatchContext,
        ) -> std::result::Result<ContinuationResult<()>, HandlerError> {
            Ok(ContinuationResult::succeeded())
        }
    }

    #[test]
    fn test_build_requires_every_target() {
        let err = HandlerRegistry::builder()
            .register(Fixed(TestTarget::Alpha, "alpha"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::MissingHandler { target: "beta" }));
    }

    #[test]
    fn test_build_rejects_duplicate_claims() {
        let err = HandlerRegistry::builder()
            .register(Fixed(TestTarget::Alpha, "first"))
            .register(Fixed(TestTarget::Alpha, "second"))
            .register(Fixed(TestTarget::Beta, "beta"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(
            err,
            CoreError::AmbiguousHandler {
                first: "first",
                second: "second",
                ..
            }
        ));
    }

    #[test]
    fn test_every_target_resolves_to_one_handler() {
        let registry = HandlerRegistry::builder()
            .register(Fixed(TestTarget::Beta, "beta"))
            .register(Fixed(TestTarget::Alpha, "alpha"))
            .build()
            .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.handler_name(TestTarget::Alpha), Some("alpha"));
        assert_eq!(registry.handler_name(TestTarget::Beta), Some("beta"));
    }

    #[test]
    fn test_partial_build_skips_missing() {
        let registry = HandlerRegistry::builder()
            .register(Fixed(TestTarget::Alpha, "alpha"))
            .build_partial()
            .unwrap();
        assert!(registry.contains(TestTarget::Alpha));
        assert!(!registry.contains(TestTarget::Beta));
    }
}
