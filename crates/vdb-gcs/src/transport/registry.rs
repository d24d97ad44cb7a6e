//! Backend registry keyed by locator scheme.
//!
//! A locator has the form `scheme://address`. The scheme selects a
//! [`TransportFactory`]; the address is passed to it verbatim.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{GcsError, GcsResult};

use super::{LoopbackNetwork, Transport, TransportError, TransportFactory};

/// Splits a locator into scheme and address.
pub fn parse_locator(locator: &str) -> GcsResult<(&str, &str)> {
    let (scheme, address) = locator
        .split_once("://")
        .ok_or_else(|| GcsError::InvalidLocator(locator.to_string()))?;

    let valid_scheme = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !valid_scheme {
        return Err(GcsError::InvalidLocator(locator.to_string()));
    }
    Ok((scheme, address))
}

/// Creates isolated single-member endpoints.
///
/// Every endpoint gets a private [`LoopbackNetwork`], so a `dummy://`
/// connection forms a group of one.
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyFactory;

impl TransportFactory for DummyFactory {
    fn create(&self, _address: &str) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(LoopbackNetwork::new().endpoint()))
    }
}

/// Registered transport backends.
#[derive(Debug, Clone)]
pub struct TransportRegistry {
    factories: HashMap<String, Arc<dyn TransportFactory>>,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("dummy", Arc::new(DummyFactory));
        registry
    }
}

impl TransportRegistry {
    /// Creates a registry with the built-in backends.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with no backends.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registers a factory for `scheme`, replacing any previous one.
    pub fn register(&mut self, scheme: impl Into<String>, factory: Arc<dyn TransportFactory>) {
        let scheme = scheme.into();
        tracing::debug!(scheme = %scheme, "registered transport backend");
        self.factories.insert(scheme, factory);
    }

    /// Returns true if a backend is registered for `scheme`.
    pub fn contains(&self, scheme: &str) -> bool {
        self.factories.contains_key(scheme)
    }

    /// Resolves a locator to its factory and address.
    pub fn resolve(&self, locator: &str) -> GcsResult<(Arc<dyn TransportFactory>, String)> {
        let (scheme, address) = parse_locator(locator)?;
        let factory = self
            .factories
            .get(scheme)
            .ok_or_else(|| GcsError::UnknownBackend(scheme.to_string()))?;
        Ok((Arc::clone(factory), address.to_string()))
    }

    /// Creates a transport endpoint for a locator.
    pub fn create(&self, locator: &str) -> GcsResult<Arc<dyn Transport>> {
        let (factory, address) = self.resolve(locator)?;
        Ok(factory.create(&address)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_locators() {
        assert_eq!(parse_locator("dummy://").expect("parse"), ("dummy", ""));
        assert_eq!(
            parse_locator("gcomm://10.0.0.1:4567").expect("parse"),
            ("gcomm", "10.0.0.1:4567")
        );
    }

    #[test]
    fn parse_invalid_locators() {
        for bad in ["", "dummy", "://addr", "bad scheme://x", "dummy:/x"] {
            assert!(
                matches!(parse_locator(bad), Err(GcsError::InvalidLocator(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn unknown_scheme() {
        let registry = TransportRegistry::new();
        assert!(registry.contains("dummy"));
        let err = registry.create("spread://localhost").expect_err("unknown");
        assert_eq!(err, GcsError::UnknownBackend("spread".into()));
        assert_eq!(err.code(), -94);
    }

    #[test]
    fn custom_backend() {
        let network = LoopbackNetwork::new();
        let mut registry = TransportRegistry::empty();
        assert!(registry.create("dummy://").is_err());
        registry.register("loopback", Arc::new(network));
        let transport = registry.create("loopback://any").expect("create");
        assert!(transport.max_message_size() > 0);
    }
}
