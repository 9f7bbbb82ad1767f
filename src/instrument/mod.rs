//! Instrument drivers, workers and the driver registry.
//!
//! Vendor drivers live outside this crate. They are plugged in by registering a factory
//! per [`InstrumentName`]; the orchestrator asks the registry for a fresh [`Driver`]
//! whenever it (re)creates an instrument worker. [`InstrumentRegistry::simulated`]
//! registers the mock drivers from [`mock`].

pub mod mock;
pub mod worker;

use crate::core::{Driver, InstrumentName};
use crate::error::{AppResult, DaqError};
use std::collections::HashMap;

pub use worker::{InstrumentCommand, InstrumentHandle, InstrumentInfo, InstrumentLink, Reply};

type DriverFactory = Box<dyn Fn(InstrumentName) -> Driver + Send + Sync>;

/// Factories for the bench instruments.
pub struct InstrumentRegistry {
    factories: HashMap<InstrumentName, DriverFactory>,
}

impl Default for InstrumentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrumentRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register (or replace) the factory for `name`.
    pub fn register<F>(&mut self, name: InstrumentName, factory: F)
    where
        F: Fn(InstrumentName) -> Driver + Send + Sync + 'static,
    {
        self.factories.insert(name, Box::new(factory));
    }

    /// True if a factory exists for `name`.
    pub fn contains(&self, name: InstrumentName) -> bool {
        self.factories.contains_key(&name)
    }

    /// Build a new driver.
    pub fn create(&self, name: InstrumentName) -> AppResult<Driver> {
        let factory = self.factories.get(&name).ok_or_else(|| {
            DaqError::Configuration(format!("No driver registered for '{}'", name))
        })?;
        let driver = factory(name);
        if driver.name() != name {
            return Err(DaqError::Configuration(format!(
                "Driver registered for '{}' reports itself as '{}'",
                name,
                driver.name()
            )));
        }
        Ok(driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::MockOptions;

    #[test]
    fn test_simulated_registry_covers_every_instrument() {
        let registry = InstrumentRegistry::simulated(MockOptions::default());
        for name in InstrumentName::ALL {
            assert!(registry.contains(name));
            assert_eq!(registry.create(name).unwrap().name(), name);
        }
    }

    #[test]
    fn test_missing_driver_is_a_configuration_error() {
        let registry = InstrumentRegistry::new();
        assert!(matches!(
            registry.create(InstrumentName::Laser),
            Err(DaqError::Configuration(_))
        ));
    }
}
