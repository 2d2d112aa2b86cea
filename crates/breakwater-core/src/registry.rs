//! The service configuration registry.
//!
//! Built once at process start from an explicit set of [`ServiceConfig`]
//! entries and passed by reference to everything that needs it. There is
//! deliberately no module-level default: tests and embedders construct
//! their own registries.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ConfigError, ParamsTable};
use crate::service::ServiceConfig;

/// Immutable, read-only table mapping service names to configuration.
#[derive(Debug, Default)]
pub struct ServiceConfigRegistry {
    services: HashMap<String, Arc<ServiceConfig>>,
}

impl ServiceConfigRegistry {
    /// Start building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Look up a service. Names are matched case-insensitively.
    pub fn get(&self, name: &str) -> Option<Arc<ServiceConfig>> {
        self.services.get(&name.to_ascii_uppercase()).cloned()
    }

    /// Registered service names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.services.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Iterate over every configured service.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServiceConfig>> {
        self.services.values()
    }
}

/// Builder collecting service configurations before validation.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    services: Vec<ServiceConfig>,
}

impl RegistryBuilder {
    /// Add one fully-assembled service configuration.
    pub fn service(mut self, config: ServiceConfig) -> Self {
        self.services.push(config);
        self
    }

    /// Add every entry of a parsed parameter table with default
    /// classifiers and probes. Entries needing a custom classifier,
    /// health check, or fallback chain should be added individually via
    /// [`Self::service`] instead.
    pub fn params_table(mut self, table: ParamsTable) -> Self {
        for (name, params) in table.services {
            self.services.push(ServiceConfig::new(name, params));
        }
        self
    }

    /// Validate every entry and freeze the registry.
    pub fn build(self) -> Result<ServiceConfigRegistry, ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::EmptyTable);
        }
        let mut services = HashMap::with_capacity(self.services.len());
        for config in self.services {
            config.params().validate(config.name())?;
            let name = config.name().to_string();
            if services.insert(name.clone(), Arc::new(config)).is_some() {
                return Err(ConfigError::DuplicateService(name));
            }
        }
        Ok(ServiceConfigRegistry { services })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceParams;

    #[test]
    fn test_build_and_lookup() {
        let registry = ServiceConfigRegistry::builder()
            .service(ServiceConfig::new("payments", ServiceParams::default()))
            .service(ServiceConfig::new("SEARCH", ServiceParams::default()))
            .build()
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.get("PAYMENTS").is_some());
        // Case-insensitive lookup.
        assert!(registry.get("payments").is_some());
        assert!(registry.get("BILLING").is_none());
        assert_eq!(registry.names(), vec!["PAYMENTS", "SEARCH"]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let result = ServiceConfigRegistry::builder()
            .service(ServiceConfig::new("payments", ServiceParams::default()))
            .service(ServiceConfig::new("Payments", ServiceParams::default()))
            .build();
        assert!(matches!(result, Err(ConfigError::DuplicateService(_))));
    }

    #[test]
    fn test_empty_rejected() {
        assert!(matches!(
            ServiceConfigRegistry::builder().build(),
            Err(ConfigError::EmptyTable)
        ));
    }

    #[test]
    fn test_invalid_params_rejected_at_build() {
        let mut params = ServiceParams::default();
        params.rate_limiter.max_tokens = 0;
        let result = ServiceConfigRegistry::builder()
            .service(ServiceConfig::new("X", params))
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
