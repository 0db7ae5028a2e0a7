//! Process-wide table of domains, loaded once.

use std::collections::BTreeMap;

use super::Domain;
use super::bank::BankDomain;
use crate::error::SopError;

pub struct Registry {
    domains: BTreeMap<String, Box<dyn Domain>>,
}

impl Registry {
    /// Every domain shipped with the crate. Descriptors are validated on load.
    pub fn builtin() -> Result<Self, SopError> {
        Ok(Self::with_domains(vec![Box::new(BankDomain::new()?)]))
    }

    pub fn with_domains(domains: Vec<Box<dyn Domain>>) -> Self {
        let domains = domains
            .into_iter()
            .map(|domain| (domain.descriptor().name.clone(), domain))
            .collect();
        Self { domains }
    }

    pub fn get(&self, name: &str) -> Result<&dyn Domain, SopError> {
        self.domains
            .get(name)
            .map(|domain| domain.as_ref())
            .ok_or_else(|| SopError::UnknownDomain(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.domains.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_lists_bank() {
        let registry = Registry::builtin().unwrap();
        assert_eq!(registry.names(), vec!["bank".to_string()]);
        assert!(registry.get("bank").is_ok());
    }

    #[test]
    fn unknown_domain_is_reported() {
        let registry = Registry::builtin().unwrap();
        let err = registry.get("dmv").err().unwrap();
        assert_eq!(err, SopError::UnknownDomain("dmv".to_string()));
    }
}
