pub mod rank;
pub mod rules;

use std::collections::BTreeMap;

use crate::core::FlowRecord;
use crate::error::ConfigError;
use rules::{Criterion, CriterionValue, Observation};

/// Signature name → criterion key → value, as supplied by the configuration.
pub type SignatureDefinitions = BTreeMap<String, BTreeMap<String, CriterionValue>>;

/// A named, conjunctive set of criteria.
#[derive(Debug, Clone)]
pub struct Signature {
    pub name: String,
    criteria: Vec<Criterion>,
}

impl Signature {
    pub fn new(name: &str, criteria: &BTreeMap<String, CriterionValue>) -> Result<Self, ConfigError> {
        let criteria = criteria
            .iter()
            .map(|(key, value)| Criterion::parse(name, key, value))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: name.to_string(),
            criteria,
        })
    }

    pub fn criteria(&self) -> &[Criterion] {
        &self.criteria
    }

    pub fn specificity(&self) -> usize {
        self.criteria.len()
    }

    /// Every criterion holds: the coarse ones together on a single flow, the
    /// rest against the aggregated observation.
    pub fn matches<O: Observation + ?Sized>(&self, obs: &O) -> bool {
        obs.admitted(self)
            && self
                .criteria
                .iter()
                .filter(|c| !c.is_coarse())
                .all(|c| c.holds(obs))
    }

    /// Every coarse criterion holds against one record.
    pub fn admits(&self, record: &FlowRecord) -> bool {
        self.criteria
            .iter()
            .filter(|c| c.is_coarse())
            .all(|c| c.holds(record))
    }
}

/// Read-only set of signatures for one run. Never empty.
#[derive(Debug, Clone)]
pub struct SignatureRegistry {
    signatures: Vec<Signature>,
}

impl SignatureRegistry {
    pub fn from_definitions(defs: &SignatureDefinitions) -> Result<Self, ConfigError> {
        let signatures = defs
            .iter()
            .map(|(name, criteria)| Signature::new(name, criteria))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_signatures(signatures)
    }

    pub fn from_signatures(mut signatures: Vec<Signature>) -> Result<Self, ConfigError> {
        if signatures.is_empty() {
            return Err(ConfigError::EmptyRegistry);
        }
        signatures.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { signatures })
    }

    /// Restrict the registry to the named signatures. An empty selection keeps all.
    pub fn select(self, names: &[String]) -> Result<Self, ConfigError> {
        if names.is_empty() {
            return Ok(self);
        }
        if let Some(missing) = names.iter().find(|n| self.get(n).is_none()) {
            return Err(ConfigError::UnknownSignature(missing.clone()));
        }
        let kept = self
            .signatures
            .into_iter()
            .filter(|s| names.contains(&s.name))
            .collect();
        Self::from_signatures(kept)
    }

    pub fn get(&self, name: &str) -> Option<&Signature> {
        self.signatures.iter().find(|s| s.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Signature> {
        self.signatures.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.signatures.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    /// Whether a record passes the coarse criteria of at least one signature.
    pub fn admits(&self, record: &FlowRecord) -> bool {
        self.signatures.iter().any(|s| s.admits(record))
    }

    /// Best matching signature for a fully folded target, if any.
    pub fn classify<O: Observation + ?Sized>(&self, target: &O) -> Option<String> {
        rank::best(self.signatures.iter().filter(|s| s.matches(target))).map(|s| s.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testutil::flow;

    fn defs(entries: &[(&str, &[(&str, CriterionValue)])]) -> SignatureDefinitions {
        entries
            .iter()
            .map(|(name, criteria)| {
                (
                    name.to_string(),
                    criteria.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn empty_registry_is_config_error() {
        let err = SignatureRegistry::from_definitions(&SignatureDefinitions::new()).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyRegistry));
    }

    #[test]
    fn invalid_entry_fails_whole_registry() {
        let d = defs(&[
            ("good", &[("port", CriterionValue::Integer(80))]),
            ("bad", &[("nonsense", CriterionValue::Integer(1))]),
        ]);
        assert!(SignatureRegistry::from_definitions(&d).is_err());
    }

    #[test]
    fn names_sorted() {
        let d = defs(&[("zeta", &[]), ("alpha", &[]), ("mid", &[])]);
        let reg = SignatureRegistry::from_definitions(&d).unwrap();
        assert_eq!(reg.names(), vec!["alpha", "mid", "zeta"]);
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn select_subset() {
        let d = defs(&[("a", &[]), ("b", &[]), ("c", &[])]);
        let reg = SignatureRegistry::from_definitions(&d).unwrap();
        let reg = reg.select(&["c".to_string(), "a".to_string()]).unwrap();
        assert_eq!(reg.names(), vec!["a", "c"]);
    }

    #[test]
    fn select_unknown_name_fails() {
        let d = defs(&[("a", &[])]);
        let reg = SignatureRegistry::from_definitions(&d).unwrap();
        let err = reg.select(&["missing".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownSignature(n) if n == "missing"));
    }

    #[test]
    fn select_nothing_keeps_all() {
        let d = defs(&[("a", &[]), ("b", &[])]);
        let reg = SignatureRegistry::from_definitions(&d).unwrap().select(&[]).unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn admits_ignores_aggregate_criteria() {
        let d = defs(&[(
            "web",
            &[
                ("port", CriterionValue::Integer(80)),
                ("min_flows", CriterionValue::Integer(1000)),
            ],
        )]);
        let reg = SignatureRegistry::from_definitions(&d).unwrap();
        assert!(reg.admits(&flow("10.0.0.1", "93.1.1.1", 80, 1, 1, 0, 1)));
        assert!(!reg.admits(&flow("10.0.0.1", "93.1.1.1", 22, 1, 1, 0, 1)));
    }

    #[test]
    fn admits_any_signature() {
        let d = defs(&[
            ("web", &[("port", CriterionValue::Integer(80))]),
            ("ssh", &[("port", CriterionValue::Integer(22))]),
        ]);
        let reg = SignatureRegistry::from_definitions(&d).unwrap();
        assert!(reg.admits(&flow("10.0.0.1", "93.1.1.1", 22, 1, 1, 0, 1)));
        assert!(!reg.admits(&flow("10.0.0.1", "93.1.1.1", 443, 1, 1, 0, 1)));
    }

    #[test]
    fn catch_all_admits_everything() {
        let d = defs(&[("everything", &[])]);
        let reg = SignatureRegistry::from_definitions(&d).unwrap();
        assert!(reg.admits(&flow("10.0.0.1", "93.1.1.1", 12345, 1, 1, 0, 1)));
    }
}
