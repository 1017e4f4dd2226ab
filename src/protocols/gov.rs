//! Governance membership oracle.

use crate::network::signed_message::pubkey_id;
use ed25519_dalek::VerifyingKey;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

/// Answers whether a public key belongs to a governance node.
pub trait GovNodeResolver: Send + Sync {
    fn is_gov_node(&self, key: &VerifyingKey) -> bool;
}

/// In-memory stand-in for the ledger's governance list, shared by every
/// node of a scenario. Keys are stored as hex pubkey ids.
#[derive(Debug, Default)]
pub struct MockLedger {
    gov: RwLock<HashSet<String>>,
}

impl MockLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_gov_node(&self, pubkey: &str) {
        self.gov.write().insert(pubkey.to_string());
    }

    pub fn del_gov_node(&self, pubkey: &str) -> bool {
        self.gov.write().remove(pubkey)
    }

    pub fn contains(&self, pubkey: &str) -> bool {
        self.gov.read().contains(pubkey)
    }

    pub fn gov_nodes(&self) -> Vec<String> {
        let mut all: Vec<String> = self.gov.read().iter().cloned().collect();
        all.sort();
        all
    }
}

/// Resolver backed by a `MockLedger`; sees ledger changes immediately.
#[derive(Debug, Clone)]
pub struct GovNodeMockResolver {
    ledger: Arc<MockLedger>,
}

impl GovNodeMockResolver {
    pub fn new(ledger: Arc<MockLedger>) -> Self {
        Self { ledger }
    }
}

impl GovNodeResolver for GovNodeMockResolver {
    fn is_gov_node(&self, key: &VerifyingKey) -> bool {
        self.ledger.contains(&pubkey_id(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::signed_message::Account;

    #[test]
    fn test_resolver_follows_ledger() {
        let ledger = MockLedger::new();
        let resolver = GovNodeMockResolver::new(ledger.clone());
        let acct = Account::random();
        let key = acct.public_key();

        assert!(!resolver.is_gov_node(&key));
        ledger.add_gov_node(&pubkey_id(&key));
        assert!(resolver.is_gov_node(&key));
        assert!(ledger.del_gov_node(&pubkey_id(&key)));
        assert!(!resolver.is_gov_node(&key));
    }
}
