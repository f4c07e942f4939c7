// Thread-safe registry of secret values (JIT tokens, API credentials,
// webhook secret) with replacement in any text that might reach log output.
// The controller's contract with the boot-script collaborator is that the
// token value is never logged; everything that prints external payloads
// goes through `mask` first.

use parking_lot::RwLock;
use std::sync::Arc;

/// Replacement text for a masked secret.
const MASK: &str = "***";

/// Shared masker handed to every component that logs external payloads.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    secrets: Arc<RwLock<Vec<String>>>,
}

impl SecretMasker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret value. Blank values are ignored; duplicates are
    /// collapsed. Longer secrets are kept first so that a secret which is
    /// a substring of another never leaves a partial remnant.
    pub fn add_value(&self, secret: &str) {
        let trimmed = secret.trim();
        if trimmed.is_empty() {
            return;
        }

        let mut secrets = self.secrets.write();
        if !secrets.iter().any(|s| s == trimmed) {
            secrets.push(trimmed.to_string());
            secrets.sort_by(|a, b| b.len().cmp(&a.len()));
        }
    }

    /// Replace every registered secret in `input` with `***`.
    pub fn mask(&self, input: &str) -> String {
        let secrets = self.secrets.read();
        let mut output = input.to_string();
        for secret in secrets.iter() {
            if output.contains(secret.as_str()) {
                output = output.replace(secret.as_str(), MASK);
            }
        }
        output
    }

    pub fn len(&self) -> usize {
        self.secrets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks_registered_value() {
        let masker = SecretMasker::new();
        masker.add_value("s3cr3t-token");
        assert_eq!(
            masker.mask("jit config: s3cr3t-token end"),
            "jit config: *** end"
        );
    }

    #[test]
    fn test_longer_secret_masked_first() {
        let masker = SecretMasker::new();
        masker.add_value("abc");
        masker.add_value("abcdef");
        assert_eq!(masker.mask("x abcdef y abc z"), "x *** y *** z");
    }

    #[test]
    fn test_blank_and_duplicate_values_ignored() {
        let masker = SecretMasker::new();
        masker.add_value("   ");
        masker.add_value("");
        assert!(masker.is_empty());

        masker.add_value("tok");
        masker.add_value("tok");
        assert_eq!(masker.len(), 1);
    }

    #[test]
    fn test_no_secrets_is_identity() {
        let masker = SecretMasker::new();
        assert_eq!(masker.mask("plain text"), "plain text");
    }
}
