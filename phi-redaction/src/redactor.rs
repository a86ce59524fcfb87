use std::collections::HashMap;

use base64::{engine::general_purpose, Engine as _};
use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};

lazy_static! {
    static ref EMAIL_REGEX: Regex =
        Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap();
    static ref PHONE_REGEX: Regex =
        Regex::new(r"\b(?:\+1[-.\s]?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}\b").unwrap();
    static ref SSN_REGEX: Regex = Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap();
    static ref CREDIT_CARD_REGEX: Regex =
        Regex::new(r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b").unwrap();
    static ref MRN_REGEX: Regex = Regex::new(r"\b(?i:MRN)[-:\s]?\d{5,10}\b").unwrap();
}

/// Scrubbing configuration.
///
/// All built-in patterns are on by default. `hash_for_correlation` is off by
/// default so tokens stay byte-stable across entries.
#[derive(Debug, Clone)]
pub struct RedactionConfig {
    pub redact_emails: bool,
    pub redact_phones: bool,
    pub redact_ssn: bool,
    pub redact_credit_cards: bool,
    pub redact_mrn: bool,
    /// Append a short SHA-256 based suffix to each token so entries that
    /// referenced the same value can be correlated.
    pub hash_for_correlation: bool,
    /// Extra patterns applied after the built-ins, with `$n` group expansion
    /// in the replacement string.
    pub custom_patterns: Vec<(Regex, String)>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            redact_emails: true,
            redact_phones: true,
            redact_ssn: true,
            redact_credit_cards: true,
            redact_mrn: true,
            hash_for_correlation: false,
            custom_patterns: Vec::new(),
        }
    }
}

/// PHI scrubber for event field values.
///
/// Patterns run most-specific first (SSN and card numbers before phone) so a
/// broader pattern never eats half of a narrower match.
pub struct PhiScrubber {
    config: RedactionConfig,
}

impl Default for PhiScrubber {
    fn default() -> Self {
        Self::new(RedactionConfig::default())
    }
}

impl PhiScrubber {
    pub fn new(config: RedactionConfig) -> Self {
        Self { config }
    }

    /// Scrub a single text value.
    pub fn scrub_text(&self, text: &str) -> String {
        let mut result = text.to_string();

        if self.config.redact_emails {
            result = self.apply(&EMAIL_REGEX, &result, "EMAIL");
        }

        if self.config.redact_ssn {
            result = self.apply(&SSN_REGEX, &result, "SSN");
        }

        if self.config.redact_credit_cards {
            result = self.apply(&CREDIT_CARD_REGEX, &result, "CC");
        }

        if self.config.redact_phones {
            result = self.apply(&PHONE_REGEX, &result, "PHONE");
        }

        if self.config.redact_mrn {
            result = self.apply(&MRN_REGEX, &result, "MRN");
        }

        for (pattern, replacement) in &self.config.custom_patterns {
            result = pattern.replace_all(&result, replacement.as_str()).to_string();
        }

        result
    }

    /// Scrub every value of a flat field map, preserving keys.
    pub fn scrub_fields(&self, fields: HashMap<String, String>) -> HashMap<String, String> {
        fields
            .into_iter()
            .map(|(key, value)| {
                let scrubbed = self.scrub_text(&value);
                (key, scrubbed)
            })
            .collect()
    }

    fn apply(&self, pattern: &Regex, text: &str, label: &str) -> String {
        pattern
            .replace_all(text, |caps: &regex::Captures| {
                if self.config.hash_for_correlation {
                    format!("[{}-REDACTED:{}]", label, short_hash(&caps[0]))
                } else {
                    format!("[{}-REDACTED]", label)
                }
            })
            .to_string()
    }
}

fn short_hash(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();
    // First 6 bytes keep the token short while leaving collisions unlikely
    // within one stream's retention window.
    general_purpose::URL_SAFE_NO_PAD.encode(&digest[..6])
}
