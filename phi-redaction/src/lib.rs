//! PHI/PII scrubbing for event payloads.
//!
//! Every value that leaves a service through the event bus passes through a
//! [`PhiScrubber`] first. Free-text fields in a practice-management system
//! routinely pick up email addresses, phone numbers, SSNs and medical record
//! numbers; the scrubber replaces each occurrence with a fixed token such as
//! `[EMAIL-REDACTED]` so downstream consumers and capped audit streams never
//! hold raw identifiers.
//!
//! When `hash_for_correlation` is enabled the token carries a short stable
//! hash (`[EMAIL-REDACTED:aBc123xY]`) so operators can correlate entries that
//! referenced the same value without ever seeing the value itself.

pub mod redactor;

pub use redactor::{PhiScrubber, RedactionConfig};
