use std::collections::HashMap;

use phi_redaction::PhiScrubber;

/// Redaction seam on the publish path.
///
/// The caller-authored fields of every envelope (resource coordinates and
/// metadata) pass through exactly one `Scrub` implementation before the
/// entry is appended to a stream; the stamped identity and timestamp
/// fields do not, so a redaction token can never corrupt them. The bus
/// wires in [`PhiScrubber`] by default; services with bespoke identifier
/// formats implement this trait themselves, typically wrapping a
/// `PhiScrubber` configured with custom patterns.
pub trait Scrub: Send + Sync {
    fn scrub(&self, fields: HashMap<String, String>) -> HashMap<String, String>;
}

impl Scrub for PhiScrubber {
    fn scrub(&self, fields: HashMap<String, String>) -> HashMap<String, String> {
        self.scrub_fields(fields)
    }
}
