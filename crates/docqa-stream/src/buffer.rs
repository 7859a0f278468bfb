use tracing::debug;

use crate::event::DATA_PREFIX;

/// Separator between two events on the wire.
pub const UNIT_DELIMITER: &str = "\n\n";

/// What `ChunkBuffer::flush` does with a remainder that looks like an event
/// but never received its trailing delimiter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TrailingPolicy {
    /// Hand the remainder to the parser as a final unit.
    #[default]
    Deliver,
    /// Drop it; only delimiter-terminated units count.
    Discard,
}

/// Accumulates decoded text and splits it into delimiter-bounded units.
///
/// The held text is always zero or more complete units followed by at most
/// one incomplete unit; `append` emits the complete ones in order.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    pending: String,
    policy: TrailingPolicy,
}

impl ChunkBuffer {
    pub fn new(policy: TrailingPolicy) -> Self {
        Self {
            pending: String::new(),
            policy,
        }
    }

    /// Appends a decoded fragment and returns every unit it completed.
    pub fn append(&mut self, text: &str) -> Vec<String> {
        // a delimiter may straddle the previous remainder and this fragment
        let search_from = if self.pending.ends_with('\n') {
            self.pending.len() - 1
        } else {
            self.pending.len()
        };
        self.pending.push_str(text);

        let mut units = Vec::new();
        let mut start = 0;
        let mut cursor = search_from;
        while let Some(idx) = self.pending[cursor..].find(UNIT_DELIMITER) {
            let end = cursor + idx;
            units.push(self.pending[start..end].to_string());
            start = end + UNIT_DELIMITER.len();
            cursor = start;
        }
        if start > 0 {
            self.pending.drain(..start);
        }
        units
    }

    /// Consumes the held remainder after the transport signalled end of data.
    ///
    /// Returns it as a final unit only when it is event-shaped and the
    /// policy allows delivery.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        if rest.trim().is_empty() {
            return None;
        }
        if !rest.trim().starts_with(DATA_PREFIX) {
            debug!(bytes = rest.len(), "dropping trailing text without data prefix");
            return None;
        }
        match self.policy {
            TrailingPolicy::Deliver => Some(rest),
            TrailingPolicy::Discard => {
                debug!(bytes = rest.len(), "discarding undelimited trailing event");
                None
            }
        }
    }

    /// Returns the text still waiting for a delimiter.
    pub fn pending(&self) -> &str {
        &self.pending
    }
}
