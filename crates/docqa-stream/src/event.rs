/// Prefix every data-carrying unit starts with.
pub const DATA_PREFIX: &str = "data: ";
/// Payload that marks the end of the stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Classification of one delimiter-bounded unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParsedEvent {
    /// `data: [DONE]`; the stream is over.
    SentinelEnd,
    /// Raw payload text after the prefix, not interpreted.
    Payload(String),
    /// Comments, padding, other fields, or an empty data line.
    Ignored,
}

/// Classifies a unit produced by `ChunkBuffer`.
pub fn parse_unit(unit: &str) -> ParsedEvent {
    let Some(rest) = unit.trim().strip_prefix(DATA_PREFIX) else {
        return ParsedEvent::Ignored;
    };
    let data = rest.trim();
    if data == DONE_SENTINEL {
        ParsedEvent::SentinelEnd
    } else if data.is_empty() {
        ParsedEvent::Ignored
    } else {
        ParsedEvent::Payload(data.to_string())
    }
}
