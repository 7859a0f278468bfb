use crate::errors::StreamFailure;

/// Streaming UTF-8 decoder.
///
/// A multi-byte character split across two reads is held back until the
/// rest of its bytes arrive. Invalid sequences fail immediately.
#[derive(Debug, Default)]
pub struct TextDecoder {
    pending: Vec<u8>,
}

impl TextDecoder {
    /// Decodes the next chunk, returning all complete characters so far.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<String, StreamFailure> {
        self.pending.extend_from_slice(chunk);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_owned();
                self.pending.clear();
                Ok(text)
            }
            Err(err) if err.error_len().is_none() => {
                // incomplete tail: keep it for the next read
                let valid = err.valid_up_to();
                let tail = self.pending.split_off(valid);
                let head = std::mem::replace(&mut self.pending, tail);
                String::from_utf8(head).map_err(|e| StreamFailure::decode(e.to_string()))
            }
            Err(err) => {
                self.pending.clear();
                Err(StreamFailure::decode(format!(
                    "invalid UTF-8 in response body: {err}"
                )))
            }
        }
    }

    /// Signals end of input. Fails when a truncated character is still held.
    pub fn finish(&mut self) -> Result<(), StreamFailure> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let held = self.pending.len();
        self.pending.clear();
        Err(StreamFailure::decode(format!(
            "response body ended inside a multi-byte character ({held} byte(s) pending)"
        )))
    }
}
