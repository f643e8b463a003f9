//! Incremental UTF-8 decoding for upstream byte streams.
//!
//! Network reads split multi-byte characters arbitrarily. Incomplete trailing
//! sequences (at most 3 bytes) are held back until the next read completes
//! them; genuinely invalid bytes become U+FFFD.

#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `bytes` (plus anything pending) as forms complete characters.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut offset = 0;

        loop {
            let rest = &self.pending[offset..];
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    offset = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            offset += valid + bad;
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more bytes.
                            offset += valid;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..offset);
        out
    }

    /// End of stream: whatever is still pending is decoded lossily.
    pub fn flush(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
