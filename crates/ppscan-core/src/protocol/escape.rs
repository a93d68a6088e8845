//! Frame body escaping.
//!
//! `0x1B` is sent as `1B 1B` and every `55 AA` pair as `1B 55 AA`, so the
//! sync magic never appears unescaped inside a body.

use super::constants::{ESCAPE, SYNC_MAGIC};

/// Escape a frame body for the wire.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 16 + 2);
    let mut i = 0;
    while i < data.len() {
        let byte = data[i];
        if byte == ESCAPE {
            out.extend_from_slice(&[ESCAPE, ESCAPE]);
            i += 1;
        } else if byte == SYNC_MAGIC[0] && data.get(i + 1) == Some(&SYNC_MAGIC[1]) {
            out.extend_from_slice(&[ESCAPE, SYNC_MAGIC[0], SYNC_MAGIC[1]]);
            i += 2;
        } else {
            out.push(byte);
            i += 1;
        }
    }
    out
}

/// Remove body escaping from a complete wire buffer.
pub fn decode(wire: &[u8]) -> Vec<u8> {
    let mut decoder = Decoder::new();
    let mut out = Vec::with_capacity(wire.len());
    decoder.push(wire, &mut out);
    decoder.finish(&mut out);
    out
}

/// Incremental decoder for bodies that arrive in several reads.
///
/// An escape sequence split across reads is held back until the bytes that
/// complete it arrive.
#[derive(Debug, Default)]
pub struct Decoder {
    held: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes held back at the end of the last chunk.
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Decode `chunk`, appending the result to `out`.
    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        let mut buf = std::mem::take(&mut self.held);
        buf.extend_from_slice(chunk);

        let mut i = 0;
        while i < buf.len() {
            if buf[i] != ESCAPE {
                out.push(buf[i]);
                i += 1;
                continue;
            }
            match (buf.get(i + 1), buf.get(i + 2)) {
                (Some(&ESCAPE), _) => {
                    out.push(ESCAPE);
                    i += 2;
                }
                (Some(&first), Some(&second)) if [first, second] == SYNC_MAGIC => {
                    out.extend_from_slice(&SYNC_MAGIC);
                    i += 3;
                }
                (None, _) | (Some(&0x55), None) => {
                    self.held.extend_from_slice(&buf[i..]);
                    return;
                }
                _ => {
                    out.push(ESCAPE);
                    i += 1;
                }
            }
        }
    }

    /// Flush held bytes literally.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        out.append(&mut self.held);
    }
}
