//! Byte-level tokenizer: one token per UTF-8 byte.

use crate::{Error, Result};

use super::Tokenizer;

/// Maps every byte `b` to id `b + ByteTokenizer::OFFSET`.
///
/// Ids below the offset are reserved for special tokens (padding, BOS, EOS)
/// and decode to nothing. Useful for tests and for models trained on raw
/// bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const OFFSET: u32 = 3;
    pub const PAD: u32 = 0;
    pub const BOS: u32 = 1;
    pub const EOS: u32 = 2;
    pub const VOCAB_SIZE: usize = 256 + Self::OFFSET as usize;

    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(|b| u32::from(b) + Self::OFFSET).collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let mut bytes = Vec::with_capacity(ids.len());
        for &id in ids {
            if id < Self::OFFSET {
                continue;
            }
            let byte = u8::try_from(id - Self::OFFSET)
                .map_err(|_| Error::Tokenizer(format!("token id {id} out of range")))?;
            bytes.push(byte);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_utf8() {
        let tok = ByteTokenizer::new();
        let ids = tok.encode("héllo").unwrap();
        assert_eq!(ids.len(), 6);
        assert_eq!(tok.decode(&ids).unwrap(), "héllo");
    }

    #[test]
    fn specials_decode_to_nothing() {
        let tok = ByteTokenizer::new();
        let mut ids = tok.encode("a").unwrap();
        ids.insert(0, ByteTokenizer::BOS);
        ids.push(ByteTokenizer::EOS);
        assert_eq!(tok.decode(&ids).unwrap(), "a");
    }

    #[test]
    fn partial_character_decodes_to_replacement() {
        let tok = ByteTokenizer::new();
        let ids = tok.encode("é").unwrap();
        assert_eq!(tok.decode(&ids[..1]).unwrap(), "\u{FFFD}");
    }

    #[test]
    fn out_of_range_id_is_an_error() {
        let tok = ByteTokenizer::new();
        assert!(matches!(tok.decode(&[1000]), Err(Error::Tokenizer(_))));
    }
}
