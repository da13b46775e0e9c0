//! Byte-stream transforms applied between the page codec and the data file.
//!
//! A pipeline is an ordered stack of transforms: writing composes them
//! forward, reading inverts them in reverse order. Every transform must be
//! total and invertible on its own outputs — `deserialize(serialize(x)) == x`
//! for all byte strings `x`.

use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use eyre::{Result, WrapErr};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

/// One invertible byte-stream transform.
pub trait ByteHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Forward transform, applied on the write path.
    fn serialize(&self, input: Vec<u8>) -> Result<Vec<u8>>;

    /// Inverse transform, applied on the read path.
    fn deserialize(&self, input: Vec<u8>) -> Result<Vec<u8>>;
}

/// Deflate compression.
pub struct DeflateHandler {
    level: Compression,
}

impl DeflateHandler {
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
        }
    }

    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level),
        }
    }
}

impl Default for DeflateHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteHandler for DeflateHandler {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn serialize(&self, input: Vec<u8>) -> Result<Vec<u8>> {
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(input.len() / 2), self.level);
        encoder
            .write_all(&input)
            .and_then(|_| encoder.finish())
            .wrap_err("deflate compression failed")
    }

    fn deserialize(&self, input: Vec<u8>) -> Result<Vec<u8>> {
        let mut decoder = DeflateDecoder::new(input.as_slice());
        let mut out = Vec::with_capacity(input.len() * 2);
        decoder
            .read_to_end(&mut out)
            .wrap_err("deflate decompression failed")?;
        Ok(out)
    }
}

/// Ordered stack of transforms shared by all readers and writers of a
/// resource.
#[derive(Clone, Default)]
pub struct ByteHandlerPipeline {
    handlers: Vec<Arc<dyn ByteHandler>>,
}

impl ByteHandlerPipeline {
    /// Empty pipeline: bytes pass through untouched.
    pub fn identity() -> Self {
        Self::default()
    }

    /// The default on-disk pipeline: deflate only.
    pub fn deflate() -> Self {
        Self::identity().with(DeflateHandler::new())
    }

    pub fn with<H: ByteHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn serialize(&self, input: Vec<u8>) -> Result<Vec<u8>> {
        let mut bytes = input;
        for handler in &self.handlers {
            bytes = handler
                .serialize(bytes)
                .wrap_err_with(|| format!("byte pipe stage '{}' failed", handler.name()))?;
        }
        Ok(bytes)
    }

    pub fn deserialize(&self, input: Vec<u8>) -> Result<Vec<u8>> {
        let mut bytes = input;
        for handler in self.handlers.iter().rev() {
            bytes = handler
                .deserialize(bytes)
                .wrap_err_with(|| format!("byte pipe stage '{}' failed", handler.name()))?;
        }
        Ok(bytes)
    }
}

impl fmt::Debug for ByteHandlerPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|h| h.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_pipeline_passes_through() {
        let pipe = ByteHandlerPipeline::identity();
        let bytes = b"some page body".to_vec();
        assert_eq!(pipe.serialize(bytes.clone()).unwrap(), bytes);
        assert_eq!(pipe.deserialize(bytes.clone()).unwrap(), bytes);
    }

    #[test]
    fn deflate_round_trip() {
        let pipe = ByteHandlerPipeline::deflate();
        let bytes: Vec<u8> = (0..10_000u32).flat_map(|i| (i % 251) as u8..=255).collect();
        let packed = pipe.serialize(bytes.clone()).unwrap();
        assert_ne!(packed, bytes);
        assert_eq!(pipe.deserialize(packed).unwrap(), bytes);
    }

    #[test]
    fn stages_invert_in_reverse_order() {
        struct Xor(u8);
        impl ByteHandler for Xor {
            fn name(&self) -> &'static str {
                "xor"
            }
            fn serialize(&self, mut input: Vec<u8>) -> Result<Vec<u8>> {
                input.iter_mut().for_each(|b| *b ^= self.0);
                Ok(input)
            }
            fn deserialize(&self, input: Vec<u8>) -> Result<Vec<u8>> {
                self.serialize(input)
            }
        }

        let pipe = ByteHandlerPipeline::identity()
            .with(DeflateHandler::new())
            .with(Xor(0xAA));
        let bytes = b"ordered composition".to_vec();
        let packed = pipe.serialize(bytes.clone()).unwrap();
        assert_eq!(pipe.deserialize(packed).unwrap(), bytes);
    }

    #[test]
    fn explicit_compression_level_round_trips() {
        let pipe = ByteHandlerPipeline::identity().with(DeflateHandler::with_level(9));
        let bytes = vec![0u8; 4096];
        let packed = pipe.serialize(bytes.clone()).unwrap();
        assert!(packed.len() < bytes.len());
        assert_eq!(pipe.deserialize(packed).unwrap(), bytes);
    }

    #[test]
    fn deflate_is_deterministic() {
        let pipe = ByteHandlerPipeline::deflate();
        let bytes = b"determinism required for content hashing".to_vec();
        assert_eq!(
            pipe.serialize(bytes.clone()).unwrap(),
            pipe.serialize(bytes).unwrap()
        );
    }
}
