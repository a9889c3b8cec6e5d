//! Codec Pipeline
//!
//! Reversible transform stack applied to every tunnelled payload. Encoding
//! runs the enabled stages in order (obfuscate, cipher, compress); decoding
//! runs them in reverse. Which stages run is decided once, when the pipeline
//! is built, from the tunnel configuration and the session profile.

mod cipher;

pub use cipher::{PacketCipher, CIPHER_OVERHEAD};

use crate::config::TunnelConfig;
use crate::error::{Error, Result};

/// Stage selection for a transport variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// obfuscate -> compress (message-framed sessions)
    Basic,
    /// obfuscate -> cipher -> compress (raw-frame sessions)
    Extended,
}

/// Inputs needed to build a pipeline
#[derive(Debug, Clone)]
pub struct CodecSettings {
    /// Pre-shared key string
    pub key: String,
    pub obfuscate: bool,
    pub cipher: bool,
    pub compress: bool,
    /// Largest payload a decode may produce
    pub max_payload: usize,
}

impl CodecSettings {
    pub fn from_config(config: &TunnelConfig) -> Self {
        Self {
            key: config.key.clone(),
            obfuscate: config.obfuscate,
            cipher: config.cipher,
            compress: config.compress,
            max_payload: config.buffer_size,
        }
    }
}

/// XOR obfuscation with the key bytes, cycled
#[derive(Clone)]
pub struct Obfuscator {
    pad: Vec<u8>,
}

impl Obfuscator {
    pub fn new(key: &str) -> Self {
        Self { pad: key.as_bytes().to_vec() }
    }

    /// XOR in place. Applying it twice restores the input.
    pub fn apply(&self, data: &mut [u8]) {
        if self.pad.is_empty() {
            return;
        }
        for (byte, pad) in data.iter_mut().zip(self.pad.iter().cycle()) {
            *byte ^= pad;
        }
    }
}

/// LZ4 block compression with the decompressed size prepended
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    max_decompressed: usize,
}

impl Compressor {
    pub fn new(max_decompressed: usize) -> Self {
        Self { max_decompressed }
    }

    pub fn compress(&self, data: &[u8]) -> Vec<u8> {
        lz4_flex::compress_prepend_size(data)
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < 4 {
            return Err(Error::Codec("compressed payload shorter than size prefix".into()));
        }
        let declared = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if declared > self.max_decompressed {
            return Err(Error::FrameTooLarge {
                declared,
                max: self.max_decompressed,
            });
        }
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| Error::Codec(format!("Decompression failed: {}", e)))
    }
}

enum Stage {
    Obfuscate(Obfuscator),
    Cipher(PacketCipher),
    Compress(Compressor),
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::Obfuscate(_) => "obfuscate",
            Stage::Cipher(_) => "cipher",
            Stage::Compress(_) => "compress",
        }
    }

    fn encode(&self, mut data: Vec<u8>) -> Result<Vec<u8>> {
        match self {
            Stage::Obfuscate(obfs) => {
                obfs.apply(&mut data);
                Ok(data)
            }
            Stage::Cipher(cipher) => cipher.seal(&data),
            Stage::Compress(lz4) => Ok(lz4.compress(&data)),
        }
    }

    fn decode(&self, mut data: Vec<u8>) -> Result<Vec<u8>> {
        match self {
            Stage::Obfuscate(obfs) => {
                obfs.apply(&mut data);
                Ok(data)
            }
            Stage::Cipher(cipher) => cipher.open(&data),
            Stage::Compress(lz4) => lz4.decompress(&data),
        }
    }
}

/// Ordered, reversible transform stack
pub struct CodecPipeline {
    profile: Profile,
    /// Stages in encode order
    stages: Vec<Stage>,
}

impl CodecPipeline {
    /// Build the pipeline for a profile
    pub fn new(profile: Profile, settings: &CodecSettings) -> Self {
        let mut stages = Vec::with_capacity(3);
        if settings.obfuscate {
            stages.push(Stage::Obfuscate(Obfuscator::new(&settings.key)));
        }
        if profile == Profile::Extended && settings.cipher {
            stages.push(Stage::Cipher(PacketCipher::new(&settings.key)));
        }
        if settings.compress {
            let mut max_decompressed = settings.max_payload;
            if profile == Profile::Extended && settings.cipher {
                max_decompressed += CIPHER_OVERHEAD;
            }
            stages.push(Stage::Compress(Compressor::new(max_decompressed)));
        }
        Self { profile, stages }
    }

    /// Pipeline with no stages
    pub fn identity(profile: Profile) -> Self {
        Self {
            profile,
            stages: Vec::new(),
        }
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// Names of the enabled stages, in encode order
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(Stage::name).collect()
    }

    /// Run the encode path
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        self.stages
            .iter()
            .try_fold(payload.to_vec(), |data, stage| stage.encode(data))
    }

    /// Run the decode path (reverse stage order)
    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.stages
            .iter()
            .rev()
            .try_fold(data.to_vec(), |data, stage| stage.decode(data))
    }
}

impl std::fmt::Debug for CodecPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecPipeline")
            .field("profile", &self.profile)
            .field("stages", &self.stage_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "asdjakflrdeghyirtoy54ytiohjgfkbfjghklfjhfkitht";

    fn settings(obfuscate: bool, cipher: bool, compress: bool) -> CodecSettings {
        CodecSettings {
            key: KEY.to_string(),
            obfuscate,
            cipher,
            compress,
            max_payload: 65535,
        }
    }

    fn sample_payloads() -> Vec<Vec<u8>> {
        vec![
            Vec::new(),
            vec![0x45],
            (0..1500).map(|i| (i % 251) as u8).collect(),
            vec![0u8; 9000],
            b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec(),
        ]
    }

    #[test]
    fn test_every_stage_subset_round_trips() {
        for profile in [Profile::Basic, Profile::Extended] {
            for mask in 0..8u8 {
                let pipeline = CodecPipeline::new(
                    profile,
                    &settings(mask & 1 != 0, mask & 2 != 0, mask & 4 != 0),
                );
                for payload in sample_payloads() {
                    let encoded = pipeline.encode(&payload).unwrap();
                    let decoded = pipeline.decode(&encoded).unwrap();
                    assert_eq!(decoded, payload, "{:?} mask={}", pipeline, mask);
                }
            }
        }
    }

    #[test]
    fn test_profile_stage_order() {
        let basic = CodecPipeline::new(Profile::Basic, &settings(true, true, true));
        assert_eq!(basic.stage_names(), vec!["obfuscate", "compress"]);

        let extended = CodecPipeline::new(Profile::Extended, &settings(true, true, true));
        assert_eq!(extended.stage_names(), vec!["obfuscate", "cipher", "compress"]);

        let identity = CodecPipeline::new(Profile::Extended, &settings(false, false, false));
        assert!(identity.stage_names().is_empty());
        assert_eq!(identity.encode(b"plain").unwrap(), b"plain");
    }

    #[test]
    fn test_obfuscation_changes_bytes() {
        let pipeline = CodecPipeline::new(Profile::Basic, &settings(true, false, false));
        let payload = vec![0u8; 64];
        let encoded = pipeline.encode(&payload).unwrap();
        assert_ne!(encoded, payload);
        assert_eq!(&encoded[..KEY.len()], KEY.as_bytes());
    }

    #[test]
    fn test_truncated_compressed_data_is_an_error() {
        let pipeline = CodecPipeline::new(Profile::Basic, &settings(false, false, true));
        let encoded = pipeline.encode(&vec![7u8; 4096]).unwrap();

        assert!(matches!(pipeline.decode(&encoded[..encoded.len() / 2]), Err(Error::Codec(_))));
        assert!(matches!(pipeline.decode(&[1, 2]), Err(Error::Codec(_))));
    }

    #[test]
    fn test_decompression_bomb_rejected_before_allocation() {
        let pipeline = CodecPipeline::new(Profile::Basic, &settings(false, false, true));
        let mut forged = (u32::MAX).to_le_bytes().to_vec();
        forged.extend_from_slice(&[0u8; 16]);

        assert!(matches!(pipeline.decode(&forged), Err(Error::FrameTooLarge { .. })));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let pipeline = CodecPipeline::new(Profile::Extended, &settings(false, true, false));
        let mut encoded = pipeline.encode(b"payload under test").unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0x01;

        assert!(matches!(pipeline.decode(&encoded), Err(Error::Codec(_))));
    }

    #[test]
    fn test_different_keys_do_not_interoperate() {
        let ours = CodecPipeline::new(Profile::Extended, &settings(true, true, true));
        let mut other = settings(true, true, true);
        other.key = "another key".into();
        let theirs = CodecPipeline::new(Profile::Extended, &other);

        let encoded = ours.encode(b"secret packet").unwrap();
        assert!(theirs.decode(&encoded).is_err());
    }
}
