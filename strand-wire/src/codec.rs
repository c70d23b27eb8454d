//! Message encoding and the length-prefixed frame format.

use crate::message::Message;
use serde::{de::DeserializeOwned, Serialize};
use strand_core::{Error, Result};

/// Serialization format for message envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializationFormat {
    /// JSON (human-readable, default)
    Json,
    /// MessagePack (binary, compact)
    MessagePack,
    /// Bincode (binary, fast)
    Bincode,
}

impl Default for SerializationFormat {
    fn default() -> Self {
        SerializationFormat::Json
    }
}

impl SerializationFormat {
    fn tag(self) -> u8 {
        match self {
            SerializationFormat::Json => 0,
            SerializationFormat::MessagePack => 1,
            SerializationFormat::Bincode => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(SerializationFormat::Json),
            1 => Ok(SerializationFormat::MessagePack),
            2 => Ok(SerializationFormat::Bincode),
            other => Err(Error::Protocol(format!("unknown format tag: {}", other))),
        }
    }
}

/// Codec configuration
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Envelope serialization format
    pub format: SerializationFormat,
    /// Deflate-compress frame bodies
    pub compression: bool,
    /// Maximum frame body size in bytes
    pub max_frame_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            format: SerializationFormat::default(),
            compression: false,
            max_frame_size: 16 * 1024 * 1024, // 16MB
        }
    }
}

/// Frame header: `[body length: u32 BE][format: u8][flags: u8]`
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub body_len: usize,
    pub format: SerializationFormat,
    pub compressed: bool,
}

/// Size of the fixed frame header in bytes
pub const FRAME_HEADER_LEN: usize = 6;

const FLAG_COMPRESSED: u8 = 0x01;

/// Encodes and decodes messages, both as bare bodies and as framed records
/// for stream-oriented channels.
///
/// Decoding dispatches on the tagged message envelope in one place; the
/// header's format byte makes each frame self-describing, so a codec can
/// decode frames produced under a different configured format.
#[derive(Clone)]
pub struct FrameCodec {
    config: CodecConfig,
}

impl FrameCodec {
    /// Create a codec with the default configuration
    pub fn new() -> Self {
        Self {
            config: CodecConfig::default(),
        }
    }

    /// Create a codec with a custom configuration
    pub fn with_config(config: CodecConfig) -> Self {
        Self { config }
    }

    /// Create a codec with a specific format and defaults otherwise
    pub fn with_format(format: SerializationFormat) -> Self {
        Self {
            config: CodecConfig {
                format,
                ..CodecConfig::default()
            },
        }
    }

    pub fn format(&self) -> SerializationFormat {
        self.config.format
    }

    pub fn max_frame_size(&self) -> usize {
        self.config.max_frame_size
    }

    /// Serialize any value in the configured format
    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self.config.format {
            SerializationFormat::Json => serde_json::to_vec(value)
                .map_err(|e| Error::Serialization(format!("JSON encoding failed: {}", e))),
            SerializationFormat::MessagePack => rmp_serde::to_vec(value)
                .map_err(|e| Error::Serialization(format!("MessagePack encoding failed: {}", e))),
            SerializationFormat::Bincode => bincode::serialize(value)
                .map_err(|e| Error::Serialization(format!("Bincode encoding failed: {}", e))),
        }
    }

    /// Deserialize any value in the configured format
    pub fn deserialize<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        Self::deserialize_as(self.config.format, data)
    }

    fn deserialize_as<T: DeserializeOwned>(format: SerializationFormat, data: &[u8]) -> Result<T> {
        match format {
            SerializationFormat::Json => serde_json::from_slice(data)
                .map_err(|e| Error::Serialization(format!("JSON decoding failed: {}", e))),
            SerializationFormat::MessagePack => rmp_serde::from_slice(data)
                .map_err(|e| Error::Serialization(format!("MessagePack decoding failed: {}", e))),
            SerializationFormat::Bincode => bincode::deserialize(data)
                .map_err(|e| Error::Serialization(format!("Bincode decoding failed: {}", e))),
        }
    }

    /// Encode a message as a complete frame: header followed by body
    pub fn encode_frame(&self, message: &Message) -> Result<Vec<u8>> {
        let mut body = self.serialize(message)?;
        if self.config.compression {
            body = compress(&body)?;
        }
        if body.len() > self.config.max_frame_size {
            return Err(Error::InvalidArgument(format!(
                "frame body of {} bytes exceeds maximum of {}",
                body.len(),
                self.config.max_frame_size
            )));
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.push(self.config.format.tag());
        frame.push(if self.config.compression {
            FLAG_COMPRESSED
        } else {
            0
        });
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Parse a frame header, enforcing the size limit
    pub fn parse_header(&self, header: [u8; FRAME_HEADER_LEN]) -> Result<FrameHeader> {
        let body_len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if body_len > self.config.max_frame_size {
            return Err(Error::Protocol(format!(
                "frame body of {} bytes exceeds maximum of {}",
                body_len, self.config.max_frame_size
            )));
        }
        Ok(FrameHeader {
            body_len,
            format: SerializationFormat::from_tag(header[4])?,
            compressed: header[5] & FLAG_COMPRESSED != 0,
        })
    }

    /// Decode a frame body described by its header
    pub fn decode_body(&self, header: &FrameHeader, body: &[u8]) -> Result<Message> {
        if header.compressed {
            let inflated = decompress(body)?;
            Self::deserialize_as(header.format, &inflated)
        } else {
            Self::deserialize_as(header.format, body)
        }
    }

    /// Decode a complete frame from a contiguous buffer
    pub fn decode_frame(&self, frame: &[u8]) -> Result<Message> {
        if frame.len() < FRAME_HEADER_LEN {
            return Err(Error::Protocol("frame shorter than header".to_string()));
        }
        let mut header_bytes = [0u8; FRAME_HEADER_LEN];
        header_bytes.copy_from_slice(&frame[..FRAME_HEADER_LEN]);
        let header = self.parse_header(header_bytes)?;
        let rest = &frame[FRAME_HEADER_LEN..];
        if rest.len() < header.body_len {
            return Err(Error::Protocol(format!(
                "frame truncated: expected {} body bytes, got {}",
                header.body_len,
                rest.len()
            )));
        }
        self.decode_body(&header, &rest[..header.body_len])
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| Error::Serialization(format!("compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::Serialization(format!("compression failed: {}", e)))
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::read::DeflateDecoder;
    use std::io::Read;

    let mut decoder = DeflateDecoder::new(data);
    let mut inflated = Vec::new();
    decoder
        .read_to_end(&mut inflated)
        .map_err(|e| Error::Serialization(format!("decompression failed: {}", e)))?;
    Ok(inflated)
}
