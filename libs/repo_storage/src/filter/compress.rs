//! Compression filters: gzip (flate2) and zstd.
//!
//! Both codecs run write-side encoders into an internal pending buffer, then
//! dribble it into the bounded stage buffer, returning `InputSame` until the
//! pending bytes drain. The `input_consumed` flag keeps a re-presented input
//! from being encoded twice.

use std::io::Write;

use anyhow::Context;
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};

use super::{FilterBuffer, FilterState, StreamFilter};

/// Per-repository compression selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressType {
    #[default]
    None,
    Gzip,
    Zstd,
}

impl CompressType {
    /// Extension appended to repository object names.
    pub fn extension(self) -> Option<&'static str> {
        match self {
            CompressType::None => None,
            CompressType::Gzip => Some("gz"),
            CompressType::Zstd => Some("zst"),
        }
    }

    pub fn from_extension(ext: &str) -> Option<CompressType> {
        match ext {
            "gz" => Some(CompressType::Gzip),
            "zst" => Some(CompressType::Zstd),
            _ => None,
        }
    }
}

impl std::str::FromStr for CompressType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(CompressType::None),
            "gz" | "gzip" => Ok(CompressType::Gzip),
            "zst" | "zstd" => Ok(CompressType::Zstd),
            _ => anyhow::bail!("unknown compression type '{s}'"),
        }
    }
}

enum Codec {
    Gzip(Option<GzEncoder<Vec<u8>>>),
    GzipDec(Option<GzDecoder<Vec<u8>>>),
    Zstd(Option<zstd::stream::write::Encoder<'static, Vec<u8>>>),
    ZstdDec(Option<zstd::stream::write::Decoder<'static, Vec<u8>>>),
}

impl Codec {
    fn write(&mut self, input: &[u8]) -> anyhow::Result<()> {
        match self {
            Codec::Gzip(Some(enc)) => enc.write_all(input).context("gzip compress"),
            Codec::GzipDec(Some(dec)) => dec.write_all(input).context("gzip decompress"),
            Codec::Zstd(Some(enc)) => enc.write_all(input).context("zstd compress"),
            Codec::ZstdDec(Some(dec)) => dec.write_all(input).context("zstd decompress"),
            _ => anyhow::bail!("compression codec used after finish"),
        }
    }

    /// Move whatever the codec produced so far into `pending`.
    fn drain(&mut self, pending: &mut Vec<u8>) {
        let buf = match self {
            Codec::Gzip(Some(enc)) => enc.get_mut(),
            Codec::GzipDec(Some(dec)) => dec.get_mut(),
            Codec::Zstd(Some(enc)) => enc.get_mut(),
            Codec::ZstdDec(Some(dec)) => dec.get_mut(),
            _ => return,
        };
        pending.append(buf);
    }

    fn finish(&mut self, pending: &mut Vec<u8>) -> anyhow::Result<()> {
        match self {
            Codec::Gzip(enc) => {
                if let Some(enc) = enc.take() {
                    pending.append(&mut enc.finish().context("finish gzip stream")?);
                }
            }
            Codec::GzipDec(dec) => {
                if let Some(dec) = dec.take() {
                    pending.append(&mut dec.finish().context("finish gzip decode stream")?);
                }
            }
            Codec::Zstd(enc) => {
                if let Some(enc) = enc.take() {
                    pending.append(&mut enc.finish().context("finish zstd stream")?);
                }
            }
            Codec::ZstdDec(dec) => {
                if let Some(mut dec) = dec.take() {
                    dec.flush().context("finish zstd decode stream")?;
                    pending.append(dec.get_mut());
                }
            }
        }
        Ok(())
    }
}

/// Shared emit loop: encoders fill `pending`, the stage buffer drains it.
struct CodecFilter {
    name: &'static str,
    codec: Codec,
    pending: Vec<u8>,
    pending_off: usize,
    input_consumed: bool,
    flushed: bool,
}

impl CodecFilter {
    fn emit(&mut self, out: &mut FilterBuffer) -> bool {
        let written = out.push(&self.pending[self.pending_off..]);
        self.pending_off += written;
        if self.pending_off == self.pending.len() {
            self.pending.clear();
            self.pending_off = 0;
            true
        } else {
            false
        }
    }
}

impl StreamFilter for CodecFilter {
    fn name(&self) -> &'static str {
        self.name
    }

    fn run(&mut self, input: Option<&[u8]>, out: &mut FilterBuffer) -> anyhow::Result<FilterState> {
        match input {
            Some(input) => {
                if !self.input_consumed {
                    self.codec.write(input)?;
                    self.codec.drain(&mut self.pending);
                    self.input_consumed = true;
                }
                if self.emit(out) {
                    self.input_consumed = false;
                    Ok(FilterState::Continue)
                } else {
                    Ok(FilterState::InputSame)
                }
            }
            None => {
                if !self.flushed {
                    self.codec.finish(&mut self.pending)?;
                    self.flushed = true;
                }
                if self.emit(out) {
                    Ok(FilterState::Done)
                } else {
                    Ok(FilterState::Continue)
                }
            }
        }
    }
}

pub struct CompressFilter;

impl CompressFilter {
    /// Build the compressing filter for `compress_type`; `None` for no-op
    /// configurations.
    pub fn new(compress_type: CompressType, level: i32) -> Option<Box<dyn StreamFilter>> {
        let codec = match compress_type {
            CompressType::None => return None,
            CompressType::Gzip => Codec::Gzip(Some(GzEncoder::new(
                Vec::new(),
                Compression::new(level.clamp(0, 9) as u32),
            ))),
            CompressType::Zstd => Codec::Zstd(Some(
                zstd::stream::write::Encoder::new(Vec::new(), level)
                    .expect("zstd encoder accepts all clamped levels"),
            )),
        };
        Some(Box::new(CodecFilter {
            name: "compress",
            codec,
            pending: Vec::new(),
            pending_off: 0,
            input_consumed: false,
            flushed: false,
        }))
    }
}

pub struct DecompressFilter;

impl DecompressFilter {
    pub fn new(compress_type: CompressType) -> Option<Box<dyn StreamFilter>> {
        let codec = match compress_type {
            CompressType::None => return None,
            CompressType::Gzip => Codec::GzipDec(Some(GzDecoder::new(Vec::new()))),
            CompressType::Zstd => Codec::ZstdDec(Some(
                zstd::stream::write::Decoder::new(Vec::new())
                    .expect("zstd decoder construction is infallible for Vec"),
            )),
        };
        Some(Box::new(CodecFilter {
            name: "decompress",
            codec,
            pending: Vec::new(),
            pending_off: 0,
            input_consumed: false,
            flushed: false,
        }))
    }
}
