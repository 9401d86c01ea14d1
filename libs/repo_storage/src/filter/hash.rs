//! Pass-through tap computing the content SHA-1 and size of whatever flows
//! through it. Placed before compression/encryption on writes and after them
//! on reads, so the hash always covers the raw bytes.

use std::sync::{Arc, Mutex};

use sha1::{Digest, Sha1};

use super::{FilterBuffer, FilterState, StreamFilter};

#[derive(Debug, Default)]
struct TapResult {
    size: u64,
    sha1: Option<String>,
}

/// Handle to read the tap's result once the pipeline has finished.
#[derive(Clone, Default)]
pub struct TapHandle(Arc<Mutex<TapResult>>);

impl TapHandle {
    /// Bytes seen by the tap.
    pub fn size(&self) -> u64 {
        self.0.lock().unwrap().size
    }

    /// Hex digest; available after the pipeline flush.
    pub fn sha1(&self) -> Option<String> {
        self.0.lock().unwrap().sha1.clone()
    }
}

pub struct SizeHashFilter {
    hasher: Option<Sha1>,
    result: TapHandle,
    consumed: usize,
}

impl SizeHashFilter {
    pub fn new() -> (Self, TapHandle) {
        let handle = TapHandle::default();
        (
            SizeHashFilter {
                hasher: Some(Sha1::new()),
                result: handle.clone(),
                consumed: 0,
            },
            handle,
        )
    }
}

impl StreamFilter for SizeHashFilter {
    fn name(&self) -> &'static str {
        "size-hash"
    }

    fn run(&mut self, input: Option<&[u8]>, out: &mut FilterBuffer) -> anyhow::Result<FilterState> {
        let Some(input) = input else {
            if let Some(hasher) = self.hasher.take() {
                let mut result = self.result.0.lock().unwrap();
                result.sha1 = Some(hex::encode(hasher.finalize()));
            }
            return Ok(FilterState::Done);
        };

        let pending = &input[self.consumed..];
        let written = out.push(pending);

        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&pending[..written]);
        }
        self.result.0.lock().unwrap().size += written as u64;
        self.consumed += written;

        if self.consumed < input.len() {
            Ok(FilterState::InputSame)
        } else {
            self.consumed = 0;
            Ok(FilterState::Continue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterPipeline;

    #[test]
    fn tap_reports_raw_size_and_digest() {
        let (tap, handle) = SizeHashFilter::new();
        let mut pipeline = FilterPipeline::with_buffer_size(vec![Box::new(tap)], 5);

        let out = pipeline.process(b"the quick brown fox").unwrap();
        assert_eq!(out, b"the quick brown fox");
        assert_eq!(handle.size(), 19);

        let mut reference = Sha1::new();
        reference.update(b"the quick brown fox");
        assert_eq!(handle.sha1().unwrap(), hex::encode(reference.finalize()));
    }

    #[test]
    fn digest_is_none_before_flush() {
        let (tap, handle) = SizeHashFilter::new();
        let mut pipeline = FilterPipeline::new(vec![Box::new(tap)]);
        let mut out = Vec::new();
        pipeline.write(b"abc", &mut out).unwrap();
        assert!(handle.sha1().is_none());
        pipeline.finish(&mut out).unwrap();
        assert!(handle.sha1().is_some());
    }
}
