//! Streaming transform stacks for repository reads and writes.
//!
//! Every filter is a small state machine driven by the host pipeline. The
//! contract, which the pipeline preserves strictly:
//!
//! - `run(Some(input), out)` absorbs input and may emit into `out`. When the
//!   output buffer fills before the input is consumed, the filter returns
//!   [`FilterState::InputSame`] and the host re-presents the *same* input
//!   buffer after draining `out`; the filter remembers how far it got.
//! - `run(None, out)` is the flush phase, repeated until the filter returns
//!   [`FilterState::Done`], after which it will never produce output again.
//!
//! The canonical write stack is `hash/size tap -> compress -> encrypt`; reads
//! run the inverse. The tap sits first so content hashes always cover the
//! raw bytes.

use bytes::Bytes;
use futures::StreamExt;

use crate::DownloadStream;

mod cipher;
mod compress;
mod hash;

pub use cipher::{CipherKey, CipherType, DecryptFilter, EncryptFilter};
pub use compress::{CompressFilter, CompressType, DecompressFilter};
pub use hash::{SizeHashFilter, TapHandle};

/// Default capacity of each inter-filter buffer.
pub const FILTER_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    /// Input fully consumed; give me the next buffer (or more flush calls).
    Continue,
    /// Output filled first; drain it and present the same input again.
    InputSame,
    /// Flush complete, no more output will be produced.
    Done,
}

/// Fixed-capacity output buffer between pipeline stages.
pub struct FilterBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl FilterBuffer {
    fn new(capacity: usize) -> Self {
        FilterBuffer {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append as much of `bytes` as fits; returns how much was written.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let take = bytes.len().min(self.remaining());
        self.data.extend_from_slice(&bytes[..take]);
        take
    }

    fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

pub trait StreamFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&mut self, input: Option<&[u8]>, out: &mut FilterBuffer)
        -> anyhow::Result<FilterState>;
}

struct Stage {
    filter: Box<dyn StreamFilter>,
    buf: FilterBuffer,
    done: bool,
}

/// Drives a chain of filters, honoring `InputSame` at every stage.
pub struct FilterPipeline {
    stages: Vec<Stage>,
}

impl FilterPipeline {
    pub fn new(filters: Vec<Box<dyn StreamFilter>>) -> Self {
        Self::with_buffer_size(filters, FILTER_BUFFER_SIZE)
    }

    pub fn with_buffer_size(filters: Vec<Box<dyn StreamFilter>>, buffer_size: usize) -> Self {
        FilterPipeline {
            stages: filters
                .into_iter()
                .map(|filter| Stage {
                    filter,
                    buf: FilterBuffer::new(buffer_size),
                    done: false,
                })
                .collect(),
        }
    }

    /// An empty pipeline passes bytes through untouched.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Push one input buffer through the whole chain, appending any produced
    /// bytes to `out`.
    pub fn write(&mut self, input: &[u8], out: &mut Vec<u8>) -> anyhow::Result<()> {
        if self.stages.is_empty() {
            out.extend_from_slice(input);
            return Ok(());
        }
        Self::feed(&mut self.stages, Some(input), out)
    }

    /// Flush every stage in order. After this the pipeline is spent.
    pub fn finish(&mut self, out: &mut Vec<u8>) -> anyhow::Result<()> {
        for first in 0..self.stages.len() {
            while !self.stages[first].done {
                Self::feed(&mut self.stages[first..], None, out)?;
            }
        }
        Ok(())
    }

    /// One `run` call on the first stage of `stages`, cascading any output
    /// downstream. Recursion depth equals the stack depth, which is small
    /// and fixed.
    fn feed(stages: &mut [Stage], input: Option<&[u8]>, out: &mut Vec<u8>) -> anyhow::Result<()> {
        let (stage, rest) = stages
            .split_first_mut()
            .expect("feed is never called on an empty chain");

        if stage.done {
            debug_assert!(input.is_none(), "input after filter '{}' finished", stage.filter.name());
            return Ok(());
        }

        loop {
            let state = stage.filter.run(input, &mut stage.buf)?;

            if !stage.buf.is_empty() {
                let chunk = stage.buf.take();
                if rest.is_empty() {
                    out.extend_from_slice(&chunk);
                } else {
                    Self::feed(rest, Some(&chunk), out)?;
                }
            }

            match state {
                FilterState::InputSame => continue,
                FilterState::Continue => return Ok(()),
                FilterState::Done => {
                    stage.done = true;
                    return Ok(());
                }
            }
        }
    }

    /// Convenience for whole in-memory buffers (info files, status files).
    pub fn process(&mut self, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write(input, &mut out)?;
        self.finish(&mut out)?;
        Ok(out)
    }
}

/// Adapt a pipeline into a byte-stream transformer, keeping memory bounded
/// by the stream chunk size rather than the object size.
pub fn pipe_stream(pipeline: FilterPipeline, input: DownloadStream) -> DownloadStream {
    struct State {
        pipeline: FilterPipeline,
        input: DownloadStream,
        finished: bool,
    }

    let state = State {
        pipeline,
        input,
        finished: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }
            match state.input.next().await {
                Some(Ok(chunk)) => {
                    let mut out = Vec::new();
                    if let Err(e) = state.pipeline.write(&chunk, &mut out) {
                        state.finished = true;
                        return Some((Err(to_io_error(e)), state));
                    }
                    if out.is_empty() {
                        continue; // the filters absorbed everything for now
                    }
                    return Some((Ok(Bytes::from(out)), state));
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.finished = true;
                    let mut out = Vec::new();
                    if let Err(e) = state.pipeline.finish(&mut out) {
                        return Some((Err(to_io_error(e)), state));
                    }
                    if out.is_empty() {
                        return None;
                    }
                    return Some((Ok(Bytes::from(out)), state));
                }
            }
        }
    }))
}

fn to_io_error(e: anyhow::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, format!("{e:#}"))
}
