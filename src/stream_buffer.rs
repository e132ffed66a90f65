//! Bounded byte FIFO that accumulates captured audio until a full inference
//! window is available.

use crate::error::{Result, SpeechError};
use std::collections::VecDeque;

pub struct StreamBuffer {
    data: VecDeque<u8>,
    capacity: usize,
    flush_threshold: usize,
}

#[derive(Debug, Default)]
pub struct StreamBufferBuilder {
    capacity: Option<usize>,
    flush_threshold: Option<usize>,
}

impl StreamBufferBuilder {
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = Some(threshold);
        self
    }

    pub fn build(self) -> Result<StreamBuffer> {
        let capacity = self
            .capacity
            .ok_or_else(|| SpeechError::InvalidArgument("Stream buffer capacity not set".to_string()))?;
        if capacity == 0 {
            return Err(SpeechError::InvalidArgument(
                "Stream buffer capacity must be greater than zero".to_string(),
            ));
        }

        let flush_threshold = self.flush_threshold.unwrap_or(capacity);
        if flush_threshold == 0 || flush_threshold > capacity {
            return Err(SpeechError::InvalidArgument(format!(
                "Flush threshold {} must be within 1..={}",
                flush_threshold, capacity
            )));
        }

        let mut data = VecDeque::new();
        data.try_reserve_exact(capacity).map_err(|e| {
            SpeechError::NoMemory(format!("Stream buffer of {} bytes: {}", capacity, e))
        })?;

        Ok(StreamBuffer {
            data,
            capacity,
            flush_threshold,
        })
    }
}

impl StreamBuffer {
    pub fn builder() -> StreamBufferBuilder {
        StreamBufferBuilder::default()
    }

    /// Append bytes, returning how many fit. Excess bytes are dropped.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let free = self.capacity - self.data.len();
        let accepted = bytes.len().min(free);
        if accepted < bytes.len() {
            log::warn!(
                "Stream buffer full: dropped {} of {} bytes",
                bytes.len() - accepted,
                bytes.len()
            );
        }
        self.data.extend(&bytes[..accepted]);
        accepted
    }

    /// Move up to `dst.len()` bytes out of the front of the buffer
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let count = dst.len().min(self.data.len());
        for (slot, byte) in dst.iter_mut().zip(self.data.drain(..count)) {
            *slot = byte;
        }
        count
    }

    pub fn size_of_data(&self) -> usize {
        self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn flush_threshold(&self) -> usize {
        self.flush_threshold
    }

    pub fn is_flush_ready(&self) -> bool {
        self.data.len() >= self.flush_threshold
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}
