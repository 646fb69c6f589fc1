//! Sample-rate conversion between the call rate and the wire rate.
//!
//! Conversion runs through an FFT band-limited interpolator operating on
//! mono interleaved PCM16. Input is buffered into fixed chunks sized to one
//! 20 ms frame at the input rate, so a steady stream of frames yields a
//! steady stream of converted frames one chunk behind.

use rubato::{FftFixedIn, Resampler as RubatoResampler};
use tracing::debug;

use crate::errors::CodecError;

/// Number of FFT sub-chunks per processing block.
const SUB_CHUNKS: usize = 2;

/// Mono sample-rate converter over interleaved PCM16.
pub trait Resampler: Send {
    /// Feed input samples, returning however many converted samples are
    /// ready. Output lags input by less than one chunk.
    fn process(&mut self, input: &[i16]) -> Result<Vec<i16>, CodecError>;

    /// Drop buffered input and internal filter state.
    fn reset(&mut self);
}

/// FFT-based implementation of [`Resampler`].
pub struct FftResampler {
    inner: FftFixedIn<f32>,
    input_buffer: Vec<f32>,
    chunk_size: usize,
}

impl FftResampler {
    /// Build a converter from `in_rate` to `out_rate`, chunked at one 20 ms
    /// frame of the input rate.
    pub fn new(in_rate: u32, out_rate: u32) -> Result<Self, CodecError> {
        let chunk_size = (in_rate / 50) as usize;
        let inner = FftFixedIn::<f32>::new(
            in_rate as usize,
            out_rate as usize,
            chunk_size,
            SUB_CHUNKS,
            1,
        )
        .map_err(|e| CodecError::ResamplerInit(e.to_string()))?;

        debug!(in_rate, out_rate, chunk_size, "resampler created");

        Ok(Self {
            inner,
            input_buffer: Vec::with_capacity(chunk_size * 2),
            chunk_size,
        })
    }
}

impl Resampler for FftResampler {
    fn process(&mut self, input: &[i16]) -> Result<Vec<i16>, CodecError> {
        for &sample in input {
            self.input_buffer.push(sample as f32 / 32768.0);
        }

        let mut output = Vec::new();
        while self.input_buffer.len() >= self.chunk_size {
            let chunk: Vec<f32> = self.input_buffer.drain(..self.chunk_size).collect();
            let converted = self
                .inner
                .process(&[chunk], None)
                .map_err(|e| CodecError::Resample(e.to_string()))?;

            for &sample in &converted[0] {
                let clamped = sample.clamp(-1.0, 1.0);
                output.push((clamped * 32767.0) as i16);
            }
        }

        Ok(output)
    }

    fn reset(&mut self) {
        self.input_buffer.clear();
        self.inner.reset();
    }
}
