//! Kira effects for the bus chains Kira has no built-in for
//!
//! Reverb convolves with the synthesized impulse responses using a
//! uniformly partitioned FFT convolution. Delay keeps the bus topology of a
//! dry path plus a wet tap on a feedback line.

use crate::effect::{MAX_DELAY_SECONDS, MAX_FEEDBACK};
use crate::graph::ImpulseResponse;
use kira::effect::{Effect, EffectBuilder};
use kira::info::Info;
use kira::Frame;
use realfft::num_complex::Complex32;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use std::sync::Arc;

/// Samples per convolution block (also the added latency)
const BLOCK: usize = 1024;

/// Highest device rate the delay line is sized for
const MAX_DEVICE_RATE: u32 = 192_000;

/// One channel of a uniformly partitioned overlap-save convolution.
///
/// All buffers are sized up front, so processing never allocates.
struct PartitionedConvolver {
    forward: Arc<dyn RealToComplex<f32>>,
    inverse: Arc<dyn ComplexToReal<f32>>,
    /// Spectrum of each `BLOCK`-sample slice of the impulse response
    partitions: Vec<Vec<Complex32>>,
    /// Spectra of recent input windows, newest at `head`
    history: Vec<Vec<Complex32>>,
    head: usize,
    /// Previous block followed by the block being filled
    window: Vec<f32>,
    filled: usize,
    output: Vec<f32>,
    time: Vec<f32>,
    accumulator: Vec<Complex32>,
    forward_scratch: Vec<Complex32>,
    inverse_scratch: Vec<Complex32>,
}

impl PartitionedConvolver {
    fn new(planner: &mut RealFftPlanner<f32>, impulse: &[f32]) -> Self {
        let forward = planner.plan_fft_forward(2 * BLOCK);
        let inverse = planner.plan_fft_inverse(2 * BLOCK);

        let mut partitions = Vec::new();
        for slice in impulse.chunks(BLOCK) {
            let mut padded = forward.make_input_vec();
            padded[..slice.len()].copy_from_slice(slice);
            let mut spectrum = forward.make_output_vec();
            if forward.process(&mut padded, &mut spectrum).is_ok() {
                partitions.push(spectrum);
            }
        }
        if partitions.is_empty() {
            partitions.push(forward.make_output_vec());
        }

        let history = (0..partitions.len())
            .map(|_| forward.make_output_vec())
            .collect();
        Self {
            partitions,
            history,
            head: 0,
            window: forward.make_input_vec(),
            filled: 0,
            output: vec![0.0; BLOCK],
            time: inverse.make_output_vec(),
            accumulator: forward.make_output_vec(),
            forward_scratch: forward.make_scratch_vec(),
            inverse_scratch: inverse.make_scratch_vec(),
            forward,
            inverse,
        }
    }

    fn process_sample(&mut self, input: f32) -> f32 {
        let out = self.output[self.filled];
        self.window[BLOCK + self.filled] = input;
        self.filled += 1;
        if self.filled == BLOCK {
            self.process_block();
            self.filled = 0;
        }
        out
    }

    fn process_block(&mut self) {
        let count = self.partitions.len();
        self.head = (self.head + count - 1) % count;

        // The forward transform consumes its input, so transform a copy
        self.time.copy_from_slice(&self.window);
        let newest = &mut self.history[self.head];
        if self
            .forward
            .process_with_scratch(&mut self.time, newest, &mut self.forward_scratch)
            .is_err()
        {
            return;
        }

        self.accumulator.fill(Complex32::new(0.0, 0.0));
        for (k, partition) in self.partitions.iter().enumerate() {
            let spectrum = &self.history[(self.head + k) % count];
            for ((acc, x), h) in self.accumulator.iter_mut().zip(spectrum).zip(partition) {
                *acc += x * h;
            }
        }
        // Real signals have purely real DC and Nyquist bins
        if let Some(first) = self.accumulator.first_mut() {
            first.im = 0.0;
        }
        if let Some(last) = self.accumulator.last_mut() {
            last.im = 0.0;
        }

        if self
            .inverse
            .process_with_scratch(&mut self.accumulator, &mut self.time, &mut self.inverse_scratch)
            .is_ok()
        {
            let scale = 1.0 / (2 * BLOCK) as f32;
            for (out, sample) in self.output.iter_mut().zip(&self.time[BLOCK..]) {
                *out = sample * scale;
            }
        }
        self.window.copy_within(BLOCK.., 0);
    }
}

/// Builds a stereo convolution reverb with a dry/wet blend
pub struct ConvolutionBuilder {
    impulse: Arc<ImpulseResponse>,
    wet: f32,
}

impl ConvolutionBuilder {
    pub fn new(impulse: Arc<ImpulseResponse>, wet: f32) -> Self {
        Self {
            impulse,
            wet: wet.clamp(0.0, 1.0),
        }
    }
}

impl EffectBuilder for ConvolutionBuilder {
    type Handle = ();

    fn build(self) -> (Box<dyn Effect>, Self::Handle) {
        (Box::new(ConvolutionReverb::new(&self.impulse, self.wet)), ())
    }
}

/// Each channel convolves with its own channel of the impulse response
struct ConvolutionReverb {
    left: PartitionedConvolver,
    right: PartitionedConvolver,
    dry: f32,
    wet: f32,
}

impl ConvolutionReverb {
    fn new(impulse: &ImpulseResponse, wet: f32) -> Self {
        let scale = impulse_scale(impulse);
        let left: Vec<f32> = impulse.frames.iter().map(|f| f.left * scale).collect();
        let right: Vec<f32> = impulse.frames.iter().map(|f| f.right * scale).collect();
        let mut planner = RealFftPlanner::<f32>::new();
        Self {
            left: PartitionedConvolver::new(&mut planner, &left),
            right: PartitionedConvolver::new(&mut planner, &right),
            dry: 1.0 - wet,
            wet,
        }
    }

    fn process_frames(&mut self, input: &mut [Frame]) {
        for frame in input {
            let left = self.left.process_sample(frame.left);
            let right = self.right.process_sample(frame.right);
            frame.left = frame.left * self.dry + left * self.wet;
            frame.right = frame.right * self.dry + right * self.wet;
        }
    }
}

impl Effect for ConvolutionReverb {
    fn process(&mut self, input: &mut [Frame], _dt: f64, _info: &Info) {
        self.process_frames(input);
    }
}

/// Unit-energy normalization per channel pair, so the wet path keeps the
/// input level for noise-like material
fn impulse_scale(impulse: &ImpulseResponse) -> f32 {
    let energy: f32 = impulse
        .frames
        .iter()
        .map(|f| (f.left * f.left + f.right * f.right) * 0.5)
        .sum();
    if energy > f32::EPSILON {
        energy.sqrt().recip()
    } else {
        0.0
    }
}

/// Builds a feedback delay: dry signal plus a wet tap on the delay line
pub struct FeedbackDelayBuilder {
    time: f32,
    feedback: f32,
    wet: f32,
}

impl FeedbackDelayBuilder {
    pub fn new(time: f32, feedback: f32, wet: f32) -> Self {
        Self {
            time: time.clamp(0.0, MAX_DELAY_SECONDS),
            feedback: feedback.clamp(0.0, MAX_FEEDBACK),
            wet: wet.clamp(0.0, 1.0),
        }
    }
}

impl EffectBuilder for FeedbackDelayBuilder {
    type Handle = ();

    fn build(self) -> (Box<dyn Effect>, Self::Handle) {
        let capacity = (MAX_DELAY_SECONDS * MAX_DEVICE_RATE as f32) as usize + 1;
        let delay = FeedbackDelay {
            line: vec![Frame::ZERO; capacity],
            write: 0,
            delay_frames: 1,
            time: self.time,
            feedback: self.feedback,
            wet: self.wet,
        };
        (Box::new(delay), ())
    }
}

struct FeedbackDelay {
    line: Vec<Frame>,
    write: usize,
    delay_frames: usize,
    time: f32,
    feedback: f32,
    wet: f32,
}

impl FeedbackDelay {
    fn set_sample_rate(&mut self, sample_rate: u32) {
        let frames = (self.time * sample_rate as f32).round() as usize;
        self.delay_frames = frames.clamp(1, self.line.len() - 1);
    }

    fn process_frames(&mut self, input: &mut [Frame]) {
        let len = self.line.len();
        for frame in input {
            let delayed = self.line[(self.write + len - self.delay_frames) % len];
            self.line[self.write] = *frame + delayed * self.feedback;
            self.write = (self.write + 1) % len;
            *frame = *frame + delayed * self.wet;
        }
    }
}

impl Effect for FeedbackDelay {
    fn init(&mut self, sample_rate: u32, _internal_buffer_size: usize) {
        self.set_sample_rate(sample_rate);
    }

    fn on_change_sample_rate(&mut self, sample_rate: u32) {
        self.set_sample_rate(sample_rate);
    }

    fn process(&mut self, input: &mut [Frame], _dt: f64, _info: &Info) {
        self.process_frames(input);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(convolver: &mut PartitionedConvolver, input: &[f32]) -> Vec<f32> {
        input.iter().map(|&x| convolver.process_sample(x)).collect()
    }

    #[test]
    fn test_convolution_matches_direct_form() {
        let impulse: Vec<f32> = (0..1500).map(|i| ((i * 7919) % 13) as f32 / 13.0 - 0.5).collect();
        let mut planner = RealFftPlanner::<f32>::new();
        let mut convolver = PartitionedConvolver::new(&mut planner, &impulse);

        let mut input = vec![0.0; 4 * BLOCK];
        input[3] = 1.0;
        input[700] = -0.5;
        let output = run(&mut convolver, &input);

        // Output lags the input by one block
        for n in BLOCK..4 * BLOCK {
            let t = n - BLOCK;
            let expected: f32 = [(3usize, 1.0f32), (700, -0.5)]
                .iter()
                .filter(|(at, _)| t >= *at && t - at < impulse.len())
                .map(|(at, amp)| impulse[t - at] * amp)
                .sum();
            assert!(
                (output[n] - expected).abs() < 1e-4,
                "sample {t}: {} vs {expected}",
                output[n]
            );
        }
    }

    #[test]
    fn test_convolution_silent_for_first_block() {
        let mut planner = RealFftPlanner::<f32>::new();
        let mut convolver = PartitionedConvolver::new(&mut planner, &[1.0]);
        let output = run(&mut convolver, &vec![1.0; BLOCK]);
        assert!(output.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_empty_impulse_is_silent() {
        let mut planner = RealFftPlanner::<f32>::new();
        let mut convolver = PartitionedConvolver::new(&mut planner, &[]);
        let output = run(&mut convolver, &vec![1.0; 3 * BLOCK]);
        assert!(output.iter().all(|s| s.abs() < 1e-6));
    }

    #[test]
    fn test_impulse_scale_unit_energy() {
        let impulse = ImpulseResponse {
            sample_rate: 1000,
            frames: vec![Frame { left: 2.0, right: 2.0 }; 4],
        };
        // energy 16, scale 1/4
        assert!((impulse_scale(&impulse) - 0.25).abs() < 1e-6);

        let silent = ImpulseResponse {
            sample_rate: 1000,
            frames: vec![Frame::ZERO; 4],
        };
        assert_eq!(impulse_scale(&silent), 0.0);
    }

    #[test]
    fn test_feedback_delay_taps() {
        let mut delay = FeedbackDelay {
            line: vec![Frame::ZERO; 16],
            write: 0,
            delay_frames: 1,
            time: 0.002,
            feedback: 0.5,
            wet: 1.0,
        };
        delay.set_sample_rate(1000);

        let mut frames = vec![Frame::ZERO; 7];
        frames[0] = Frame { left: 1.0, right: 1.0 };
        delay.process_frames(&mut frames);

        let left: Vec<f32> = frames.iter().map(|f| f.left).collect();
        assert_eq!(left, vec![1.0, 0.0, 1.0, 0.0, 0.5, 0.0, 0.25]);
    }

    #[test]
    fn test_reverb_blends_dry_and_wet() {
        let impulse = ImpulseResponse {
            sample_rate: 1000,
            frames: vec![Frame { left: 1.0, right: 1.0 }],
        };
        let mut reverb = ConvolutionReverb::new(&impulse, 0.25);
        let mut frames = vec![Frame { left: 1.0, right: 0.5 }; 2 * BLOCK];
        reverb.process_frames(&mut frames);

        // First block is dry only, then the unit impulse adds the delayed input
        assert!((frames[0].left - 0.75).abs() < 1e-6);
        assert!((frames[BLOCK].left - 1.0).abs() < 1e-4);
        assert!((frames[BLOCK].right - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_delay_clamps_parameters() {
        let builder = FeedbackDelayBuilder::new(10.0, 2.0, -1.0);
        assert_eq!(builder.time, MAX_DELAY_SECONDS);
        assert_eq!(builder.feedback, MAX_FEEDBACK);
        assert_eq!(builder.wet, 0.0);
    }
}
