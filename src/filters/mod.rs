pub mod channel_mix;
pub mod low_pass;
pub mod volume;

use crate::format::ParameterUpdate;

/// Trait for filters that process interleaved i16 PCM samples in place.
/// Buffer layout: `[c0, c1, .., cN-1, c0, c1, ..]`.
pub trait PcmFilter: Send {
  /// Process samples in-place.
  fn process(&mut self, samples: &mut [i16], channels: usize);
  /// Whether this filter is currently active (non-default params).
  fn is_enabled(&self) -> bool;
  /// Reset internal state (on flush or parameter change).
  fn reset(&mut self);
}

/// An ordered chain of PCM filters built from the engine's current parameters.
pub struct FilterChain {
  filters: Vec<Box<dyn PcmFilter>>,
}

impl FilterChain {
  pub fn from_params(params: &ParameterUpdate) -> Self {
    let mut filters: Vec<Box<dyn PcmFilter>> = Vec::new();

    // Gain (applied first)
    if let Some(gain) = params.gain {
      let f = volume::GainFilter::new(gain);
      if f.is_enabled() {
        filters.push(Box::new(f));
      }
    }

    // Channel Mix
    if let Some(cm) = params.channel_mix {
      let f = channel_mix::ChannelMixFilter::new(
        cm.left_to_left,
        cm.left_to_right,
        cm.right_to_left,
        cm.right_to_right,
      );
      if f.is_enabled() {
        filters.push(Box::new(f));
      }
    }

    // Low Pass
    if let Some(lp) = params.low_pass {
      let f = low_pass::LowPassFilter::new(lp.smoothing);
      if f.is_enabled() {
        filters.push(Box::new(f));
      }
    }

    Self { filters }
  }

  pub fn is_active(&self) -> bool {
    !self.filters.is_empty()
  }

  pub fn process(&mut self, samples: &mut [i16], channels: usize) {
    for filter in &mut self.filters {
      filter.process(samples, channels);
    }
  }

  pub fn reset(&mut self) {
    for filter in &mut self.filters {
      filter.reset();
    }
  }
}

/// Decode little-endian i16 PCM.
pub fn samples_from_bytes(bytes: &[u8]) -> Vec<i16> {
  bytes
    .chunks_exact(2)
    .map(|b| i16::from_le_bytes([b[0], b[1]]))
    .collect()
}

/// Encode i16 PCM as little-endian bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
  samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Change the channel count of interleaved PCM.
///
/// Down-mixing to mono averages every channel; up-mixing from mono copies the
/// sample into each channel; any other change keeps the shared leading
/// channels and fills the rest with silence.
pub fn remix(samples: &[i16], from: usize, to: usize) -> Vec<i16> {
  if from == to || from == 0 || to == 0 {
    return samples.to_vec();
  }

  let frames = samples.len() / from;
  let mut out = Vec::with_capacity(frames * to);
  for frame in samples.chunks_exact(from) {
    if to == 1 {
      let sum: i32 = frame.iter().map(|s| *s as i32).sum();
      out.push((sum / from as i32) as i16);
    } else if from == 1 {
      out.extend(std::iter::repeat_n(frame[0], to));
    } else {
      for ch in 0..to {
        out.push(frame.get(ch).copied().unwrap_or(0));
      }
    }
  }
  out
}

/// Nearest-neighbour sample-rate conversion of interleaved PCM.
pub fn resample(samples: &[i16], channels: usize, from_rate: u32, to_rate: u32) -> Vec<i16> {
  if from_rate == to_rate || channels == 0 || from_rate == 0 {
    return samples.to_vec();
  }

  let in_frames = samples.len() / channels;
  let out_frames = (in_frames as u64 * to_rate as u64 / from_rate as u64) as usize;
  let mut out = Vec::with_capacity(out_frames * channels);
  for i in 0..out_frames {
    let src = ((i as u64 * from_rate as u64) / to_rate as u64) as usize;
    let src = src.min(in_frames.saturating_sub(1));
    out.extend_from_slice(&samples[src * channels..(src + 1) * channels]);
  }
  out
}
