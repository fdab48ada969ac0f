use super::PcmFilter;

/// Gain filter. Scales all samples by a float factor.
pub struct GainFilter {
  gain: f32,
}

impl GainFilter {
  pub fn new(gain: f32) -> Self {
    Self { gain: gain.max(0.0) }
  }
}

impl PcmFilter for GainFilter {
  fn process(&mut self, samples: &mut [i16], _channels: usize) {
    let gain = self.gain;
    for sample in samples.iter_mut() {
      let s = (*sample as f32 * gain) as i32;
      *sample = s.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    }
  }

  fn is_enabled(&self) -> bool {
    (self.gain - 1.0).abs() > f32::EPSILON
  }

  fn reset(&mut self) {}
}
