use super::PcmFilter;

/// Low-pass filter: single-pole IIR smoothing, one history value per channel.
pub struct LowPassFilter {
  smoothing: f32,
  smoothing_factor: f64,
  prev: Vec<f64>,
}

impl LowPassFilter {
  pub fn new(smoothing: f32) -> Self {
    let smoothing_factor = if smoothing > 1.0 {
      1.0 / smoothing as f64
    } else {
      0.0
    };
    Self {
      smoothing,
      smoothing_factor,
      prev: Vec::new(),
    }
  }
}

impl PcmFilter for LowPassFilter {
  fn process(&mut self, samples: &mut [i16], channels: usize) {
    if self.smoothing <= 1.0 || channels == 0 {
      return;
    }
    if self.prev.len() != channels {
      self.prev = vec![0.0; channels];
    }

    for frame in samples.chunks_exact_mut(channels) {
      for (sample, prev) in frame.iter_mut().zip(self.prev.iter_mut()) {
        let next = *prev + self.smoothing_factor * (*sample as f64 - *prev);
        *prev = next;
        *sample = (next as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
      }
    }
  }

  fn is_enabled(&self) -> bool {
    self.smoothing > 1.0
  }

  fn reset(&mut self) {
    self.prev.iter_mut().for_each(|p| *p = 0.0);
  }
}
