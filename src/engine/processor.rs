//! Format negotiation and the per-buffer transform shared by every engine.

use crate::{
    common::errors::{AdapterError, Result},
    constants::{DEFAULT_INPUT_BUFFER_COUNT, DEFAULT_OUTPUT_BUFFER_COUNT, FRAMES_PER_SECOND},
    filters::{FilterChain, remix, resample, samples_from_bytes, samples_to_bytes},
    format::{MediaFormat, ParameterUpdate, PortFormat, PortFormats, StreamParams},
};

/// Work out the port formats an engine accepts for `params`.
pub fn negotiate(params: &StreamParams) -> Result<PortFormats> {
    validate(&params.input)?;
    let output = derive_output(&params.input, params.output, &params.tuning)?;

    Ok(PortFormats {
        input: PortFormat::new(
            params.input,
            params.input_buffer_count.unwrap_or(DEFAULT_INPUT_BUFFER_COUNT),
        ),
        output: PortFormat::new(
            output,
            params
                .output_buffer_count
                .unwrap_or(DEFAULT_OUTPUT_BUFFER_COUNT),
        ),
    })
}

fn validate(media: &MediaFormat) -> Result<()> {
    match *media {
        MediaFormat::Audio {
            sample_rate,
            channels,
        } => {
            if channels == 0 {
                return Err(AdapterError::engine("audio with zero channels"));
            }
            if sample_rate == 0 || sample_rate % FRAMES_PER_SECOND != 0 {
                return Err(AdapterError::engine(format!(
                    "sample rate {sample_rate} is not a multiple of {FRAMES_PER_SECOND} Hz"
                )));
            }
        }
        MediaFormat::Video { width, height, .. } => {
            if width == 0 || height == 0 {
                return Err(AdapterError::engine(format!(
                    "empty picture {width}x{height}"
                )));
            }
        }
    }
    Ok(())
}

fn derive_output(
    input: &MediaFormat,
    requested: Option<MediaFormat>,
    tuning: &ParameterUpdate,
) -> Result<MediaFormat> {
    let base = requested.unwrap_or(*input);
    if !base.same_kind(input) {
        return Err(AdapterError::engine(format!(
            "cannot convert {input} into {base}"
        )));
    }

    let output = match base {
        MediaFormat::Audio {
            sample_rate,
            channels,
        } => MediaFormat::Audio {
            sample_rate: tuning.sample_rate.unwrap_or(sample_rate),
            channels: tuning.channels.unwrap_or(channels),
        },
        video => {
            if video != *input {
                return Err(AdapterError::engine(format!(
                    "video passes through unscaled, {input} cannot become {video}"
                )));
            }
            video
        }
    };
    validate(&output)?;
    Ok(output)
}

/// Tracks the negotiated formats plus any parameter change that would alter
/// the output format once it is committed.
///
/// Engine proxies keep one on the adapter side so `configure` and
/// `output_format` can answer without a round trip; the worker keeps its own.
#[derive(Debug, Default, Clone)]
pub struct FormatTracker {
    params: Option<StreamParams>,
    committed: Option<PortFormats>,
}

impl FormatTracker {
    pub fn configure(&mut self, params: &StreamParams) -> Result<PortFormats> {
        let formats = negotiate(params)?;
        self.params = Some(params.clone());
        self.committed = Some(formats);
        Ok(formats)
    }

    pub fn tuning(&self) -> ParameterUpdate {
        self.params
            .as_ref()
            .map(|p| p.tuning.clone())
            .unwrap_or_default()
    }

    /// Merge `update` into the stream parameters. Rejected updates leave the
    /// tracker unchanged.
    pub fn apply(&mut self, update: &ParameterUpdate) -> Result<()> {
        let params = self
            .params
            .as_ref()
            .ok_or_else(|| AdapterError::engine("parameters set before configure"))?;
        let mut next = params.clone();
        next.tuning.merge_from(update.clone());
        derive_output(&next.input, next.output, &next.tuning)?;
        self.params = Some(next);
        Ok(())
    }

    /// Output format implied by the current parameters, keeping the committed count.
    pub fn pending_output(&self) -> Result<PortFormat> {
        let (params, committed) = self
            .params
            .as_ref()
            .zip(self.committed)
            .ok_or_else(|| AdapterError::engine("engine is not configured"))?;
        let media = derive_output(&params.input, params.output, &params.tuning)?;
        Ok(PortFormat::new(media, committed.output.buffer_count))
    }

    /// True when the pending output differs from the committed one.
    pub fn output_changed(&self) -> bool {
        match (self.pending_output(), self.committed) {
            (Ok(pending), Some(committed)) => pending != committed.output,
            _ => false,
        }
    }

    pub fn commit_output(&mut self) -> Result<PortFormat> {
        let output = self.pending_output()?;
        if let Some(formats) = self.committed.as_mut() {
            formats.output = output;
        }
        Ok(output)
    }
}

/// Turns one input payload into one output payload.
pub struct Processor {
    input: MediaFormat,
    output: MediaFormat,
    chain: FilterChain,
}

impl Processor {
    pub fn new(formats: PortFormats, tuning: &ParameterUpdate) -> Self {
        Self {
            input: formats.input.media,
            output: formats.output.media,
            chain: FilterChain::from_params(tuning),
        }
    }

    pub fn set_output(&mut self, output: MediaFormat) {
        self.output = output;
        self.chain.reset();
    }

    pub fn retune(&mut self, tuning: &ParameterUpdate) {
        self.chain = FilterChain::from_params(tuning);
    }

    pub fn reset(&mut self) {
        self.chain.reset();
    }

    /// Transform `data`, never producing more than `capacity` bytes.
    pub fn process(&mut self, data: &[u8], capacity: usize) -> Vec<u8> {
        let mut out = match (self.input, self.output) {
            (
                MediaFormat::Audio {
                    sample_rate: in_rate,
                    channels: in_ch,
                },
                MediaFormat::Audio {
                    sample_rate: out_rate,
                    channels: out_ch,
                },
            ) => {
                let samples = samples_from_bytes(data);
                let samples = remix(&samples, in_ch as usize, out_ch as usize);
                let mut samples = resample(&samples, out_ch as usize, in_rate, out_rate);
                if self.chain.is_active() {
                    self.chain.process(&mut samples, out_ch as usize);
                }
                samples_to_bytes(&samples)
            }
            _ => data.to_vec(),
        };
        out.truncate(capacity);
        out
    }
}
