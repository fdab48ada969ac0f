use serde::{Deserialize, Serialize};

use crate::constants::{
    BYTES_PER_SAMPLE, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE, FRAMES_PER_SECOND,
};

/// Pixel layout of a video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Nv12,
    Rgba8888,
}

/// What one buffer on a port carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MediaFormat {
    /// Interleaved signed 16-bit PCM, 20 ms per buffer.
    Audio { sample_rate: u32, channels: u16 },
    /// One uncompressed picture per buffer.
    Video {
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
    },
}

impl MediaFormat {
    /// Bytes needed to hold one buffer's worth of this format.
    pub fn frame_bytes(&self) -> usize {
        match *self {
            Self::Audio {
                sample_rate,
                channels,
            } => (sample_rate / FRAMES_PER_SECOND) as usize * channels as usize * BYTES_PER_SAMPLE,
            Self::Video {
                width,
                height,
                pixel_format,
            } => {
                let pixels = width as usize * height as usize;
                match pixel_format {
                    PixelFormat::Nv12 => pixels * 3 / 2,
                    PixelFormat::Rgba8888 => pixels * 4,
                }
            }
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, Self::Audio { .. })
    }

    pub fn is_video(&self) -> bool {
        matches!(self, Self::Video { .. })
    }

    /// True when a buffer of one format can be turned into the other without
    /// changing media type.
    pub fn same_kind(&self, other: &MediaFormat) -> bool {
        self.is_audio() == other.is_audio()
    }
}

impl Default for MediaFormat {
    fn default() -> Self {
        Self::Audio {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
        }
    }
}

impl std::fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio {
                sample_rate,
                channels,
            } => write!(f, "pcm16 {sample_rate}Hz x{channels}"),
            Self::Video {
                width,
                height,
                pixel_format,
            } => write!(f, "{pixel_format:?} {width}x{height}"),
        }
    }
}

/// Format, count and per-buffer size of one port for one configuration epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortFormat {
    pub media: MediaFormat,
    pub buffer_count: usize,
    pub buffer_size: usize,
}

impl PortFormat {
    pub fn new(media: MediaFormat, buffer_count: usize) -> Self {
        Self {
            media,
            buffer_count,
            buffer_size: media.frame_bytes(),
        }
    }
}

impl std::fmt::Display for PortFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} x {} bytes)",
            self.media, self.buffer_count, self.buffer_size
        )
    }
}

/// Formats accepted by the engine for both ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortFormats {
    pub input: PortFormat,
    pub output: PortFormat,
}

/// Parameters handed to `Configure`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamParams {
    #[serde(default)]
    pub input: MediaFormat,
    /// Requested output format; the engine derives one from the input when absent.
    #[serde(default)]
    pub output: Option<MediaFormat>,
    #[serde(default)]
    pub input_buffer_count: Option<usize>,
    #[serde(default)]
    pub output_buffer_count: Option<usize>,
    /// Processing parameters applied from the first buffer on.
    #[serde(default)]
    pub tuning: ParameterUpdate,
}

macro_rules! define_params {
    ($($field:ident : $type:ty => $name:expr),* $(,)?) => {
        /// Partial update of the engine's processing parameters.
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct ParameterUpdate {
            $(
                #[serde(default, skip_serializing_if = "Option::is_none")]
                pub $field: Option<$type>,
            )*
        }

        impl ParameterUpdate {
            /// Names of every supported parameter in camelCase.
            pub fn names() -> Vec<String> {
                vec![
                    $($name.into()),*
                ]
            }

            /// Names of the parameters this update actually sets.
            pub fn present(&self) -> Vec<&'static str> {
                let mut out = Vec::new();
                $(
                    if self.$field.is_some() {
                        out.push($name);
                    }
                )*
                out
            }

            /// Overlay every field set in `incoming` onto `self`.
            pub fn merge_from(&mut self, incoming: ParameterUpdate) {
                $(
                    if incoming.$field.is_some() {
                        self.$field = incoming.$field;
                    }
                )*
            }

            /// Returns true if no field is set.
            pub fn is_empty(&self) -> bool {
                $(
                    self.$field.is_none() &&
                )* true
            }
        }
    };
}

define_params! {
    gain: f32 => "gain",
    low_pass: LowPassParams => "lowPass",
    channel_mix: ChannelMixParams => "channelMix",
    channels: u16 => "channels",
    sample_rate: u32 => "sampleRate",
}

impl ParameterUpdate {
    /// True when applying this update changes the shape of output buffers.
    pub fn changes_output_format(&self) -> bool {
        self.channels.is_some() || self.sample_rate.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LowPassParams {
    pub smoothing: f32,
}

/// Stereo mix matrix; ignored when the output is not two channels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMixParams {
    pub left_to_left: f32,
    pub left_to_right: f32,
    pub right_to_left: f32,
    pub right_to_right: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_frame_is_twenty_milliseconds() {
        let fmt = MediaFormat::default();
        assert_eq!(fmt.frame_bytes(), 960 * 2 * 2);
    }

    #[test]
    fn nv12_is_twelve_bits_per_pixel() {
        let fmt = MediaFormat::Video {
            width: 64,
            height: 32,
            pixel_format: PixelFormat::Nv12,
        };
        assert_eq!(fmt.frame_bytes(), 64 * 32 * 3 / 2);
    }

    #[test]
    fn merge_keeps_fields_missing_from_update() {
        let mut current = ParameterUpdate {
            gain: Some(0.5),
            channels: Some(2),
            ..Default::default()
        };
        current.merge_from(ParameterUpdate {
            channels: Some(1),
            ..Default::default()
        });
        assert_eq!(current.gain, Some(0.5));
        assert_eq!(current.channels, Some(1));
        assert!(current.changes_output_format());
    }

    #[test]
    fn empty_update_reports_nothing() {
        let update = ParameterUpdate::default();
        assert!(update.is_empty());
        assert!(update.present().is_empty());
        assert_eq!(ParameterUpdate::names().len(), 5);
    }

    #[test]
    fn update_deserializes_from_camel_case() {
        let update: ParameterUpdate =
            serde_json::from_str(r#"{"gain":0.8,"lowPass":{"smoothing":20.0}}"#).unwrap();
        assert_eq!(update.present(), vec!["gain", "lowPass"]);
        assert!(!update.changes_output_format());
    }
}
