extern crate ffmpeg_next as ffmpeg;

use ffmpeg::codec::Parameters as AvCodecParameters;
use ffmpeg::media::Type as AvMediaType;
use ffmpeg::util::format::Pixel as AvPixel;
use ffmpeg::util::format::Sample as AvSample;
use ffmpeg::ChannelLayout as AvChannelLayout;
use ffmpeg::Rational as AvRational;

use crate::time::Time;

/// Snapshot of one elementary stream of a [`crate::MediaInput`].
///
/// Holds everything downstream stages need to configure themselves: codec
/// parameters for decoders and stream copy, the stream time base for
/// timestamp bookkeeping. The snapshot stays valid after the input closes.
#[derive(Clone)]
pub struct Stream {
    index: usize,
    parameters: AvCodecParameters,
    time_base: AvRational,
    frame_rate: AvRational,
    duration: Option<i64>,
}

impl Stream {
    pub(crate) fn from_av(stream: &ffmpeg::format::stream::Stream) -> Self {
        let frame_rate = stream.avg_frame_rate();
        let frame_rate = if frame_rate.numerator() > 0 {
            frame_rate
        } else {
            stream.rate()
        };

        Self {
            index: stream.index(),
            parameters: stream.parameters(),
            time_base: stream.time_base(),
            frame_rate,
            duration: match stream.duration() {
                ffmpeg::ffi::AV_NOPTS_VALUE => None,
                duration => Some(duration),
            },
        }
    }

    /// Index of the stream within its container.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Codec parameters of the stream.
    pub fn parameters(&self) -> &AvCodecParameters {
        &self.parameters
    }

    /// Media type of the stream.
    pub fn media_type(&self) -> AvMediaType {
        self.parameters.medium()
    }

    /// Time base packet timestamps of this stream are expressed in.
    pub fn time_base(&self) -> AvRational {
        self.time_base
    }

    /// Average frame rate reported by the demuxer (video streams).
    pub fn frame_rate(&self) -> AvRational {
        self.frame_rate
    }

    /// Stream duration, when the container knows it.
    pub fn duration(&self) -> Time {
        Time::new(self.duration, self.time_base)
    }
}

unsafe impl Send for Stream {}
unsafe impl Sync for Stream {}

/// Video-specific stream parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub pixel_format: AvPixel,
    pub frame_rate: AvRational,
    pub sample_aspect_ratio: AvRational,
}

/// Audio-specific stream parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioInfo {
    pub sample_rate: i32,
    pub sample_format: AvSample,
    pub channel_layout: AvChannelLayout,
}

#[derive(Debug, Clone)]
enum StreamParams {
    Video(VideoInfo),
    Audio(AudioInfo),
}

/// Descriptor used to configure downstream stages: encoders and filters are
/// set up from the [`StreamInfo`] their upstream produces. Immutable once
/// constructed.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    time_base: AvRational,
    params: StreamParams,
}

impl StreamInfo {
    /// Describe a video stream.
    pub fn video(
        width: u32,
        height: u32,
        pixel_format: AvPixel,
        frame_rate: AvRational,
        time_base: AvRational,
    ) -> Self {
        Self {
            time_base,
            params: StreamParams::Video(VideoInfo {
                width,
                height,
                pixel_format,
                frame_rate,
                sample_aspect_ratio: AvRational::new(0, 1),
            }),
        }
    }

    /// Describe a video stream with an explicit sample aspect ratio.
    pub fn video_with_aspect(
        width: u32,
        height: u32,
        pixel_format: AvPixel,
        frame_rate: AvRational,
        time_base: AvRational,
        sample_aspect_ratio: AvRational,
    ) -> Self {
        Self {
            time_base,
            params: StreamParams::Video(VideoInfo {
                width,
                height,
                pixel_format,
                frame_rate,
                sample_aspect_ratio,
            }),
        }
    }

    /// Describe an audio stream.
    pub fn audio(
        sample_rate: i32,
        sample_format: AvSample,
        channel_layout: AvChannelLayout,
        time_base: AvRational,
    ) -> Self {
        Self {
            time_base,
            params: StreamParams::Audio(AudioInfo {
                sample_rate,
                sample_format,
                channel_layout,
            }),
        }
    }

    /// Media type this descriptor describes.
    pub fn media_type(&self) -> AvMediaType {
        match self.params {
            StreamParams::Video(_) => AvMediaType::Video,
            StreamParams::Audio(_) => AvMediaType::Audio,
        }
    }

    /// Time base of the described stream.
    pub fn time_base(&self) -> AvRational {
        self.time_base
    }

    /// Video parameters, if this describes a video stream.
    pub fn video_info(&self) -> Option<&VideoInfo> {
        match &self.params {
            StreamParams::Video(info) => Some(info),
            StreamParams::Audio(_) => None,
        }
    }

    /// Audio parameters, if this describes an audio stream.
    pub fn audio_info(&self) -> Option<&AudioInfo> {
        match &self.params {
            StreamParams::Audio(info) => Some(info),
            StreamParams::Video(_) => None,
        }
    }
}

unsafe impl Send for StreamInfo {}
unsafe impl Sync for StreamInfo {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_info_accessors() {
        let info = StreamInfo::video(
            1920,
            1080,
            AvPixel::YUV420P,
            AvRational::new(30, 1),
            AvRational::new(1, 15360),
        );
        assert_eq!(info.media_type(), AvMediaType::Video);
        assert_eq!(info.time_base(), AvRational::new(1, 15360));
        assert_eq!(info.video_info().unwrap().width, 1920);
        assert!(info.audio_info().is_none());
    }
}
