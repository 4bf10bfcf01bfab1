extern crate ffmpeg_next as ffmpeg;

use ffmpeg::codec::codec::Codec as AvCodec;
use ffmpeg::codec::encoder::Encoder as AvEncoderBase;
use ffmpeg::codec::flag::Flags as AvCodecFlags;
use ffmpeg::codec::packet::Packet as AvPacket;
use ffmpeg::codec::Id as AvCodecId;
use ffmpeg::media::Type as AvMediaType;
use ffmpeg::util::error::EAGAIN;
use ffmpeg::{Error as AvError, Rational as AvRational};

use crate::bitrate::BitrateSpec;
use crate::error::Error;
use crate::ffi;
use crate::ffi_hwaccel;
use crate::frame::Frame;
use crate::options::Options;
use crate::packet::Packet;
use crate::stream::StreamInfo;

type Result<T> = std::result::Result<T, Error>;

/// Identifies the encoder implementation to use: a codec name, a numeric
/// codec id, or a codec object (e.g. from
/// [`crate::HardwareContext::encoder_codec`]).
pub enum EncoderCodec {
    Name(String),
    Id(AvCodecId),
    Codec(AvCodec),
}

impl From<&str> for EncoderCodec {
    fn from(value: &str) -> Self {
        EncoderCodec::Name(value.to_string())
    }
}

impl From<AvCodecId> for EncoderCodec {
    fn from(value: AvCodecId) -> Self {
        EncoderCodec::Id(value)
    }
}

impl From<AvCodec> for EncoderCodec {
    fn from(value: AvCodec) -> Self {
        EncoderCodec::Codec(value)
    }
}

/// Holds a logical combination of encoder settings. Values not given here
/// are inherited from the input [`StreamInfo`].
#[derive(Debug, Clone, Default)]
pub struct Settings {
    bitrate: Option<BitrateSpec>,
    gop_size: Option<u32>,
    max_b_frames: Option<usize>,
    threads: Option<usize>,
    time_base: Option<AvRational>,
    frame_rate: Option<AvRational>,
    global_header: bool,
    options: Options,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Target bitrate, as bits per second or a string like `"2M"`.
    pub fn with_bitrate(mut self, bitrate: impl Into<BitrateSpec>) -> Self {
        self.bitrate = Some(bitrate.into());
        self
    }

    /// Keyframe interval in frames.
    pub fn with_gop_size(mut self, gop_size: u32) -> Self {
        self.gop_size = Some(gop_size);
        self
    }

    pub fn with_max_b_frames(mut self, max_b_frames: usize) -> Self {
        self.max_b_frames = Some(max_b_frames);
        self
    }

    /// Number of encoding threads (0 selects automatically).
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Override the output time base inherited from the input stream info.
    pub fn with_time_base(mut self, time_base: AvRational) -> Self {
        self.time_base = Some(time_base);
        self
    }

    /// Override the frame rate inherited from the input stream info.
    pub fn with_frame_rate(mut self, frame_rate: AvRational) -> Self {
        self.frame_rate = Some(frame_rate);
        self
    }

    /// Emit global headers. Required by container formats such as MP4 and
    /// Matroska; see [`crate::MediaOutput::needs_global_header`].
    pub fn with_global_header(mut self) -> Self {
        self.global_header = true;
        self
    }

    /// Free-form codec options (`preset`, `crf`, `profile`, ...).
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }
}

struct Config {
    info: StreamInfo,
    settings: Settings,
}

enum AvEncoder {
    Video(ffmpeg::codec::encoder::video::Encoder),
    Audio(ffmpeg::codec::encoder::audio::Encoder),
}

impl AvEncoder {
    fn base(&mut self) -> &mut AvEncoderBase {
        match self {
            AvEncoder::Video(video) => &mut ***video,
            AvEncoder::Audio(audio) => &mut ***audio,
        }
    }

    fn context(&self) -> &ffmpeg::codec::Context {
        match self {
            AvEncoder::Video(video) => video,
            AvEncoder::Audio(audio) => audio,
        }
    }
}

struct OpenedEncoder {
    encoder: AvEncoder,
    time_base: AvRational,
    /// Hardware frames context adopted from the first frame; null for
    /// software encoding. Compared by identity for every later frame.
    hw_frames: *mut ffmpeg::ffi::AVBufferRef,
    last_pts: Option<i64>,
    draining: bool,
    drained: bool,
}

enum State {
    Configured(Box<Config>),
    Open(OpenedEncoder),
    Closed,
}

/// Encodes raw frames into packets.
///
/// The codec context opens lazily on the first [`Encoder::encode`] call so
/// that a hardware frames context arriving with the first frame can be
/// adopted before the encoder opens. Frames after the first must share that
/// hardware frames context.
///
/// Produced packets carry the encoder's output time base and no stream
/// index; [`crate::MediaOutput::write_packet`] assigns both.
///
/// # Example
///
/// ```ignore
/// let info = decoder.output_stream_info()?;
/// let mut encoder = Encoder::new(
///     "libx264",
///     info,
///     Settings::new().with_bitrate("2M").with_gop_size(60),
/// )?;
/// ```
pub struct Encoder {
    codec: AvCodec,
    state: State,
}

impl Encoder {
    /// Create an encoder from a codec identifier, the stream info describing
    /// its input, and settings. The codec context is not opened yet.
    pub fn new(
        codec: impl Into<EncoderCodec>,
        info: StreamInfo,
        settings: Settings,
    ) -> Result<Self> {
        crate::init()?;
        let codec = match codec.into() {
            EncoderCodec::Name(name) => {
                ffmpeg::encoder::find_by_name(&name).ok_or(Error::CodecNotFound)?
            }
            EncoderCodec::Id(id) => ffmpeg::encoder::find(id).ok_or(Error::CodecNotFound)?,
            EncoderCodec::Codec(codec) => codec,
        };

        if codec.medium() != info.media_type() {
            return Err(Error::InvalidArgument(format!(
                "codec {} does not encode {:?}",
                codec.name(),
                info.media_type(),
            )));
        }

        Ok(Self {
            codec,
            state: State::Configured(Box::new(Config { info, settings })),
        })
    }

    /// Submit one frame and poll for an encoded packet.
    ///
    /// The first call opens the codec context, adopting the frame's
    /// hardware frames context when present. `None` means the encoder needs
    /// more input before it can produce a packet.
    pub fn encode(&mut self, frame: &Frame) -> Result<Option<Packet>> {
        self.ensure_open(Some(frame))?;
        let opened = self.opened_mut()?;
        if opened.draining {
            return Err(Error::InvalidState("encode after flush"));
        }

        if opened.hw_frames.is_null() {
            if frame.is_hardware() {
                return Err(Error::HardwareIncompatible);
            }
        } else if frame.hw_frames_ctx() != opened.hw_frames {
            return Err(Error::HardwareIncompatible);
        }

        if let Some(pts) = frame.pts() {
            if let Some(last) = opened.last_pts {
                if pts <= last {
                    return Err(Error::EncodeFailed(AvError::InvalidData));
                }
            }
            opened.last_pts = Some(pts);
        }

        match opened.encoder.base().send_frame(frame.as_ref()) {
            Ok(()) => {}
            Err(AvError::Other { errno }) if errno == EAGAIN => {
                // Output queue full: drain one packet, then the frame fits.
                let packet = Self::receive_packet(opened)?;
                opened
                    .encoder
                    .base()
                    .send_frame(frame.as_ref())
                    .map_err(Error::EncodeFailed)?;
                if packet.is_some() {
                    return Ok(packet);
                }
            }
            Err(err) => return Err(Error::EncodeFailed(err)),
        }

        Self::receive_packet(opened)
    }

    /// Enter the draining state (on the first call) and pull one buffered
    /// packet. `None` means the encoder is fully drained.
    ///
    /// An encoder that never saw a frame opens as software here so that it
    /// can still finalize an (empty) stream.
    pub fn flush(&mut self) -> Result<Option<Packet>> {
        self.ensure_open(None)?;
        let opened = self.opened_mut()?;
        if opened.drained {
            return Ok(None);
        }
        if !opened.draining {
            opened.draining = true;
            match opened.encoder.base().send_eof() {
                Ok(()) | Err(AvError::Eof) => {}
                Err(err) => return Err(Error::EncodeFailed(err)),
            }
        }
        Self::receive_packet(opened)
    }

    /// Lazy sequence draining all buffered packets.
    pub fn flush_packets(&mut self) -> impl Iterator<Item = Result<Packet>> + '_ {
        std::iter::from_fn(move || self.flush().transpose())
    }

    /// Lazy sequence encoding an entire frame sequence, flush included.
    pub fn packets<I>(&mut self, frames: I) -> Packets<'_, I>
    where
        I: Iterator<Item = Result<Frame>>,
    {
        Packets {
            encoder: self,
            frames: Some(frames),
        }
    }

    /// Force the lazy open now, as software. Needed when an output stream
    /// must be configured from this encoder before the first frame arrives.
    pub fn open(&mut self) -> Result<()> {
        self.ensure_open(None)
    }

    /// Turn on global headers before the encoder opens. No effect once
    /// open; pipelines call this when the output container requires it.
    pub(crate) fn request_global_header(&mut self) {
        if let State::Configured(config) = &mut self.state {
            config.settings.global_header = true;
        }
    }

    /// Whether the codec context has been opened yet.
    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open(_))
    }

    /// The encoder's output time base. Available once open.
    pub fn time_base(&self) -> Result<AvRational> {
        Ok(self.opened()?.time_base)
    }

    /// Codec parameters of the opened encoder.
    pub(crate) fn parameters(&self) -> Result<ffmpeg::codec::Parameters> {
        let opened = self.opened().map_err(|_| {
            Error::InvalidState("encoder parameters are only available once it is open")
        })?;
        ffi::parameters_from_context(opened.encoder.context()).map_err(Error::BackendError)
    }

    /// The codec this encoder uses.
    pub fn codec(&self) -> AvCodec {
        self.codec
    }

    /// Whether the encoder consumes hardware frames.
    pub fn is_hardware(&self) -> bool {
        match &self.state {
            State::Open(opened) => !opened.hw_frames.is_null(),
            _ => false,
        }
    }

    /// Release the codec context. The hardware context, if any, belongs to
    /// the caller and is never released here. Idempotent.
    pub fn close(&mut self) {
        self.state = State::Closed;
    }

    fn ensure_open(&mut self, first_frame: Option<&Frame>) -> Result<()> {
        match &self.state {
            State::Open(_) => Ok(()),
            State::Closed => Err(Error::InvalidState("operation on closed encoder")),
            State::Configured(_) => {
                let config = match std::mem::replace(&mut self.state, State::Closed) {
                    State::Configured(config) => config,
                    _ => unreachable!(),
                };
                match Self::do_open(self.codec, *config, first_frame) {
                    Ok(opened) => {
                        self.state = State::Open(opened);
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    fn do_open(
        codec: AvCodec,
        config: Config,
        first_frame: Option<&Frame>,
    ) -> Result<OpenedEncoder> {
        let Config { info, settings } = config;

        let mut context = ffi::codec_context_as(&codec).map_err(Error::BackendError)?;
        // Some formats require global headers or the output will not be
        // playable by dumb players.
        if settings.global_header {
            context.set_flags(AvCodecFlags::GLOBAL_HEADER);
        }
        if let Some(threads) = settings.threads {
            context.set_threading(ffmpeg::threading::Config {
                count: threads,
                kind: ffmpeg::threading::Type::Frame,
                safe: true,
            });
        }

        let bitrate = settings
            .bitrate
            .as_ref()
            .map(BitrateSpec::resolve)
            .transpose()?;

        let hw_frames = first_frame
            .map(Frame::hw_frames_ctx)
            .unwrap_or(std::ptr::null_mut());

        let (encoder, time_base) = match info.media_type() {
            AvMediaType::Video => {
                let video_info = info.video_info().expect("video stream info");
                let mut encoder = context
                    .encoder()
                    .video()
                    .map_err(Error::CodecOpenFailed)?;

                encoder.set_width(video_info.width);
                encoder.set_height(video_info.height);
                encoder.set_time_base(settings.time_base.unwrap_or(info.time_base()));
                encoder
                    .set_frame_rate(Some(settings.frame_rate.unwrap_or(video_info.frame_rate)));
                if video_info.sample_aspect_ratio.numerator() > 0 {
                    encoder.set_aspect_ratio(video_info.sample_aspect_ratio);
                }
                if let Some(bitrate) = bitrate {
                    encoder.set_bit_rate(bitrate as usize);
                }
                if let Some(gop_size) = settings.gop_size {
                    encoder.set_gop(gop_size);
                }
                if let Some(max_b_frames) = settings.max_b_frames {
                    encoder.set_max_b_frames(max_b_frames);
                }

                if hw_frames.is_null() {
                    encoder.set_format(video_info.pixel_format);
                } else {
                    // Adopt the hardware frames context of the first frame;
                    // its pixel format is the hardware format.
                    let frame = first_frame.expect("hardware frame");
                    let hw_format = frame.video().expect("video frame").format();
                    encoder.set_format(hw_format);
                    ffi_hwaccel::codec_context_set_hw_frames_ctx(&mut encoder, hw_frames);
                }

                let opened = encoder
                    .open_with(settings.options.to_dict())
                    .map_err(Error::CodecOpenFailed)?;
                let time_base = ffi::codec_context_time_base(&opened);
                (AvEncoder::Video(opened), time_base)
            }
            AvMediaType::Audio => {
                let audio_info = info.audio_info().expect("audio stream info");
                let mut encoder = context
                    .encoder()
                    .audio()
                    .map_err(Error::CodecOpenFailed)?;

                encoder.set_rate(audio_info.sample_rate);
                encoder.set_format(audio_info.sample_format);
                encoder.set_channel_layout(audio_info.channel_layout.clone());
                encoder.set_time_base(
                    settings
                        .time_base
                        .unwrap_or(AvRational::new(1, audio_info.sample_rate)),
                );
                if let Some(bitrate) = bitrate {
                    encoder.set_bit_rate(bitrate as usize);
                }

                let opened = encoder
                    .open_with(settings.options.to_dict())
                    .map_err(Error::CodecOpenFailed)?;
                let time_base = ffi::codec_context_time_base(&opened);
                (AvEncoder::Audio(opened), time_base)
            }
            other => {
                return Err(Error::InvalidArgument(format!(
                    "cannot encode {other:?} streams"
                )))
            }
        };

        Ok(OpenedEncoder {
            encoder,
            time_base,
            hw_frames,
            last_pts: None,
            draining: false,
            drained: false,
        })
    }

    fn opened(&self) -> Result<&OpenedEncoder> {
        match &self.state {
            State::Open(opened) => Ok(opened),
            State::Configured(_) => Err(Error::InvalidState("encoder is not open yet")),
            State::Closed => Err(Error::InvalidState("operation on closed encoder")),
        }
    }

    fn opened_mut(&mut self) -> Result<&mut OpenedEncoder> {
        match &mut self.state {
            State::Open(opened) => Ok(opened),
            State::Configured(_) => Err(Error::InvalidState("encoder is not open yet")),
            State::Closed => Err(Error::InvalidState("operation on closed encoder")),
        }
    }

    /// Pull one encoded packet, mapping `EAGAIN` ("need more input") and
    /// end-of-stream to `None`.
    fn receive_packet(opened: &mut OpenedEncoder) -> Result<Option<Packet>> {
        let mut packet = AvPacket::empty();
        match opened.encoder.base().receive_packet(&mut packet) {
            Ok(()) => Ok(Some(Packet::new(packet, opened.time_base))),
            Err(AvError::Other { errno }) if errno == EAGAIN => Ok(None),
            Err(AvError::Eof) => {
                opened.drained = true;
                Ok(None)
            }
            Err(err) => Err(Error::EncodeFailed(err)),
        }
    }
}

unsafe impl Send for Encoder {}

/// Lazy packet sequence produced by [`Encoder::packets`].
pub struct Packets<'a, I> {
    encoder: &'a mut Encoder,
    frames: Option<I>,
}

impl<I> Iterator for Packets<'_, I>
where
    I: Iterator<Item = Result<Frame>>,
{
    type Item = Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(frames) = self.frames.as_mut() {
            match frames.next() {
                Some(Ok(frame)) => match self.encoder.encode(&frame) {
                    Ok(Some(packet)) => return Some(Ok(packet)),
                    Ok(None) => continue,
                    Err(err) => return Some(Err(err)),
                },
                Some(Err(err)) => return Some(Err(err)),
                None => {
                    self.frames = None;
                }
            }
        }

        match self.encoder.flush() {
            Ok(Some(packet)) => Some(Ok(packet)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffmpeg::util::format::Pixel as AvPixel;

    fn video_info() -> StreamInfo {
        StreamInfo::video(
            320,
            240,
            AvPixel::YUV420P,
            AvRational::new(25, 1),
            AvRational::new(1, 25),
        )
    }

    #[test]
    fn unknown_codec_name_fails() {
        crate::init().unwrap();
        let result = Encoder::new("no_such_codec", video_info(), Settings::new());
        assert!(matches!(result, Err(Error::CodecNotFound)));
    }

    #[test]
    fn codec_medium_must_match_info() {
        crate::init().unwrap();
        let result = Encoder::new(AvCodecId::PCM_S16LE, video_info(), Settings::new());
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn lazy_open_and_software_encode() {
        crate::init().unwrap();
        let mut encoder =
            Encoder::new(AvCodecId::MPEG4, video_info(), Settings::new()).unwrap();
        assert!(!encoder.is_open());
        assert!(encoder.time_base().is_err(), "time base requires open");

        let mut produced = 0;
        for index in 0..5 {
            let mut frame = ffmpeg::frame::Video::new(AvPixel::YUV420P, 320, 240);
            blacken(&mut frame);
            frame.set_pts(Some(index));
            let frame = Frame::Video(frame);
            if encoder.encode(&frame).unwrap().is_some() {
                produced += 1;
            }
        }
        assert!(encoder.is_open());
        assert!(!encoder.is_hardware());

        while let Some(packet) = encoder.flush().unwrap() {
            assert_eq!(packet.time_base(), encoder.time_base().unwrap());
            produced += 1;
        }
        assert_eq!(produced, 5);
    }

    #[test]
    fn non_monotonic_pts_is_rejected() {
        crate::init().unwrap();
        let mut encoder =
            Encoder::new(AvCodecId::MPEG4, video_info(), Settings::new()).unwrap();

        let mut frame = ffmpeg::frame::Video::new(AvPixel::YUV420P, 320, 240);
        blacken(&mut frame);
        frame.set_pts(Some(10));
        encoder.encode(&Frame::Video(frame)).unwrap();

        let mut frame = ffmpeg::frame::Video::new(AvPixel::YUV420P, 320, 240);
        blacken(&mut frame);
        frame.set_pts(Some(10));
        assert!(matches!(
            encoder.encode(&Frame::Video(frame)),
            Err(Error::EncodeFailed(_))
        ));
    }

    #[test]
    fn operations_after_close_fail() {
        crate::init().unwrap();
        let mut encoder =
            Encoder::new(AvCodecId::MPEG4, video_info(), Settings::new()).unwrap();
        encoder.close();
        assert!(matches!(
            encoder.flush(),
            Err(Error::InvalidState(_))
        ));
    }

    /// Fill every plane so the encoder sees deterministic data.
    fn blacken(frame: &mut ffmpeg::frame::Video) {
        for plane in 0..frame.planes() {
            let fill = if plane == 0 { 16 } else { 128 };
            frame.data_mut(plane).fill(fill);
        }
    }
}
