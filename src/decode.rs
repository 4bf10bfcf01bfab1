extern crate ffmpeg_next as ffmpeg;

use ffmpeg::codec::decoder::Audio as AvAudioDecoder;
use ffmpeg::codec::decoder::Opened as AvOpenedDecoder;
use ffmpeg::codec::decoder::Video as AvVideoDecoder;
use ffmpeg::codec::Context as AvContext;
use ffmpeg::media::Type as AvMediaType;
use ffmpeg::util::error::EAGAIN;
use ffmpeg::util::format::Pixel as AvPixel;
use ffmpeg::util::frame::Audio as AvAudioFrame;
use ffmpeg::util::frame::Video as AvVideoFrame;
use ffmpeg::{Error as AvError, Rational as AvRational};

use crate::error::Error;
use crate::ffi;
use crate::ffi_hwaccel;
use crate::frame::Frame;
use crate::hwaccel::HardwareContext;
use crate::options::Options;
use crate::packet::Packet;
use crate::stream::{Stream, StreamInfo};

type Result<T> = std::result::Result<T, Error>;

/// Builds a [`Decoder`].
pub struct DecoderBuilder<'a> {
    stream: &'a Stream,
    hardware: Option<&'a HardwareContext>,
    threads: Option<usize>,
    options: Options,
}

impl<'a> DecoderBuilder<'a> {
    /// Create a decoder builder for the given stream.
    pub fn new(stream: &'a Stream) -> Self {
        Self {
            stream,
            hardware: None,
            threads: None,
            options: Options::new(),
        }
    }

    /// Decode on the given hardware device. The decoder takes an internal
    /// reference on the device; the caller keeps ownership of the context.
    pub fn with_hardware(mut self, hardware: &'a HardwareContext) -> Self {
        self.hardware = Some(hardware);
        self
    }

    /// Number of decoding threads (0 selects automatically).
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Free-form codec options (e.g. `skip_frame`).
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Build the [`Decoder`].
    pub fn build(self) -> Result<Decoder> {
        crate::init()?;
        let media_type = self.stream.media_type();
        if media_type != AvMediaType::Video && media_type != AvMediaType::Audio {
            return Err(Error::InvalidArgument(format!(
                "cannot decode {media_type:?} streams"
            )));
        }

        let codec =
            ffmpeg::decoder::find(self.stream.parameters().id()).ok_or(Error::CodecNotFound)?;

        let mut context = AvContext::new();
        ffi::set_decoder_context_time_base(&mut context, self.stream.time_base());
        context
            .set_parameters(self.stream.parameters().clone())
            .map_err(Error::BackendError)?;

        let mut hw_pixel_format = None;
        if let Some(hardware) = self.hardware {
            if media_type != AvMediaType::Video {
                return Err(Error::InvalidArgument(
                    "hardware decoding only applies to video streams".to_string(),
                ));
            }
            let pixel_format = hardware
                .decoder_pixel_format(&codec)
                .ok_or(Error::HardwareIncompatible)?;
            ffi_hwaccel::codec_context_hwaccel_set_get_format(&mut context, pixel_format);
            ffi_hwaccel::codec_context_hwaccel_set_hw_device_ctx(&mut context, hardware.device());
            hw_pixel_format = Some(pixel_format);
        }

        if let Some(threads) = self.threads {
            context.set_threading(ffmpeg::threading::Config {
                count: threads,
                kind: ffmpeg::threading::Type::Frame,
                safe: true,
            });
        }

        let opened = if self.options.is_empty() {
            context.decoder().open_as(codec)
        } else {
            context.decoder().open_as_with(codec, self.options.to_dict())
        }
        .map_err(Error::CodecOpenFailed)?;

        let decoder = match media_type {
            AvMediaType::Video => AvDecoder::Video(opened.video().map_err(Error::CodecOpenFailed)?),
            AvMediaType::Audio => AvDecoder::Audio(opened.audio().map_err(Error::CodecOpenFailed)?),
            _ => unreachable!(),
        };

        Ok(Decoder {
            decoder: Some(decoder),
            draining: false,
            drained: false,
            stream: self.stream.clone(),
            hw_pixel_format,
        })
    }
}

enum AvDecoder {
    Video(AvVideoDecoder),
    Audio(AvAudioDecoder),
}

impl AvDecoder {
    fn opened(&mut self) -> &mut AvOpenedDecoder {
        match self {
            AvDecoder::Video(video) => &mut **video,
            AvDecoder::Audio(audio) => &mut **audio,
        }
    }
}

/// Decodes packets of one stream into raw frames.
///
/// The decoder accepts packets while open; sending end-of-stream (via
/// [`Decoder::flush`]) moves it into a draining state in which it emits any
/// buffered frames until the codec runs dry.
///
/// # Example
///
/// ```ignore
/// let stream = input.best_video_stream_index()?;
/// let mut decoder = Decoder::new(&input.stream(stream)?)?;
/// for frame in decoder.frames(input.packets(Some(stream))?) {
///     println!("decoded {:?}", frame?);
/// }
/// ```
pub struct Decoder {
    decoder: Option<AvDecoder>,
    draining: bool,
    drained: bool,
    stream: Stream,
    hw_pixel_format: Option<AvPixel>,
}

impl Decoder {
    /// Create a decoder for the given stream with default options.
    #[inline]
    pub fn new(stream: &Stream) -> Result<Self> {
        DecoderBuilder::new(stream).build()
    }

    /// Submit one packet and poll for a decoded frame.
    ///
    /// `None` means the decoder needs more input before it can produce a
    /// frame; callers keep feeding packets. Produced frames carry their PTS
    /// in the input stream's time base.
    pub fn decode(&mut self, packet: Packet) -> Result<Option<Frame>> {
        if self.draining {
            return Err(Error::InvalidState("decode after flush"));
        }

        let stream_time_base = self.stream.time_base();
        let decoder = self.active()?;
        let (mut packet, packet_time_base) = packet.into_inner_parts();
        packet.rescale_ts(packet_time_base, stream_time_base);

        match decoder.opened().send_packet(&packet) {
            Ok(()) => {}
            Err(AvError::Other { errno }) if errno == EAGAIN => {
                // Output queue full: drain one frame, then the packet fits.
                let frame = self.receive_frame()?;
                let decoder = self.active()?;
                decoder
                    .opened()
                    .send_packet(&packet)
                    .map_err(Error::DecodeFailed)?;
                if frame.is_some() {
                    return Ok(frame);
                }
            }
            Err(err) => return Err(Error::DecodeFailed(err)),
        }

        self.receive_frame()
    }

    /// Enter the draining state (on the first call) and pull one buffered
    /// frame. `None` means the decoder is fully drained.
    pub fn flush(&mut self) -> Result<Option<Frame>> {
        if self.drained {
            return Ok(None);
        }
        if !self.draining {
            self.draining = true;
            let decoder = self.active()?;
            match decoder.opened().send_eof() {
                Ok(()) | Err(AvError::Eof) => {}
                Err(err) => return Err(Error::DecodeFailed(err)),
            }
        }
        self.receive_frame()
    }

    /// Lazy sequence draining all buffered frames.
    pub fn flush_frames(&mut self) -> impl Iterator<Item = Result<Frame>> + '_ {
        std::iter::from_fn(move || self.flush().transpose())
    }

    /// Lazy sequence decoding an entire packet sequence, flush included.
    ///
    /// Packets for other streams are filtered out. Each produced frame is
    /// yielded exactly once and owned by the consumer.
    pub fn frames<I>(&mut self, packets: I) -> Frames<'_, I>
    where
        I: Iterator<Item = Result<Packet>>,
    {
        Frames {
            decoder: self,
            packets: Some(packets),
        }
    }

    /// The stream info downstream encoders and filters must be configured
    /// from. For hardware decoding the reported pixel format is the hardware
    /// pixel format.
    pub fn output_stream_info(&self) -> Result<StreamInfo> {
        let decoder = self
            .decoder
            .as_ref()
            .ok_or(Error::InvalidState("operation on closed decoder"))?;

        Ok(match decoder {
            AvDecoder::Video(video) => StreamInfo::video_with_aspect(
                video.width(),
                video.height(),
                self.hw_pixel_format.unwrap_or(video.format()),
                self.stream.frame_rate(),
                self.stream.time_base(),
                video.aspect_ratio(),
            ),
            AvDecoder::Audio(audio) => StreamInfo::audio(
                audio.rate() as i32,
                audio.format(),
                audio.channel_layout(),
                self.stream.time_base(),
            ),
        })
    }

    /// Whether this decoder produces hardware frames.
    pub fn is_hardware(&self) -> bool {
        self.hw_pixel_format.is_some()
    }

    /// The stream this decoder was created from.
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Index of the stream this decoder consumes.
    pub fn stream_index(&self) -> usize {
        self.stream.index()
    }

    /// Time base of produced frames.
    pub fn time_base(&self) -> AvRational {
        self.stream.time_base()
    }

    /// Release the codec context. Buffered frames still in the codec are
    /// discarded. Idempotent.
    pub fn close(&mut self) {
        // Drain whatever the codec still holds before freeing it.
        const MAX_DRAIN_ITERATIONS: u32 = 100;

        if let Some(decoder) = self.decoder.as_mut() {
            if !self.draining {
                let _ = decoder.opened().send_eof();
            }
            for _ in 0..MAX_DRAIN_ITERATIONS {
                match self.receive_frame() {
                    Ok(Some(_)) => continue,
                    _ => break,
                }
            }
        }
        self.decoder.take();
    }

    fn active(&mut self) -> Result<&mut AvDecoder> {
        self.decoder
            .as_mut()
            .ok_or(Error::InvalidState("operation on closed decoder"))
    }

    /// Pull one decoded frame, mapping `EAGAIN` ("need more input") and
    /// end-of-stream to `None`.
    fn receive_frame(&mut self) -> Result<Option<Frame>> {
        let decoder = match self.decoder.as_mut() {
            Some(decoder) => decoder,
            None => return Ok(None),
        };

        match decoder {
            AvDecoder::Video(video) => {
                let mut frame = AvVideoFrame::empty();
                match video.receive_frame(&mut frame) {
                    Ok(()) => Ok(Some(Frame::Video(frame))),
                    Err(err) => self.map_receive_error(err),
                }
            }
            AvDecoder::Audio(audio) => {
                let mut frame = AvAudioFrame::empty();
                match audio.receive_frame(&mut frame) {
                    Ok(()) => Ok(Some(Frame::Audio(frame))),
                    Err(err) => self.map_receive_error(err),
                }
            }
        }
    }

    fn map_receive_error(&mut self, err: AvError) -> Result<Option<Frame>> {
        match err {
            AvError::Other { errno } if errno == EAGAIN => Ok(None),
            AvError::Eof => {
                self.drained = true;
                Ok(None)
            }
            err => Err(Error::DecodeFailed(err)),
        }
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.close();
    }
}

unsafe impl Send for Decoder {}

/// Lazy frame sequence produced by [`Decoder::frames`].
pub struct Frames<'a, I> {
    decoder: &'a mut Decoder,
    packets: Option<I>,
}

impl<I> Iterator for Frames<'_, I>
where
    I: Iterator<Item = Result<Packet>>,
{
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        // Pump packets until the decoder produces a frame, then switch to
        // flushing once the packet sequence ends.
        while let Some(packets) = self.packets.as_mut() {
            match packets.next() {
                Some(Ok(packet)) => {
                    if packet.stream_index() != self.decoder.stream_index() {
                        continue;
                    }
                    match self.decoder.decode(packet) {
                        Ok(Some(frame)) => return Some(Ok(frame)),
                        Ok(None) => continue,
                        Err(err) => return Some(Err(err)),
                    }
                }
                Some(Err(err)) => return Some(Err(err)),
                None => {
                    self.packets = None;
                }
            }
        }

        match self.decoder.flush() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}
