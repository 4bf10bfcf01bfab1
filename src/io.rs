extern crate ffmpeg_next as ffmpeg;

use std::io::Cursor;
use std::io::{Read, Seek, Write};

use ffmpeg::codec::packet::Packet as AvPacket;
use ffmpeg::format::context::Input as AvInput;
use ffmpeg::media::Type as AvMediaType;
use ffmpeg::util::format::Pixel as AvPixel;
use ffmpeg::util::format::{sample, Sample as AvSample};
use ffmpeg::Error as AvError;
use ffmpeg::Rational as AvRational;

use crate::error::Error;
use crate::ffi;
use crate::location::Location;
use crate::options::Options;
use crate::packet::Packet;
use crate::stream::Stream;
use crate::time::Time;

type Result<T> = std::result::Result<T, Error>;

/// Default I/O buffer size for buffer and callback sources.
const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Upper bound on bytes read for non-destructive format probing.
const PROBE_READ_LIMIT: usize = 1024 * 1024;

/// Reader side of a caller-provided byte source.
pub trait MediaRead: Read + Seek + Send {}
impl<T: Read + Seek + Send> MediaRead for T {}

/// Writer side of a caller-provided byte sink.
pub trait MediaWrite: Write + Seek + Send {}
impl<T: Write + Seek + Send> MediaWrite for T {}

/// Where a [`MediaInput`] reads from.
pub enum Source {
    /// A file path or network URL, handed to libavformat as-is.
    Location(Location),
    /// An in-memory buffer holding a complete media file.
    Buffer(Vec<u8>),
    /// A caller-provided read/seek implementation.
    Callbacks(Box<dyn MediaRead>),
    /// Raw (non-demuxed) samples that need explicit parameters.
    Raw(RawDescriptor),
}

impl From<Location> for Source {
    fn from(value: Location) -> Source {
        Source::Location(value)
    }
}

impl From<&Location> for Source {
    fn from(value: &Location) -> Source {
        Source::Location(value.clone())
    }
}

impl From<&std::path::Path> for Source {
    fn from(value: &std::path::Path) -> Source {
        Source::Location(value.into())
    }
}

impl From<std::path::PathBuf> for Source {
    fn from(value: std::path::PathBuf) -> Source {
        Source::Location(value.into())
    }
}

impl From<crate::location::Url> for Source {
    fn from(value: crate::location::Url) -> Source {
        Source::Location(value.into())
    }
}

impl From<&str> for Source {
    fn from(value: &str) -> Source {
        Source::Location(value.into())
    }
}

impl From<Vec<u8>> for Source {
    fn from(value: Vec<u8>) -> Source {
        Source::Buffer(value)
    }
}

impl From<RawDescriptor> for Source {
    fn from(value: RawDescriptor) -> Source {
        Source::Raw(value)
    }
}

/// Backing bytes of a [`RawDescriptor`].
pub enum RawSource {
    Path(std::path::PathBuf),
    Buffer(Vec<u8>),
}

/// Describes raw input that libavformat cannot infer parameters for:
/// headerless video frames or PCM samples.
pub enum RawDescriptor {
    Video {
        source: RawSource,
        width: u32,
        height: u32,
        pixel_format: AvPixel,
        frame_rate: AvRational,
    },
    Audio {
        source: RawSource,
        sample_rate: i32,
        channels: i32,
        sample_format: AvSample,
    },
}

impl RawDescriptor {
    /// The demuxer name and parameter dictionary for this descriptor, plus
    /// the underlying byte source.
    fn into_open_parts(self) -> Result<(RawSource, String, Options)> {
        match self {
            RawDescriptor::Video {
                source,
                width,
                height,
                pixel_format,
                frame_rate,
            } => {
                let pixel_format_name = pixel_format
                    .descriptor()
                    .map(|descriptor| descriptor.name())
                    .ok_or_else(|| {
                        Error::InvalidArgument("raw video needs a valid pixel format".to_string())
                    })?;
                let mut options = Options::new();
                options.set("video_size", &format!("{width}x{height}"));
                options.set("pixel_format", pixel_format_name);
                options.set(
                    "framerate",
                    &format!("{}/{}", frame_rate.numerator(), frame_rate.denominator()),
                );
                Ok((source, "rawvideo".to_string(), options))
            }
            RawDescriptor::Audio {
                source,
                sample_rate,
                channels,
                sample_format,
            } => {
                let format = pcm_demuxer_name(sample_format).ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "no raw PCM demuxer for sample format {sample_format:?}"
                    ))
                })?;
                let mut options = Options::new();
                options.set("sample_rate", &sample_rate.to_string());
                options.set("ch_layout", &format!("{channels}c"));
                Ok((source, format.to_string(), options))
            }
        }
    }
}

/// The PCM demuxer matching a packed sample format.
fn pcm_demuxer_name(format: AvSample) -> Option<&'static str> {
    match format {
        AvSample::U8(sample::Type::Packed) => Some("u8"),
        AvSample::I16(sample::Type::Packed) => Some("s16le"),
        AvSample::I32(sample::Type::Packed) => Some("s32le"),
        AvSample::F32(sample::Type::Packed) => Some("f32le"),
        AvSample::F64(sample::Type::Packed) => Some("f64le"),
        _ => None,
    }
}

/// Result of probing a source for its container format.
#[derive(Debug, Clone)]
pub struct FormatProbe {
    /// Short demuxer name, e.g. `"mov,mp4,m4a,3gp,3g2,mj2"`.
    pub format: String,
    pub long_name: Option<String>,
    pub mime_type: Option<String>,
    /// Comma-separated file extensions the format claims.
    pub extensions: Option<String>,
    /// Detection score normalized to `0.0..=1.0`.
    pub confidence: f32,
}

/// Flags modifying [`MediaInput::seek_with_flags`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SeekFlags {
    /// Seek to the nearest keyframe before the target.
    pub backward: bool,
    /// Allow seeking to non-keyframes.
    pub any: bool,
    /// Seek by byte position instead of time.
    pub byte: bool,
    /// Seek by frame number instead of time.
    pub frame: bool,
}

impl SeekFlags {
    fn to_av(self) -> std::ffi::c_int {
        let mut flags = 0;
        if self.backward {
            flags |= ffmpeg::ffi::AVSEEK_FLAG_BACKWARD;
        }
        if self.any {
            flags |= ffmpeg::ffi::AVSEEK_FLAG_ANY;
        }
        if self.byte {
            flags |= ffmpeg::ffi::AVSEEK_FLAG_BYTE;
        }
        if self.frame {
            flags |= ffmpeg::ffi::AVSEEK_FLAG_FRAME;
        }
        flags as std::ffi::c_int
    }
}

/// Builds a [`MediaInput`].
///
/// # Example
///
/// ```ignore
/// let mut options = HashMap::new();
/// options.insert(
///     "rtsp_transport".to_string(),
///     "tcp".to_string(),
/// );
///
/// let input = MediaInputBuilder::new(Path::new("stream.sdp"))
///     .with_options(options.into())
///     .build()?;
/// ```
pub struct MediaInputBuilder {
    source: Source,
    format: Option<String>,
    options: Options,
    buffer_size: usize,
}

impl MediaInputBuilder {
    /// Create a builder for the given source.
    pub fn new(source: impl Into<Source>) -> Self {
        Self {
            source: source.into(),
            format: None,
            options: Options::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Force a specific input format instead of letting libavformat probe.
    pub fn with_format(mut self, format: &str) -> Self {
        self.format = Some(format.to_string());
        self
    }

    /// Specify options for the backend demuxer.
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// I/O buffer size for buffer and callback sources.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Build the [`MediaInput`].
    pub fn build(self) -> Result<MediaInput> {
        crate::init()?;
        let Self {
            source,
            mut format,
            options,
            buffer_size,
        } = self;

        let mut options = options;
        let source = match source {
            Source::Raw(descriptor) => {
                let (raw_source, raw_format, raw_options) = descriptor.into_open_parts()?;
                for (key, value) in
                    std::collections::HashMap::<String, String>::from(raw_options)
                {
                    options.set(&key, &value);
                }
                format = Some(raw_format);
                match raw_source {
                    RawSource::Path(path) => Source::Location(Location::File(path)),
                    RawSource::Buffer(buffer) => Source::Buffer(buffer),
                }
            }
            other => other,
        };

        match source {
            Source::Location(location) => {
                let path = location.as_path().to_string_lossy().into_owned();
                let input = ffi::open_input(
                    Some(&path),
                    format.as_deref(),
                    options.to_dict(),
                    None,
                )
                .map_err(map_open_error)?;
                Ok(MediaInput { input: Some(input), io: None })
            }
            Source::Buffer(buffer) => {
                Self::build_from_reader(Box::new(Cursor::new(buffer)), format, options, buffer_size)
            }
            Source::Callbacks(reader) => {
                Self::build_from_reader(reader, format, options, buffer_size)
            }
            Source::Raw(_) => unreachable!("raw descriptors resolved above"),
        }
    }

    fn build_from_reader(
        reader: Box<dyn MediaRead>,
        format: Option<String>,
        options: Options,
        buffer_size: usize,
    ) -> Result<MediaInput> {
        let io = ffi::AvioReader::new(reader, buffer_size).map_err(Error::SourceUnavailable)?;
        let input = ffi::open_input(None, format.as_deref(), options.to_dict(), Some(io.as_ptr()))
            .map_err(map_open_error)?;
        Ok(MediaInput {
            input: Some(input),
            io: Some(io),
        })
    }
}

fn map_open_error(error: ffi::OpenInputError) -> Error {
    match error {
        ffi::OpenInputError::Open(AvError::DemuxerNotFound)
        | ffi::OpenInputError::Open(AvError::InvalidData) => Error::FormatNotRecognized,
        ffi::OpenInputError::Open(err) => Error::SourceUnavailable(err),
        ffi::OpenInputError::Probe(err) => Error::ProbeFailed(err),
    }
}

/// Demuxer over a media source. Opens the source, probes its format and
/// exposes the contained streams and their packets.
///
/// # Example
///
/// ```ignore
/// let mut input = MediaInput::open(Path::new("movie.mp4"))?;
/// let video = input.best_video_stream_index()?;
/// for packet in input.packets(Some(video)) {
///     println!("packet of {} bytes", packet?.size());
/// }
/// ```
pub struct MediaInput {
    // Declared before `io` so the format context drops before the custom
    // I/O context it borrows.
    input: Option<AvInput>,
    io: Option<ffi::AvioReader>,
}

impl MediaInput {
    /// Open the given source with default options.
    #[inline]
    pub fn open(source: impl Into<Source>) -> Result<Self> {
        MediaInputBuilder::new(source).build()
    }

    /// Probe a source for its container format without opening a demuxer.
    ///
    /// Returns `None` when libavformat does not recognize the bytes. Only
    /// path and buffer sources can be probed non-destructively; callback and
    /// raw sources return an `InvalidArgument` error.
    pub fn probe_format(source: impl Into<Source>) -> Result<Option<FormatProbe>> {
        let (bytes, filename) = match source.into() {
            Source::Location(Location::File(path)) => {
                let mut file = std::fs::File::open(&path)
                    .map_err(|_| Error::SourceUnavailable(AvError::InvalidData))?;
                let mut bytes = vec![0u8; PROBE_READ_LIMIT];
                let mut filled = 0;
                loop {
                    match file.read(&mut bytes[filled..]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(_) => return Err(Error::SourceUnavailable(AvError::InvalidData)),
                    }
                    if filled == bytes.len() {
                        break;
                    }
                }
                bytes.truncate(filled);
                (bytes, Some(path.to_string_lossy().into_owned()))
            }
            Source::Buffer(buffer) => {
                let mut buffer = buffer;
                buffer.truncate(PROBE_READ_LIMIT);
                (buffer, None)
            }
            _ => {
                return Err(Error::InvalidArgument(
                    "only path and buffer sources can be probed".to_string(),
                ))
            }
        };

        Ok(
            ffi::probe_buffer(&bytes, filename.as_deref()).map(|probe| FormatProbe {
                format: probe.format,
                long_name: probe.long_name,
                mime_type: probe.mime_type,
                extensions: probe.extensions,
                confidence: probe.confidence,
            }),
        )
    }

    /// Snapshots of all streams in the container.
    pub fn streams(&self) -> Result<Vec<Stream>> {
        Ok(self
            .input()?
            .streams()
            .map(|stream| Stream::from_av(&stream))
            .collect())
    }

    /// Snapshot of the stream with the given index.
    pub fn stream(&self, index: usize) -> Result<Stream> {
        Ok(Stream::from_av(
            &self.input()?.stream(index).ok_or(AvError::StreamNotFound)?,
        ))
    }

    /// The `nth` video stream (0 for the first).
    pub fn video(&self, nth: usize) -> Result<Stream> {
        self.nth_of_type(AvMediaType::Video, nth)
    }

    /// The `nth` audio stream (0 for the first).
    pub fn audio(&self, nth: usize) -> Result<Stream> {
        self.nth_of_type(AvMediaType::Audio, nth)
    }

    /// The stream libavformat considers the best of the given media type.
    pub fn find_best_stream(&self, media_type: AvMediaType) -> Result<Stream> {
        Ok(Stream::from_av(
            &self
                .input()?
                .streams()
                .best(media_type)
                .ok_or(AvError::StreamNotFound)?,
        ))
    }

    /// Find the best video stream and return its index.
    pub fn best_video_stream_index(&self) -> Result<usize> {
        Ok(self.find_best_stream(AvMediaType::Video)?.index())
    }

    /// Find the best audio stream and return its index.
    pub fn best_audio_stream_index(&self) -> Result<usize> {
        Ok(self.find_best_stream(AvMediaType::Audio)?.index())
    }

    /// Container duration, when known.
    pub fn duration(&self) -> Result<Time> {
        let duration = self.input()?.duration();
        Ok(Time::new(
            (duration != ffmpeg::ffi::AV_NOPTS_VALUE).then_some(duration),
            ffmpeg::ffi::AV_TIME_BASE_Q.into(),
        ))
    }

    /// Container-level metadata tags.
    pub fn metadata(&self) -> Result<std::collections::HashMap<String, String>> {
        Ok(self
            .input()?
            .metadata()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect())
    }

    /// Lazy sequence of packets, optionally filtered to one stream.
    ///
    /// The sequence is finite and not restartable. Each yielded packet is
    /// independently owned by the consumer. A read error is yielded once and
    /// ends the sequence; end of input ends the sequence without an error.
    pub fn packets(&mut self, stream_index: Option<usize>) -> Result<Packets<'_>> {
        if self.input.is_none() {
            return Err(Error::InvalidState("packets() on closed input"));
        }
        Ok(Packets {
            input: self,
            stream_index,
            done: false,
        })
    }

    /// Read the next packet, optionally skipping other streams. `None` marks
    /// the end of the input.
    pub(crate) fn next_packet(&mut self, stream_index: Option<usize>) -> Result<Option<Packet>> {
        let input = self
            .input
            .as_mut()
            .ok_or(Error::InvalidState("read on closed input"))?;
        loop {
            let mut packet = AvPacket::empty();
            match packet.read(input) {
                Ok(()) => {
                    let index = packet.stream();
                    if let Some(wanted) = stream_index {
                        if index != wanted {
                            continue;
                        }
                    }
                    let time_base = match input.stream(index) {
                        Some(stream) => stream.time_base(),
                        None => continue,
                    };
                    return Ok(Some(Packet::new(packet, time_base)));
                }
                Err(AvError::Eof) => return Ok(None),
                Err(AvError::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                    continue;
                }
                Err(err) => return Err(Error::ReadFailed(err)),
            }
        }
    }

    /// Seek to the given position in seconds.
    ///
    /// * `stream_index` - Interpret the position in this stream's time base;
    ///   container time base when `None`.
    pub fn seek(&mut self, seconds: f64, stream_index: Option<usize>) -> Result<()> {
        self.seek_with_flags(
            seconds,
            stream_index,
            SeekFlags {
                backward: true,
                ..SeekFlags::default()
            },
        )
    }

    /// Seek with explicit flags.
    pub fn seek_with_flags(
        &mut self,
        seconds: f64,
        stream_index: Option<usize>,
        flags: SeekFlags,
    ) -> Result<()> {
        let input = self
            .input
            .as_mut()
            .ok_or(Error::InvalidState("seek on closed input"))?;

        let time_base: AvRational = match stream_index {
            Some(index) => input
                .stream(index)
                .ok_or(AvError::StreamNotFound)?
                .time_base(),
            None => ffmpeg::ffi::AV_TIME_BASE_Q.into(),
        };
        let timestamp = (seconds * time_base.denominator() as f64
            / time_base.numerator().max(1) as f64)
            .round() as i64;

        ffi::seek_input(input, stream_index, timestamp, flags.to_av()).map_err(Error::SeekFailed)
    }

    /// Best effort seek back to the start of the input.
    pub fn seek_to_start(&mut self) -> Result<()> {
        let input = self
            .input
            .as_mut()
            .ok_or(Error::InvalidState("seek on closed input"))?;
        ffi::seek_input(
            input,
            None,
            i64::MIN,
            ffmpeg::ffi::AVSEEK_FLAG_BACKWARD as std::ffi::c_int,
        )
        .map_err(Error::SeekFailed)
    }

    /// Close the input and release the format context and any I/O context.
    /// Idempotent.
    pub fn close(&mut self) {
        self.input.take();
        self.io.take();
    }

    fn input(&self) -> Result<&AvInput> {
        self.input
            .as_ref()
            .ok_or(Error::InvalidState("operation on closed input"))
    }

    fn nth_of_type(&self, media_type: AvMediaType, nth: usize) -> Result<Stream> {
        self.input()?
            .streams()
            .filter(|stream| stream.parameters().medium() == media_type)
            .nth(nth)
            .map(|stream| Stream::from_av(&stream))
            .ok_or(Error::BackendError(AvError::StreamNotFound))
    }
}

unsafe impl Send for MediaInput {}

/// Lazy packet sequence produced by [`MediaInput::packets`].
pub struct Packets<'a> {
    input: &'a mut MediaInput,
    stream_index: Option<usize>,
    done: bool,
}

impl Iterator for Packets<'_> {
    type Item = Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.input.next_packet(self.stream_index) {
            Ok(Some(packet)) => Some(Ok(packet)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                // Surface the read error once, then fuse the sequence.
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_file_is_source_unavailable() {
        crate::init().unwrap();
        let result = MediaInput::open(std::path::Path::new("/definitely/not/here.mp4"));
        assert!(matches!(
            result.err().unwrap(),
            Error::SourceUnavailable(_) | Error::FormatNotRecognized
        ));
    }

    #[test]
    fn probe_unrecognized_buffer_is_none() {
        crate::init().unwrap();
        let noise = vec![0u8; 256];
        assert!(MediaInput::probe_format(noise).unwrap().is_none());
    }

    #[test]
    fn probe_rejects_callback_sources() {
        crate::init().unwrap();
        let source = Source::Callbacks(Box::new(Cursor::new(Vec::new())));
        assert!(matches!(
            MediaInput::probe_format(source),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn pcm_demuxer_names() {
        assert_eq!(
            pcm_demuxer_name(AvSample::I16(sample::Type::Packed)),
            Some("s16le")
        );
        assert_eq!(pcm_demuxer_name(AvSample::I16(sample::Type::Planar)), None);
    }
}
