extern crate ffmpeg_next as ffmpeg;

use ffmpeg::format::context::Output as AvOutput;
use ffmpeg::format::flag::Flags as AvFormatFlags;
use ffmpeg::Rational as AvRational;

use crate::encode::Encoder;
use crate::error::Error;
use crate::ffi;
use crate::io::MediaWrite;
use crate::location::Location;
use crate::options::Options;
use crate::packet::Packet;
use crate::stream::Stream;

type Result<T> = std::result::Result<T, Error>;

/// Default I/O buffer size for callback sinks.
const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Where a [`MediaOutput`] writes to.
pub enum Destination {
    /// A file path or network URL, handed to libavformat as-is.
    Location(Location),
    /// A caller-provided write/seek implementation.
    Callbacks(Box<dyn MediaWrite>),
}

impl From<Location> for Destination {
    fn from(value: Location) -> Destination {
        Destination::Location(value)
    }
}

impl From<&std::path::Path> for Destination {
    fn from(value: &std::path::Path) -> Destination {
        Destination::Location(value.into())
    }
}

impl From<std::path::PathBuf> for Destination {
    fn from(value: std::path::PathBuf) -> Destination {
        Destination::Location(value.into())
    }
}

impl From<crate::location::Url> for Destination {
    fn from(value: crate::location::Url) -> Destination {
        Destination::Location(value.into())
    }
}

impl From<&str> for Destination {
    fn from(value: &str) -> Destination {
        Destination::Location(value.into())
    }
}

/// Muxer state. Transitions are monotone; `close` is reachable from
/// everywhere.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Configuring,
    HeaderWritten,
    TrailerWritten,
    Closed,
}

/// Builds a [`MediaOutput`].
pub struct MediaOutputBuilder {
    destination: Destination,
    format: Option<String>,
    options: Options,
    buffer_size: usize,
}

impl MediaOutputBuilder {
    /// Create a builder for the given destination.
    pub fn new(destination: impl Into<Destination>) -> Self {
        Self {
            destination: destination.into(),
            format: None,
            options: Options::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Container format name. Inferred from the path extension when omitted;
    /// required for callback sinks.
    pub fn with_format(mut self, format: &str) -> Self {
        self.format = Some(format.to_string());
        self
    }

    /// Muxer options, applied when the header is written.
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// I/O buffer size for callback sinks.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Build the [`MediaOutput`].
    pub fn build(self) -> Result<MediaOutput> {
        crate::init()?;
        let (output, io) = match self.destination {
            Destination::Location(location) => {
                let output = match self.format.as_deref() {
                    None => ffmpeg::format::output(&location.as_path()),
                    Some(format) => ffmpeg::format::output_as(&location.as_path(), format),
                }
                .map_err(Error::SourceUnavailable)?;
                (output, None)
            }
            Destination::Callbacks(sink) => {
                let format = self.format.as_deref().ok_or_else(|| {
                    Error::InvalidArgument(
                        "callback sinks require an explicit output format".to_string(),
                    )
                })?;
                let io = ffi::AvioWriter::new(sink, self.buffer_size)
                    .map_err(Error::SourceUnavailable)?;
                let output = ffi::open_output_with_avio(format, io.as_ptr())
                    .map_err(Error::SourceUnavailable)?;
                (output, Some(io))
            }
        };

        Ok(MediaOutput {
            output: Some(output),
            io,
            options: self.options,
            state: State::Configuring,
            failed: false,
            wrote_trailer: false,
        })
    }
}

/// Muxer over a media sink.
///
/// Streams are added while configuring, then the header is written, packets
/// are written, and finally the trailer. [`MediaOutput::close`] is idempotent
/// and finishes the trailer when a header exists without one.
///
/// # Example
///
/// ```ignore
/// let mut output = MediaOutput::open(Path::new("out.mkv"))?;
/// let index = output.add_stream_copy(&input.video(0)?)?;
/// output.write_header()?;
/// for packet in input.packets(None)? {
///     output.write_packet(packet?, index)?;
/// }
/// output.write_trailer()?;
/// ```
pub struct MediaOutput {
    // Declared before `io` so the format context drops before the custom
    // I/O context it borrows.
    output: Option<AvOutput>,
    io: Option<ffi::AvioWriter>,
    options: Options,
    state: State,
    failed: bool,
    wrote_trailer: bool,
}

impl MediaOutput {
    /// Open the given destination with default options.
    #[inline]
    pub fn open(destination: impl Into<Destination>) -> Result<Self> {
        MediaOutputBuilder::new(destination).build()
    }

    /// Whether the container format wants codecs to use global headers.
    /// Encoders feeding this output should request global headers before
    /// they open.
    pub fn needs_global_header(&self) -> Result<bool> {
        Ok(self
            .output()?
            .format()
            .flags()
            .contains(AvFormatFlags::GLOBAL_HEADER))
    }

    /// Add an output stream configured from an opened encoder. The stream
    /// copies the encoder's codec parameters; packets from that encoder are
    /// rescaled from their carried time base on write.
    ///
    /// Fails with `InvalidState` after the header has been written or when
    /// the encoder has not opened yet.
    pub fn add_stream_from_encoder(&mut self, encoder: &Encoder) -> Result<usize> {
        self.add_stream_from_encoder_with(encoder, None)
    }

    /// Like [`MediaOutput::add_stream_from_encoder`] with an explicit stream
    /// time base instead of the encoder's.
    pub fn add_stream_from_encoder_with(
        &mut self,
        encoder: &Encoder,
        time_base: Option<AvRational>,
    ) -> Result<usize> {
        self.expect_state(State::Configuring, "add_stream after write_header")?;
        let parameters = encoder.parameters()?;
        let time_base = time_base.unwrap_or(encoder.time_base()?);

        let output = self.output_mut()?;
        let mut stream = output
            .add_stream(Some(encoder.codec()))
            .map_err(Error::BackendError)?;
        stream.set_parameters(parameters);
        stream.set_time_base(time_base);
        Ok(stream.index())
    }

    /// Add an output stream that copies an input stream's codec parameters
    /// (remux, no transcoding). The codec tag is cleared since it may not be
    /// valid in the target container.
    pub fn add_stream_copy(&mut self, source: &Stream) -> Result<usize> {
        self.add_stream_copy_with(source, None)
    }

    /// Like [`MediaOutput::add_stream_copy`] with an explicit stream time
    /// base instead of the source stream's.
    pub fn add_stream_copy_with(
        &mut self,
        source: &Stream,
        time_base: Option<AvRational>,
    ) -> Result<usize> {
        self.expect_state(State::Configuring, "add_stream after write_header")?;
        let time_base = time_base.unwrap_or(source.time_base());

        let output = self.output_mut()?;
        let mut stream = output
            .add_stream(ffmpeg::encoder::find(source.parameters().id()))
            .map_err(Error::BackendError)?;
        stream.set_parameters(source.parameters().clone());
        stream.set_time_base(time_base);
        ffi::stream_clear_codec_tag(&mut stream);
        Ok(stream.index())
    }

    /// Add an output stream that carries a bitstream filter's output: the
    /// filter's output codec parameters and time base instead of the
    /// original stream's.
    pub fn add_stream_from_bitstream_filter(
        &mut self,
        bsf: &crate::bsf::BitstreamFilter,
    ) -> Result<usize> {
        self.expect_state(State::Configuring, "add_stream after write_header")?;
        let parameters = bsf.output_codec_parameters()?;
        let time_base = bsf.output_time_base();

        let output = self.output_mut()?;
        let mut stream = output
            .add_stream(ffmpeg::encoder::find(parameters.id()))
            .map_err(Error::BackendError)?;
        stream.set_parameters(parameters);
        stream.set_time_base(time_base);
        ffi::stream_clear_codec_tag(&mut stream);
        Ok(stream.index())
    }

    /// Number of output streams added so far.
    pub fn stream_count(&self) -> Result<usize> {
        Ok(self.output()?.streams().count())
    }

    /// Write the container header. Valid once, after at least one stream was
    /// added.
    pub fn write_header(&mut self) -> Result<()> {
        self.expect_state(State::Configuring, "write_header written twice")?;
        if self.stream_count()? == 0 {
            return Err(Error::InvalidArgument(
                "write_header requires at least one stream".to_string(),
            ));
        }

        let options = self.options.to_dict();
        self.output_mut()?
            .write_header_with(options)
            .map_err(Error::WriteFailed)?;
        self.state = State::HeaderWritten;
        Ok(())
    }

    /// Write one packet to the stream with the given index.
    ///
    /// The packet's timestamps are rescaled from its carried time base to
    /// the output stream's time base and handed to the interleaved writer.
    pub fn write_packet(&mut self, packet: Packet, stream_index: usize) -> Result<()> {
        if self.failed {
            return Err(Error::InvalidState("write_packet after write error"));
        }
        self.expect_state(State::HeaderWritten, "write_packet before write_header")?;

        let output = self.output_mut()?;
        let stream_time_base = output
            .stream(stream_index)
            .ok_or_else(|| {
                Error::InvalidArgument(format!("no output stream with index {stream_index}"))
            })?
            .time_base();

        let (mut packet, source_time_base) = packet.into_inner_parts();
        packet.set_stream(stream_index);
        packet.set_position(-1);
        packet.rescale_ts(source_time_base, stream_time_base);

        match packet.write_interleaved(output) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.failed = true;
                Err(Error::WriteFailed(err))
            }
        }
    }

    /// Write the container trailer. Valid once, after the header.
    pub fn write_trailer(&mut self) -> Result<()> {
        self.expect_state(State::HeaderWritten, "write_trailer before write_header")?;
        self.output_mut()?
            .write_trailer()
            .map_err(Error::WriteFailed)?;
        self.state = State::TrailerWritten;
        self.wrote_trailer = true;
        Ok(())
    }

    /// Whether the trailer has been written.
    pub fn trailer_written(&self) -> bool {
        self.wrote_trailer
    }

    /// Flush the trailer if the header was written without one, then release
    /// the format context and any I/O context. Idempotent.
    pub fn close(&mut self) {
        if self.state == State::HeaderWritten && !self.failed {
            if let Some(output) = self.output.as_mut() {
                match output.write_trailer() {
                    Ok(()) => self.wrote_trailer = true,
                    Err(err) => {
                        tracing::warn!(target: "media", "failed to write trailer on close: {err}");
                    }
                }
            }
            self.state = State::TrailerWritten;
        }
        self.abort();
    }

    /// Release the format context and any I/O context without attempting to
    /// write a trailer. Error paths use this so a failed run never leaves a
    /// finalized-looking file behind. Idempotent.
    pub fn abort(&mut self) {
        self.state = State::Closed;
        if let Some(mut output) = self.output.take() {
            if self.io.is_some() {
                // Detach the custom I/O context so dropping the format
                // context does not try to close it; `io` owns it.
                ffi::take_pb(&mut output);
            }
            drop(output);
        }
        self.io.take();
    }

    fn expect_state(&self, expected: State, what: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState(what))
        }
    }

    fn output(&self) -> Result<&AvOutput> {
        self.output
            .as_ref()
            .ok_or(Error::InvalidState("operation on closed output"))
    }

    fn output_mut(&mut self) -> Result<&mut AvOutput> {
        self.output
            .as_mut()
            .ok_or(Error::InvalidState("operation on closed output"))
    }
}

impl Drop for MediaOutput {
    fn drop(&mut self) {
        self.close();
    }
}

unsafe impl Send for MediaOutput {}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_output(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("avpipe-mux-{}-{name}", std::process::id()))
    }

    #[test]
    fn header_requires_streams() {
        crate::init().unwrap();
        let path = temp_output("empty.mp4");
        let mut output = MediaOutput::open(path.as_path()).unwrap();
        assert!(matches!(
            output.write_header(),
            Err(Error::InvalidArgument(_))
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn trailer_requires_header() {
        crate::init().unwrap();
        let path = temp_output("trailer.mp4");
        let mut output = MediaOutput::open(path.as_path()).unwrap();
        assert!(matches!(
            output.write_trailer(),
            Err(Error::InvalidState(_))
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn close_is_idempotent() {
        crate::init().unwrap();
        let path = temp_output("close.mp4");
        let mut output = MediaOutput::open(path.as_path()).unwrap();
        output.close();
        output.close();
        assert!(matches!(
            output.write_header(),
            Err(Error::InvalidState(_))
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn callback_sink_requires_format() {
        crate::init().unwrap();
        let sink = Box::new(std::io::Cursor::new(Vec::new()));
        let result = MediaOutputBuilder::new(Destination::Callbacks(sink)).build();
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
