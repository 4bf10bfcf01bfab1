extern crate ffmpeg_next as ffmpeg;

use ffmpeg::filter as avfilter;
use ffmpeg::media::Type as AvMediaType;
use ffmpeg::util::error::EAGAIN;
use ffmpeg::util::frame::Audio as AvAudioFrame;
use ffmpeg::util::frame::Video as AvVideoFrame;
use ffmpeg::Error as AvError;

use crate::error::Error;
use crate::ffi;
use crate::ffi_hwaccel;
use crate::frame::Frame;
use crate::hwaccel::HardwareContext;
use crate::stream::StreamInfo;

type Result<T> = std::result::Result<T, Error>;

const SOURCE_NAME: &str = "in";
const SINK_NAME: &str = "out";

/// `AVFILTER_CMD_FLAG_*` from `avfilter.h`; redefined here because the
/// generated bindings expose them with a platform-dependent integer type.
const CMD_FLAG_ONE: std::ffi::c_int = 1;
const CMD_FLAG_FAST: std::ffi::c_int = 2;

/// Flags modifying [`Filter::send_command_with_flags`] and
/// [`Filter::queue_command_with_flags`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CommandFlags {
    /// Stop at the first filter instance that supports the command instead
    /// of sending it to every match.
    pub one: bool,
    /// Only execute the command when it is cheap to do so.
    pub fast: bool,
}

impl CommandFlags {
    fn to_av(self) -> std::ffi::c_int {
        let mut flags = 0;
        if self.one {
            flags |= CMD_FLAG_ONE;
        }
        if self.fast {
            flags |= CMD_FLAG_FAST;
        }
        flags
    }
}

/// Builds a [`Filter`].
pub struct FilterBuilder<'a> {
    description: String,
    info: StreamInfo,
    hardware: Option<&'a HardwareContext>,
    threads: Option<usize>,
}

impl<'a> FilterBuilder<'a> {
    /// Create a filter builder from a libavfilter graph description and the
    /// stream info describing its input.
    ///
    /// The description uses libavfilter's standard grammar and is passed
    /// through opaque, e.g. `"scale=640:360,fps=15"`.
    pub fn new(description: &str, info: StreamInfo) -> Self {
        Self {
            description: description.to_string(),
            info,
            hardware: None,
            threads: None,
        }
    }

    /// Let hardware filters in the graph use the given device.
    pub fn with_hardware(mut self, hardware: &'a HardwareContext) -> Self {
        self.hardware = Some(hardware);
        self
    }

    /// Number of graph threads (0 selects automatically).
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Build the [`Filter`].
    ///
    /// Audio graphs are configured eagerly and fail here on bad
    /// descriptions; video graphs defer configuration to the first frame so
    /// a hardware frames context can be bound first.
    pub fn build(self) -> Result<Filter> {
        crate::init()?;
        let media_type = self.info.media_type();
        let mut graph = avfilter::Graph::new();
        if let Some(threads) = self.threads {
            ffi::graph_set_threads(&mut graph, threads);
        }

        match media_type {
            AvMediaType::Video => {
                let info = self.info.video_info().expect("video stream info");
                let time_base = self.info.time_base();
                let mut args = format!(
                    "video_size={}x{}:pix_fmt={}:time_base={}/{}:pixel_aspect={}/{}",
                    info.width,
                    info.height,
                    ffmpeg::ffi::AVPixelFormat::from(info.pixel_format) as i32,
                    time_base.numerator(),
                    time_base.denominator(),
                    info.sample_aspect_ratio.numerator().max(0),
                    info.sample_aspect_ratio.denominator().max(1),
                );
                if info.frame_rate.numerator() > 0 {
                    args.push_str(&format!(
                        ":frame_rate={}/{}",
                        info.frame_rate.numerator(),
                        info.frame_rate.denominator()
                    ));
                }

                let buffer =
                    avfilter::find("buffer").ok_or(Error::FilterConfigFailed(AvError::Unknown))?;
                let buffersink = avfilter::find("buffersink")
                    .ok_or(Error::FilterConfigFailed(AvError::Unknown))?;
                graph
                    .add(&buffer, SOURCE_NAME, &args)
                    .map_err(Error::FilterConfigFailed)?;
                graph
                    .add(&buffersink, SINK_NAME, "")
                    .map_err(Error::FilterConfigFailed)?;
            }
            AvMediaType::Audio => {
                let info = self.info.audio_info().expect("audio stream info");
                let time_base = self.info.time_base();
                let args = format!(
                    "time_base={}/{}:sample_rate={}:sample_fmt={}:channel_layout={}c",
                    time_base.numerator(),
                    time_base.denominator(),
                    info.sample_rate,
                    ffmpeg::ffi::AVSampleFormat::from(info.sample_format) as i32,
                    info.channel_layout.channels(),
                );

                let abuffer =
                    avfilter::find("abuffer").ok_or(Error::FilterConfigFailed(AvError::Unknown))?;
                let abuffersink = avfilter::find("abuffersink")
                    .ok_or(Error::FilterConfigFailed(AvError::Unknown))?;
                graph
                    .add(&abuffer, SOURCE_NAME, &args)
                    .map_err(Error::FilterConfigFailed)?;
                graph
                    .add(&abuffersink, SINK_NAME, "")
                    .map_err(Error::FilterConfigFailed)?;
            }
            other => {
                return Err(Error::InvalidArgument(format!(
                    "cannot filter {other:?} streams"
                )))
            }
        }

        graph
            .output(SOURCE_NAME, 0)
            .and_then(|parser| parser.input(SINK_NAME, 0))
            .and_then(|parser| parser.parse(&self.description))
            .map_err(Error::FilterConfigFailed)?;

        let hw_device = match self.hardware {
            Some(hardware) => unsafe { hardware.device().ref_raw() },
            None => std::ptr::null_mut(),
        };

        let mut filter = Filter {
            graph: Some(graph),
            description: self.description,
            info: self.info,
            media_type,
            hw_device,
            ready: false,
            flushing: false,
            drained: false,
        };

        // Audio graphs have nothing to wait for; configure eagerly.
        if media_type == AvMediaType::Audio {
            filter.configure(None)?;
        }

        Ok(filter)
    }
}

/// One libavfilter graph with a single buffer source and buffer sink.
///
/// Frames go in through [`Filter::process`] and come out of the same call or
/// [`Filter::receive`]. For video the graph is configured lazily on the
/// first frame, because a hardware frames context may need to be bound
/// before format negotiation.
///
/// # Example
///
/// ```ignore
/// let mut filter = Filter::new("scale=640:360,fps=15", decoder.output_stream_info()?)?;
/// for frame in filter.frames(decoder.frames(input.packets(None)?)) {
///     let frame = frame?;
/// }
/// ```
pub struct Filter {
    graph: Option<avfilter::Graph>,
    description: String,
    info: StreamInfo,
    media_type: AvMediaType,
    /// Device reference for hardware filters; null when none was given.
    hw_device: *mut ffmpeg::ffi::AVBufferRef,
    ready: bool,
    flushing: bool,
    drained: bool,
}

impl Filter {
    /// Create a filter with default options.
    #[inline]
    pub fn new(description: &str, info: StreamInfo) -> Result<Self> {
        FilterBuilder::new(description, info).build()
    }

    /// Push one frame into the graph and poll the sink once.
    ///
    /// `None` means the graph either needs more input or holds more output
    /// already; use [`Filter::receive`] to drain multi-frame bursts (e.g.
    /// from rate-changing filters).
    pub fn process(&mut self, frame: &Frame) -> Result<Option<Frame>> {
        if self.flushing {
            return Err(Error::InvalidState("process after flush"));
        }
        if !self.ready {
            self.configure(Some(frame))?;
        }

        let graph = self.graph_mut()?;
        graph
            .get(SOURCE_NAME)
            .ok_or(Error::InvalidState("filter graph lost its source"))?
            .source()
            .add(frame.as_ref())
            .map_err(Error::FilterFailed)?;

        self.receive()
    }

    /// Poll the sink without pushing new input. `None` means no output is
    /// buffered right now.
    pub fn receive(&mut self) -> Result<Option<Frame>> {
        if !self.ready {
            return Ok(None);
        }
        let media_type = self.media_type;
        let graph = self.graph_mut()?;
        let mut sink = graph
            .get(SINK_NAME)
            .ok_or(Error::InvalidState("filter graph lost its sink"))?;
        let mut sink = sink.sink();

        let result = match media_type {
            AvMediaType::Video => {
                let mut frame = AvVideoFrame::empty();
                sink.frame(&mut frame).map(|()| Frame::Video(frame))
            }
            _ => {
                let mut frame = AvAudioFrame::empty();
                sink.frame(&mut frame).map(|()| Frame::Audio(frame))
            }
        };

        match result {
            Ok(frame) => Ok(Some(frame)),
            Err(AvError::Other { errno }) if errno == EAGAIN => Ok(None),
            Err(AvError::Eof) => {
                self.drained = true;
                Ok(None)
            }
            Err(err) => Err(Error::FilterFailed(err)),
        }
    }

    /// Push all frames, then fully drain the sink.
    pub fn process_multiple(&mut self, frames: &[Frame]) -> Result<Vec<Frame>> {
        let mut output = Vec::new();
        for frame in frames {
            if let Some(filtered) = self.process(frame)? {
                output.push(filtered);
            }
        }
        while let Some(filtered) = self.receive()? {
            output.push(filtered);
        }
        Ok(output)
    }

    /// Push end-of-stream into the buffer source. Buffered output keeps
    /// coming out of [`Filter::receive`] until it returns `None`.
    pub fn flush(&mut self) -> Result<()> {
        if self.flushing {
            return Ok(());
        }
        if !self.ready {
            // Flushing an unconfigured video graph: configure without a
            // hardware context so the graph can produce its (empty) output.
            self.configure(None)?;
        }
        self.flushing = true;

        let graph = self.graph_mut()?;
        graph
            .get(SOURCE_NAME)
            .ok_or(Error::InvalidState("filter graph lost its source"))?
            .source()
            .flush()
            .map_err(Error::FilterFailed)
    }

    /// Lazy sequence draining all buffered frames after a flush.
    pub fn flush_frames(&mut self) -> impl Iterator<Item = Result<Frame>> + '_ {
        std::iter::from_fn(move || {
            if !self.flushing {
                if let Err(err) = self.flush() {
                    return Some(Err(err));
                }
            }
            if self.drained {
                return None;
            }
            self.receive().transpose()
        })
    }

    /// Lazy sequence filtering an entire frame sequence, flush included.
    pub fn frames<I>(&mut self, frames: I) -> Frames<'_, I>
    where
        I: Iterator<Item = Result<Frame>>,
    {
        Frames {
            filter: self,
            frames: Some(frames),
        }
    }

    /// Send a command to a filter instance (`target` may be a filter name or
    /// `"all"`) and return the filter's response.
    pub fn send_command(&mut self, target: &str, command: &str, argument: &str) -> Result<String> {
        self.send_command_with_flags(target, command, argument, CommandFlags::default())
    }

    /// Send a command with explicit flags.
    pub fn send_command_with_flags(
        &mut self,
        target: &str,
        command: &str,
        argument: &str,
        flags: CommandFlags,
    ) -> Result<String> {
        let graph = self.graph_mut()?;
        ffi::graph_send_command(graph, target, command, argument, flags.to_av())
            .map_err(Error::FilterFailed)
    }

    /// Schedule a command to be applied at media timestamp `ts` (seconds).
    pub fn queue_command(
        &mut self,
        target: &str,
        command: &str,
        argument: &str,
        ts: f64,
    ) -> Result<()> {
        self.queue_command_with_flags(target, command, argument, ts, CommandFlags::default())
    }

    /// Schedule a command with explicit flags.
    pub fn queue_command_with_flags(
        &mut self,
        target: &str,
        command: &str,
        argument: &str,
        ts: f64,
        flags: CommandFlags,
    ) -> Result<()> {
        let graph = self.graph_mut()?;
        ffi::graph_queue_command(graph, target, command, argument, ts, flags.to_av())
            .map_err(Error::FilterFailed)
    }

    /// Stream info describing the graph's negotiated output. Available once
    /// the graph is configured.
    ///
    /// The channel layout of audio output is assumed unchanged from the
    /// input description.
    pub fn output_stream_info(&mut self) -> Result<StreamInfo> {
        if !self.ready {
            return Err(Error::InvalidState(
                "filter output is unknown before configuration",
            ));
        }
        let media_type = self.media_type;
        let input_channel_layout = self.info.audio_info().map(|info| info.channel_layout.clone());
        let graph = self.graph_mut()?;
        let mut sink = graph
            .get(SINK_NAME)
            .ok_or(Error::InvalidState("filter graph lost its sink"))?;

        Ok(match media_type {
            AvMediaType::Video => StreamInfo::video(
                ffi::buffersink_width(&mut sink),
                ffi::buffersink_height(&mut sink),
                raw_pixel_format(ffi::buffersink_format(&mut sink)),
                ffi::buffersink_frame_rate(&mut sink),
                ffi::buffersink_time_base(&mut sink),
            ),
            _ => StreamInfo::audio(
                ffi::buffersink_sample_rate(&mut sink),
                raw_sample_format(ffi::buffersink_format(&mut sink)),
                input_channel_layout.expect("audio stream info"),
                ffi::buffersink_time_base(&mut sink),
            ),
        })
    }

    /// Media type this filter processes.
    pub fn media_type(&self) -> AvMediaType {
        self.media_type
    }

    /// The graph description this filter was built from.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Whether the graph has been fully configured.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Release the filter graph. Idempotent.
    pub fn free(&mut self) {
        self.graph.take();
    }

    /// Configure the graph. For video this happens on the first frame so a
    /// hardware frames context can be bound to the buffer source first.
    fn configure(&mut self, first_frame: Option<&Frame>) -> Result<()> {
        let hw_device = self.hw_device;
        let graph = self
            .graph
            .as_mut()
            .ok_or(Error::InvalidState("operation on freed filter"))?;

        if let Some(frame) = first_frame {
            let frames_ref = frame.hw_frames_ctx();
            if !frames_ref.is_null() {
                let mut source = graph
                    .get(SOURCE_NAME)
                    .ok_or(Error::InvalidState("filter graph lost its source"))?;
                ffi_hwaccel::buffersrc_set_hw_frames_ctx(&mut source, frames_ref)
                    .map_err(Error::FilterConfigFailed)?;
            }
        }
        if !hw_device.is_null() {
            ffi_hwaccel::graph_propagate_hw_device_ctx(graph, hw_device);
        }

        graph.validate().map_err(Error::FilterConfigFailed)?;
        tracing::debug!(target: "media", "configured filter graph: {}", self.description);
        self.ready = true;
        Ok(())
    }

    fn graph_mut(&mut self) -> Result<&mut avfilter::Graph> {
        self.graph
            .as_mut()
            .ok_or(Error::InvalidState("operation on freed filter"))
    }
}

impl Drop for Filter {
    fn drop(&mut self) {
        self.graph.take();
        if !self.hw_device.is_null() {
            unsafe {
                ffmpeg::ffi::av_buffer_unref(&mut self.hw_device);
            }
        }
    }
}

unsafe impl Send for Filter {}

fn raw_pixel_format(format: std::ffi::c_int) -> ffmpeg::util::format::Pixel {
    let raw: ffmpeg::ffi::AVPixelFormat = unsafe { std::mem::transmute(format) };
    raw.into()
}

fn raw_sample_format(format: std::ffi::c_int) -> ffmpeg::util::format::Sample {
    let raw: ffmpeg::ffi::AVSampleFormat = unsafe { std::mem::transmute(format) };
    raw.into()
}

/// Lazy frame sequence produced by [`Filter::frames`].
pub struct Frames<'a, I> {
    filter: &'a mut Filter,
    frames: Option<I>,
}

impl<I> Iterator for Frames<'_, I>
where
    I: Iterator<Item = Result<Frame>>,
{
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        // Drain buffered output first so rate-increasing filters do not
        // lose frames between inputs.
        if self.filter.ready {
            match self.filter.receive() {
                Ok(Some(frame)) => return Some(Ok(frame)),
                Ok(None) => {}
                Err(err) => return Some(Err(err)),
            }
        }

        while let Some(frames) = self.frames.as_mut() {
            match frames.next() {
                Some(Ok(frame)) => match self.filter.process(&frame) {
                    Ok(Some(filtered)) => return Some(Ok(filtered)),
                    Ok(None) => continue,
                    Err(err) => return Some(Err(err)),
                },
                Some(Err(err)) => return Some(Err(err)),
                None => {
                    self.frames = None;
                    if let Err(err) = self.filter.flush() {
                        return Some(Err(err));
                    }
                }
            }
        }

        if self.filter.drained {
            return None;
        }
        match self.filter.receive() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffmpeg::util::format::Sample as AvSample;
    use ffmpeg::ChannelLayout;
    use ffmpeg::Rational as AvRational;

    fn audio_info() -> StreamInfo {
        StreamInfo::audio(
            44_100,
            AvSample::I16(ffmpeg::util::format::sample::Type::Packed),
            ChannelLayout::MONO,
            AvRational::new(1, 44_100),
        )
    }

    fn video_info() -> StreamInfo {
        StreamInfo::video(
            1280,
            720,
            ffmpeg::util::format::Pixel::YUV420P,
            AvRational::new(30, 1),
            AvRational::new(1, 15360),
        )
    }

    #[test]
    fn audio_graph_configures_eagerly() {
        crate::init().unwrap();
        let filter = Filter::new("anull", audio_info()).unwrap();
        assert!(filter.is_ready());
        assert_eq!(filter.media_type(), AvMediaType::Audio);
    }

    #[test]
    fn audio_graph_rejects_garbage_descriptions() {
        crate::init().unwrap();
        assert!(matches!(
            Filter::new("definitely/not=a~filter", audio_info()),
            Err(Error::FilterConfigFailed(_))
        ));
    }

    #[test]
    fn video_graph_defers_configuration() {
        crate::init().unwrap();
        let filter = Filter::new("scale=640:360", video_info()).unwrap();
        assert!(!filter.is_ready(), "video graphs configure on first frame");
    }

    #[test]
    fn video_scale_process_and_output_info() {
        crate::init().unwrap();
        let mut filter = Filter::new("scale=640:360", video_info()).unwrap();

        let mut produced = Vec::new();
        for index in 0..3 {
            let mut frame =
                ffmpeg::frame::Video::new(ffmpeg::util::format::Pixel::YUV420P, 1280, 720);
            for plane in 0..frame.planes() {
                frame.data_mut(plane).fill(if plane == 0 { 64 } else { 128 });
            }
            frame.set_pts(Some(index));
            if let Some(filtered) = filter.process(&Frame::Video(frame)).unwrap() {
                produced.push(filtered);
            }
        }
        filter.flush().unwrap();
        while let Some(filtered) = filter.receive().unwrap() {
            produced.push(filtered);
        }

        assert_eq!(produced.len(), 3);
        for frame in &produced {
            let video = frame.video().unwrap();
            assert_eq!((video.width(), video.height()), (640, 360));
        }

        let info = filter.output_stream_info().unwrap();
        let video = info.video_info().unwrap();
        assert_eq!((video.width, video.height), (640, 360));
    }

    #[test]
    fn commands_reach_filter_instances() {
        crate::init().unwrap();
        let mut filter = Filter::new("volume=1.0", audio_info()).unwrap();
        // The volume filter supports runtime "volume" commands.
        assert!(filter.send_command("all", "volume", "0.5").is_ok());
        assert!(filter
            .send_command_with_flags(
                "all",
                "volume",
                "0.25",
                CommandFlags {
                    one: true,
                    ..CommandFlags::default()
                },
            )
            .is_ok());
    }

    #[test]
    fn process_after_free_fails() {
        crate::init().unwrap();
        let mut filter = Filter::new("anull", audio_info()).unwrap();
        filter.free();
        assert!(matches!(filter.receive(), Err(Error::InvalidState(_))));
    }
}
