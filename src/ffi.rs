extern crate ffmpeg_next as ffmpeg;

use std::ffi::{CStr, CString};
use std::io::{Read, Seek, SeekFrom, Write};

use ffmpeg::codec::codec::Codec;
use ffmpeg::codec::context::Context;
use ffmpeg::filter::Graph;
use ffmpeg::format::context::{Input, Output};
use ffmpeg::util::frame::Frame;
use ffmpeg::{Dictionary, Error, Rational};

use ffmpeg::ffi::*;

use crate::io::{MediaRead, MediaWrite};

/// `AVSEEK_SIZE` and `AVSEEK_FORCE` from `avio.h`; redefined here because the
/// generated bindings expose them with a platform-dependent integer type.
const SEEK_SIZE: std::ffi::c_int = 0x10000;
const SEEK_FORCE: std::ffi::c_int = 0x20000;

/// `AVPROBE_PADDING_SIZE` from `avformat.h`.
const PROBE_PADDING: usize = 32;

/// Which phase of opening an input failed; lets the caller map open errors
/// and probe errors to different error kinds.
pub enum OpenInputError {
    /// `avformat_open_input` failed: source missing or format unreadable.
    Open(Error),
    /// `avformat_find_stream_info` failed: format recognized but stream
    /// parameters could not be probed.
    Probe(Error),
}

/// Open an input format context. This generalizes the bindings in
/// `ffmpeg-next` like `input` and `input_with_dictionary`: it optionally
/// forces an input format by name and optionally attaches a custom I/O
/// context, which the safe API cannot express.
///
/// On success the returned [`Input`] owns the format context. When `avio` is
/// given, `AVFMT_FLAG_CUSTOM_IO` is set so closing the input will not free
/// the I/O context; the caller stays responsible for it.
pub fn open_input(
    path: Option<&str>,
    format: Option<&str>,
    options: Dictionary,
    avio: Option<*mut AVIOContext>,
) -> Result<Input, OpenInputError> {
    let path = CString::new(path.unwrap_or_default())
        .map_err(|_| OpenInputError::Open(Error::InvalidData))?;

    let input_format = match format {
        Some(name) => {
            let name =
                CString::new(name).map_err(|_| OpenInputError::Open(Error::InvalidData))?;
            let format = unsafe { av_find_input_format(name.as_ptr()) };
            if format.is_null() {
                return Err(OpenInputError::Open(Error::DemuxerNotFound));
            }
            format
        }
        None => std::ptr::null(),
    };

    unsafe {
        let mut ps = avformat_alloc_context();
        if ps.is_null() {
            return Err(OpenInputError::Open(Error::Unknown));
        }
        if let Some(avio) = avio {
            (*ps).pb = avio;
            (*ps).flags |= AVFMT_FLAG_CUSTOM_IO as std::ffi::c_int;
        }

        let mut opts = options.disown();
        let open_result = avformat_open_input(&mut ps, path.as_ptr(), input_format, &mut opts);
        av_dict_free(&mut opts);
        // On open failure the context has already been freed by lavf.
        if open_result < 0 {
            return Err(OpenInputError::Open(Error::from(open_result)));
        }

        match avformat_find_stream_info(ps, std::ptr::null_mut()) {
            r if r >= 0 => Ok(Input::wrap(ps)),
            e => {
                avformat_close_input(&mut ps);
                Err(OpenInputError::Probe(Error::from(e)))
            }
        }
    }
}

/// Allocate an output format context with the given container format,
/// without a file attached, and install a custom I/O context on it.
pub fn open_output_with_avio(format: &str, avio: *mut AVIOContext) -> Result<Output, Error> {
    let format = CString::new(format).map_err(|_| Error::InvalidData)?;
    unsafe {
        let mut output_ptr = std::ptr::null_mut();
        match avformat_alloc_output_context2(
            &mut output_ptr,
            std::ptr::null_mut(),
            format.as_ptr(),
            std::ptr::null(),
        ) {
            0 => {
                (*output_ptr).pb = avio;
                (*output_ptr).flags |= AVFMT_FLAG_CUSTOM_IO as std::ffi::c_int;
                Ok(Output::wrap(output_ptr))
            }
            e => Err(Error::from(e)),
        }
    }
}

/// Detach the I/O context from an output context so that dropping the format
/// context will not attempt to close it. The caller keeps ownership of the
/// detached context.
pub fn take_pb(output: &mut Output) {
    unsafe {
        (*output.as_mut_ptr()).pb = std::ptr::null_mut();
    }
}

/// Read side of a custom I/O context. Owns the boxed source the callbacks
/// dispatch into; must outlive the format context it is attached to and be
/// dropped after it.
pub struct AvioReader {
    ctx: *mut AVIOContext,
    opaque: *mut ReadOpaque,
}

struct ReadOpaque {
    source: Box<dyn MediaRead>,
}

impl AvioReader {
    pub fn new(source: Box<dyn MediaRead>, buffer_size: usize) -> Result<Self, Error> {
        let opaque = Box::into_raw(Box::new(ReadOpaque { source }));
        unsafe {
            let buffer = av_malloc(buffer_size) as *mut u8;
            if buffer.is_null() {
                drop(Box::from_raw(opaque));
                return Err(Error::Unknown);
            }
            let ctx = avio_alloc_context(
                buffer,
                buffer_size as std::ffi::c_int,
                0,
                opaque as *mut std::ffi::c_void,
                Some(read_packet_callback),
                None,
                Some(seek_callback),
            );
            if ctx.is_null() {
                av_free(buffer as *mut std::ffi::c_void);
                drop(Box::from_raw(opaque));
                return Err(Error::Unknown);
            }
            Ok(Self { ctx, opaque })
        }
    }

    pub fn as_ptr(&self) -> *mut AVIOContext {
        self.ctx
    }
}

impl Drop for AvioReader {
    fn drop(&mut self) {
        unsafe {
            if !self.ctx.is_null() {
                // The buffer may have been reallocated by lavf; free whatever
                // the context points at now, then the context itself.
                av_free((*self.ctx).buffer as *mut std::ffi::c_void);
                avio_context_free(&mut self.ctx);
            }
            drop(Box::from_raw(self.opaque));
        }
    }
}

unsafe impl Send for AvioReader {}

/// Write side of a custom I/O context.
pub struct AvioWriter {
    ctx: *mut AVIOContext,
    opaque: *mut WriteOpaque,
}

struct WriteOpaque {
    sink: Box<dyn MediaWrite>,
}

impl AvioWriter {
    pub fn new(sink: Box<dyn MediaWrite>, buffer_size: usize) -> Result<Self, Error> {
        let opaque = Box::into_raw(Box::new(WriteOpaque { sink }));
        unsafe {
            let buffer = av_malloc(buffer_size) as *mut u8;
            if buffer.is_null() {
                drop(Box::from_raw(opaque));
                return Err(Error::Unknown);
            }
            let ctx = avio_alloc_context(
                buffer,
                buffer_size as std::ffi::c_int,
                1,
                opaque as *mut std::ffi::c_void,
                None,
                // XXX: Doing a manual transmute here to match the expected
                // callback function signature. It changed in ffmpeg 7 and we
                // don't know at compile time which version we're dealing
                // with; this converts to either the signature where the
                // buffer argument is `*const u8` or `*mut u8`.
                Some(std::mem::transmute::<*const (), _>(
                    write_packet_callback as _,
                )),
                Some(write_seek_callback),
            );
            if ctx.is_null() {
                av_free(buffer as *mut std::ffi::c_void);
                drop(Box::from_raw(opaque));
                return Err(Error::Unknown);
            }
            Ok(Self { ctx, opaque })
        }
    }

    pub fn as_ptr(&self) -> *mut AVIOContext {
        self.ctx
    }
}

impl Drop for AvioWriter {
    fn drop(&mut self) {
        unsafe {
            if !self.ctx.is_null() {
                avio_flush(self.ctx);
                av_free((*self.ctx).buffer as *mut std::ffi::c_void);
                avio_context_free(&mut self.ctx);
            }
            drop(Box::from_raw(self.opaque));
        }
    }
}

unsafe impl Send for AvioWriter {}

unsafe extern "C" fn read_packet_callback(
    opaque: *mut std::ffi::c_void,
    buf: *mut u8,
    buf_size: std::ffi::c_int,
) -> std::ffi::c_int {
    let this = &mut *(opaque as *mut ReadOpaque);
    let slice = std::slice::from_raw_parts_mut(buf, buf_size.max(0) as usize);
    match this.source.read(slice) {
        Ok(0) => AVERROR_EOF,
        Ok(n) => n as std::ffi::c_int,
        Err(_) => AVERROR_EXTERNAL,
    }
}

unsafe extern "C" fn write_packet_callback(
    opaque: *mut std::ffi::c_void,
    buf: *const u8,
    buf_size: std::ffi::c_int,
) -> std::ffi::c_int {
    let this = &mut *(opaque as *mut WriteOpaque);
    let slice = std::slice::from_raw_parts(buf, buf_size.max(0) as usize);
    match this.sink.write_all(slice) {
        Ok(()) => buf_size,
        Err(_) => AVERROR_EXTERNAL,
    }
}

unsafe extern "C" fn seek_callback(
    opaque: *mut std::ffi::c_void,
    offset: i64,
    whence: std::ffi::c_int,
) -> i64 {
    let this = &mut *(opaque as *mut ReadOpaque);
    seek_stream(&mut this.source, offset, whence)
}

unsafe extern "C" fn write_seek_callback(
    opaque: *mut std::ffi::c_void,
    offset: i64,
    whence: std::ffi::c_int,
) -> i64 {
    let this = &mut *(opaque as *mut WriteOpaque);
    seek_stream(&mut this.sink, offset, whence)
}

fn seek_stream<S: Seek + ?Sized>(
    stream: &mut Box<S>,
    offset: i64,
    whence: std::ffi::c_int,
) -> i64 {
    let whence = whence & !SEEK_FORCE;
    if whence == SEEK_SIZE {
        // Report total stream size: remember the position, hop to the end
        // and back.
        let result = (|| {
            let current = stream.stream_position()?;
            let size = stream.seek(SeekFrom::End(0))?;
            stream.seek(SeekFrom::Start(current))?;
            Ok::<u64, std::io::Error>(size)
        })();
        return match result {
            Ok(size) => size as i64,
            Err(_) => AVERROR_EXTERNAL as i64,
        };
    }

    let target = match whence {
        0 => SeekFrom::Start(offset.max(0) as u64),
        1 => SeekFrom::Current(offset),
        2 => SeekFrom::End(offset),
        _ => return AVERROR_EXTERNAL as i64,
    };
    match stream.seek(target) {
        Ok(position) => position as i64,
        Err(_) => AVERROR_EXTERNAL as i64,
    }
}

/// Result of probing a source for its container format.
#[derive(Debug, Clone)]
pub struct Probe {
    pub format: String,
    pub long_name: Option<String>,
    pub mime_type: Option<String>,
    pub extensions: Option<String>,
    /// Detection score normalized to `0.0..=1.0`.
    pub confidence: f32,
}

/// Probe the given bytes for a container format without opening a demuxer.
pub fn probe_buffer(data: &[u8], filename: Option<&str>) -> Option<Probe> {
    let filename = CString::new(filename.unwrap_or_default()).ok()?;
    let mut padded = Vec::with_capacity(data.len() + PROBE_PADDING);
    padded.extend_from_slice(data);
    padded.extend(std::iter::repeat(0u8).take(PROBE_PADDING));

    unsafe {
        let mut probe_data = AVProbeData {
            filename: filename.as_ptr(),
            buf: padded.as_mut_ptr(),
            buf_size: data.len() as std::ffi::c_int,
            mime_type: std::ptr::null(),
        };
        let mut score: std::ffi::c_int = 0;
        let format = av_probe_input_format3(&mut probe_data, 1, &mut score);
        if format.is_null() {
            return None;
        }

        let name = |ptr: *const std::ffi::c_char| {
            if ptr.is_null() {
                None
            } else {
                Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
            }
        };

        Some(Probe {
            format: name((*format).name)?,
            long_name: name((*format).long_name),
            mime_type: name((*format).mime_type),
            extensions: name((*format).extensions),
            confidence: score as f32 / AVPROBE_SCORE_MAX as f32,
        })
    }
}

/// Seek a format context to `timestamp` (in the time base of
/// `stream_index`, or in `AV_TIME_BASE` units when it is `None`).
pub fn seek_input(
    input: &mut Input,
    stream_index: Option<usize>,
    timestamp: i64,
    flags: std::ffi::c_int,
) -> Result<(), Error> {
    unsafe {
        let index = stream_index.map(|i| i as std::ffi::c_int).unwrap_or(-1);
        match avformat_seek_file(
            input.as_mut_ptr(),
            index,
            i64::MIN,
            timestamp,
            i64::MAX,
            flags,
        ) {
            r if r >= 0 => Ok(()),
            e => Err(Error::from(e)),
        }
    }
}

/// Initialize a new codec context using a specific codec.
pub fn codec_context_as(codec: &Codec) -> Result<Context, Error> {
    unsafe {
        let context_ptr = avcodec_alloc_context3(codec.as_ptr());
        if !context_ptr.is_null() {
            Ok(Context::wrap(context_ptr, None))
        } else {
            Err(Error::Unknown)
        }
    }
}

/// Set the `time_base` field of a decoder context. (Not natively supported
/// in the public API.)
pub fn set_decoder_context_time_base(decoder_context: &mut Context, time_base: Rational) {
    unsafe {
        (*decoder_context.as_mut_ptr()).time_base = time_base.into();
    }
}

/// Get the `time_base` field of a codec context. (Not natively supported in
/// the public API.)
pub fn codec_context_time_base(context: &Context) -> Rational {
    unsafe { (*context.as_ptr()).time_base.into() }
}

/// Extract codec parameters from a codec context (usually an opened
/// encoder).
pub fn parameters_from_context(
    context: &Context,
) -> Result<ffmpeg::codec::Parameters, Error> {
    unsafe {
        let mut parameters = ffmpeg::codec::Parameters::new();
        match avcodec_parameters_from_context(parameters.as_mut_ptr(), context.as_ptr()) {
            r if r >= 0 => Ok(parameters),
            e => Err(Error::from(e)),
        }
    }
}

/// Clear the codec tag of an output stream. Required for stream copy between
/// containers whose codec tags disagree.
pub fn stream_clear_codec_tag(stream: &mut ffmpeg::format::stream::StreamMut) {
    unsafe {
        (*(*stream.as_mut_ptr()).codecpar).codec_tag = 0;
    }
}

/// Copy frame properties from `src` to `dst`.
pub fn copy_frame_props(src: &Frame, dst: &mut Frame) {
    unsafe {
        av_frame_copy_props(dst.as_mut_ptr(), src.as_ptr());
    }
}

/// Set the thread count of a filter graph. (Not natively supported in the
/// public API.)
pub fn graph_set_threads(graph: &mut Graph, threads: usize) {
    unsafe {
        (*graph.as_mut_ptr()).nb_threads = threads as std::ffi::c_int;
    }
}

/// Output width negotiated by a buffer sink.
pub fn buffersink_width(sink: &mut ffmpeg::filter::Context) -> u32 {
    unsafe { av_buffersink_get_w(sink.as_mut_ptr()) as u32 }
}

/// Output height negotiated by a buffer sink.
pub fn buffersink_height(sink: &mut ffmpeg::filter::Context) -> u32 {
    unsafe { av_buffersink_get_h(sink.as_mut_ptr()) as u32 }
}

/// Output pixel or sample format negotiated by a buffer sink, as the raw
/// format integer.
pub fn buffersink_format(sink: &mut ffmpeg::filter::Context) -> std::ffi::c_int {
    unsafe { av_buffersink_get_format(sink.as_mut_ptr()) }
}

/// Output time base negotiated by a buffer sink.
pub fn buffersink_time_base(sink: &mut ffmpeg::filter::Context) -> Rational {
    unsafe { av_buffersink_get_time_base(sink.as_mut_ptr()).into() }
}

/// Output frame rate negotiated by a buffer sink; `0/1` when unknown.
pub fn buffersink_frame_rate(sink: &mut ffmpeg::filter::Context) -> Rational {
    unsafe { av_buffersink_get_frame_rate(sink.as_mut_ptr()).into() }
}

/// Output sample rate negotiated by a buffer sink.
pub fn buffersink_sample_rate(sink: &mut ffmpeg::filter::Context) -> i32 {
    unsafe { av_buffersink_get_sample_rate(sink.as_mut_ptr()) }
}

/// Send a command to one or more filter instances in a graph and return the
/// filter's response. `target` may name a filter instance or be `"all"`;
/// `flags` takes the `AVFILTER_CMD_FLAG_*` bits.
pub fn graph_send_command(
    graph: &mut Graph,
    target: &str,
    command: &str,
    argument: &str,
    flags: std::ffi::c_int,
) -> Result<String, Error> {
    const RESPONSE_LEN: usize = 4096;

    let target = CString::new(target).map_err(|_| Error::InvalidData)?;
    let command = CString::new(command).map_err(|_| Error::InvalidData)?;
    let argument = CString::new(argument).map_err(|_| Error::InvalidData)?;

    unsafe {
        let mut response = [0 as std::ffi::c_char; RESPONSE_LEN];
        match avfilter_graph_send_command(
            graph.as_mut_ptr(),
            target.as_ptr(),
            command.as_ptr(),
            argument.as_ptr(),
            response.as_mut_ptr(),
            RESPONSE_LEN as std::ffi::c_int,
            flags,
        ) {
            r if r >= 0 => Ok(CStr::from_ptr(response.as_ptr())
                .to_string_lossy()
                .into_owned()),
            e => Err(Error::from(e)),
        }
    }
}

/// Queue a command for a filter instance to be applied at timestamp `ts`
/// (in seconds).
pub fn graph_queue_command(
    graph: &mut Graph,
    target: &str,
    command: &str,
    argument: &str,
    ts: f64,
    flags: std::ffi::c_int,
) -> Result<(), Error> {
    let target = CString::new(target).map_err(|_| Error::InvalidData)?;
    let command = CString::new(command).map_err(|_| Error::InvalidData)?;
    let argument = CString::new(argument).map_err(|_| Error::InvalidData)?;

    unsafe {
        match avfilter_graph_queue_command(
            graph.as_mut_ptr(),
            target.as_ptr(),
            command.as_ptr(),
            argument.as_ptr(),
            flags,
            ts,
        ) {
            r if r >= 0 => Ok(()),
            e => Err(Error::from(e)),
        }
    }
}

/// Initialize the logging handler. This will redirect all ffmpeg logging to
/// the Rust `tracing` crate and any subscribers to it.
pub fn init_logging() {
    unsafe {
        av_log_set_callback(Some(log_callback));
    }
}

/// Internal function with C-style callback behavior that receives all log
/// messages from ffmpeg and forwards them to `tracing`.
unsafe extern "C" fn log_callback(
    avcl: *mut std::ffi::c_void,
    level_no: std::ffi::c_int,
    fmt: *const std::ffi::c_char,
    #[cfg(all(target_arch = "x86_64", target_family = "unix"))] vl: *mut __va_list_tag,
    #[cfg(not(all(target_arch = "x86_64", target_family = "unix")))] vl: va_list,
) {
    // Check whether or not the message would be printed at all.
    let event_would_log = match level_no {
        // These are all error states.
        AV_LOG_PANIC | AV_LOG_FATAL | AV_LOG_ERROR => tracing::enabled!(tracing::Level::ERROR),
        AV_LOG_WARNING => tracing::enabled!(tracing::Level::WARN),
        AV_LOG_INFO => tracing::enabled!(tracing::Level::INFO),
        // There is no "verbose" in `tracing`, so we just put it in the
        // "debug" category.
        AV_LOG_VERBOSE | AV_LOG_DEBUG => tracing::enabled!(tracing::Level::DEBUG),
        AV_LOG_TRACE => tracing::enabled!(tracing::Level::TRACE),
        _ => {
            return;
        }
    };

    if event_would_log {
        // 1024 bytes is the buffer size used by ffmpeg itself for log lines,
        // so longer lines may be truncated.
        let mut line = [0; 1024];
        let mut print_prefix: std::ffi::c_int = 1;
        let ret = av_log_format_line2(
            avcl,
            level_no,
            fmt,
            vl,
            line.as_mut_ptr(),
            (line.len()) as std::ffi::c_int,
            (&mut print_prefix) as *mut std::ffi::c_int,
        );
        // Simply discard the log message if formatting fails.
        if ret > 0 {
            if let Ok(line) = std::ffi::CStr::from_ptr(line.as_mut_ptr()).to_str() {
                let line = line.trim();
                match level_no {
                    AV_LOG_PANIC | AV_LOG_FATAL | AV_LOG_ERROR => {
                        tracing::error!(target: "media", "{}", line)
                    }
                    AV_LOG_WARNING => tracing::warn!(target: "media", "{}", line),
                    AV_LOG_INFO => tracing::info!(target: "media", "{}", line),
                    AV_LOG_VERBOSE | AV_LOG_DEBUG => {
                        tracing::debug!(target: "media", "{}", line)
                    }
                    AV_LOG_TRACE => tracing::trace!(target: "media", "{}", line),
                    _ => {}
                };
            }
        }
    }
}
