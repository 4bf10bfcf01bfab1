extern crate ffmpeg_next as ffmpeg;

use std::ffi::{CStr, CString};

use ffmpeg::codec::codec::Codec;
use ffmpeg::util::format::Pixel;

use crate::hwaccel::HardwareDeviceType;
use crate::options::Options;

/// Owns one `AVHWDeviceContext` reference.
pub struct HardwareDeviceContext {
    ptr: *mut ffmpeg::ffi::AVBufferRef,
}

impl HardwareDeviceContext {
    pub fn new(
        device_type: HardwareDeviceType,
        device: Option<&str>,
        options: Option<&Options>,
    ) -> Result<HardwareDeviceContext, ffmpeg::error::Error> {
        let mut ptr: *mut ffmpeg::ffi::AVBufferRef = std::ptr::null_mut();
        let device = match device {
            Some(name) => {
                Some(CString::new(name).map_err(|_| ffmpeg::error::Error::InvalidData)?)
            }
            None => None,
        };

        unsafe {
            let mut opts = options
                .map(|options| options.to_dict().disown())
                .unwrap_or(std::ptr::null_mut());
            let result = ffmpeg::ffi::av_hwdevice_ctx_create(
                (&mut ptr) as *mut *mut ffmpeg::ffi::AVBufferRef,
                device_type.into(),
                device
                    .as_ref()
                    .map(|name| name.as_ptr())
                    .unwrap_or(std::ptr::null()),
                opts,
                0,
            );
            ffmpeg::ffi::av_dict_free(&mut opts);
            match result {
                0 => Ok(HardwareDeviceContext { ptr }),
                e => Err(ffmpeg::error::Error::from(e)),
            }
        }
    }

    /// Take a new reference on the underlying device context.
    pub(crate) unsafe fn ref_raw(&self) -> *mut ffmpeg::ffi::AVBufferRef {
        ffmpeg::ffi::av_buffer_ref(self.ptr)
    }

    /// Borrow the underlying device context without taking a reference.
    pub(crate) fn as_ptr(&self) -> *mut ffmpeg::ffi::AVBufferRef {
        self.ptr
    }
}

impl Drop for HardwareDeviceContext {
    fn drop(&mut self) {
        unsafe {
            ffmpeg::ffi::av_buffer_unref(&mut self.ptr);
        }
    }
}

unsafe impl Send for HardwareDeviceContext {}
unsafe impl Sync for HardwareDeviceContext {}

pub fn hwdevice_list_available_device_types() -> Vec<HardwareDeviceType> {
    let mut hwdevice_types = Vec::new();
    let mut hwdevice_type = unsafe {
        ffmpeg::ffi::av_hwdevice_iterate_types(ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE)
    };
    while hwdevice_type != ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE {
        if let Some(known) = HardwareDeviceType::from(hwdevice_type) {
            hwdevice_types.push(known);
        }
        hwdevice_type = unsafe { ffmpeg::ffi::av_hwdevice_iterate_types(hwdevice_type) };
    }
    hwdevice_types
}

pub fn hwdevice_type_name(device_type: HardwareDeviceType) -> &'static str {
    unsafe {
        let name = ffmpeg::ffi::av_hwdevice_get_type_name(device_type.into());
        if name.is_null() {
            "unknown"
        } else {
            CStr::from_ptr(name).to_str().unwrap_or("unknown")
        }
    }
}

pub fn hwdevice_transfer_frame(
    target_frame: &mut ffmpeg::frame::Frame,
    hwdevice_frame: &ffmpeg::frame::Frame,
) -> Result<(), ffmpeg::error::Error> {
    unsafe {
        match ffmpeg::ffi::av_hwframe_transfer_data(
            target_frame.as_mut_ptr(),
            hwdevice_frame.as_ptr(),
            0,
        ) {
            0 => Ok(()),
            e => Err(ffmpeg::error::Error::from(e)),
        }
    }
}

/// The hardware frames context reference of a frame, null when the frame
/// lives in system memory.
pub fn frame_hw_frames_ctx(frame: &ffmpeg::frame::Frame) -> *mut ffmpeg::ffi::AVBufferRef {
    unsafe { (*frame.as_ptr()).hw_frames_ctx }
}

/// The software pixel format frames of this hardware frames context map to
/// when downloaded.
pub fn hwframes_ctx_sw_format(frames_ref: *mut ffmpeg::ffi::AVBufferRef) -> Pixel {
    unsafe {
        let frames_ctx = (*frames_ref).data as *mut ffmpeg::ffi::AVHWFramesContext;
        (*frames_ctx).sw_format.into()
    }
}

/// Find the hardware pixel format a codec uses with the given device type,
/// if the codec supports that device at all.
pub fn codec_find_corresponding_hwaccel_pixfmt(
    codec: &Codec,
    hwaccel_type: HardwareDeviceType,
) -> Option<Pixel> {
    codec_ptr_hwaccel_pixfmt(codec.as_ptr(), hwaccel_type)
}

fn codec_ptr_hwaccel_pixfmt(
    codec: *const ffmpeg::ffi::AVCodec,
    hwaccel_type: HardwareDeviceType,
) -> Option<Pixel> {
    let mut i = 0;
    loop {
        unsafe {
            let hw_config = ffmpeg::ffi::avcodec_get_hw_config(codec, i);
            if !hw_config.is_null() {
                let hw_config_supports_codec = (((*hw_config).methods) as i32
                    & ffmpeg::ffi::AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX as i32)
                    != 0;
                if hw_config_supports_codec && (*hw_config).device_type == hwaccel_type.into() {
                    break Some((*hw_config).pix_fmt.into());
                }
            } else {
                break None;
            }
        }
        i += 1;
    }
}

/// Whether the codec carries a hardware config for the given device type
/// and, optionally, the given pixel format.
pub fn codec_supports_hwdevice(
    codec: &Codec,
    hwaccel_type: HardwareDeviceType,
    pixel_format: Option<Pixel>,
) -> bool {
    let mut i = 0;
    loop {
        unsafe {
            let hw_config = ffmpeg::ffi::avcodec_get_hw_config(codec.as_ptr(), i);
            if hw_config.is_null() {
                break false;
            }
            if (*hw_config).device_type == hwaccel_type.into() {
                match pixel_format {
                    None => break true,
                    Some(format) => {
                        if Pixel::from((*hw_config).pix_fmt) == format {
                            break true;
                        }
                    }
                }
            }
        }
        i += 1;
    }
}

/// Names of all codecs whose hardware config list includes the given device
/// type.
pub fn hwdevice_supported_codec_names(
    hwaccel_type: HardwareDeviceType,
    encoders: bool,
) -> Vec<String> {
    let mut names = Vec::new();
    let mut opaque: *mut std::ffi::c_void = std::ptr::null_mut();
    loop {
        unsafe {
            let codec = ffmpeg::ffi::av_codec_iterate(&mut opaque);
            if codec.is_null() {
                break;
            }
            let is_encoder = ffmpeg::ffi::av_codec_is_encoder(codec) != 0;
            if is_encoder != encoders {
                continue;
            }
            if codec_ptr_hwaccel_pixfmt(codec, hwaccel_type).is_some() {
                if let Ok(name) = CStr::from_ptr((*codec).name).to_str() {
                    names.push(name.to_string());
                }
            }
        }
    }
    names
}

/// Open a small throwaway encoder to verify that a compiled-in hardware
/// encoder is actually functional on this machine. Guards against drivers
/// that expose the codec but fail at open time.
pub fn encoder_open_test(
    codec: &Codec,
    device: &HardwareDeviceContext,
    device_pixel_format: Pixel,
) -> bool {
    const TEST_DIM: i32 = 100;

    unsafe {
        let codec_ptr = codec.as_ptr();
        let mut ctx = ffmpeg::ffi::avcodec_alloc_context3(codec_ptr);
        if ctx.is_null() {
            return false;
        }

        // First supported pixel format, preferring the device's own format
        // so the zero-copy path gets exercised.
        let device_format = ffmpeg::ffi::AVPixelFormat::from(device_pixel_format);
        let mut chosen: Option<ffmpeg::ffi::AVPixelFormat> = None;
        let mut fmt_list = (*codec_ptr).pix_fmts;
        if !fmt_list.is_null() {
            while *fmt_list != ffmpeg::ffi::AVPixelFormat::AV_PIX_FMT_NONE {
                if chosen.is_none() {
                    chosen = Some(*fmt_list);
                }
                if *fmt_list == device_format {
                    chosen = Some(*fmt_list);
                    break;
                }
                fmt_list = fmt_list.add(1);
            }
        }
        let chosen = chosen.unwrap_or(ffmpeg::ffi::AVPixelFormat::AV_PIX_FMT_NV12);

        (*ctx).width = TEST_DIM;
        (*ctx).height = TEST_DIM;
        (*ctx).time_base = ffmpeg::ffi::AVRational { num: 1, den: 30 };
        (*ctx).framerate = ffmpeg::ffi::AVRational { num: 30, den: 1 };
        (*ctx).pix_fmt = chosen;

        if chosen == device_format {
            // Hardware input format: the encoder needs a frames context
            // before it will open.
            let frames_ref = ffmpeg::ffi::av_hwframe_ctx_alloc(device.as_ptr());
            if frames_ref.is_null() {
                ffmpeg::ffi::avcodec_free_context(&mut ctx);
                return false;
            }
            let frames_ctx = (*frames_ref).data as *mut ffmpeg::ffi::AVHWFramesContext;
            (*frames_ctx).format = chosen;
            (*frames_ctx).sw_format = ffmpeg::ffi::AVPixelFormat::AV_PIX_FMT_NV12;
            (*frames_ctx).width = TEST_DIM;
            (*frames_ctx).height = TEST_DIM;
            (*frames_ctx).initial_pool_size = 2;
            let mut frames_ref = frames_ref;
            if ffmpeg::ffi::av_hwframe_ctx_init(frames_ref) < 0 {
                ffmpeg::ffi::av_buffer_unref(&mut frames_ref);
                ffmpeg::ffi::avcodec_free_context(&mut ctx);
                return false;
            }
            (*ctx).hw_frames_ctx = ffmpeg::ffi::av_buffer_ref(frames_ref);
            ffmpeg::ffi::av_buffer_unref(&mut frames_ref);
        }

        let opened = ffmpeg::ffi::avcodec_open2(ctx, codec_ptr, std::ptr::null_mut()) == 0;
        ffmpeg::ffi::avcodec_free_context(&mut ctx);
        opened
    }
}

/// Install the hardware pixel format negotiation callback on a codec
/// context.
pub fn codec_context_hwaccel_set_get_format(
    codec_context: &mut ffmpeg::codec::context::Context,
    hw_pixfmt: Pixel,
) {
    unsafe {
        (*codec_context.as_mut_ptr()).opaque =
            ffmpeg::ffi::AVPixelFormat::from(hw_pixfmt) as i32 as _;
        (*codec_context.as_mut_ptr()).get_format = Some(hwaccel_get_format);
    }
}

/// Attach a hardware device context to a codec context.
pub fn codec_context_hwaccel_set_hw_device_ctx(
    codec_context: &mut ffmpeg::codec::context::Context,
    hardware_device_context: &HardwareDeviceContext,
) {
    unsafe {
        (*codec_context.as_mut_ptr()).hw_device_ctx = hardware_device_context.ref_raw();
    }
}

/// Attach a hardware frames context (by reference) to a codec context. Used
/// when an encoder adopts the frames context of its first input frame.
pub fn codec_context_set_hw_frames_ctx(
    codec_context: &mut ffmpeg::codec::context::Context,
    frames_ref: *mut ffmpeg::ffi::AVBufferRef,
) {
    unsafe {
        (*codec_context.as_mut_ptr()).hw_frames_ctx = ffmpeg::ffi::av_buffer_ref(frames_ref);
    }
}

/// Give every filter in a graph that does not have one yet a reference to
/// the hardware device, so hardware filters can allocate frames. Must happen
/// before the graph is configured.
pub fn graph_propagate_hw_device_ctx(
    graph: &mut ffmpeg::filter::Graph,
    device_ref: *mut ffmpeg::ffi::AVBufferRef,
) {
    unsafe {
        let graph = graph.as_mut_ptr();
        for i in 0..(*graph).nb_filters as usize {
            let filter = *(*graph).filters.add(i);
            if (*filter).hw_device_ctx.is_null() {
                (*filter).hw_device_ctx = ffmpeg::ffi::av_buffer_ref(device_ref);
            }
        }
    }
}

/// Bind a hardware frames context to a buffer source filter so the graph
/// negotiates hardware formats. Must happen before the graph is configured.
pub fn buffersrc_set_hw_frames_ctx(
    filter_context: &mut ffmpeg::filter::Context,
    frames_ref: *mut ffmpeg::ffi::AVBufferRef,
) -> Result<(), ffmpeg::error::Error> {
    unsafe {
        let params = ffmpeg::ffi::av_buffersrc_parameters_alloc();
        if params.is_null() {
            return Err(ffmpeg::error::Error::Unknown);
        }
        (*params).hw_frames_ctx = frames_ref;
        let result =
            ffmpeg::ffi::av_buffersrc_parameters_set(filter_context.as_mut_ptr(), params);
        ffmpeg::ffi::av_free(params as *mut std::ffi::c_void);
        match result {
            0 => Ok(()),
            e => Err(ffmpeg::error::Error::from(e)),
        }
    }
}

#[no_mangle]
unsafe extern "C" fn hwaccel_get_format(
    ctx: *mut ffmpeg::ffi::AVCodecContext,
    pix_fmts: *const ffmpeg::ffi::AVPixelFormat,
) -> ffmpeg::ffi::AVPixelFormat {
    let mut p = pix_fmts;
    while *p != ffmpeg::ffi::AVPixelFormat::AV_PIX_FMT_NONE {
        if *p == std::mem::transmute((*ctx).opaque as i32) {
            return *p;
        }
        p = p.add(1);
    }
    ffmpeg::ffi::AVPixelFormat::AV_PIX_FMT_NONE
}
