extern crate ffmpeg_next as ffmpeg;

use ffmpeg::codec::codec::Codec as AvCodec;
use ffmpeg::codec::Id as AvCodecId;
use ffmpeg::util::format::Pixel as AvPixel;

use crate::error::Error;
use crate::ffi_hwaccel;
use crate::options::Options;

type Result<T> = std::result::Result<T, Error>;

/// Owns a hardware device handle of one device type.
///
/// A [`HardwareContext`] is created and owned by the caller; decoders,
/// encoders and filters that use it only take internal references on the
/// underlying device, never ownership. Dropping the context after dependent
/// stages is always safe since the device handle is reference counted.
pub struct HardwareContext {
    device: ffi_hwaccel::HardwareDeviceContext,
    device_type: HardwareDeviceType,
    pixel_format: AvPixel,
}

/// Options for [`HardwareContext::auto`].
#[derive(Default)]
pub struct AutoOptions {
    /// Device path or GPU index hint, passed through to device creation.
    pub device_name: Option<String>,
    /// Free-form options passed to the device initialization.
    pub options: Options,
}

impl HardwareContext {
    /// Create a hardware context for the given device type.
    ///
    /// * `device` - Optional device path or index hint (e.g. a DRM render
    ///   node or a GPU ordinal).
    /// * `options` - Options passed to the device initialization.
    pub fn create(
        device_type: HardwareDeviceType,
        device: Option<&str>,
        options: Option<&Options>,
    ) -> Result<Self> {
        crate::init()?;
        let device = ffi_hwaccel::HardwareDeviceContext::new(device_type, device, options)
            .map_err(Error::HardwareUnavailable)?;

        Ok(Self {
            device,
            device_type,
            pixel_format: device_type.pixel_format(),
        })
    }

    /// Create the preferred working hardware context for this platform, or
    /// `None` when no device type both initializes and can open a test
    /// encoder.
    ///
    /// The preference order is deterministic per platform: VideoToolbox on
    /// macOS; VAAPI, then CUDA on Linux; D3D11VA, D3D12VA, QSV, then CUDA on
    /// Windows.
    pub fn auto(options: Option<AutoOptions>) -> Option<Self> {
        let options = options.unwrap_or_default();

        let preference: &[HardwareDeviceType] = if cfg!(target_os = "macos") {
            &[HardwareDeviceType::VideoToolbox]
        } else if cfg!(target_os = "windows") {
            &[
                HardwareDeviceType::D3D11Va,
                HardwareDeviceType::D3D12Va,
                HardwareDeviceType::Qsv,
                HardwareDeviceType::Cuda,
            ]
        } else {
            &[HardwareDeviceType::VaApi, HardwareDeviceType::Cuda]
        };

        for &device_type in preference {
            let context = match Self::create(
                device_type,
                options.device_name.as_deref(),
                Some(&options.options),
            ) {
                Ok(context) => context,
                Err(_) => continue,
            };
            // A device that initializes but cannot open any encoder is
            // considered non-functional for pipeline purposes.
            if context.encoder_codec("h264").is_some() || context.encoder_codec("hevc").is_some()
            {
                tracing::debug!(
                    target: "media",
                    "selected hardware device type {}",
                    context.device_type_name()
                );
                return Some(context);
            }
        }

        None
    }

    /// List hardware device types compiled into the linked ffmpeg.
    pub fn list_available() -> Vec<HardwareDeviceType> {
        ffi_hwaccel::hwdevice_list_available_device_types()
    }

    /// Device type of this context.
    pub fn device_type(&self) -> HardwareDeviceType {
        self.device_type
    }

    /// Human-readable name of the device type (e.g. `"cuda"`).
    pub fn device_type_name(&self) -> &'static str {
        ffi_hwaccel::hwdevice_type_name(self.device_type)
    }

    /// The hardware pixel format frames of this device carry (e.g.
    /// [`AvPixel::CUDA`] for CUDA devices).
    pub fn pixel_format(&self) -> AvPixel {
        self.pixel_format
    }

    /// Whether the codec identified by `codec_id` supports this device type.
    pub fn supports_codec(&self, codec_id: AvCodecId, is_encoder: bool) -> bool {
        match self.find_codec(codec_id, is_encoder) {
            Some(codec) => ffi_hwaccel::codec_supports_hwdevice(&codec, self.device_type, None),
            None => false,
        }
    }

    /// Whether the codec supports the given pixel format on this device
    /// type.
    pub fn supports_pixel_format(
        &self,
        codec_id: AvCodecId,
        pixel_format: AvPixel,
        is_encoder: bool,
    ) -> bool {
        match self.find_codec(codec_id, is_encoder) {
            Some(codec) => ffi_hwaccel::codec_supports_hwdevice(
                &codec,
                self.device_type,
                Some(pixel_format),
            ),
            None => false,
        }
    }

    /// Names of all codecs whose hardware configuration list includes this
    /// device type.
    pub fn find_supported_codecs(&self, is_encoder: bool) -> Vec<String> {
        ffi_hwaccel::hwdevice_supported_codec_names(self.device_type, is_encoder)
    }

    /// Map a generic encoder name ("h264", "hevc", "av1") to the hardware
    /// implementation for this device, verifying it can actually open.
    ///
    /// Opening a tiny test encoder guards against compiled-in but
    /// non-functional encoders (missing drivers, unsupported GPUs). Returns
    /// `None` when no working hardware encoder exists for the base name.
    pub fn encoder_codec(&self, base_name: &str) -> Option<AvCodec> {
        let suffix = self.device_type.encoder_suffix()?;
        let codec = ffmpeg::encoder::find_by_name(&format!("{base_name}_{suffix}"))?;
        if ffi_hwaccel::encoder_open_test(&codec, &self.device, self.pixel_format) {
            Some(codec)
        } else {
            None
        }
    }

    /// The device pixel format a decoder would produce for `codec`, if the
    /// codec supports this device type.
    pub(crate) fn decoder_pixel_format(&self, codec: &AvCodec) -> Option<AvPixel> {
        ffi_hwaccel::codec_find_corresponding_hwaccel_pixfmt(codec, self.device_type)
    }

    pub(crate) fn device(&self) -> &ffi_hwaccel::HardwareDeviceContext {
        &self.device
    }

    fn find_codec(&self, codec_id: AvCodecId, is_encoder: bool) -> Option<AvCodec> {
        if is_encoder {
            ffmpeg::encoder::find(codec_id)
        } else {
            ffmpeg::decoder::find(codec_id)
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HardwareDeviceType {
    /// Video Decode and Presentation API for Unix (VDPAU)
    Vdpau,
    /// NVIDIA CUDA
    Cuda,
    /// Video Acceleration API (VA-API)
    VaApi,
    /// DirectX Video Acceleration 2.0
    Dxva2,
    /// Quick Sync Video
    Qsv,
    /// VideoToolbox
    VideoToolbox,
    /// Direct3D 11 Video Acceleration
    D3D11Va,
    /// Linux Direct Rendering Manager
    Drm,
    /// OpenCL
    OpenCl,
    /// MediaCodec
    MediaCodec,
    /// Vulkan
    Vulkan,
    /// Direct3D 12 Video Acceleration
    D3D12Va,
}

impl HardwareDeviceType {
    /// Whether or not the device type is available on this system.
    pub fn is_available(self) -> bool {
        Self::list_available().contains(&self)
    }

    /// List available hardware acceleration device types on this system.
    ///
    /// Uses `av_hwdevice_iterate_types` internally.
    pub fn list_available() -> Vec<HardwareDeviceType> {
        ffi_hwaccel::hwdevice_list_available_device_types()
    }

    /// The pixel format frames allocated on this device type carry.
    pub fn pixel_format(self) -> AvPixel {
        match self {
            HardwareDeviceType::Vdpau => AvPixel::VDPAU,
            HardwareDeviceType::Cuda => AvPixel::CUDA,
            HardwareDeviceType::VaApi => AvPixel::VAAPI,
            HardwareDeviceType::Dxva2 => AvPixel::DXVA2_VLD,
            HardwareDeviceType::Qsv => AvPixel::QSV,
            HardwareDeviceType::VideoToolbox => AvPixel::VIDEOTOOLBOX,
            HardwareDeviceType::D3D11Va => AvPixel::D3D11,
            HardwareDeviceType::Drm => AvPixel::DRM_PRIME,
            HardwareDeviceType::OpenCl => AvPixel::OPENCL,
            HardwareDeviceType::MediaCodec => AvPixel::MEDIACODEC,
            HardwareDeviceType::Vulkan => AvPixel::VULKAN,
            HardwareDeviceType::D3D12Va => AvPixel::D3D12,
        }
    }

    /// Encoder name suffix used by ffmpeg for this device type, when one
    /// exists (e.g. `h264_nvenc` for CUDA).
    fn encoder_suffix(self) -> Option<&'static str> {
        match self {
            HardwareDeviceType::Cuda => Some("nvenc"),
            HardwareDeviceType::VaApi => Some("vaapi"),
            HardwareDeviceType::Qsv => Some("qsv"),
            HardwareDeviceType::VideoToolbox => Some("videotoolbox"),
            HardwareDeviceType::D3D11Va | HardwareDeviceType::D3D12Va => Some("mf"),
            HardwareDeviceType::MediaCodec => Some("mediacodec"),
            HardwareDeviceType::Vulkan => Some("vulkan"),
            _ => None,
        }
    }
}

impl HardwareDeviceType {
    pub fn from(value: ffmpeg::ffi::AVHWDeviceType) -> Option<HardwareDeviceType> {
        match value {
            ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VDPAU => Some(Self::Vdpau),
            ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA => Some(Self::Cuda),
            ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI => Some(Self::VaApi),
            ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_DXVA2 => Some(Self::Dxva2),
            ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_QSV => Some(Self::Qsv),
            ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VIDEOTOOLBOX => Some(Self::VideoToolbox),
            ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_D3D11VA => Some(Self::D3D11Va),
            ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_DRM => Some(Self::Drm),
            ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_OPENCL => Some(Self::OpenCl),
            ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_MEDIACODEC => Some(Self::MediaCodec),
            ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VULKAN => Some(Self::Vulkan),
            ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_D3D12VA => Some(Self::D3D12Va),
            ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE => None,
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }
}

impl From<HardwareDeviceType> for ffmpeg::ffi::AVHWDeviceType {
    fn from(value: HardwareDeviceType) -> Self {
        match value {
            HardwareDeviceType::Vdpau => ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VDPAU,
            HardwareDeviceType::Cuda => ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA,
            HardwareDeviceType::VaApi => ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI,
            HardwareDeviceType::Dxva2 => ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_DXVA2,
            HardwareDeviceType::Qsv => ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_QSV,
            HardwareDeviceType::VideoToolbox => {
                ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VIDEOTOOLBOX
            }
            HardwareDeviceType::D3D11Va => ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_D3D11VA,
            HardwareDeviceType::Drm => ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_DRM,
            HardwareDeviceType::OpenCl => ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_OPENCL,
            HardwareDeviceType::MediaCodec => {
                ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_MEDIACODEC
            }
            HardwareDeviceType::Vulkan => ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VULKAN,
            HardwareDeviceType::D3D12Va => ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_D3D12VA,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_never_panics() {
        // On hosts without acceleration this simply returns None.
        let _ = HardwareContext::auto(None);
    }

    #[test]
    fn list_available_matches_is_available() {
        for device_type in HardwareDeviceType::list_available() {
            assert!(device_type.is_available());
        }
    }
}
