extern crate ffmpeg_next as ffmpeg;

use ffmpeg::media::Type as AvMediaType;
use ffmpeg::util::format::Pixel as AvPixel;
use ffmpeg::util::frame::Audio as AvAudioFrame;
use ffmpeg::util::frame::Frame as AvFrame;
use ffmpeg::util::frame::Video as AvVideoFrame;
use ffmpeg::Rational as AvRational;

use crate::error::Error;
use crate::ffi;
use crate::ffi_hwaccel;
use crate::time::Time;

type Result<T> = std::result::Result<T, Error>;

/// Re-export internal pixel format type for callers.
pub type PixelFormat = AvPixel;

/// Re-export internal sample format type for callers.
pub type SampleFormat = ffmpeg::util::format::Sample;

/// A raw (decoded) unit of media data, either video or audio.
///
/// Frames carry their PTS in the time base of the stage that produced them.
/// Video frames may reference hardware memory; such frames travel between
/// stages without copying pixel data as long as every consumer shares the
/// same hardware frames context.
pub enum Frame {
    Video(AvVideoFrame),
    Audio(AvAudioFrame),
}

impl Frame {
    /// Media type of this frame.
    pub fn media_type(&self) -> AvMediaType {
        match self {
            Frame::Video(_) => AvMediaType::Video,
            Frame::Audio(_) => AvMediaType::Audio,
        }
    }

    /// Frame PTS in the producing stage's time base, combined with that time
    /// base by the caller.
    pub fn pts(&self) -> Option<i64> {
        self.as_ref().pts()
    }

    /// Frame PTS as a [`Time`] in the given time base.
    pub fn pts_in(&self, time_base: AvRational) -> Time {
        Time::new(self.pts(), time_base)
    }

    pub fn set_pts(&mut self, pts: Option<i64>) {
        self.as_mut().set_pts(pts);
    }

    /// Whether this frame references hardware (GPU) memory.
    pub fn is_hardware(&self) -> bool {
        !ffi_hwaccel::frame_hw_frames_ctx(self.as_ref()).is_null()
    }

    /// Raw reference to the hardware frames context that allocated this
    /// frame, if any. Two frames are compatible when their references point
    /// at the same context.
    pub(crate) fn hw_frames_ctx(&self) -> *mut ffmpeg::ffi::AVBufferRef {
        ffi_hwaccel::frame_hw_frames_ctx(self.as_ref())
    }

    /// Transfer a hardware frame to system memory. The downloaded frame has
    /// the software pixel format of the originating hardware frames context
    /// and the same timestamps.
    ///
    /// Returns the frame unchanged if it does not reference hardware memory.
    pub fn download(self) -> Result<Frame> {
        match self {
            Frame::Video(frame) if !ffi_hwaccel::frame_hw_frames_ctx(&frame).is_null() => {
                let sw_format =
                    ffi_hwaccel::hwframes_ctx_sw_format(ffi_hwaccel::frame_hw_frames_ctx(&frame));
                let mut downloaded = AvVideoFrame::empty();
                downloaded.set_format(sw_format);
                ffi_hwaccel::hwdevice_transfer_frame(&mut downloaded, &frame)
                    .map_err(Error::BackendError)?;
                ffi::copy_frame_props(&frame, &mut downloaded);
                Ok(Frame::Video(downloaded))
            }
            other => Ok(other),
        }
    }

    /// Borrow as video frame. Returns `None` for audio frames.
    pub fn video(&self) -> Option<&AvVideoFrame> {
        match self {
            Frame::Video(frame) => Some(frame),
            Frame::Audio(_) => None,
        }
    }

    /// Borrow as audio frame. Returns `None` for video frames.
    pub fn audio(&self) -> Option<&AvAudioFrame> {
        match self {
            Frame::Audio(frame) => Some(frame),
            Frame::Video(_) => None,
        }
    }

    /// Borrow the underlying native frame.
    pub(crate) fn as_ref(&self) -> &AvFrame {
        match self {
            Frame::Video(frame) => frame,
            Frame::Audio(frame) => frame,
        }
    }

    /// Mutably borrow the underlying native frame.
    pub(crate) fn as_mut(&mut self) -> &mut AvFrame {
        match self {
            Frame::Video(frame) => frame,
            Frame::Audio(frame) => frame,
        }
    }
}

impl From<AvVideoFrame> for Frame {
    fn from(frame: AvVideoFrame) -> Self {
        Frame::Video(frame)
    }
}

impl From<AvAudioFrame> for Frame {
    fn from(frame: AvAudioFrame) -> Self {
        Frame::Audio(frame)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Frame::Video(frame) => f
                .debug_struct("Frame::Video")
                .field("width", &frame.width())
                .field("height", &frame.height())
                .field("format", &frame.format())
                .field("pts", &frame.pts())
                .finish(),
            Frame::Audio(frame) => f
                .debug_struct("Frame::Audio")
                .field("rate", &frame.rate())
                .field("samples", &frame.samples())
                .field("format", &frame.format())
                .field("pts", &frame.pts())
                .finish(),
        }
    }
}

unsafe impl Send for Frame {}
unsafe impl Sync for Frame {}
