extern crate ffmpeg_next as ffmpeg;

use std::ffi::CString;

use ffmpeg::codec::packet::Packet as AvPacket;
use ffmpeg::codec::Parameters as AvCodecParameters;
use ffmpeg::Rational as AvRational;

/// Owns one `AVBSFContext`. There is no safe wrapper for the bitstream
/// filter API in `ffmpeg-next`, so this is a hand binding.
pub struct BsfContext {
    ptr: *mut ffmpeg::ffi::AVBSFContext,
}

impl BsfContext {
    /// Allocate and initialize a bitstream filter by name, configured with
    /// the codec parameters and time base of the stream it will process.
    pub fn new(
        name: &str,
        parameters: &AvCodecParameters,
        time_base: AvRational,
    ) -> Result<BsfContext, ffmpeg::error::Error> {
        let cname = CString::new(name).map_err(|_| ffmpeg::error::Error::InvalidData)?;

        unsafe {
            let filter = ffmpeg::ffi::av_bsf_get_by_name(cname.as_ptr());
            if filter.is_null() {
                return Err(ffmpeg::error::Error::BsfNotFound);
            }

            let mut ptr: *mut ffmpeg::ffi::AVBSFContext = std::ptr::null_mut();
            match ffmpeg::ffi::av_bsf_alloc(filter, &mut ptr) {
                0 => {}
                e => return Err(ffmpeg::error::Error::from(e)),
            }

            let copied = ffmpeg::ffi::avcodec_parameters_copy((*ptr).par_in, parameters.as_ptr());
            if copied < 0 {
                ffmpeg::ffi::av_bsf_free(&mut ptr);
                return Err(ffmpeg::error::Error::from(copied));
            }
            (*ptr).time_base_in = time_base.into();

            match ffmpeg::ffi::av_bsf_init(ptr) {
                0 => Ok(BsfContext { ptr }),
                e => {
                    ffmpeg::ffi::av_bsf_free(&mut ptr);
                    Err(ffmpeg::error::Error::from(e))
                }
            }
        }
    }

    /// Submit a packet, or end-of-stream when `packet` is `None`. Ownership
    /// of the packet's payload reference transfers to the filter.
    pub fn send(&mut self, packet: Option<&mut AvPacket>) -> Result<(), ffmpeg::error::Error> {
        unsafe {
            let ptr = match packet {
                Some(packet) => packet.as_mut_ptr(),
                None => std::ptr::null_mut(),
            };
            match ffmpeg::ffi::av_bsf_send_packet(self.ptr, ptr) {
                0 => Ok(()),
                e => Err(ffmpeg::error::Error::from(e)),
            }
        }
    }

    /// Pull the next filtered packet into `packet`. Maps to the usual
    /// `EAGAIN` ("feed more input") and `EOF` ("fully drained") errors.
    pub fn receive(&mut self, packet: &mut AvPacket) -> Result<(), ffmpeg::error::Error> {
        unsafe {
            match ffmpeg::ffi::av_bsf_receive_packet(self.ptr, packet.as_mut_ptr()) {
                0 => Ok(()),
                e => Err(ffmpeg::error::Error::from(e)),
            }
        }
    }

    /// Return internal buffers to the post-construction state.
    pub fn reset(&mut self) {
        unsafe {
            ffmpeg::ffi::av_bsf_flush(self.ptr);
        }
    }

    /// Codec parameters describing the filtered output.
    pub fn output_parameters(&self) -> Result<AvCodecParameters, ffmpeg::error::Error> {
        unsafe {
            let mut parameters = AvCodecParameters::new();
            match ffmpeg::ffi::avcodec_parameters_copy(
                parameters.as_mut_ptr(),
                (*self.ptr).par_out,
            ) {
                r if r >= 0 => Ok(parameters),
                e => Err(ffmpeg::error::Error::from(e)),
            }
        }
    }

    /// Time base of packets produced by the filter.
    pub fn output_time_base(&self) -> AvRational {
        unsafe { (*self.ptr).time_base_out.into() }
    }
}

impl Drop for BsfContext {
    fn drop(&mut self) {
        unsafe {
            ffmpeg::ffi::av_bsf_free(&mut self.ptr);
        }
    }
}

unsafe impl Send for BsfContext {}
unsafe impl Sync for BsfContext {}
