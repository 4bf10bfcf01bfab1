mod bitrate;
mod bsf;
mod decode;
mod encode;
mod error;
mod ffi;
mod ffi_bsf;
mod ffi_hwaccel;
mod filter;
mod frame;
mod hwaccel;
mod init;
mod io;
mod location;
mod mux;
mod options;
mod packet;
pub mod pipeline;
mod stream;
mod time;

pub use bitrate::{parse_bitrate, BitrateSpec};
pub use bsf::BitstreamFilter;
pub use decode::{Decoder, DecoderBuilder};
pub use encode::{Encoder, EncoderCodec, Settings as EncoderSettings};
pub use error::Error;
pub use filter::{CommandFlags, Filter, FilterBuilder};
pub use frame::{Frame, PixelFormat, SampleFormat};
pub use hwaccel::{AutoOptions, HardwareContext, HardwareDeviceType};
pub use init::init;
pub use io::{
    FormatProbe, MediaInput, MediaInputBuilder, MediaRead, MediaWrite, RawDescriptor, RawSource,
    SeekFlags, Source,
};
pub use location::{Location, Url};
pub use mux::{Destination, MediaOutput, MediaOutputBuilder};
pub use options::Options;
pub use packet::Packet;
pub use pipeline::{Chain, NamedPipeline, PipelineControl, Transcode};
pub use stream::{AudioInfo, Stream, StreamInfo, VideoInfo};
pub use time::Time;

/// Re-export inner `ffmpeg` library.
pub use ffmpeg_next as ffmpeg;
