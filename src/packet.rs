extern crate ffmpeg_next as ffmpeg;

use ffmpeg::codec::packet::Packet as AvPacket;
use ffmpeg::Rational as AvRational;

use crate::time::Time;

/// A compressed, timestamped unit of media data.
///
/// Every packet carries the time base of the stage that produced it: the
/// demuxer stream, the encoder, or a bitstream filter. Consumers that need
/// timestamps in another time base rescale against that carried time base;
/// [`crate::MediaOutput::write_packet`] does so automatically.
#[derive(Clone)]
pub struct Packet {
    inner: AvPacket,
    time_base: AvRational,
}

impl Packet {
    /// Create a new packet from a native packet and the time base its
    /// timestamps are expressed in.
    pub(crate) fn new(inner: AvPacket, time_base: AvRational) -> Self {
        Self { inner, time_base }
    }

    /// Index of the stream this packet belongs to.
    pub fn stream_index(&self) -> usize {
        self.inner.stream()
    }

    /// Time base the packet timestamps are expressed in.
    pub fn time_base(&self) -> AvRational {
        self.time_base
    }

    /// Get packet PTS (presentation timestamp).
    pub fn pts(&self) -> Time {
        Time::new(self.inner.pts(), self.time_base)
    }

    /// Get packet DTS (decoder timestamp).
    pub fn dts(&self) -> Time {
        Time::new(self.inner.dts(), self.time_base)
    }

    /// Get packet duration.
    pub fn duration(&self) -> Time {
        Time::new(Some(self.inner.duration()), self.time_base)
    }

    /// Whether the packet contains a keyframe.
    pub fn is_key(&self) -> bool {
        self.inner.is_key()
    }

    /// Size of the compressed payload in bytes.
    pub fn size(&self) -> usize {
        self.inner.size()
    }

    /// The compressed payload.
    pub fn data(&self) -> Option<&[u8]> {
        self.inner.data()
    }

    /// Set packet PTS (presentation timestamp). The timestamp is rescaled
    /// into the packet's carried time base.
    pub fn set_pts(&mut self, timestamp: &Time) {
        self.inner.set_pts(timestamp.rescale(self.time_base).value());
    }

    /// Set packet DTS (decoder timestamp). The timestamp is rescaled into
    /// the packet's carried time base.
    pub fn set_dts(&mut self, timestamp: &Time) {
        self.inner.set_dts(timestamp.rescale(self.time_base).value());
    }

    /// Downcast to the native packet and its carried time base.
    pub(crate) fn into_inner_parts(self) -> (AvPacket, AvRational) {
        (self.inner, self.time_base)
    }
}

unsafe impl Send for Packet {}
unsafe impl Sync for Packet {}
