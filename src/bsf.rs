extern crate ffmpeg_next as ffmpeg;

use std::collections::VecDeque;

use ffmpeg::codec::packet::Packet as AvPacket;
use ffmpeg::codec::Parameters as AvCodecParameters;
use ffmpeg::util::error::EAGAIN;
use ffmpeg::{Error as AvError, Rational as AvRational};

use crate::error::Error;
use crate::ffi_bsf;
use crate::packet::Packet;
use crate::stream::Stream;

type Result<T> = std::result::Result<T, Error>;

/// A bitstream filter chain for one stream's compressed data.
///
/// Operates on packets without decoding, e.g. `"h264_mp4toannexb"` to turn
/// AVCC H.264 into Annex-B, or `"null"` as a passthrough. One input packet
/// may produce zero, one or many output packets.
///
/// # Example
///
/// ```ignore
/// let stream = input.video(0)?;
/// let mut bsf = BitstreamFilter::new("h264_mp4toannexb", &stream)?;
/// for packet in bsf.packets(input.packets(Some(stream.index()))?) {
///     let packet = packet?;
/// }
/// ```
pub struct BitstreamFilter {
    bsf: Option<ffi_bsf::BsfContext>,
    name: String,
    stream: Stream,
    output_time_base: AvRational,
    flushing: bool,
}

impl BitstreamFilter {
    /// Create a bitstream filter by name, configured from the given
    /// stream's codec parameters and time base.
    pub fn new(name: &str, stream: &Stream) -> Result<Self> {
        crate::init()?;
        let bsf = ffi_bsf::BsfContext::new(name, stream.parameters(), stream.time_base())
            .map_err(|err| match err {
                AvError::BsfNotFound => Error::CodecNotFound,
                err => Error::BsfFailed(err),
            })?;
        let output_time_base = bsf.output_time_base();

        Ok(Self {
            bsf: Some(bsf),
            name: name.to_string(),
            stream: stream.clone(),
            output_time_base,
            flushing: false,
        })
    }

    /// Submit one packet and collect all immediately available outputs.
    /// Output packets carry the filter's output time base.
    pub fn process(&mut self, packet: Packet) -> Result<Vec<Packet>> {
        if self.flushing {
            return Err(Error::InvalidState("process after flush"));
        }
        let output_time_base = self.output_time_base;
        let bsf = self.active()?;

        let (mut packet, _) = packet.into_inner_parts();
        let mut output = Vec::new();
        match bsf.send(Some(&mut packet)) {
            Ok(()) => {}
            Err(AvError::Other { errno }) if errno == EAGAIN => {
                // Drain pending output, then the packet fits.
                Self::drain_into(bsf, output_time_base, &mut output)?;
                bsf.send(Some(&mut packet)).map_err(Error::BsfFailed)?;
            }
            Err(err) => return Err(Error::BsfFailed(err)),
        }

        Self::drain_into(bsf, output_time_base, &mut output)?;
        Ok(output)
    }

    /// Signal end-of-stream and collect everything still buffered.
    pub fn flush(&mut self) -> Result<Vec<Packet>> {
        if self.bsf.is_none() {
            return Err(Error::InvalidState("operation on disposed bitstream filter"));
        }
        let output_time_base = self.output_time_base;

        if !self.flushing {
            self.flushing = true;
            let bsf = self.bsf.as_mut().expect("checked above");
            match bsf.send(None) {
                Ok(()) | Err(AvError::Eof) => {}
                Err(err) => return Err(Error::BsfFailed(err)),
            }
        }

        let bsf = self.bsf.as_mut().expect("checked above");
        let mut output = Vec::new();
        Self::drain_into(bsf, output_time_base, &mut output)?;
        Ok(output)
    }

    /// Lazy sequence draining buffered packets after end-of-stream.
    pub fn flush_packets(&mut self) -> impl Iterator<Item = Result<Packet>> + '_ {
        let mut pending: VecDeque<Packet> = VecDeque::new();
        let mut done = false;
        std::iter::from_fn(move || {
            if let Some(packet) = pending.pop_front() {
                return Some(Ok(packet));
            }
            if done {
                return None;
            }
            match self.flush() {
                Ok(packets) => {
                    done = true;
                    pending.extend(packets);
                    pending.pop_front().map(Ok)
                }
                Err(err) => {
                    done = true;
                    Some(Err(err))
                }
            }
        })
    }

    /// Lazy sequence filtering an entire packet sequence, flush included.
    /// Packets for other streams are filtered out.
    pub fn packets<I>(&mut self, packets: I) -> Packets<'_, I>
    where
        I: Iterator<Item = Result<Packet>>,
    {
        Packets {
            bsf: self,
            packets: Some(packets),
            pending: VecDeque::new(),
        }
    }

    /// Return internal buffers to the post-construction state, as if no
    /// input had been sent yet.
    pub fn reset(&mut self) -> Result<()> {
        let bsf = self.active()?;
        bsf.reset();
        self.flushing = false;
        Ok(())
    }

    /// Codec parameters describing the filtered output. Stream copy setups
    /// configure their output stream from these instead of the input's.
    pub fn output_codec_parameters(&self) -> Result<AvCodecParameters> {
        self.bsf
            .as_ref()
            .ok_or(Error::InvalidState("operation on disposed bitstream filter"))?
            .output_parameters()
            .map_err(Error::BsfFailed)
    }

    /// Time base of packets produced by this filter.
    pub fn output_time_base(&self) -> AvRational {
        self.output_time_base
    }

    /// The filter name this chain was created from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The stream this filter was configured from.
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Index of the stream this filter consumes.
    pub fn stream_index(&self) -> usize {
        self.stream.index()
    }

    /// Release the filter context. Idempotent.
    pub fn dispose(&mut self) {
        self.bsf.take();
    }

    fn active(&mut self) -> Result<&mut ffi_bsf::BsfContext> {
        self.bsf
            .as_mut()
            .ok_or(Error::InvalidState("operation on disposed bitstream filter"))
    }

    fn drain_into(
        bsf: &mut ffi_bsf::BsfContext,
        output_time_base: AvRational,
        output: &mut Vec<Packet>,
    ) -> Result<()> {
        loop {
            let mut packet = AvPacket::empty();
            match bsf.receive(&mut packet) {
                Ok(()) => output.push(Packet::new(packet, output_time_base)),
                Err(AvError::Other { errno }) if errno == EAGAIN => break,
                Err(AvError::Eof) => break,
                Err(err) => return Err(Error::BsfFailed(err)),
            }
        }
        Ok(())
    }
}

unsafe impl Send for BitstreamFilter {}

/// Lazy packet sequence produced by [`BitstreamFilter::packets`].
pub struct Packets<'a, I> {
    bsf: &'a mut BitstreamFilter,
    packets: Option<I>,
    pending: VecDeque<Packet>,
}

impl<I> Iterator for Packets<'_, I>
where
    I: Iterator<Item = Result<Packet>>,
{
    type Item = Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(packet) = self.pending.pop_front() {
                return Some(Ok(packet));
            }
            match self.packets.as_mut() {
                Some(packets) => match packets.next() {
                    Some(Ok(packet)) => {
                        if packet.stream_index() != self.bsf.stream_index() {
                            continue;
                        }
                        match self.bsf.process(packet) {
                            Ok(produced) => self.pending.extend(produced),
                            Err(err) => return Some(Err(err)),
                        }
                    }
                    Some(Err(err)) => return Some(Err(err)),
                    None => {
                        self.packets = None;
                        match self.bsf.flush() {
                            Ok(produced) => self.pending.extend(produced),
                            Err(err) => return Some(Err(err)),
                        }
                    }
                },
                None => {
                    if self.pending.is_empty() {
                        return None;
                    }
                }
            }
        }
    }
}
