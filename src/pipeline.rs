//! Terminal pipeline composers.
//!
//! A terminal pipeline owns all of its stages, pumps elements through them
//! on a worker thread and finalizes the output. The returned
//! [`PipelineControl`] is the completion handle: [`PipelineControl::wait`]
//! resolves once the output trailer is written and surfaces the first fatal
//! error otherwise; [`PipelineControl::stop`] requests early termination,
//! after which stages drain and the trailer is still written.
//!
//! Partial pipelines need no composer, they are the stage adapters chained
//! by hand: [`crate::Decoder::frames`] turns packets into frames,
//! [`crate::Filter::frames`] maps frames to frames,
//! [`crate::Encoder::packets`] turns frames into packets and
//! [`crate::BitstreamFilter::packets`] maps packets to packets. Dropping
//! such a chain releases every stage.
//!
//! Backpressure is the pull itself: each element is read from the source
//! only after the previous one has been written downstream, so no more than
//! one element per stage is in flight.

extern crate ffmpeg_next as ffmpeg;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::bsf::BitstreamFilter;
use crate::decode::Decoder;
use crate::encode::Encoder;
use crate::error::Error;
use crate::filter::Filter;
use crate::frame::Frame;
use crate::io::MediaInput;
use crate::mux::MediaOutput;
use crate::packet::Packet;

type Result<T> = std::result::Result<T, Error>;

/// Handle to a running pipeline.
///
/// Dropping the control without waiting requests a stop and joins the
/// worker, so resources are always released.
pub struct PipelineControl {
    cancel: Arc<AtomicBool>,
    packets_written: Arc<AtomicU64>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl PipelineControl {
    fn spawn<F>(worker: F) -> Self
    where
        F: FnOnce(&AtomicBool, &AtomicU64) -> Result<()> + Send + 'static,
    {
        let cancel = Arc::new(AtomicBool::new(false));
        let packets_written = Arc::new(AtomicU64::new(0));
        let handle = {
            let cancel = Arc::clone(&cancel);
            let packets_written = Arc::clone(&packets_written);
            std::thread::spawn(move || worker(&cancel, &packets_written))
        };
        Self {
            cancel,
            packets_written,
            handle: Some(handle),
        }
    }

    /// Request early termination. In-flight elements are drained, the
    /// trailer is written and all stages release. Idempotent.
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Wait for the pipeline to finish. Resolves once the output trailer
    /// has been written; surfaces the first fatal error from any stage
    /// otherwise.
    pub fn wait(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| Error::Canceled)?,
            None => Ok(()),
        }
    }

    /// Whether the worker has finished (successfully or not).
    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }

    /// Number of packets written to the output so far.
    pub fn packets_written(&self) -> u64 {
        self.packets_written.load(Ordering::Relaxed)
    }
}

impl Drop for PipelineControl {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancel.store(true, Ordering::SeqCst);
            let _ = handle.join();
        }
    }
}

/// Stream copy: write every packet of `input` to `output` without
/// transcoding.
pub fn copy(input: MediaInput, output: MediaOutput) -> Result<PipelineControl> {
    copy_with_bsf(input, Vec::new(), output)
}

/// Stream copy through bitstream filters. Each filter applies to the stream
/// it was constructed from; other streams copy untouched.
pub fn copy_with_bsf(
    mut input: MediaInput,
    mut bsfs: Vec<BitstreamFilter>,
    mut output: MediaOutput,
) -> Result<PipelineControl> {
    // Register every input stream up front; bsf-filtered streams carry the
    // filter's output parameters.
    let mut mapping: HashMap<usize, usize> = HashMap::new();
    let mut bsf_by_stream: HashMap<usize, BitstreamFilter> = HashMap::new();
    for bsf in bsfs.drain(..) {
        bsf_by_stream.insert(bsf.stream_index(), bsf);
    }

    for stream in input.streams()? {
        let out_index = match bsf_by_stream.get(&stream.index()) {
            Some(bsf) => output.add_stream_from_bitstream_filter(bsf)?,
            None => output.add_stream_copy(&stream)?,
        };
        mapping.insert(stream.index(), out_index);
    }
    output.write_header()?;

    Ok(PipelineControl::spawn(move |cancel, written| {
        let result = (|| {
            while !cancel.load(Ordering::SeqCst) {
                let packet = match input.next_packet(None)? {
                    Some(packet) => packet,
                    None => break,
                };
                let out_index = match mapping.get(&packet.stream_index()) {
                    Some(out_index) => *out_index,
                    None => continue,
                };
                match bsf_by_stream.get_mut(&packet.stream_index()) {
                    Some(bsf) => {
                        for packet in bsf.process(packet)? {
                            output.write_packet(packet, out_index)?;
                            written.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    None => {
                        output.write_packet(packet, out_index)?;
                        written.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            input.close();
            for (stream_index, bsf) in bsf_by_stream.iter_mut() {
                let out_index = mapping[stream_index];
                for packet in bsf.flush()? {
                    output.write_packet(packet, out_index)?;
                    written.fetch_add(1, Ordering::Relaxed);
                }
            }
            output.write_trailer()?;
            Ok(())
        })();

        input.close();
        // An errored run must not leave a finalized-looking file behind:
        // completion resolves iff the trailer was written.
        if result.is_ok() {
            output.close();
        } else {
            output.abort();
        }
        result
    }))
}

/// Builds a full transcode pipeline: demux, decode, filter, encode, apply
/// output bitstream filters, mux. Streams other than the decoded one are
/// copied by default.
///
/// # Example
///
/// ```ignore
/// let control = Transcode::new(input, decoder, encoder, output)
///     .with_filter(Filter::new("scale=640:360,fps=15", info)?)
///     .start()?;
/// control.wait()?;
/// ```
pub struct Transcode {
    input: MediaInput,
    decoder: Decoder,
    filters: Vec<Filter>,
    encoder: Encoder,
    bsfs: Vec<BitstreamFilter>,
    output: MediaOutput,
    copy_other_streams: bool,
}

impl Transcode {
    pub fn new(
        input: MediaInput,
        decoder: Decoder,
        encoder: Encoder,
        output: MediaOutput,
    ) -> Self {
        Self {
            input,
            decoder,
            filters: Vec::new(),
            encoder,
            bsfs: Vec::new(),
            output,
            copy_other_streams: true,
        }
    }

    /// Append a filter to the frame chain between decoder and encoder.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Append a bitstream filter to the packet chain between encoder and
    /// output.
    pub fn with_bitstream_filter(mut self, bsf: BitstreamFilter) -> Self {
        self.bsfs.push(bsf);
        self
    }

    /// Whether streams other than the decoded one are stream-copied to the
    /// output (default) or dropped.
    pub fn with_stream_copy(mut self, enabled: bool) -> Self {
        self.copy_other_streams = enabled;
        self
    }

    /// Start the pipeline.
    pub fn start(self) -> Result<PipelineControl> {
        let Self {
            mut input,
            mut decoder,
            mut filters,
            mut encoder,
            mut bsfs,
            mut output,
            copy_other_streams,
        } = self;

        if output.needs_global_header()? {
            encoder.request_global_header();
        }

        // Copy lanes register immediately; the encoder's stream has to wait
        // until the encoder opens on the first frame. Copy packets arriving
        // before that are buffered.
        let mut copy_mapping: HashMap<usize, usize> = HashMap::new();
        if copy_other_streams {
            for stream in input.streams()? {
                if stream.index() == decoder.stream_index() {
                    continue;
                }
                let out_index = output.add_stream_copy(&stream)?;
                copy_mapping.insert(stream.index(), out_index);
            }
        }

        Ok(PipelineControl::spawn(move |cancel, written| {
            let mut encoder_out: Option<usize> = None;
            let mut pending: Vec<(usize, Packet)> = Vec::new();

            let result = (|| {
                while !cancel.load(Ordering::SeqCst) {
                    let packet = match input.next_packet(None)? {
                        Some(packet) => packet,
                        None => break,
                    };

                    if packet.stream_index() == decoder.stream_index() {
                        if let Some(frame) = decoder.decode(packet)? {
                            for frame in filters_process(&mut filters, frame)? {
                                let packet = encoder.encode(&frame)?;
                                register_encoder_stream(
                                    &mut output,
                                    &encoder,
                                    &mut encoder_out,
                                    &mut pending,
                                    written,
                                )?;
                                if let Some(packet) = packet {
                                    write_encoded(
                                        &mut output,
                                        &mut bsfs,
                                        packet,
                                        encoder_out.expect("registered above"),
                                        written,
                                    )?;
                                }
                            }
                        }
                    } else if let Some(out_index) = copy_mapping.get(&packet.stream_index()) {
                        if encoder_out.is_some() {
                            output.write_packet(packet, *out_index)?;
                            written.fetch_add(1, Ordering::Relaxed);
                        } else {
                            pending.push((*out_index, packet));
                        }
                    }
                }

                // Normal and canceled termination share the drain path:
                // source closes, then each stage flushes in flow order, then
                // the trailer is written.
                input.close();

                let mut tail_frames = Vec::new();
                while let Some(frame) = decoder.flush()? {
                    tail_frames.push(frame);
                }
                for frame in tail_frames {
                    for frame in filters_process(&mut filters, frame)? {
                        let packet = encoder.encode(&frame)?;
                        register_encoder_stream(
                            &mut output,
                            &encoder,
                            &mut encoder_out,
                            &mut pending,
                            written,
                        )?;
                        if let Some(packet) = packet {
                            write_encoded(
                                &mut output,
                                &mut bsfs,
                                packet,
                                encoder_out.expect("registered above"),
                                written,
                            )?;
                        }
                    }
                }

                let mut flushed = filters_flush(&mut filters)?;
                // An encoder that never opened still registers its stream
                // here, so empty inputs produce a valid header and trailer.
                let mut encoded: Vec<Packet> = Vec::new();
                for frame in flushed.drain(..) {
                    if let Some(packet) = encoder.encode(&frame)? {
                        encoded.push(packet);
                    }
                }
                while let Some(packet) = encoder.flush()? {
                    encoded.push(packet);
                }
                register_encoder_stream(
                    &mut output,
                    &encoder,
                    &mut encoder_out,
                    &mut pending,
                    written,
                )?;
                let encoder_out = encoder_out.expect("registered above");
                for packet in encoded {
                    write_encoded(&mut output, &mut bsfs, packet, encoder_out, written)?;
                }
                for packet in bsfs_flush(&mut bsfs)? {
                    output.write_packet(packet, encoder_out)?;
                    written.fetch_add(1, Ordering::Relaxed);
                }

                output.write_trailer()?;
                Ok(())
            })();

            input.close();
            decoder.close();
            for filter in filters.iter_mut() {
                filter.free();
            }
            encoder.close();
            for bsf in bsfs.iter_mut() {
                bsf.dispose();
            }
            if result.is_ok() {
                output.close();
            } else {
                output.abort();
            }
            result
        }))
    }
}

/// Mux a sequence of frames: filter, encode and write them to `output`.
/// The frame sequence drives the pipeline; it ends when the iterator ends.
pub fn mux_frames<I>(
    frames: I,
    filters: Vec<Filter>,
    encoder: Encoder,
    output: MediaOutput,
) -> Result<PipelineControl>
where
    I: Iterator<Item = Result<Frame>> + Send + 'static,
{
    let mut frames = frames;
    let mut filters = filters;
    let mut encoder = encoder;
    let mut output = output;

    if output.needs_global_header()? {
        encoder.request_global_header();
    }

    Ok(PipelineControl::spawn(move |cancel, written| {
        let mut encoder_out: Option<usize> = None;
        let mut pending: Vec<(usize, Packet)> = Vec::new();
        let mut bsfs = Vec::new();

        let result = (|| {
            while !cancel.load(Ordering::SeqCst) {
                let frame = match frames.next() {
                    Some(frame) => frame?,
                    None => break,
                };
                for frame in filters_process(&mut filters, frame)? {
                    let packet = encoder.encode(&frame)?;
                    register_encoder_stream(
                        &mut output,
                        &encoder,
                        &mut encoder_out,
                        &mut pending,
                        written,
                    )?;
                    if let Some(packet) = packet {
                        write_encoded(
                            &mut output,
                            &mut bsfs,
                            packet,
                            encoder_out.expect("registered above"),
                            written,
                        )?;
                    }
                }
            }

            let mut flushed = filters_flush(&mut filters)?;
            let mut encoded: Vec<Packet> = Vec::new();
            for frame in flushed.drain(..) {
                if let Some(packet) = encoder.encode(&frame)? {
                    encoded.push(packet);
                }
            }
            while let Some(packet) = encoder.flush()? {
                encoded.push(packet);
            }
            register_encoder_stream(&mut output, &encoder, &mut encoder_out, &mut pending, written)?;
            let encoder_out = encoder_out.expect("registered above");
            for packet in encoded {
                output.write_packet(packet, encoder_out)?;
                written.fetch_add(1, Ordering::Relaxed);
            }
            output.write_trailer()?;
            Ok(())
        })();

        for filter in filters.iter_mut() {
            filter.free();
        }
        encoder.close();
        if result.is_ok() {
            output.close();
        } else {
            output.abort();
        }
        result
    }))
}

/// Stage chain of one named stream in a [`NamedPipeline`].
pub enum Chain {
    /// Stream copy, optionally through bitstream filters.
    Passthrough { bsfs: Vec<BitstreamFilter> },
    /// Full transcode.
    Transcode {
        decoder: Decoder,
        filters: Vec<Filter>,
        encoder: Encoder,
        bsfs: Vec<BitstreamFilter>,
    },
}

impl Chain {
    /// Plain stream copy.
    pub fn passthrough() -> Self {
        Chain::Passthrough { bsfs: Vec::new() }
    }
}

struct NamedLane {
    name: String,
    input: MediaInput,
    stream_index: usize,
    chain: Chain,
    out_index: Option<usize>,
    done: bool,
}

/// Builds a multi-stream pipeline keyed by stream name. Each named stream
/// reads from its own input and runs its own stage chain; all streams mux
/// into one shared output. The pipeline completes when every named stream
/// has drained.
///
/// # Example
///
/// ```ignore
/// let control = NamedPipeline::new(output)
///     .stream("video", video_input, video_index, Chain::Transcode { .. })
///     .stream("audio", audio_input, audio_index, Chain::passthrough())
///     .start()?;
/// ```
pub struct NamedPipeline {
    lanes: Vec<NamedLane>,
    output: MediaOutput,
}

impl NamedPipeline {
    pub fn new(output: MediaOutput) -> Self {
        Self {
            lanes: Vec::new(),
            output,
        }
    }

    /// Add a named stream: its input, the index of the elementary stream to
    /// read from that input, and the stage chain to run it through.
    pub fn stream(
        mut self,
        name: &str,
        input: MediaInput,
        stream_index: usize,
        chain: Chain,
    ) -> Self {
        self.lanes.push(NamedLane {
            name: name.to_string(),
            input,
            stream_index,
            chain,
            out_index: None,
            done: false,
        });
        self
    }

    /// Start the pipeline.
    pub fn start(self) -> Result<PipelineControl> {
        let Self {
            mut lanes,
            mut output,
        } = self;

        if lanes.is_empty() {
            return Err(Error::InvalidArgument(
                "named pipeline needs at least one stream".to_string(),
            ));
        }

        // Passthrough lanes register immediately; transcode lanes wait for
        // their encoder to open.
        let needs_global_header = output.needs_global_header()?;
        let mut unregistered = 0usize;
        for lane in lanes.iter_mut() {
            match &mut lane.chain {
                Chain::Passthrough { bsfs } => {
                    let stream = lane.input.stream(lane.stream_index)?;
                    let out_index = match bsfs.last() {
                        Some(bsf) => output.add_stream_from_bitstream_filter(bsf)?,
                        None => output.add_stream_copy(&stream)?,
                    };
                    lane.out_index = Some(out_index);
                }
                Chain::Transcode { encoder, .. } => {
                    if needs_global_header {
                        encoder.request_global_header();
                    }
                    unregistered += 1;
                }
            }
        }
        if unregistered == 0 {
            output.write_header()?;
        }

        Ok(PipelineControl::spawn(move |cancel, written| {
            let mut pending: Vec<(usize, Packet)> = Vec::new();

            let result = (|| {
                // Round-robin across lanes: one packet each per turn, so no
                // lane runs ahead unboundedly.
                loop {
                    if cancel.load(Ordering::SeqCst) {
                        break;
                    }
                    let mut all_done = true;
                    for lane in lanes.iter_mut() {
                        if lane.done {
                            continue;
                        }
                        all_done = false;
                        step_lane(
                            lane,
                            &mut output,
                            &mut unregistered,
                            &mut pending,
                            written,
                        )?;
                    }
                    if all_done {
                        break;
                    }
                }

                // Drain every lane in flow order, then finalize the output.
                for lane in lanes.iter_mut() {
                    lane.input.close();
                    if !lane.done {
                        finish_lane(lane, &mut output, &mut unregistered, &mut pending, written)?;
                    }
                }
                output.write_trailer()?;
                Ok(())
            })();

            for lane in lanes.iter_mut() {
                lane.input.close();
                match &mut lane.chain {
                    Chain::Passthrough { bsfs } => {
                        for bsf in bsfs.iter_mut() {
                            bsf.dispose();
                        }
                    }
                    Chain::Transcode {
                        decoder,
                        filters,
                        encoder,
                        bsfs,
                    } => {
                        decoder.close();
                        for filter in filters.iter_mut() {
                            filter.free();
                        }
                        encoder.close();
                        for bsf in bsfs.iter_mut() {
                            bsf.dispose();
                        }
                    }
                }
            }
            if result.is_ok() {
                output.close();
            } else {
                output.abort();
            }
            result
        }))
    }
}

/// Advance one named lane by one source packet.
fn step_lane(
    lane: &mut NamedLane,
    output: &mut MediaOutput,
    unregistered: &mut usize,
    pending: &mut Vec<(usize, Packet)>,
    written: &AtomicU64,
) -> Result<()> {
    let packet = match lane.input.next_packet(Some(lane.stream_index))? {
        Some(packet) => packet,
        None => {
            finish_lane(lane, output, unregistered, pending, written)?;
            return Ok(());
        }
    };

    match &mut lane.chain {
        Chain::Passthrough { bsfs } => {
            let out_index = lane.out_index.expect("passthrough lanes register early");
            for packet in bsfs_process_one(bsfs, packet)? {
                emit(output, pending, *unregistered, packet, out_index, written)?;
            }
        }
        Chain::Transcode {
            decoder,
            filters,
            encoder,
            bsfs,
        } => {
            if let Some(frame) = decoder.decode(packet)? {
                for frame in filters_process(filters, frame)? {
                    let packet = encoder.encode(&frame)?;
                    register_lane_encoder(
                        encoder,
                        &mut lane.out_index,
                        output,
                        unregistered,
                        pending,
                        written,
                    )?;
                    if let Some(packet) = packet {
                        let out_index = lane.out_index.expect("registered above");
                        for packet in bsfs_process_one(bsfs, packet)? {
                            emit(output, pending, *unregistered, packet, out_index, written)?;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Drain a named lane completely: decoder, filters, encoder, bitstream
/// filters, in flow order.
fn finish_lane(
    lane: &mut NamedLane,
    output: &mut MediaOutput,
    unregistered: &mut usize,
    pending: &mut Vec<(usize, Packet)>,
    written: &AtomicU64,
) -> Result<()> {
    if lane.done {
        return Ok(());
    }

    match &mut lane.chain {
        Chain::Passthrough { bsfs } => {
            let out_index = lane.out_index.expect("passthrough lanes register early");
            for packet in bsfs_flush(bsfs)? {
                emit(output, pending, *unregistered, packet, out_index, written)?;
            }
        }
        Chain::Transcode {
            decoder,
            filters,
            encoder,
            bsfs,
        } => {
            let mut tail = Vec::new();
            while let Some(frame) = decoder.flush()? {
                tail.push(frame);
            }
            let mut frames = Vec::new();
            for frame in tail {
                frames.extend(filters_process(filters, frame)?);
            }
            frames.extend(filters_flush(filters)?);

            let mut encoded = Vec::new();
            for frame in frames {
                if let Some(packet) = encoder.encode(&frame)? {
                    encoded.push(packet);
                }
            }
            while let Some(packet) = encoder.flush()? {
                encoded.push(packet);
            }
            register_lane_encoder(
                encoder,
                &mut lane.out_index,
                output,
                unregistered,
                pending,
                written,
            )?;
            let out_index = lane.out_index.expect("registered above");
            for packet in encoded {
                for packet in bsfs_process_one(bsfs, packet)? {
                    emit(output, pending, *unregistered, packet, out_index, written)?;
                }
            }
            for packet in bsfs_flush(bsfs)? {
                emit(output, pending, *unregistered, packet, out_index, written)?;
            }
        }
    }

    tracing::debug!(target: "media", "pipeline stream {:?} drained", lane.name);
    lane.done = true;
    Ok(())
}

/// Register a transcode lane's output stream once its encoder has opened.
/// When the last lane registers, the header is written and buffered packets
/// flush out.
fn register_lane_encoder(
    encoder: &Encoder,
    out_index: &mut Option<usize>,
    output: &mut MediaOutput,
    unregistered: &mut usize,
    pending: &mut Vec<(usize, Packet)>,
    written: &AtomicU64,
) -> Result<()> {
    if out_index.is_some() || !encoder.is_open() {
        return Ok(());
    }
    *out_index = Some(output.add_stream_from_encoder(encoder)?);
    *unregistered -= 1;
    if *unregistered == 0 {
        output.write_header()?;
        for (index, packet) in pending.drain(..) {
            output.write_packet(packet, index)?;
            written.fetch_add(1, Ordering::Relaxed);
        }
    }
    Ok(())
}

/// Write a packet, or buffer it while the header still waits on lazy
/// stream registration.
fn emit(
    output: &mut MediaOutput,
    pending: &mut Vec<(usize, Packet)>,
    unregistered: usize,
    packet: Packet,
    out_index: usize,
    written: &AtomicU64,
) -> Result<()> {
    if unregistered == 0 {
        output.write_packet(packet, out_index)?;
        written.fetch_add(1, Ordering::Relaxed);
    } else {
        pending.push((out_index, packet));
    }
    Ok(())
}

/// Run one frame through a filter chain, draining every stage.
fn filters_process(filters: &mut [Filter], frame: Frame) -> Result<Vec<Frame>> {
    let mut frames = vec![frame];
    for filter in filters.iter_mut() {
        let mut produced = Vec::new();
        for frame in frames.drain(..) {
            if let Some(filtered) = filter.process(&frame)? {
                produced.push(filtered);
            }
            while let Some(filtered) = filter.receive()? {
                produced.push(filtered);
            }
        }
        frames = produced;
    }
    Ok(frames)
}

/// Flush a filter chain front to back, cascading each stage's tail frames
/// into the next.
fn filters_flush(filters: &mut [Filter]) -> Result<Vec<Frame>> {
    let mut carried: Vec<Frame> = Vec::new();
    for index in 0..filters.len() {
        let filter = &mut filters[index];
        let mut produced = Vec::new();
        for frame in carried.drain(..) {
            if let Some(filtered) = filter.process(&frame)? {
                produced.push(filtered);
            }
            while let Some(filtered) = filter.receive()? {
                produced.push(filtered);
            }
        }
        filter.flush()?;
        while let Some(filtered) = filter.receive()? {
            produced.push(filtered);
        }
        carried = produced;
    }
    Ok(carried)
}

/// Run one packet through a bitstream filter chain.
fn bsfs_process_one(bsfs: &mut [BitstreamFilter], packet: Packet) -> Result<Vec<Packet>> {
    let mut packets = vec![packet];
    for bsf in bsfs.iter_mut() {
        let mut produced = Vec::new();
        for packet in packets.drain(..) {
            produced.extend(bsf.process(packet)?);
        }
        packets = produced;
    }
    Ok(packets)
}

/// Flush a bitstream filter chain front to back.
fn bsfs_flush(bsfs: &mut [BitstreamFilter]) -> Result<Vec<Packet>> {
    let mut carried: Vec<Packet> = Vec::new();
    for index in 0..bsfs.len() {
        let bsf = &mut bsfs[index];
        let mut produced = Vec::new();
        for packet in carried.drain(..) {
            produced.extend(bsf.process(packet)?);
        }
        produced.extend(bsf.flush()?);
        carried = produced;
    }
    Ok(carried)
}

/// Write one encoded packet through the output bitstream filter chain.
fn write_encoded(
    output: &mut MediaOutput,
    bsfs: &mut [BitstreamFilter],
    packet: Packet,
    out_index: usize,
    written: &AtomicU64,
) -> Result<()> {
    for packet in bsfs_process_one(bsfs, packet)? {
        output.write_packet(packet, out_index)?;
        written.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}

/// Register the transcode encoder's output stream once it has opened; write
/// the header and flush buffered copy packets when it was the last thing
/// the header waited on.
fn register_encoder_stream(
    output: &mut MediaOutput,
    encoder: &Encoder,
    encoder_out: &mut Option<usize>,
    pending: &mut Vec<(usize, Packet)>,
    written: &AtomicU64,
) -> Result<()> {
    if encoder_out.is_some() || !encoder.is_open() {
        return Ok(());
    }
    *encoder_out = Some(output.add_stream_from_encoder(encoder)?);
    output.write_header()?;
    for (index, packet) in pending.drain(..) {
        output.write_packet(packet, index)?;
        written.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::Settings;
    use crate::stream::StreamInfo;

    use ffmpeg::codec::Id as AvCodecId;
    use ffmpeg::util::format::Pixel as AvPixel;
    use ffmpeg::util::format::{sample, Sample as AvSample};
    use ffmpeg::ChannelLayout;
    use ffmpeg::Rational as AvRational;

    const VIDEO_FRAMES: i64 = 25;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("avpipe-pipe-{}-{name}", std::process::id()))
    }

    fn video_frame(pts: i64) -> Frame {
        let mut frame = ffmpeg::frame::Video::new(AvPixel::YUV420P, 320, 240);
        for plane in 0..frame.planes() {
            let fill = if plane == 0 { (16 + pts * 2) as u8 } else { 128 };
            frame.data_mut(plane).fill(fill);
        }
        frame.set_pts(Some(pts));
        Frame::Video(frame)
    }

    /// Synthesize a small MPEG-4 video file so no test fixtures are needed.
    fn make_video_file(path: &std::path::Path) {
        let _ = std::fs::remove_file(path);
        let info = StreamInfo::video(
            320,
            240,
            AvPixel::YUV420P,
            AvRational::new(25, 1),
            AvRational::new(1, 25),
        );
        let mut encoder = Encoder::new(
            AvCodecId::MPEG4,
            info,
            Settings::new().with_bitrate(400_000).with_gop_size(12),
        )
        .unwrap();
        let mut output = MediaOutput::open(path).unwrap();
        if output.needs_global_header().unwrap() {
            encoder.request_global_header();
        }

        let mut packets = Vec::new();
        for pts in 0..VIDEO_FRAMES {
            if let Some(packet) = encoder.encode(&video_frame(pts)).unwrap() {
                packets.push(packet);
            }
        }
        while let Some(packet) = encoder.flush().unwrap() {
            packets.push(packet);
        }

        let index = output.add_stream_from_encoder(&encoder).unwrap();
        output.write_header().unwrap();
        for packet in packets {
            output.write_packet(packet, index).unwrap();
        }
        output.write_trailer().unwrap();
    }

    fn count_packets(path: &std::path::Path) -> usize {
        let mut input = MediaInput::open(path).unwrap();
        let count = input
            .packets(Some(0))
            .unwrap()
            .map(|packet| packet.unwrap())
            .count();
        count
    }

    #[test]
    fn remux_roundtrip_preserves_packet_count() {
        crate::init().unwrap();
        let source = temp_path("remux-src.mp4");
        let copied = temp_path("remux-dst.mkv");
        make_video_file(&source);
        let source_packets = count_packets(&source);
        assert_eq!(source_packets, VIDEO_FRAMES as usize);

        let input = MediaInput::open(source.as_path()).unwrap();
        let output = MediaOutput::open(copied.as_path()).unwrap();
        let control = copy(input, output).unwrap();
        control.wait().unwrap();

        let mut result = MediaInput::open(copied.as_path()).unwrap();
        assert_eq!(result.streams().unwrap().len(), 1);
        drop(result);
        assert_eq!(count_packets(&copied), source_packets);

        let _ = std::fs::remove_file(&source);
        let _ = std::fs::remove_file(&copied);
    }

    #[test]
    fn copy_through_null_bsf_is_transparent() {
        crate::init().unwrap();
        let source = temp_path("bsf-src.mp4");
        let copied = temp_path("bsf-dst.mp4");
        make_video_file(&source);

        let input = MediaInput::open(source.as_path()).unwrap();
        let bsf = BitstreamFilter::new("null", &input.video(0).unwrap()).unwrap();
        let output = MediaOutput::open(copied.as_path()).unwrap();
        let control = copy_with_bsf(input, vec![bsf], output).unwrap();
        control.wait().unwrap();

        assert_eq!(count_packets(&copied), VIDEO_FRAMES as usize);

        let _ = std::fs::remove_file(&source);
        let _ = std::fs::remove_file(&copied);
    }

    #[test]
    fn transcode_with_scale_filter() {
        crate::init().unwrap();
        let source = temp_path("transcode-src.mp4");
        let target = temp_path("transcode-dst.mp4");
        make_video_file(&source);

        let input = MediaInput::open(source.as_path()).unwrap();
        let stream = input.video(0).unwrap();
        let decoder = Decoder::new(&stream).unwrap();
        let info = decoder.output_stream_info().unwrap();
        let filter = Filter::new("scale=160:120", info.clone()).unwrap();
        let encoder = Encoder::new(
            AvCodecId::MPEG4,
            StreamInfo::video(
                160,
                120,
                AvPixel::YUV420P,
                AvRational::new(25, 1),
                info.time_base(),
            ),
            Settings::new().with_bitrate("200k"),
        )
        .unwrap();
        let output = MediaOutput::open(target.as_path()).unwrap();

        let control = Transcode::new(input, decoder, encoder, output)
            .with_filter(filter)
            .start()
            .unwrap();
        control.wait().unwrap();

        // Decode the result and verify dimensions and frame count.
        let mut result = MediaInput::open(target.as_path()).unwrap();
        let mut decoder = Decoder::new(&result.video(0).unwrap()).unwrap();
        let mut frames = 0;
        let mut last_pts = None;
        for frame in decoder.frames(result.packets(Some(0)).unwrap()) {
            let frame = frame.unwrap();
            let video = frame.video().unwrap();
            assert_eq!((video.width(), video.height()), (160, 120));
            if let (Some(last), Some(pts)) = (last_pts, frame.pts()) {
                assert!(pts > last, "pts must increase in display order");
            }
            last_pts = frame.pts().or(last_pts);
            frames += 1;
        }
        assert_eq!(frames, VIDEO_FRAMES);

        let _ = std::fs::remove_file(&source);
        let _ = std::fs::remove_file(&target);
    }

    #[test]
    fn frames_in_muxed_out() {
        crate::init().unwrap();
        let target = temp_path("frames-dst.mp4");
        let _ = std::fs::remove_file(&target);

        let info = StreamInfo::video(
            320,
            240,
            AvPixel::YUV420P,
            AvRational::new(25, 1),
            AvRational::new(1, 25),
        );
        let encoder = Encoder::new(AvCodecId::MPEG4, info, Settings::new()).unwrap();
        let output = MediaOutput::open(target.as_path()).unwrap();
        let frames = (0..10).map(|pts| Ok(video_frame(pts)));

        let control = mux_frames(frames, Vec::new(), encoder, output).unwrap();
        control.wait().unwrap();
        assert_eq!(count_packets(&target), 10);

        let _ = std::fs::remove_file(&target);
    }

    #[test]
    fn named_pipeline_muxes_two_streams() {
        crate::init().unwrap();
        let source_a = temp_path("named-a.mp4");
        let source_b = temp_path("named-b.mp4");
        let target = temp_path("named-dst.mkv");
        make_video_file(&source_a);
        make_video_file(&source_b);

        let input_a = MediaInput::open(source_a.as_path()).unwrap();
        let input_b = MediaInput::open(source_b.as_path()).unwrap();
        let stream_b = input_b.video(0).unwrap();
        let decoder = Decoder::new(&stream_b).unwrap();
        let info = decoder.output_stream_info().unwrap();
        let encoder = Encoder::new(
            AvCodecId::MPEG4,
            StreamInfo::video(
                320,
                240,
                AvPixel::YUV420P,
                AvRational::new(25, 1),
                info.time_base(),
            ),
            Settings::new(),
        )
        .unwrap();
        let output = MediaOutput::open(target.as_path()).unwrap();

        let control = NamedPipeline::new(output)
            .stream("copy", input_a, 0, Chain::passthrough())
            .stream(
                "encode",
                input_b,
                0,
                Chain::Transcode {
                    decoder,
                    filters: Vec::new(),
                    encoder,
                    bsfs: Vec::new(),
                },
            )
            .start()
            .unwrap();
        control.wait().unwrap();

        let result = MediaInput::open(target.as_path()).unwrap();
        assert_eq!(result.streams().unwrap().len(), 2);

        let _ = std::fs::remove_file(&source_a);
        let _ = std::fs::remove_file(&source_b);
        let _ = std::fs::remove_file(&target);
    }

    #[test]
    fn stop_settles_and_releases_the_output() {
        crate::init().unwrap();
        let source = temp_path("stop-src.mp4");
        let target = temp_path("stop-dst.mkv");
        make_video_file(&source);

        let input = MediaInput::open(source.as_path()).unwrap();
        let output = MediaOutput::open(target.as_path()).unwrap();
        let control = copy(input, output).unwrap();
        control.stop();
        control.wait().unwrap();

        // The file handle is released; reopening for write must work.
        std::fs::OpenOptions::new()
            .write(true)
            .open(&target)
            .unwrap();

        let _ = std::fs::remove_file(&source);
        let _ = std::fs::remove_file(&target);
    }

    #[test]
    fn failing_pipeline_rejects_without_finalizing() {
        crate::init().unwrap();
        let source = temp_path("fail-src.mp4");
        let target = temp_path("fail-dst.mp4");
        make_video_file(&source);

        let input = MediaInput::open(source.as_path()).unwrap();
        let stream = input.video(0).unwrap();
        let decoder = Decoder::new(&stream).unwrap();
        // The encoder dimensions disagree with the decoded frames, so the
        // first encode fails inside the worker.
        let encoder = Encoder::new(
            AvCodecId::MPEG4,
            StreamInfo::video(
                160,
                120,
                AvPixel::YUV420P,
                AvRational::new(25, 1),
                AvRational::new(1, 25),
            ),
            Settings::new(),
        )
        .unwrap();
        let output = MediaOutput::open(target.as_path()).unwrap();

        let control = Transcode::new(input, decoder, encoder, output)
            .with_stream_copy(false)
            .start()
            .unwrap();
        assert!(control.wait().is_err());
        // Completion rejected, so no trailer: the result must not read back
        // as a valid container.
        assert!(MediaInput::open(target.as_path()).is_err());

        let _ = std::fs::remove_file(&source);
        let _ = std::fs::remove_file(&target);
    }

    #[test]
    fn abort_leaves_the_container_unfinalized() {
        crate::init().unwrap();
        let target = temp_path("abort.mp4");
        let _ = std::fs::remove_file(&target);

        let info = StreamInfo::video(
            320,
            240,
            AvPixel::YUV420P,
            AvRational::new(25, 1),
            AvRational::new(1, 25),
        );
        let mut encoder = Encoder::new(AvCodecId::MPEG4, info, Settings::new()).unwrap();
        let mut output = MediaOutput::open(target.as_path()).unwrap();
        if output.needs_global_header().unwrap() {
            encoder.request_global_header();
        }

        let mut packets = Vec::new();
        for pts in 0..5 {
            if let Some(packet) = encoder.encode(&video_frame(pts)).unwrap() {
                packets.push(packet);
            }
        }
        while let Some(packet) = encoder.flush().unwrap() {
            packets.push(packet);
        }
        let index = output.add_stream_from_encoder(&encoder).unwrap();
        output.write_header().unwrap();
        for packet in packets {
            output.write_packet(packet, index).unwrap();
        }

        output.abort();
        assert!(!output.trailer_written());
        // Without the trailer the mp4 has no moov atom and is not readable.
        assert!(MediaInput::open(target.as_path()).is_err());

        let _ = std::fs::remove_file(&target);
    }

    #[test]
    fn audio_pcm_roundtrip() {
        crate::init().unwrap();
        let target = temp_path("audio.wav");
        let _ = std::fs::remove_file(&target);

        let info = StreamInfo::audio(
            44_100,
            AvSample::I16(sample::Type::Packed),
            ChannelLayout::MONO,
            AvRational::new(1, 44_100),
        );
        let mut encoder = Encoder::new(AvCodecId::PCM_S16LE, info, Settings::new()).unwrap();
        let mut output = MediaOutput::open(target.as_path()).unwrap();

        let mut packets = Vec::new();
        for index in 0..20i64 {
            let mut frame = ffmpeg::frame::Audio::new(
                AvSample::I16(sample::Type::Packed),
                1024,
                ChannelLayout::MONO,
            );
            frame.set_rate(44_100);
            frame.set_pts(Some(index * 1024));
            if let Some(packet) = encoder.encode(&Frame::Audio(frame)).unwrap() {
                packets.push(packet);
            }
        }
        while let Some(packet) = encoder.flush().unwrap() {
            packets.push(packet);
        }

        let index = output.add_stream_from_encoder(&encoder).unwrap();
        output.write_header().unwrap();
        for packet in packets {
            output.write_packet(packet, index).unwrap();
        }
        output.write_trailer().unwrap();
        output.close();

        let mut input = MediaInput::open(target.as_path()).unwrap();
        let stream = input.audio(0).unwrap();
        assert_eq!(stream.media_type(), ffmpeg::media::Type::Audio);
        let mut decoder = Decoder::new(&stream).unwrap();
        let mut samples = 0usize;
        for frame in decoder.frames(input.packets(None).unwrap()) {
            let frame = frame.unwrap();
            samples += frame.audio().unwrap().samples();
        }
        assert_eq!(samples, 20 * 1024);

        let _ = std::fs::remove_file(&target);
    }

    #[test]
    fn probe_recognizes_synthesized_file() {
        crate::init().unwrap();
        let source = temp_path("probe.mp4");
        make_video_file(&source);

        let probe = MediaInput::probe_format(source.as_path())
            .unwrap()
            .expect("mp4 must be recognized");
        assert!(probe.format.contains("mp4"));
        assert!(probe.confidence > 0.0);

        let _ = std::fs::remove_file(&source);
    }
}

