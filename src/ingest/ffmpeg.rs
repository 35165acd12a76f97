//! FFmpeg-backed frame source for files, RTSP/HTTP URLs and capture devices.
//!
//! Decoding happens in memory; every decoded frame is converted to RGB24 at
//! its native size. Resizing to the pipeline's working size is left to the
//! caller.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::{FrameSource, ReadOutcome, SourceStats};
use crate::frame::Frame;

struct Decoding {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    eof_sent: bool,
}

// SAFETY: the ffmpeg contexts are owned exclusively by one `Decoding`, which
// moves between threads with its pipeline but is never used from two at once.
unsafe impl Send for Decoding {}

pub(crate) struct FfmpegSource {
    identifier: Option<String>,
    decoding: Option<Decoding>,
    frames_read: u64,
    rewinds: u64,
}

impl FfmpegSource {
    pub(crate) fn new() -> Self {
        Self {
            identifier: None,
            decoding: None,
            frames_read: 0,
            rewinds: 0,
        }
    }
}

fn open_decoding(source_id: &str) -> Result<Decoding> {
    ffmpeg::init().context("initialize ffmpeg")?;
    let input = ffmpeg::format::input(&source_id)
        .with_context(|| format!("failed to open '{}' with ffmpeg", source_id))?;
    let input_stream = input
        .streams()
        .best(ffmpeg::media::Type::Video)
        .ok_or_else(|| anyhow!("'{}' has no video track", source_id))?;
    let stream_index = input_stream.index();
    let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
        .context("load video decoder parameters")?;
    let decoder = context
        .decoder()
        .video()
        .context("open ffmpeg video decoder")?;

    let scaler = ffmpeg::software::scaling::context::Context::get(
        decoder.format(),
        decoder.width(),
        decoder.height(),
        ffmpeg::util::format::pixel::Pixel::RGB24,
        decoder.width(),
        decoder.height(),
        ffmpeg::software::scaling::flag::Flags::BILINEAR,
    )
    .context("create ffmpeg scaler")?;

    Ok(Decoding {
        input,
        stream_index,
        decoder,
        scaler,
        eof_sent: false,
    })
}

fn receive(
    decoder: &mut ffmpeg::codec::decoder::Video,
    scaler: &mut ffmpeg::software::scaling::Context,
) -> Result<Option<Frame>> {
    let mut decoded = ffmpeg::frame::Video::empty();
    if decoder.receive_frame(&mut decoded).is_err() {
        return Ok(None);
    }
    let mut rgb_frame = ffmpeg::frame::Video::empty();
    scaler
        .run(&decoded, &mut rgb_frame)
        .context("scale frame to RGB")?;
    let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
    Frame::from_rgb(pixels, width, height).map(Some)
}

impl Decoding {
    fn next(&mut self) -> Result<Option<Frame>> {
        if let Some(frame) = receive(&mut self.decoder, &mut self.scaler)? {
            return Ok(Some(frame));
        }
        for (stream, packet) in self.input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            self.decoder
                .send_packet(&packet)
                .context("send packet to ffmpeg decoder")?;
            if let Some(frame) = receive(&mut self.decoder, &mut self.scaler)? {
                return Ok(Some(frame));
            }
        }
        if !self.eof_sent {
            self.eof_sent = true;
            self.decoder.send_eof().context("flush ffmpeg decoder")?;
        }
        receive(&mut self.decoder, &mut self.scaler)
    }

    fn rewind(&mut self) -> Result<()> {
        self.input
            .seek(0, ..)
            .context("seek to start of input")?;
        self.decoder.flush();
        self.eof_sent = false;
        Ok(())
    }
}

impl FrameSource for FfmpegSource {
    fn open(&mut self, source_id: &str) -> Result<()> {
        let decoding = open_decoding(source_id)?;
        log::info!(
            "FfmpegSource: opened {} ({}x{})",
            source_id,
            decoding.decoder.width(),
            decoding.decoder.height()
        );
        self.decoding = Some(decoding);
        self.identifier = Some(source_id.to_string());
        Ok(())
    }

    fn read(&mut self) -> Result<ReadOutcome> {
        let decoding = self
            .decoding
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg source read before open"))?;
        match decoding.next()? {
            Some(frame) => {
                self.frames_read += 1;
                Ok(ReadOutcome::Frame(frame))
            }
            None => Ok(ReadOutcome::EndOfStream),
        }
    }

    fn rewind(&mut self) -> Result<()> {
        let decoding = self
            .decoding
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg source rewound before open"))?;
        decoding.rewind()?;
        self.rewinds += 1;
        Ok(())
    }

    fn release(&mut self) {
        if self.decoding.take().is_some() {
            log::debug!(
                "FfmpegSource: released {}",
                self.identifier.as_deref().unwrap_or("")
            );
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_read: self.frames_read,
            rewinds: self.rewinds,
            identifier: self.identifier.clone().unwrap_or_default(),
        }
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let pixels = data
            .get(..row_bytes * height as usize)
            .context("ffmpeg frame is shorter than its dimensions")?;
        return Ok((pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
