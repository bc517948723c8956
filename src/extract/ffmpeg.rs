//! FFmpeg-backed decoding for arbitrary video containers.

use std::path::Path;

use ffmpeg_next as ffmpeg;
use image::RgbImage;

use super::FrameWriter;
use crate::error::{PipelineError, Result};

fn extraction_err(context: &str, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Extraction(format!("{context}: {err}"))
}

/// Decodes the best video stream of `path` frame by frame, converting each
/// frame to RGB before handing it to the writer.
pub(super) fn decode(path: &Path, writer: &mut FrameWriter<'_>) -> Result<Option<f64>> {
    ffmpeg::init().map_err(|e| extraction_err("initialize ffmpeg", e))?;
    let mut input = ffmpeg::format::input(&path)
        .map_err(|e| extraction_err(&format!("open '{}' with ffmpeg", path.display()), e))?;
    let input_stream = input
        .streams()
        .best(ffmpeg::media::Type::Video)
        .ok_or_else(|| PipelineError::Extraction(format!("{} has no video track", path.display())))?;
    let stream_index = input_stream.index();
    let rate = input_stream.avg_frame_rate();
    let frame_rate = (rate.numerator() > 0 && rate.denominator() > 0).then(|| f64::from(rate));
    let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
        .map_err(|e| extraction_err("load video decoder parameters", e))?;
    let mut decoder = context
        .decoder()
        .video()
        .map_err(|e| extraction_err("open ffmpeg video decoder", e))?;

    let mut scaler = ffmpeg::software::scaling::context::Context::get(
        decoder.format(),
        decoder.width(),
        decoder.height(),
        ffmpeg::util::format::pixel::Pixel::RGB24,
        decoder.width(),
        decoder.height(),
        ffmpeg::software::scaling::flag::Flags::BILINEAR,
    )
    .map_err(|e| extraction_err("create ffmpeg scaler", e))?;

    for (stream, packet) in input.packets() {
        if stream.index() != stream_index {
            continue;
        }
        decoder
            .send_packet(&packet)
            .map_err(|e| extraction_err("send packet to ffmpeg decoder", e))?;
        drain_decoder(&mut decoder, &mut scaler, writer)?;
    }
    decoder
        .send_eof()
        .map_err(|e| extraction_err("flush ffmpeg decoder", e))?;
    drain_decoder(&mut decoder, &mut scaler, writer)?;

    Ok(frame_rate)
}

fn drain_decoder(
    decoder: &mut ffmpeg::codec::decoder::Video,
    scaler: &mut ffmpeg::software::scaling::Context,
    writer: &mut FrameWriter<'_>,
) -> Result<()> {
    let mut decoded = ffmpeg::frame::Video::empty();
    let mut rgb_frame = ffmpeg::frame::Video::empty();
    while decoder.receive_frame(&mut decoded).is_ok() {
        scaler
            .run(&decoded, &mut rgb_frame)
            .map_err(|e| extraction_err("scale frame to RGB", e))?;
        let image = frame_to_image(&rgb_frame)?;
        writer.write(&image)?;
    }
    Ok(())
}

fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<RgbImage> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * height as usize)
            .ok_or_else(|| PipelineError::Extraction("ffmpeg frame is truncated".to_string()))?
            .to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            let end = start + row_bytes;
            pixels.extend_from_slice(data.get(start..end).ok_or_else(|| {
                PipelineError::Extraction("ffmpeg frame row is out of bounds".to_string())
            })?);
        }
        pixels
    };

    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| PipelineError::Extraction("ffmpeg frame has unexpected size".to_string()))
}
