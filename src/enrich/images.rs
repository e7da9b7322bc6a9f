use image::codecs::jpeg::JpegEncoder;
use image::ImageResult;

/// Decodes any supported image format and re-encodes it as a lossy JPEG.
/// Transparency is flattened since JPEG carries no alpha channel.
pub fn recompress_jpeg(raw: &[u8], quality: u8) -> ImageResult<Vec<u8>> {
    let decoded = image::load_from_memory(raw)?;
    let rgb = decoded.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode_image(&rgb)?;
    Ok(out)
}
