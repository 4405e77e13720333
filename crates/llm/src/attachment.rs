use std::io::Cursor;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, ImageEncoder};
use snafu::{ResultExt, Snafu};

/// Longest edge, in pixels, of an image sent upstream.
pub const MAX_IMAGE_DIMENSION: u32 = 1024;
pub const JPEG_QUALITY: u8 = 80;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AttachmentError {
    #[snafu(display("attachment is empty"))]
    EmptyAttachment { stage: &'static str },
    #[snafu(display("failed to decode attachment image on `{stage}`: {source}"))]
    DecodeImage {
        stage: &'static str,
        source: image::ImageError,
    },
    #[snafu(display("failed to encode attachment image on `{stage}`: {source}"))]
    EncodeImage {
        stage: &'static str,
        source: image::ImageError,
    },
}

/// Decodes raw image bytes, shrinks them to [`MAX_IMAGE_DIMENSION`] and returns a
/// JPEG `data:` URI ready to be placed in an `image_url` block.
pub fn prepare_image(bytes: &[u8]) -> Result<String, AttachmentError> {
    snafu::ensure!(
        !bytes.is_empty(),
        EmptyAttachmentSnafu {
            stage: "prepare-image"
        }
    );

    let image = image::load_from_memory(bytes).context(DecodeImageSnafu {
        stage: "prepare-image-decode",
    })?;

    let image = if image.width() > MAX_IMAGE_DIMENSION || image.height() > MAX_IMAGE_DIMENSION {
        // `resize` keeps the aspect ratio and fits inside the bounding box.
        image.resize(MAX_IMAGE_DIMENSION, MAX_IMAGE_DIMENSION, FilterType::Triangle)
    } else {
        image
    };

    let rgb = image.to_rgb8();
    let mut encoded = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut encoded, JPEG_QUALITY)
        .write_image(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
        .context(EncodeImageSnafu {
            stage: "prepare-image-encode",
        })?;

    Ok(format!(
        "data:image/jpeg;base64,{}",
        STANDARD.encode(encoded.into_inner())
    ))
}
