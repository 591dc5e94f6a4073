//! Canned response shapes.

use http::{header, HeaderValue, StatusCode};
use serde::Serialize;
use thiserror::Error;

use crate::listener::context::HttpResponse;

const CACHE_FOREVER_OFF: &str = "max-age=0, no-cache, no-store, must-revalidate";
const CACHE_SIX_HOURS: &str = "max-age=21600";

/// Image formats handlers may ask to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Bmp,
    Gif,
    Png,
    Jpeg,
    Ico,
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ImageFormat::Bmp => "bmp",
            ImageFormat::Gif => "gif",
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Ico => "ico",
        };
        f.write_str(name)
    }
}

/// Error type for response shaping.
#[derive(Debug, Error)]
pub enum ResponderError {
    #[error("cannot serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("image format {0} is not supported")]
    UnsupportedImageFormat(ImageFormat),

    #[error("failed to write response: {0}")]
    Io(#[from] std::io::Error),
}

/// Send a UTF-8 text body. Always eligible for compression.
pub fn send_text(
    response: &mut dyn HttpResponse,
    content: &str,
    mime_type: &str,
) -> Result<(), ResponderError> {
    response.set_status(StatusCode::OK);
    set_content_type(response, mime_type);
    response.enable_compression(true);
    response.write(content.as_bytes())?;
    Ok(())
}

/// Serialize `payload` as JSON, optionally wrapped in a JSONP callback.
///
/// Browsers must never cache these; the payload changes every second. The
/// mime type stays JSON unless the caller overrides it.
pub fn send_json<T: Serialize>(
    response: &mut dyn HttpResponse,
    payload: &T,
    jsonp_callback: Option<&str>,
    mime_type: Option<&str>,
) -> Result<(), ResponderError> {
    let json = serde_json::to_string(payload)?;
    let body = match jsonp_callback {
        Some(callback) => format!("{callback}({json})"),
        None => json,
    };

    response.set_status(StatusCode::OK);
    set_content_type(response, mime_type.unwrap_or("application/json"));
    response.set_header(
        header::CACHE_CONTROL,
        HeaderValue::from_static(CACHE_FOREVER_OFF),
    );
    response.enable_compression(true);
    response.write(body.as_bytes())?;
    Ok(())
}

/// Send an image. Only bitmap, GIF and PNG are served; image bytes are
/// already compressed, so the response never is.
pub fn send_image(
    response: &mut dyn HttpResponse,
    image: &[u8],
    format: ImageFormat,
) -> Result<(), ResponderError> {
    let mime_type = match format {
        ImageFormat::Bmp => "image/bmp",
        ImageFormat::Gif => "image/gif",
        ImageFormat::Png => "image/png",
        other => return Err(ResponderError::UnsupportedImageFormat(other)),
    };

    response.set_status(StatusCode::OK);
    set_content_type(response, mime_type);
    response.set_header(
        header::CACHE_CONTROL,
        HeaderValue::from_static(CACHE_SIX_HOURS),
    );
    response.enable_compression(false);
    response.write(image)?;
    Ok(())
}

/// Send audio verbatim. Only uncompressed WAV benefits from compression.
pub fn send_audio(
    response: &mut dyn HttpResponse,
    audio: &[u8],
    mime_type: &str,
) -> Result<(), ResponderError> {
    response.set_status(StatusCode::OK);
    set_content_type(response, mime_type);
    response.enable_compression(is_wav_mime(mime_type));
    response.write(audio)?;
    Ok(())
}

/// Send raw bytes verbatim; the caller decides about compression.
pub fn send_binary(
    response: &mut dyn HttpResponse,
    bytes: &[u8],
    mime_type: &str,
    compress: bool,
) -> Result<(), ResponderError> {
    response.set_status(StatusCode::OK);
    set_content_type(response, mime_type);
    response.enable_compression(compress);
    response.write(bytes)?;
    Ok(())
}

/// Refuse the request outright.
pub fn forbidden(response: &mut dyn HttpResponse) {
    response.set_status(StatusCode::FORBIDDEN);
}

fn set_content_type(response: &mut dyn HttpResponse, mime_type: &str) {
    if let Ok(value) = HeaderValue::from_str(mime_type) {
        response.set_header(header::CONTENT_TYPE, value);
    }
}

fn is_wav_mime(mime_type: &str) -> bool {
    matches!(
        mime_type.to_ascii_lowercase().as_str(),
        "audio/wav" | "audio/x-wav" | "audio/wave"
    )
}
