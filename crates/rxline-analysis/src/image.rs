/*
 * RxLine - Prescription analysis dispatch service
 * Copyright (C) 2025–2026 RxLine Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Prescription image acquisition: HTTP download plus magic-number MIME
//! sniffing for transports that hand us `application/octet-stream`.

use std::time::Duration;

use tracing::{debug, warn};

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

#[derive(thiserror::Error, Debug)]
pub enum ImageFetchError {
    #[error("image download timed out")]
    Timeout,
    #[error("image download returned status {0}")]
    Status(u16),
    #[error("image download failed: {0}")]
    Request(String),
}

/// Downloaded image bytes with their resolved MIME type.
pub struct DownloadedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Download an image, following redirects, bounded by `timeout`.
///
/// The MIME type comes from the response's `Content-Type` header unless that
/// is absent or a generic octet-stream, in which case it is sniffed from the
/// leading bytes.
///
/// # Errors
///
/// Returns [`ImageFetchError`] on timeout, a non-2xx status, or a transport
/// failure while downloading or reading the body.
pub async fn fetch_image(
    http: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<DownloadedImage, ImageFetchError> {
    debug!(url = %url, "downloading prescription image");

    let response = http
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(classify_request_error)?;

    let status = response.status();
    if !status.is_success() {
        return Err(ImageFetchError::Status(status.as_u16()));
    }

    let declared = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

    let bytes = response
        .bytes()
        .await
        .map_err(classify_request_error)?
        .to_vec();

    let mime_type = match declared {
        Some(ct) if !ct.is_empty() && ct != "application/octet-stream" => ct,
        _ => {
            let sniffed = sniff_mime(&bytes);
            debug!(mime = sniffed, "content type sniffed from image header");
            sniffed.to_string()
        }
    };

    debug!(size = bytes.len(), mime = %mime_type, "image downloaded");
    Ok(DownloadedImage { bytes, mime_type })
}

fn classify_request_error(e: reqwest::Error) -> ImageFetchError {
    if e.is_timeout() {
        ImageFetchError::Timeout
    } else {
        ImageFetchError::Request(e.to_string())
    }
}

/// Determine an image MIME type from its magic-number header bytes.
/// Unrecognized data defaults to JPEG, the common case for phone-camera
/// prescription photos.
#[must_use]
pub fn sniff_mime(data: &[u8]) -> &'static str {
    if data.len() >= 3 && data[0] == 0xFF && data[1] == 0xD8 && data[2] == 0xFF {
        return "image/jpeg";
    }
    if data.len() >= 8 && data[..8] == PNG_SIGNATURE {
        return "image/png";
    }
    if data.len() >= 6 && (&data[..6] == b"GIF87a" || &data[..6] == b"GIF89a") {
        return "image/gif";
    }
    if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return "image/webp";
    }
    if data.len() >= 2 && &data[..2] == b"BM" {
        return "image/bmp";
    }
    warn!("could not determine image type from header bytes, defaulting to jpeg");
    "image/jpeg"
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_jpeg() {
        assert_eq!(sniff_mime(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00]), "image/jpeg");
    }

    #[test]
    fn test_sniff_png() {
        let mut data = PNG_SIGNATURE.to_vec();
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x0D]);
        assert_eq!(sniff_mime(&data), "image/png");
    }

    #[test]
    fn test_sniff_gif_both_versions() {
        assert_eq!(sniff_mime(b"GIF87a-rest"), "image/gif");
        assert_eq!(sniff_mime(b"GIF89a-rest"), "image/gif");
    }

    #[test]
    fn test_sniff_webp_requires_riff_and_webp_tags() {
        assert_eq!(sniff_mime(b"RIFF\x10\x00\x00\x00WEBPVP8 "), "image/webp");
        // RIFF container that is not WebP (e.g. WAV) falls through
        assert_eq!(sniff_mime(b"RIFF\x10\x00\x00\x00WAVEfmt "), "image/jpeg");
    }

    #[test]
    fn test_sniff_bmp() {
        assert_eq!(sniff_mime(b"BM\x36\x00\x00\x00"), "image/bmp");
    }

    #[test]
    fn test_sniff_unknown_defaults_to_jpeg() {
        assert_eq!(sniff_mime(b"not an image at all"), "image/jpeg");
        assert_eq!(sniff_mime(&[]), "image/jpeg");
        assert_eq!(sniff_mime(&[0xFF]), "image/jpeg");
    }
}
