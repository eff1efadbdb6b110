use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::StreamExt;
use thiserror::Error;

/// Stop downloading once this much has been read without finding a header.
const MAX_PROBE_BYTES: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("invalid data url")]
    InvalidDataUrl,
    #[error("failed to fetch image: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("unsupported or truncated image header")]
    UnknownFormat,
}

fn be_u16(bytes: &[u8], at: usize) -> Option<u32> {
    let b = bytes.get(at..at + 2)?;
    Some(u32::from(u16::from_be_bytes([b[0], b[1]])))
}

fn le_u16(bytes: &[u8], at: usize) -> Option<u32> {
    let b = bytes.get(at..at + 2)?;
    Some(u32::from(u16::from_le_bytes([b[0], b[1]])))
}

fn be_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let b = bytes.get(at..at + 4)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn le_u24(bytes: &[u8], at: usize) -> Option<u32> {
    let b = bytes.get(at..at + 3)?;
    Some(u32::from(b[0]) | u32::from(b[1]) << 8 | u32::from(b[2]) << 16)
}

fn png(bytes: &[u8]) -> Option<(u32, u32)> {
    if !bytes.starts_with(b"\x89PNG\r\n\x1a\n") || bytes.get(12..16)? != b"IHDR" {
        return None;
    }
    Some((be_u32(bytes, 16)?, be_u32(bytes, 20)?))
}

fn gif(bytes: &[u8]) -> Option<(u32, u32)> {
    if !(bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a")) {
        return None;
    }
    Some((le_u16(bytes, 6)?, le_u16(bytes, 8)?))
}

fn jpeg(bytes: &[u8]) -> Option<(u32, u32)> {
    if !bytes.starts_with(&[0xFF, 0xD8]) {
        return None;
    }
    let mut i = 2;
    while i + 4 <= bytes.len() {
        if bytes[i] != 0xFF {
            i += 1;
            continue;
        }
        let marker = bytes[i + 1];
        match marker {
            0xFF => {
                i += 1;
                continue;
            }
            0xD0..=0xD9 | 0x01 => {
                i += 2;
                continue;
            }
            0xC0..=0xCF if !matches!(marker, 0xC4 | 0xC8 | 0xCC) => {
                let height = be_u16(bytes, i + 5)?;
                let width = be_u16(bytes, i + 7)?;
                return Some((width, height));
            }
            _ => {}
        }
        let len = be_u16(bytes, i + 2)? as usize;
        i += 2 + len;
    }
    None
}

fn webp(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.get(0..4)? != b"RIFF" || bytes.get(8..12)? != b"WEBP" {
        return None;
    }
    match bytes.get(12..16)? {
        b"VP8 " => Some((le_u16(bytes, 26)? & 0x3FFF, le_u16(bytes, 28)? & 0x3FFF)),
        b"VP8L" => {
            let b = bytes.get(21..25)?;
            let (b0, b1, b2, b3) = (u32::from(b[0]), u32::from(b[1]), u32::from(b[2]), u32::from(b[3]));
            let width = 1 + (((b1 & 0x3F) << 8) | b0);
            let height = 1 + (((b3 & 0x0F) << 10) | (b2 << 2) | ((b1 & 0xC0) >> 6));
            Some((width, height))
        }
        b"VP8X" => Some((1 + le_u24(bytes, 24)?, 1 + le_u24(bytes, 27)?)),
        _ => None,
    }
}

/// Width and height from the header of a PNG, GIF, JPEG or WebP image.
pub fn dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    png(bytes)
        .or_else(|| gif(bytes))
        .or_else(|| jpeg(bytes))
        .or_else(|| webp(bytes))
}

fn decode_data_url(url: &str) -> Result<Vec<u8>, ImageError> {
    let (_, payload) = url.split_once(";base64,").ok_or(ImageError::InvalidDataUrl)?;
    STANDARD
        .decode(payload.trim())
        .map_err(|_| ImageError::InvalidDataUrl)
}

/// Resolves the size of an inline (`data:`) or remote image; remote images
/// are read only until the header is complete.
pub async fn image_size(client: &reqwest::Client, url: &str) -> Result<(u32, u32), ImageError> {
    if url.starts_with("data:") {
        let bytes = decode_data_url(url)?;
        return dimensions(&bytes).ok_or(ImageError::UnknownFormat);
    }

    let response = client.get(url).send().await?.error_for_status()?;
    let mut stream = Box::pin(response.bytes_stream());
    let mut buffer = Vec::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
        if let Some(size) = dimensions(&buffer) {
            return Ok(size);
        }
        if buffer.len() > MAX_PROBE_BYTES {
            break;
        }
    }
    Err(ImageError::UnknownFormat)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_header(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = b"\x89PNG\r\n\x1a\n\x00\x00\x00\x0dIHDR".to_vec();
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
        bytes
    }

    #[test]
    fn reads_png_and_gif() {
        assert_eq!(dimensions(&png_header(1024, 768)), Some((1024, 768)));
        let mut gif = b"GIF89a".to_vec();
        gif.extend_from_slice(&[0x20, 0x03, 0x58, 0x02]);
        assert_eq!(dimensions(&gif), Some((800, 600)));
    }

    #[test]
    fn reads_jpeg_after_app_segments() {
        let mut jpeg = vec![0xFF, 0xD8];
        // APP0 with a 16 byte body
        jpeg.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
        jpeg.extend_from_slice(&[0u8; 14]);
        // SOF0: length, precision, height 300, width 500
        jpeg.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08, 0x01, 0x2C, 0x01, 0xF4]);
        assert_eq!(dimensions(&jpeg), Some((500, 300)));
    }

    #[test]
    fn reads_webp_extended() {
        let mut webp = b"RIFF\x00\x00\x00\x00WEBPVP8X".to_vec();
        webp.extend_from_slice(&[0u8; 8]);
        // canvas 640x480 stored minus one
        webp.extend_from_slice(&[0x7F, 0x02, 0x00, 0xDF, 0x01, 0x00]);
        assert_eq!(dimensions(&webp), Some((640, 480)));
    }

    #[tokio::test]
    async fn data_url_is_decoded() {
        let url = format!("data:image/png;base64,{}", STANDARD.encode(png_header(64, 32)));
        let size = image_size(&reqwest::Client::new(), &url).await.unwrap();
        assert_eq!(size, (64, 32));
        assert!(image_size(&reqwest::Client::new(), "data:image/png;base64,@@").await.is_err());
    }
}
