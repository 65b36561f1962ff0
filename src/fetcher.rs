use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client};
use std::time::Duration;
use tracing::{debug, warn};

/// A downloaded image body with the server's declared content type.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

/// Network seam for the pipeline. Implementations never return errors:
/// failures are logged and reported as `false` / `None`.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// HEAD `url`; true only for a 2xx answer within the probe timeout.
    async fn probe(&self, url: &str) -> bool;

    /// GET `url` and buffer the body.
    async fn fetch(&self, url: &str) -> Option<FetchedImage>;
}

#[derive(Clone)]
pub struct HttpFetcher {
    http: Client,
    fetch_timeout: Duration,
    probe_timeout: Duration,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("fetch_timeout", &self.fetch_timeout)
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}

impl HttpFetcher {
    pub fn new(fetch_timeout: Duration, probe_timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("barrel-imagesync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            fetch_timeout,
            probe_timeout,
        })
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn probe(&self, url: &str) -> bool {
        match self.http.head(url).timeout(self.probe_timeout).send().await {
            Ok(res) => {
                debug!(url, status = %res.status(), "probe");
                res.status().is_success()
            }
            Err(err) => {
                debug!(url, %err, "probe failed");
                false
            }
        }
    }

    async fn fetch(&self, url: &str) -> Option<FetchedImage> {
        let res = match self.http.get(url).timeout(self.fetch_timeout).send().await {
            Ok(res) => res,
            Err(err) => {
                warn!(url, %err, "image download failed");
                return None;
            }
        };
        if !res.status().is_success() {
            warn!(url, status = %res.status(), "image download returned non-success status");
            return None;
        }
        let content_type = res
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        match res.bytes().await {
            Ok(bytes) => Some(FetchedImage {
                bytes,
                content_type,
            }),
            Err(err) => {
                warn!(url, %err, "failed to read image body");
                None
            }
        }
    }
}

/// Image formats the bucket accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
    Avif,
    Svg,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::Gif => "gif",
            ImageFormat::Webp => "webp",
            ImageFormat::Avif => "avif",
            ImageFormat::Svg => "svg",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Avif => "image/avif",
            ImageFormat::Svg => "image/svg+xml",
        }
    }

    /// Magic-byte sniffing. SVG is text and is not sniffed here.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageFormat::Jpeg)
        } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(ImageFormat::Png)
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            Some(ImageFormat::Gif)
        } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(ImageFormat::Webp)
        } else if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" && &bytes[8..12] == b"avif" {
            Some(ImageFormat::Avif)
        } else {
            None
        }
    }

    pub fn from_mime(content_type: &str) -> Option<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(ImageFormat::Jpeg),
            "image/png" => Some(ImageFormat::Png),
            "image/gif" => Some(ImageFormat::Gif),
            "image/webp" => Some(ImageFormat::Webp),
            "image/avif" => Some(ImageFormat::Avif),
            "image/svg+xml" => Some(ImageFormat::Svg),
            _ => None,
        }
    }

    pub fn from_url(url: &str) -> Option<Self> {
        let path = url.split(['?', '#']).next().unwrap_or_default();
        let last = path.rsplit('/').next().unwrap_or_default();
        let (_, ext) = last.rsplit_once('.')?;
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            "gif" => Some(ImageFormat::Gif),
            "webp" => Some(ImageFormat::Webp),
            "avif" => Some(ImageFormat::Avif),
            "svg" => Some(ImageFormat::Svg),
            _ => None,
        }
    }

    /// Bytes first, then the declared content type, then the URL extension.
    pub fn detect(image: &FetchedImage, url: &str) -> Option<Self> {
        Self::sniff(&image.bytes)
            .or_else(|| image.content_type.as_deref().and_then(Self::from_mime))
            .or_else(|| Self::from_url(url))
    }
}

/// Read pixel dimensions from PNG, GIF or JPEG headers without decoding.
pub fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    match ImageFormat::sniff(bytes)? {
        ImageFormat::Png => {
            // IHDR is always the first chunk.
            if bytes.len() < 24 || &bytes[12..16] != b"IHDR" {
                return None;
            }
            let w = u32::from_be_bytes(bytes[16..20].try_into().ok()?);
            let h = u32::from_be_bytes(bytes[20..24].try_into().ok()?);
            Some((w, h))
        }
        ImageFormat::Gif => {
            if bytes.len() < 10 {
                return None;
            }
            let w = u16::from_le_bytes([bytes[6], bytes[7]]);
            let h = u16::from_le_bytes([bytes[8], bytes[9]]);
            Some((u32::from(w), u32::from(h)))
        }
        ImageFormat::Jpeg => jpeg_dimensions(bytes),
        _ => None,
    }
}

fn jpeg_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    let mut i = 2;
    while i + 4 <= bytes.len() {
        if bytes[i] != 0xFF {
            return None;
        }
        let marker = bytes[i + 1];
        // Fill bytes and standalone markers carry no length.
        if marker == 0xFF {
            i += 1;
            continue;
        }
        if marker == 0x01 || (0xD0..=0xD7).contains(&marker) {
            i += 2;
            continue;
        }
        let len = usize::from(u16::from_be_bytes([bytes[i + 2], bytes[i + 3]]));
        let is_sof = (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            if i + 9 > bytes.len() {
                return None;
            }
            let h = u16::from_be_bytes([bytes[i + 5], bytes[i + 6]]);
            let w = u16::from_be_bytes([bytes[i + 7], bytes[i + 8]]);
            return Some((u32::from(w), u32::from(h)));
        }
        if len < 2 {
            return None;
        }
        i += 2 + len;
    }
    None
}
