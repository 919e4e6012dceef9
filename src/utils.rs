use crate::RenderError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Resource class of an intercepted request, as reported by the browser
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Document,
    Stylesheet,
    Script,
    Image,
    ImageSet,
    Font,
    Media,
    Xhr,
    Fetch,
    WebSocket,
    Other,
}

impl From<&str> for ResourceKind {
    fn from(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "document" => ResourceKind::Document,
            "stylesheet" => ResourceKind::Stylesheet,
            "script" => ResourceKind::Script,
            "image" => ResourceKind::Image,
            "imageset" => ResourceKind::ImageSet,
            "font" => ResourceKind::Font,
            "media" => ResourceKind::Media,
            "xhr" => ResourceKind::Xhr,
            "fetch" => ResourceKind::Fetch,
            "websocket" => ResourceKind::WebSocket,
            _ => ResourceKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptDecision {
    Continue,
    Abort,
    Respond { status: u16, body: String },
}

static STREAMING_BOOTSTRAP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(socket\.io\.min\.js)+$|data:image/[a-z]*.?;base64")
        .expect("streaming bootstrap regex compiles")
});

static SPECIAL_INFO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"[?&](?:botInfo=(?P<botInfo>[^&#]*)|deviceInfo=(?P<deviceInfo>[^&#]*)|localeInfo=(?P<localeInfo>[^&#]*))",
    )
    .expect("special info regex compiles")
});

/// Decides what happens to every request a rendered page issues
///
/// Stylesheets get an empty stand-in so layout code that waits on them still
/// resolves; heavy assets and the realtime transport bootstrap never load.
#[derive(Debug, Clone)]
pub struct RequestInterceptor {
    pub block_fonts: bool,
    pub block_images: bool,
    pub block_media: bool,
    pub stub_stylesheets: bool,
}

impl RequestInterceptor {
    pub fn new() -> Self {
        Self {
            block_fonts: true,
            block_images: true,
            block_media: true,
            stub_stylesheets: true,
        }
    }

    pub fn decide(&self, url: &str, kind: ResourceKind) -> InterceptDecision {
        if self.stub_stylesheets && kind == ResourceKind::Stylesheet {
            return InterceptDecision::Respond {
                status: 200,
                body: "aborted".to_string(),
            };
        }

        if STREAMING_BOOTSTRAP.is_match(url) {
            return InterceptDecision::Abort;
        }

        let blocked = match kind {
            ResourceKind::Font => self.block_fonts,
            ResourceKind::Image | ResourceKind::ImageSet => self.block_images,
            ResourceKind::Media => self.block_media,
            _ => false,
        };

        if blocked {
            InterceptDecision::Abort
        } else {
            InterceptDecision::Continue
        }
    }
}

impl Default for RequestInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

/// Extra request headers for a render: directives carried in the URL query
/// plus the marker identifying the renderer.
pub fn extract_special_headers(url: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for captures in SPECIAL_INFO.captures_iter(url) {
        for name in ["botInfo", "deviceInfo", "localeInfo"] {
            if let Some(value) = captures.name(name) {
                headers.insert(name.to_string(), value.as_str().to_string());
            }
        }
    }
    headers.insert("service".to_string(), "puppeteer".to_string());
    headers
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let minutes = total_seconds / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

pub fn validate_url(url: &str) -> Result<Url, RenderError> {
    let parsed = Url::parse(url)?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(RenderError::InvalidUrl(format!(
            "unsupported scheme '{other}', expected http or https"
        ))),
    }
}

/// File name for a rendered URL inside a batch output directory.
pub fn output_file_name(url: &str) -> String {
    let stem: String = url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '&' | '=' | '#' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let stem = stem.trim_matches('_');
    if stem.is_empty() {
        "index.html".to_string()
    } else {
        format!("{stem}.html")
    }
}
