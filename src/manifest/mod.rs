//! Manifest handling: rewriting HLS/DASH references so they point back at this proxy, and
//! turning a DASH MPD into HLS playlists.
pub mod dash;
pub mod hls;
pub mod mpd;
pub mod mpd_to_hls;

use once_cell::sync::Lazy;
use regex::Regex;

pub use dash::rewrite_dash;
pub use hls::rewrite_hls;
pub use mpd::{Mpd, MpdError};

pub const HLS_MIME: &str = "application/vnd.apple.mpegurl";
pub const DASH_MIME: &str = "application/dash+xml";

/// registry backed segment route, `/segment/<id>.ts`
pub fn segment_path(id: &str) -> String {
    format!("/segment/{}.ts", id)
}

/// DASH template identifiers ($Number$, $Time%08d$, $$ ...), these have to survive rewriting
pub(crate) static TEMPLATE_IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$(RepresentationID|Number|Time|Bandwidth|SubNumber)(?:%0(\d+)d)?\$|\$\$")
        .expect("template identifier regex should compile")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Hls,
    Dash,
}

impl ManifestKind {
    /// content type first, then a sniff of the body since plenty of origins send text/plain
    pub fn detect(content_type: &str, body: &str) -> Option<Self> {
        let content_type = content_type.to_ascii_lowercase();
        if content_type.contains("mpegurl") {
            return Some(Self::Hls);
        }
        if content_type.contains("dash+xml") {
            return Some(Self::Dash);
        }

        let head = body.trim_start_matches('\u{feff}').trim_start();
        if head.starts_with("#EXT") {
            Some(Self::Hls)
        } else if head.starts_with('<') && body.contains("<MPD") {
            Some(Self::Dash)
        } else {
            None
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Hls => HLS_MIME,
            Self::Dash => DASH_MIME,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_by_content_type_before_body() {
        assert_eq!(
            ManifestKind::detect("application/x-mpegURL", "garbage"),
            Some(ManifestKind::Hls)
        );
        assert_eq!(
            ManifestKind::detect("application/dash+xml; charset=utf-8", ""),
            Some(ManifestKind::Dash)
        );
    }

    #[test]
    fn sniffs_body_when_content_type_is_useless() {
        assert_eq!(
            ManifestKind::detect("text/plain", "#EXTM3U\n#EXT-X-VERSION:3\n"),
            Some(ManifestKind::Hls)
        );
        assert_eq!(
            ManifestKind::detect(
                "application/octet-stream",
                "<?xml version=\"1.0\"?>\n<MPD type=\"static\"></MPD>"
            ),
            Some(ManifestKind::Dash)
        );
        assert_eq!(ManifestKind::detect("video/mp2t", "G@\u{0}"), None);
    }
}
