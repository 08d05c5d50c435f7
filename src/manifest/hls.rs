use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::{debug, error};
use url::Url;

use crate::manifest::segment_path;
use crate::server::services::segment_registry_services::SegmentRegistry;

// URI attribute of EXT-X-MAP, EXT-X-KEY, EXT-X-MEDIA, EXT-X-I-FRAME-STREAM-INF and friends
static URI_ATTRIBUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([:,]\s*URI=)"([^"]*)""#).expect("URI attribute regex should compile")
});

/// Rewrites every uri line of an HLS playlist, and every `URI="..."` attribute of a tag, to
/// `/segment/<id>.ts`, registering the resolved upstream url with the registry. Everything else
/// in the playlist, line endings included, is untouched.
pub fn rewrite_hls(text: &str, base_url: &Url, registry: &SegmentRegistry) -> String {
    rewrite_hls_with(text, base_url, |absolute| {
        segment_path(&registry.resolve_or_create(absolute))
    })
}

/// same as [`rewrite_hls`] but the caller decides what a resolved uri turns into
pub fn rewrite_hls_with<F>(text: &str, base_url: &Url, mut locate: F) -> String
where
    F: FnMut(&str) -> String,
{
    let mut rewritten = String::with_capacity(text.len());
    let mut replaced = 0usize;

    for raw in text.split_inclusive('\n') {
        let (line, ending) = split_line_ending(raw);
        let trimmed = line.trim();

        if trimmed.starts_with("#EXT") && line.contains("URI=\"") {
            let tag = URI_ATTRIBUTE.replace_all(line, |caps: &Captures| {
                match resolve(&caps[2], base_url) {
                    Some(resolved) => {
                        replaced += 1;
                        format!("{}\"{}\"", &caps[1], locate(resolved.as_str()))
                    }
                    None => caps[0].to_string(),
                }
            });
            rewritten.push_str(&tag);
            rewritten.push_str(ending);
            continue;
        }

        if trimmed.is_empty() || trimmed.starts_with('#') {
            rewritten.push_str(raw);
            continue;
        }

        match resolve(trimmed, base_url) {
            Some(resolved) => {
                rewritten.push_str(&locate(resolved.as_str()));
                rewritten.push_str(ending);
                replaced += 1;
            }
            None => rewritten.push_str(raw),
        }
    }

    debug!("Rewrote {} playlist uris against {}", replaced, base_url);
    rewritten
}

fn resolve(reference: &str, base_url: &Url) -> Option<Url> {
    let reference = reference.trim();
    // an empty reference would join to the playlist itself
    if reference.is_empty() {
        return None;
    }

    match base_url.join(reference) {
        Ok(resolved) if matches!(resolved.scheme(), "http" | "https") => Some(resolved),
        Ok(resolved) => {
            debug!("Leaving non-http uri alone: {}", resolved);
            None
        }
        Err(e) => {
            error!("Failed to resolve: {} - {}", reference, e);
            None
        }
    }
}

fn split_line_ending(raw: &str) -> (&str, &str) {
    if let Some(line) = raw.strip_suffix("\r\n") {
        (line, "\r\n")
    } else if let Some(line) = raw.strip_suffix('\n') {
        (line, "\n")
    } else {
        (raw, "")
    }
}
