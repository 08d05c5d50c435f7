use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::{debug, error};
use url::Url;

use crate::manifest::TEMPLATE_IDENTIFIER;

// start, end and empty element tags. declarations, comments and processing instructions don't
// start with a name character so they never match
static ELEMENT_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<(/?)(?:[A-Za-z_][\w.-]*:)?([A-Za-z_][\w.-]*)(?:\s(?:[^>"']|"[^"]*"|'[^']*')*)?/?>"#)
        .expect("element tag regex should compile")
});

static URL_ATTRIBUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(\s(?:media|initialization|sourceURL)\s*=\s*)(?:"([^"]*)"|'([^']*)')"#)
        .expect("url attribute regex should compile")
});

/// base url in effect inside one open element
struct Scope {
    base: Url,
    // only the first BaseURL of an element counts, the rest are failover alternates
    has_base_url: bool,
}

/// Points every `BaseURL` body and every `media` / `initialization` / `sourceURL` attribute at
/// the `/segment?u=` passthrough. No registry here, the absolute upstream url travels in the
/// query string. References resolve against the BaseURL chain around them, the manifest url at
/// the top. Everything else in the document is left byte for byte.
pub fn rewrite_dash(text: &str, base_url: &Url) -> String {
    let mut rewritten = String::with_capacity(text.len() + text.len() / 4);
    let mut scopes: Vec<Scope> = Vec::new();
    // where the body of the BaseURL we're inside starts
    let mut base_url_body: Option<usize> = None;
    let mut last = 0;

    for caps in ELEMENT_TAG.captures_iter(text) {
        let Some(tag) = caps.get(0) else {
            continue;
        };
        let closing = !caps[1].is_empty();
        let self_closing = tag.as_str().ends_with("/>");
        let is_base_url = &caps[2] == "BaseURL";

        if base_url_body.is_none() {
            rewritten.push_str(&text[last..tag.start()]);
        }
        last = tag.end();

        let current = scopes.last().map(|s| &s.base).unwrap_or(base_url).clone();

        if closing {
            if let (true, Some(body_start)) = (is_base_url, base_url_body.take()) {
                let body = &text[body_start..tag.start()];
                scopes.pop();
                match resolve_reference(body, &current) {
                    Some(resolved) => {
                        rewritten.push_str(&proxied_segment_url(resolved.as_str()));
                        if let Some(parent) = scopes.last_mut().filter(|p| !p.has_base_url) {
                            parent.base = resolved;
                            parent.has_base_url = true;
                        }
                    }
                    None => rewritten.push_str(body),
                }
            } else {
                scopes.pop();
            }
            rewritten.push_str(tag.as_str());
            continue;
        }

        rewritten.push_str(&rewrite_attributes(tag.as_str(), &current));

        if !self_closing {
            scopes.push(Scope {
                base: current,
                has_base_url: false,
            });
            if is_base_url {
                base_url_body = Some(tag.end());
            }
        }
    }

    match base_url_body {
        // unterminated BaseURL, hand the rest back untouched
        Some(body_start) => rewritten.push_str(&text[body_start..]),
        None => rewritten.push_str(&text[last..]),
    }

    debug!("Rewrote DASH manifest against {}", base_url);
    rewritten
}

fn rewrite_attributes<'a>(tag: &'a str, base_url: &Url) -> Cow<'a, str> {
    URL_ATTRIBUTE.replace_all(tag, |caps: &Captures| {
        let (value, quote) = match (caps.get(2), caps.get(3)) {
            (Some(v), _) => (v.as_str(), '"'),
            (None, Some(v)) => (v.as_str(), '\''),
            (None, None) => return caps[0].to_string(),
        };

        // already ours
        if value.starts_with("/segment?u=") {
            return caps[0].to_string();
        }

        match resolve_reference(value, base_url) {
            Some(resolved) => format!(
                "{}{}{}{}",
                &caps[1],
                quote,
                proxied_segment_url(resolved.as_str()),
                quote
            ),
            None => caps[0].to_string(),
        }
    })
}

/// `/segment?u=<encoded>` for an absolute upstream url, template identifiers stay literal so the
/// player can still expand them
pub fn proxied_segment_url(absolute: &str) -> String {
    let mut encoded = String::with_capacity(absolute.len() * 3 / 2);
    let mut last = 0;

    for identifier in TEMPLATE_IDENTIFIER.find_iter(absolute) {
        encoded.push_str(&urlencoding::encode(&absolute[last..identifier.start()]));
        encoded.push_str(identifier.as_str());
        last = identifier.end();
    }
    encoded.push_str(&urlencoding::encode(&absolute[last..]));

    format!("/segment?u={}", encoded)
}

fn resolve_reference(raw: &str, base_url: &Url) -> Option<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    // attribute and text values are still xml escaped (&amp; in query strings mostly)
    let unescaped = quick_xml::escape::unescape(trimmed).unwrap_or(Cow::Borrowed(trimmed));

    match base_url.join(&unescaped) {
        Ok(resolved) if matches!(resolved.scheme(), "http" | "https") => Some(resolved),
        Ok(_) => None,
        Err(e) => {
            error!("Failed to resolve: {} - {}", trimmed, e);
            None
        }
    }
}
