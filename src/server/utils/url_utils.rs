use base64::{Engine as _, engine::general_purpose::URL_SAFE};
use tracing::error;
use url::Url;

use crate::server::error::{AppResult, Error};

/// Decodes the `u` query parameter. It's either a plain http(s) url (possibly still percent
/// encoded) or url-safe base64 with or without padding. Only http and https make it out.
pub fn decode_target_url(url_param: &str) -> AppResult<Url> {
    let url_param = url_param.trim();
    if url_param.is_empty() {
        return Err(Error::BadRequest("Missing ?u=<full URL>".to_string()));
    }

    let lowered = url_param.to_ascii_lowercase();
    // the query extractor already decoded once, a second pass catches double encoding
    let decoded = if lowered.starts_with("http%3a") || lowered.starts_with("https%3a") {
        urlencoding::decode(url_param)
            .map(|s| s.into_owned())
            .map_err(|e| {
                error!("Failed to decode URL: {}", e);
                Error::BadRequest("Invalid URL encoding".to_string())
            })?
    } else if lowered.starts_with("http://") || lowered.starts_with("https://") {
        url_param.to_string()
    } else {
        let mut padded = url_param.to_string();
        while padded.len() % 4 != 0 {
            padded.push('=');
        }

        URL_SAFE
            .decode(&padded)
            .map_err(|e| {
                error!("Failed to decode base64: {}", e);
                Error::BadRequest("Invalid URL encoding".to_string())
            })
            .and_then(|bytes| {
                String::from_utf8(bytes).map_err(|e| {
                    error!("Failed to parse UTF-8: {}", e);
                    Error::BadRequest("Invalid URL encoding".to_string())
                })
            })?
    };

    let url = Url::parse(&decoded).map_err(|e| {
        error!("Failed to parse target URL: {}", e);
        Error::BadRequest("Invalid URL format".to_string())
    })?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(Error::BadRequest(
            "Only http/https URLs supported".to_string(),
        ));
    }

    Ok(url)
}
