pub mod content_encoding;
pub mod response_utils;
pub mod url_utils;
