use std::time::Duration;

use manifest_proxy::IdStrategy;
use manifest_proxy::manifest::hls::{rewrite_hls, rewrite_hls_with};
use manifest_proxy::server::services::segment_registry_services::{
    SegmentLookup, SegmentRegistry, SegmentRegistryConfig,
};
use url::Url;

fn registry() -> SegmentRegistry {
    SegmentRegistry::new(SegmentRegistryConfig {
        ttl: Duration::from_secs(60),
        max_entries: 1000,
        id_strategy: IdStrategy::Deterministic,
    })
}

fn segment_id(line: &str) -> &str {
    line.strip_prefix("/segment/")
        .and_then(|rest| rest.strip_suffix(".ts"))
        .unwrap_or_else(|| panic!("not a segment path: {}", line))
}

#[tokio::test]
async fn test_rewrites_relative_segments() {
    let registry = registry();
    let base = Url::parse("http://origin/path/").unwrap();

    let output = rewrite_hls(
        "#EXTM3U\n#EXT-X-VERSION:3\nseg1.ts\nseg2.ts\n",
        &base,
        &registry,
    );

    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "#EXTM3U");
    assert_eq!(lines[1], "#EXT-X-VERSION:3");

    assert_eq!(
        registry.lookup(segment_id(lines[2])),
        SegmentLookup::Found("http://origin/path/seg1.ts".to_string())
    );
    assert_eq!(
        registry.lookup(segment_id(lines[3])),
        SegmentLookup::Found("http://origin/path/seg2.ts".to_string())
    );
    assert!(output.ends_with('\n'));
}

#[tokio::test]
async fn test_keeps_tags_blank_lines_and_crlf() {
    let base = Url::parse("https://origin/live/index.m3u8").unwrap();
    let input = "#EXTM3U\r\n#EXTINF:4.0,\r\n\r\n/abs/seg.ts\r\n#EXT-X-ENDLIST";

    let output = rewrite_hls_with(input, &base, |url| format!("<{}>", url));

    assert_eq!(
        output,
        "#EXTM3U\r\n#EXTINF:4.0,\r\n\r\n<https://origin/abs/seg.ts>\r\n#EXT-X-ENDLIST"
    );
}

#[tokio::test]
async fn test_absolute_and_protocol_relative_uris() {
    let base = Url::parse("https://origin/live/index.m3u8").unwrap();
    let input = "http://other/a.ts\n//cdn.example/b.ts\n../c.ts?token=1\n";

    let mut seen = Vec::new();
    rewrite_hls_with(input, &base, |url| {
        seen.push(url.to_string());
        "x".to_string()
    });

    assert_eq!(
        seen,
        vec![
            "http://other/a.ts",
            "https://cdn.example/b.ts",
            "https://origin/c.ts?token=1",
        ]
    );
}

#[tokio::test]
async fn test_leaves_non_http_uris_alone() {
    let base = Url::parse("https://origin/live/index.m3u8").unwrap();
    let input = "#EXTM3U\ndata:text/plain,hello\nskd://key-id\n";

    let output = rewrite_hls_with(input, &base, |_| panic!("nothing should be located"));
    assert_eq!(output, input);
}

#[tokio::test]
async fn test_same_manifest_rewrites_identically() {
    let registry = registry();
    let base = Url::parse("http://origin/path/").unwrap();
    let input = "#EXTM3U\nseg1.ts\nseg2.ts\n";

    let first = rewrite_hls(input, &base, &registry);
    let second = rewrite_hls(input, &base, &registry);

    assert_eq!(first, second);
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn test_rewrites_uri_attributes_of_tags() {
    let registry = registry();
    let base = Url::parse("https://origin/live/720p/index.m3u8").unwrap();
    let input = "#EXTM3U\n\
#EXT-X-MAP:URI=\"init.mp4\",BYTERANGE=\"720@0\"\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"https://keys.example/k?token=secret\",IV=0x1234\n\
#EXTINF:4.0,\n\
seg1.m4s\n";

    let output = rewrite_hls(input, &base, &registry);

    assert!(!output.contains("init.mp4"));
    assert!(!output.contains("keys.example"));
    assert!(!output.contains("token=secret"));
    assert!(output.contains(",BYTERANGE=\"720@0\"\n"));
    assert!(output.contains(",IV=0x1234\n"));
    assert_eq!(registry.len(), 3);

    let lines: Vec<&str> = output.lines().collect();
    let map_id = lines[1]
        .strip_prefix("#EXT-X-MAP:URI=\"/segment/")
        .and_then(|rest| rest.split_once(".ts\""))
        .map(|(id, _)| id)
        .unwrap();
    assert_eq!(
        registry.lookup(map_id),
        SegmentLookup::Found("https://origin/live/720p/init.mp4".to_string())
    );
}

#[tokio::test]
async fn test_rewrites_rendition_uris_in_master_playlists() {
    let base = Url::parse("https://origin/live/master.m3u8").unwrap();
    let input = "#EXTM3U\n\
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aac\",NAME=\"en\",URI=\"audio/en.m3u8\"\n\
#EXT-X-I-FRAME-STREAM-INF:BANDWIDTH=90000,URI=\"iframes.m3u8\"\n\
#EXT-X-STREAM-INF:BANDWIDTH=800000,AUDIO=\"aac\"\n\
720p.m3u8\n";

    let output = rewrite_hls_with(input, &base, |url| format!("<{}>", url));

    assert_eq!(
        output,
        "#EXTM3U\n\
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aac\",NAME=\"en\",URI=\"<https://origin/live/audio/en.m3u8>\"\n\
#EXT-X-I-FRAME-STREAM-INF:BANDWIDTH=90000,URI=\"<https://origin/live/iframes.m3u8>\"\n\
#EXT-X-STREAM-INF:BANDWIDTH=800000,AUDIO=\"aac\"\n\
<https://origin/live/720p.m3u8>\n"
    );
}

#[tokio::test]
async fn test_leaves_non_http_key_uris_alone() {
    let base = Url::parse("https://origin/live/index.m3u8").unwrap();
    let input = "#EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"skd://key-id\",KEYFORMAT=\"com.apple.streamingkeydelivery\"\n";

    let output = rewrite_hls_with(input, &base, |_| panic!("nothing should be located"));
    assert_eq!(output, input);
}
