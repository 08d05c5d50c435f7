use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Router,
    body::{Body, Bytes, to_bytes},
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header},
    response::Response,
};
use futures::{StreamExt, stream};
use tower::ServiceExt;
use url::Url;

use manifest_proxy::{
    AppConfig, Channel, ProxyApplicationServer,
    server::{
        error::Error,
        services::{
            ProxyServices,
            upstream_services::{MockUpstreamServiceTrait, UpstreamRequest, UpstreamResponse},
        },
    },
};

const HLS_PLAYLIST: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXTINF:4.0,\nseg1.ts\n#EXTINF:4.0,\nseg2.ts\n";

const DASH_MANIFEST: &str = r#"<?xml version="1.0"?>
<MPD type="static" mediaPresentationDuration="PT8S">
  <Period>
    <AdaptationSet mimeType="video/mp4">
      <SegmentTemplate timescale="1" duration="4" media="$RepresentationID$/$Number$.m4s"/>
      <Representation id="v1" bandwidth="500000" width="640" height="360"/>
    </AdaptationSet>
  </Period>
</MPD>
"#;

fn config() -> AppConfig {
    AppConfig {
        channels: vec![
            Channel {
                key: "news".to_string(),
                url: Url::parse("http://origin/path/index.m3u8").unwrap(),
            },
            Channel {
                key: "sport".to_string(),
                url: Url::parse("http://origin/mpd/manifest.mpd").unwrap(),
            },
        ],
        base_url: Some(Url::parse("http://origin/assets/").unwrap()),
        rate_limit_per_minute: 10_000,
        ..AppConfig::default()
    }
}

fn upstream_response(url: &str, status: StatusCode, content_type: &str, body: &str) -> UpstreamResponse {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));

    UpstreamResponse {
        url: url.to_string(),
        status,
        headers,
        body: stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(body.to_string()))]).boxed(),
    }
}

/// serves the playlists above plus any segment as `segment:<url>`
fn fake_origin(request: UpstreamRequest) -> Result<UpstreamResponse, Error> {
    match request.url.as_str() {
        "http://origin/path/index.m3u8" => Ok(upstream_response(
            &request.url,
            StatusCode::OK,
            "application/vnd.apple.mpegurl",
            HLS_PLAYLIST,
        )),
        "http://origin/mpd/manifest.mpd" => Ok(upstream_response(
            &request.url,
            StatusCode::OK,
            "application/dash+xml",
            DASH_MANIFEST,
        )),
        url if url.contains("timeout") => Err(Error::UpstreamTimeout),
        url if url.contains("down") => Err(Error::UpstreamStatus(StatusCode::SERVICE_UNAVAILABLE)),
        url if url.contains("missing") => Err(Error::UpstreamStatus(StatusCode::NOT_FOUND)),
        url => Ok(upstream_response(
            url,
            StatusCode::OK,
            "video/mp2t",
            &format!("segment:{}", url),
        )),
    }
}

fn app_with(config: AppConfig, upstream: MockUpstreamServiceTrait) -> (Router, ProxyServices) {
    let services = ProxyServices::with_upstream(Arc::new(config), Arc::new(upstream));
    (ProxyApplicationServer::router(services.clone()), services)
}

fn app() -> (Router, ProxyServices) {
    let mut upstream = MockUpstreamServiceTrait::new();
    upstream.expect_fetch().returning(fake_origin);
    app_with(config(), upstream)
}

async fn get(app: &Router, uri: &str) -> Response {
    app.clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn segment_paths(playlist: &str) -> Vec<String> {
    playlist
        .lines()
        .filter(|line| line.starts_with("/segment/"))
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_health_reports_registry() {
    let (app, _) = app();
    let response = get(&app, "/health").await;

    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["services"]["segment_registry"]["entries"], 0);
    assert_eq!(body["services"]["channels"], 2);
}

#[tokio::test]
async fn test_unknown_channel_is_not_found() {
    let (app, _) = app();
    let response = get(&app, "/nope/playlist.m3u8").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_text(response).await.contains("unknown channel"));
}

#[tokio::test]
async fn test_hls_channel_is_rewritten_and_segments_resolve() {
    let (app, services) = app();

    let response = get(&app, "/news/playlist.m3u8").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/vnd.apple.mpegurl"
    );
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

    let playlist = body_text(response).await;
    assert!(playlist.starts_with("#EXTM3U\n#EXT-X-VERSION:3\n#EXTINF:4.0,\n/segment/"));
    assert!(!playlist.contains("origin"));

    let segments = segment_paths(&playlist);
    assert_eq!(segments.len(), 2);
    assert_eq!(services.segments.len(), 2);

    let response = get(&app, &segments[1]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp2t");
    assert!(response.headers().get(header::CONNECTION).is_none());
    assert_eq!(
        response.headers()[header::CACHE_CONTROL],
        "public, max-age=60, stale-while-revalidate=30"
    );
    assert_eq!(body_text(response).await, "segment:http://origin/path/seg2.ts");
}

#[tokio::test]
async fn test_manifest_is_compressed_when_accepted() {
    let (app, _) = app();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/news/playlist.m3u8")
                .header(header::ACCEPT_ENCODING, "gzip, deflate")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");
    assert_eq!(response.headers()[header::VARY], "Accept-Encoding");
}

#[tokio::test]
async fn test_segment_request_forwards_range() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = seen.clone();

    let mut upstream = MockUpstreamServiceTrait::new();
    upstream.expect_fetch().returning(move |request| {
        recorded.lock().unwrap().push(request.clone());
        let mut response = upstream_response(&request.url, StatusCode::PARTIAL_CONTENT, "video/mp4", "part");
        response
            .headers
            .insert(header::CONTENT_RANGE, HeaderValue::from_static("bytes 0-3/100"));
        Ok(response)
    });

    let (app, services) = app_with(config(), upstream);
    let id = services.segments.resolve_or_create("http://origin/path/seg1.m4s");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/segment/{}.ts", id))
                .header(header::RANGE, "bytes=0-3")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-3/100");

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].url, "http://origin/path/seg1.m4s");
    assert_eq!(seen[0].headers[header::RANGE], "bytes=0-3");
}

#[tokio::test]
async fn test_unknown_segment_is_not_found() {
    let (app, _) = app();
    let response = get(&app, "/segment/doesnotexist.ts").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(start_paused = true)]
async fn test_expired_segment_is_gone() {
    let (app, services) = app();
    let id = services.segments.resolve_or_create("http://origin/path/seg1.ts");

    tokio::time::advance(Duration::from_secs(61)).await;

    let response = get(&app, &format!("/segment/{}.ts", id)).await;
    assert_eq!(response.status(), StatusCode::GONE);

    let response = get(&app, &format!("/segment/{}.ts", id)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_nested_playlist_behind_segment_is_rewritten() {
    let mut upstream = MockUpstreamServiceTrait::new();
    upstream.expect_fetch().returning(|request| {
        if request.url == "http://origin/path/720p/index.m3u8" {
            // redirected, relative entries resolve against where it ended up
            Ok(upstream_response(
                "http://cdn.example/720p/index.m3u8",
                StatusCode::OK,
                "application/x-mpegURL",
                "#EXTM3U\n#EXTINF:4.0,\nchunk.ts\n",
            ))
        } else {
            fake_origin(request)
        }
    });

    let (app, services) = app_with(config(), upstream);
    let id = services.segments.resolve_or_create("http://origin/path/720p/index.m3u8");

    let response = get(&app, &format!("/segment/{}.ts", id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/vnd.apple.mpegurl"
    );

    let playlist = body_text(response).await;
    let segments = segment_paths(&playlist);
    assert_eq!(segments.len(), 1);

    let response = get(&app, &segments[0]).await;
    assert_eq!(body_text(response).await, "segment:http://cdn.example/720p/chunk.ts");
}

#[tokio::test]
async fn test_dash_channel_as_hls() {
    let (app, _) = app();

    let response = get(&app, "/sport/playlist.m3u8").await;
    assert_eq!(response.status(), StatusCode::OK);
    let master = body_text(response).await;
    assert!(master.contains("#EXT-X-STREAM-INF:BANDWIDTH=500000,RESOLUTION=640x360\n"));
    assert!(master.contains("/sport/playlist.m3u8?rep=v1\n"));

    let response = get(&app, "/sport/playlist.m3u8?rep=v1").await;
    assert_eq!(response.status(), StatusCode::OK);
    let media = body_text(response).await;
    let segments = segment_paths(&media);
    assert_eq!(segments.len(), 2);
    assert!(media.ends_with("#EXT-X-ENDLIST\n"));

    let response = get(&app, &segments[0]).await;
    assert_eq!(body_text(response).await, "segment:http://origin/mpd/v1/1.m4s");

    let response = get(&app, "/sport/playlist.m3u8?rep=missing").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_dash_manifest_route() {
    let (app, _) = app();

    let response = get(&app, "/sport/manifest.mpd").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/dash+xml");
    let body = body_text(response).await;
    assert!(body.contains(r#"media="/segment?u=http%3A%2F%2Forigin%2Fmpd%2F$RepresentationID$%2F$Number$.m4s""#));

    let response = get(&app, "/news/manifest.mpd").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_passthrough_target_validation() {
    let (app, _) = app();

    assert_eq!(get(&app, "/proxy").await.status(), StatusCode::BAD_REQUEST);
    assert_eq!(get(&app, "/proxy?u=").await.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        get(&app, "/proxy?u=ftp%3A%2F%2Forigin%2Ffile").await.status(),
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn test_passthrough_streams_upstream() {
    let (app, _) = app();

    let response = get(&app, "/segment?u=http%3A%2F%2Forigin%2Fmpd%2Fv1%2F1.m4s").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "segment:http://origin/mpd/v1/1.m4s");

    let response = get(&app, "/base/img/logo.png").await;
    assert_eq!(body_text(response).await, "segment:http://origin/assets/img/logo.png");
}

#[tokio::test]
async fn test_passthrough_head_has_no_body() {
    let methods = Arc::new(Mutex::new(Vec::new()));
    let recorded = methods.clone();

    let mut upstream = MockUpstreamServiceTrait::new();
    upstream.expect_fetch().returning(move |request| {
        recorded.lock().unwrap().push(request.method.clone());
        fake_origin(request)
    });
    let (app, _) = app_with(config(), upstream);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::HEAD)
                .uri("/proxy?u=http%3A%2F%2Forigin%2Fa.ts")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.is_empty());
    assert_eq!(*methods.lock().unwrap(), vec![Method::HEAD]);
}

#[tokio::test]
async fn test_upstream_failures_map_to_gateway_errors() {
    let (app, _) = app();

    let response = get(&app, "/proxy?u=http%3A%2F%2Fdown.example%2Fa.ts").await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert!(body["error"].as_str().unwrap().contains("503"));

    let response = get(&app, "/proxy?u=http%3A%2F%2Fmissing.example%2Fa.ts").await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let response = get(&app, "/proxy?u=http%3A%2F%2Ftimeout.example%2Fa.ts").await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn test_rate_limit_rejects_with_retry_after() {
    let mut upstream = MockUpstreamServiceTrait::new();
    upstream.expect_fetch().returning(fake_origin);
    let (app, _) = app_with(
        AppConfig {
            rate_limit_per_minute: 2,
            ..config()
        },
        upstream,
    );

    assert_eq!(get(&app, "/news/playlist.m3u8").await.status(), StatusCode::OK);
    assert_eq!(get(&app, "/news/playlist.m3u8").await.status(), StatusCode::OK);

    let response = get(&app, "/news/playlist.m3u8").await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));

    // health stays reachable for probes
    assert_eq!(get(&app, "/health").await.status(), StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_segment_requests_resolve_their_own_url() {
    let (app, services) = app();

    let ids: Vec<(String, String)> = (0..100)
        .map(|i| {
            let url = format!("http://origin/path/seg{}.ts", i);
            (services.segments.resolve_or_create(&url), url)
        })
        .collect();

    let mut tasks = Vec::new();
    for (id, url) in ids {
        let app = app.clone();
        tasks.push(tokio::spawn(async move {
            let response = get(&app, &format!("/segment/{}.ts", id)).await;
            (response.status(), body_text(response).await, url)
        }));
    }

    for task in tasks {
        let (status, body, url) = task.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, format!("segment:{}", url));
    }
}
