use url::Url;

#[derive(clap::ValueEnum, Clone, Debug, Copy)]
pub enum CargoEnv {
    Development,
    Production,
}

/// how the segment registry hands out ids for upstream urls
#[derive(clap::ValueEnum, Clone, Debug, Copy, PartialEq, Eq)]
pub enum IdStrategy {
    /// fresh id on every registration, the same segment gets a new id per manifest fetch
    Random,
    /// id derived from the url, repeated rewrites of the same manifest are byte-identical
    Deterministic,
}

/// a fixed channel key -> upstream manifest url pair
#[derive(Clone, Debug, PartialEq)]
pub struct Channel {
    pub key: String,
    pub url: Url,
}

/// parses `key=url`, used as the clap value parser for CHANNELS
pub fn parse_channel(raw: &str) -> Result<Channel, String> {
    let (key, url) = raw
        .split_once('=')
        .ok_or_else(|| format!("channel '{}' should look like key=url", raw))?;

    let key = key.trim();
    if key.is_empty() || key.contains('/') {
        return Err(format!("invalid channel key '{}'", key));
    }

    let url = Url::parse(url.trim()).map_err(|e| format!("invalid url for '{}': {}", key, e))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(format!("channel '{}' must use http or https", key));
    }

    Ok(Channel {
        key: key.to_string(),
        url,
    })
}

#[derive(clap::Parser)]
pub struct AppConfig {
    // production or development
    #[clap(long, env, value_enum, default_value = "development")]
    pub cargo_env: CargoEnv,

    // port that the app will bind to
    #[clap(long, env, default_value = "3000")]
    pub port: u16,

    // this should be either * for allowing everything, or a comma seperated list of domains like
    // example.com,something.com
    #[clap(long, env, default_value = "*")]
    pub cors_origin: String,

    // optional sentry integration
    #[clap(long, env)]
    pub sentry_dsn: Option<String>,

    // only used in production, development logs to stdout
    #[clap(long, env, default_value = "logs")]
    pub log_dir: String,

    // comma seperated key=url pairs, e.g. news=https://origin/news/index.m3u8,sport=https://origin/s.mpd
    #[clap(long, env, value_delimiter = ',', value_parser = parse_channel)]
    pub channels: Vec<Channel>,

    // fixed origin for the /base/* route, left unset the route answers 400
    #[clap(long, env)]
    pub base_url: Option<Url>,

    #[clap(long, env, default_value = "60")]
    pub segment_ttl_secs: u64,

    #[clap(long, env, default_value = "1000")]
    pub segment_max_entries: usize,

    #[clap(long, env, default_value = "30")]
    pub sweep_interval_secs: u64,

    #[clap(long, env, value_enum, default_value = "deterministic")]
    pub id_strategy: IdStrategy,

    // how long we wait for upstream response headers before giving up with a 504
    #[clap(long, env, default_value = "10")]
    pub upstream_timeout_secs: u64,

    // total attempts per upstream fetch, 1 means no retries
    #[clap(long, env, default_value = "1")]
    pub upstream_attempts: u32,

    // first retry delay, doubled on every following attempt
    #[clap(long, env, default_value = "300")]
    pub upstream_backoff_ms: u64,

    #[clap(long, env, default_value = "300")]
    pub rate_limit_per_minute: u32,

    #[clap(long, env, default_value = "1024")]
    pub max_concurrent_requests: usize,
}

impl Default for AppConfig {
    // mirrors the clap defaults, mostly so tests can build a config without touching env
    fn default() -> Self {
        Self {
            cargo_env: CargoEnv::Development,
            port: 3000,
            cors_origin: "*".to_string(),
            sentry_dsn: None,
            log_dir: "logs".to_string(),
            channels: Vec::new(),
            base_url: None,
            segment_ttl_secs: 60,
            segment_max_entries: 1000,
            sweep_interval_secs: 30,
            id_strategy: IdStrategy::Deterministic,
            upstream_timeout_secs: 10,
            upstream_attempts: 1,
            upstream_backoff_ms: 300,
            rate_limit_per_minute: 300,
            max_concurrent_requests: 1024,
        }
    }
}
