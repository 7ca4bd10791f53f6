#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use tracing::warn;

use crate::{
    admission::AdmissionConfig, cache::CacheConfig, queue::QueueConfig, resolver::ResolverConfig,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_GATEWAY_PORT: u16 = 3000;
pub const DEFAULT_GATEWAY_HOST: &str = "127.0.0.1";

/// How long a parked download ticket outlives the queue timeout.
const TICKET_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub queue: QueueConfig,
    pub admission: AdmissionConfig,
    pub cache: CacheConfig,
    pub resolver: ResolverConfig,
    pub sweep_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_GATEWAY_HOST.to_string(),
            port: DEFAULT_GATEWAY_PORT,
            queue: QueueConfig::default(),
            admission: AdmissionConfig::default(),
            cache: CacheConfig::default(),
            resolver: ResolverConfig::default(),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl GatewayConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Lifetime of an unclaimed download ticket.
    pub fn ticket_ttl(&self) -> Duration {
        self.queue.request_timeout + TICKET_GRACE
    }
}

/// Values given on the command line. They beat both the environment and the
/// env file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub env_path: Option<PathBuf>,
    pub yt_dlp: Option<PathBuf>,
    pub ffmpeg: Option<PathBuf>,
    pub cookies_file: Option<PathBuf>,
}

pub fn resolve_config(overrides: ConfigOverrides) -> Result<GatewayConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<GatewayConfig> {
    build_config_with_overrides(file_vars, env_lookup, ConfigOverrides::default())
}

/// Process environment first, env file second.
struct Lookup<'a, F> {
    file_vars: &'a HashMap<String, String>,
    env_lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Lookup<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.env_lookup)(key)
            .or_else(|| self.file_vars.get(key).cloned())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parsed<T: FromStr + Copy>(&self, key: &str, default: T) -> T {
        match self.string(key) {
            None => default,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(key, value = %raw, "ignoring unparsable setting");
                default
            }),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        Duration::from_secs(self.parsed(key, default.as_secs()))
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        Duration::from_millis(self.parsed(key, default.as_millis() as u64))
    }
}

fn build_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> Result<GatewayConfig> {
    let lookup = Lookup {
        file_vars,
        env_lookup,
    };
    let defaults = GatewayConfig::default();

    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup.string("GATEWAY_HOST"))
        .unwrap_or(defaults.host);
    let port = overrides
        .port
        .unwrap_or_else(|| lookup.parsed("GATEWAY_PORT", defaults.port));

    let queue = QueueConfig {
        max_concurrent_downloads: lookup.parsed(
            "MAX_CONCURRENT_DOWNLOADS",
            defaults.queue.max_concurrent_downloads,
        ),
        max_concurrent_metadata: lookup.parsed(
            "MAX_CONCURRENT_METADATA",
            defaults.queue.max_concurrent_metadata,
        ),
        capacity: lookup.parsed("QUEUE_CAPACITY", defaults.queue.capacity),
        request_timeout: lookup.secs("REQUEST_TIMEOUT_SECS", defaults.queue.request_timeout),
        max_retries: lookup.parsed("MAX_RETRIES", defaults.queue.max_retries),
        retry_base_delay: lookup.millis("RETRY_BASE_DELAY_MS", defaults.queue.retry_base_delay),
    };
    if queue.max_concurrent_downloads == 0 || queue.max_concurrent_metadata == 0 {
        bail!("MAX_CONCURRENT_DOWNLOADS and MAX_CONCURRENT_METADATA must be at least 1");
    }
    if queue.capacity == 0 {
        bail!("QUEUE_CAPACITY must be at least 1");
    }

    let admission = AdmissionConfig {
        rate_limit_window: lookup.secs(
            "RATE_LIMIT_WINDOW_SECS",
            defaults.admission.rate_limit_window,
        ),
        rate_limit_max: lookup.parsed(
            "RATE_LIMIT_MAX_REQUESTS",
            defaults.admission.rate_limit_max,
        ),
        memory_threshold_bytes: lookup.parsed(
            "MEMORY_THRESHOLD_MB",
            defaults.admission.memory_threshold_bytes / (1024 * 1024),
        ) * 1024
            * 1024,
        memory_threshold_percent: lookup.parsed(
            "MEMORY_THRESHOLD_PERCENT",
            defaults.admission.memory_threshold_percent,
        ),
    };
    if !(admission.memory_threshold_percent > 0.0 && admission.memory_threshold_percent <= 100.0)
    {
        bail!(
            "MEMORY_THRESHOLD_PERCENT must be within (0, 100], got {}",
            admission.memory_threshold_percent
        );
    }

    let cache = CacheConfig {
        ttl: lookup.secs("CACHE_TTL_SECS", defaults.cache.ttl),
        capacity: lookup.parsed("CACHE_CAPACITY", defaults.cache.capacity),
    };

    let resolver = ResolverConfig {
        program: overrides
            .yt_dlp
            .or_else(|| lookup.string("YT_DLP_PATH").map(PathBuf::from))
            .unwrap_or(defaults.resolver.program),
        transcoder: overrides
            .ffmpeg
            .or_else(|| lookup.string("FFMPEG_PATH").map(PathBuf::from))
            .unwrap_or(defaults.resolver.transcoder),
        cookies_file: overrides
            .cookies_file
            .or_else(|| lookup.string("GATEWAY_COOKIES_FILE").map(PathBuf::from))
            .or(defaults.resolver.cookies_file),
        metadata_timeout: lookup.secs("METADATA_TIMEOUT_SECS", defaults.resolver.metadata_timeout),
        download_timeout: lookup.secs("DOWNLOAD_TIMEOUT_SECS", defaults.resolver.download_timeout),
        kill_grace: lookup.millis("KILL_GRACE_MS", defaults.resolver.kill_grace),
        audio_bitrate: lookup
            .string("AUDIO_BITRATE")
            .unwrap_or(defaults.resolver.audio_bitrate),
    };

    let sweep_interval = lookup.secs("SWEEP_INTERVAL_SECS", defaults.sweep_interval);

    Ok(GatewayConfig {
        host,
        port,
        queue,
        admission,
        cache,
        resolver,
        sweep_interval: sweep_interval.max(Duration::from_secs(1)),
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn config_from(contents: &str) -> GatewayConfig {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_config(&vars, |_| None).unwrap()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = config_from("");
        assert_eq!(config.bind_addr(), "127.0.0.1:3000");
        assert_eq!(config.queue.max_concurrent_downloads, 6);
        assert_eq!(config.queue.max_concurrent_metadata, 10);
        assert_eq!(config.queue.capacity, 1000);
        assert_eq!(config.queue.request_timeout, Duration::from_secs(300));
        assert_eq!(config.resolver.download_timeout, Duration::from_secs(600));
        assert_eq!(config.admission.rate_limit_max, 100);
        assert_eq!(config.admission.memory_threshold_bytes, 400 * 1024 * 1024);
        assert_eq!(config.cache.ttl, Duration::from_secs(3600));
        assert_eq!(config.resolver.program, PathBuf::from("yt-dlp"));
        assert_eq!(config.resolver.transcoder, PathBuf::from("ffmpeg"));
        assert_eq!(
            config.resolver.cookies_file,
            Some(PathBuf::from("cookies.txt"))
        );
        assert_eq!(config.ticket_ttl(), Duration::from_secs(360));
    }

    #[test]
    fn env_file_values_are_applied() {
        let config = config_from(
            "GATEWAY_PORT=\"4242\"\nMAX_CONCURRENT_DOWNLOADS=2\nCACHE_CAPACITY=10\n\
             RATE_LIMIT_WINDOW_SECS=30\nMEMORY_THRESHOLD_MB=512\nRETRY_BASE_DELAY_MS=250\n\
             GATEWAY_COOKIES_FILE=/srv/cookies.txt\nFFMPEG_PATH=/opt/ffmpeg/bin/ffmpeg\n",
        );
        assert_eq!(config.port, 4242);
        assert_eq!(config.queue.max_concurrent_downloads, 2);
        assert_eq!(config.cache.capacity, 10);
        assert_eq!(config.admission.rate_limit_window, Duration::from_secs(30));
        assert_eq!(config.admission.memory_threshold_bytes, 512 * 1024 * 1024);
        assert_eq!(config.queue.retry_base_delay, Duration::from_millis(250));
        assert_eq!(
            config.resolver.cookies_file,
            Some(PathBuf::from("/srv/cookies.txt"))
        );
        assert_eq!(
            config.resolver.transcoder,
            PathBuf::from("/opt/ffmpeg/bin/ffmpeg")
        );
    }

    #[test]
    fn unparsable_numbers_fall_back_to_defaults() {
        let config = config_from("GATEWAY_PORT=\"nope\"\nQUEUE_CAPACITY=lots\nMAX_RETRIES=-1\n");
        assert_eq!(config.port, DEFAULT_GATEWAY_PORT);
        assert_eq!(config.queue.capacity, 1000);
        assert_eq!(config.queue.max_retries, 3);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let vars = read_env_file(make_config("MAX_CONCURRENT_DOWNLOADS=0\n").path()).unwrap();
        let err = build_config(&vars, |_| None).unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn environment_beats_env_file() {
        let vars = read_env_file(make_config("GATEWAY_HOST=\"file-host\"\n").path()).unwrap();
        let config = build_config(&vars, |key| {
            if key == "GATEWAY_HOST" {
                Some("0.0.0.0".to_string())
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export YT_DLP_PATH="/opt/yt-dlp"
            AUDIO_BITRATE='128K'
            GATEWAY_HOST =  "0.0.0.0"
            GATEWAY_PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("YT_DLP_PATH").unwrap(), "/opt/yt-dlp");
        assert_eq!(vars.get("AUDIO_BITRATE").unwrap(), "128K");
        assert_eq!(vars.get("GATEWAY_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("GATEWAY_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn overrides_take_precedence() {
        let mut vars = HashMap::new();
        vars.insert("GATEWAY_HOST".to_string(), "file-host".to_string());
        vars.insert("GATEWAY_PORT".to_string(), "7000".to_string());
        vars.insert("YT_DLP_PATH".to_string(), "/file/yt-dlp".to_string());

        let overrides = ConfigOverrides {
            host: Some("override-host".into()),
            port: Some(9000),
            env_path: None,
            yt_dlp: Some(PathBuf::from("/override/yt-dlp")),
            ffmpeg: None,
            cookies_file: Some(PathBuf::from("/override/cookies.txt")),
        };

        let config = build_config_with_overrides(
            &vars,
            |key| {
                if key == "GATEWAY_PORT" {
                    Some("8000".to_string())
                } else {
                    None
                }
            },
            overrides,
        )
        .unwrap();

        assert_eq!(config.host, "override-host");
        assert_eq!(config.port, 9000);
        assert_eq!(config.resolver.program, PathBuf::from("/override/yt-dlp"));
        assert_eq!(
            config.resolver.cookies_file,
            Some(PathBuf::from("/override/cookies.txt"))
        );
    }

    #[test]
    fn blank_host_override_is_ignored() {
        let vars = read_env_file(make_config("").path()).unwrap();
        let config = build_config_with_overrides(
            &vars,
            |_| None,
            ConfigOverrides {
                host: Some("   ".into()),
                ..ConfigOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(config.host, DEFAULT_GATEWAY_HOST);
    }
}
