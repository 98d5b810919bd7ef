use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use river::consumer_retry::RetryConfig;

use crate::dispatcher::DispatcherConfig;
use crate::dlq::DEFAULT_DEAD_LETTER_SUBJECT;
use crate::routing::HandlerDefaults;

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub bus_type: String,
    pub nats_url: String,
    pub river_stream: String,
    pub river_subjects: Vec<String>,
    pub visibility_timeout: Duration,

    pub bindings_path: PathBuf,
    pub script_root: PathBuf,

    pub inference_base_url: Option<String>,
    pub inference_api_key: Option<String>,
    pub inference_model: String,

    pub dispatcher: DispatcherConfig,
    pub handlers: HandlerDefaults,

    pub host: String,
    pub port: u16,
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("{name} must be a valid {}", std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// `crm.>=1,lead.*=2` style overrides
fn parse_overrides(raw: &str) -> Result<Vec<(String, usize)>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (pattern, limit) = entry
                .rsplit_once('=')
                .ok_or_else(|| format!("SUBJECT_CONCURRENCY_OVERRIDES entry '{entry}' must be pattern=limit"))?;
            let limit: usize = limit
                .trim()
                .parse()
                .map_err(|_| format!("SUBJECT_CONCURRENCY_OVERRIDES limit in '{entry}' must be a number"))?;
            Ok((pattern.trim().to_string(), limit))
        })
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let bindings_path = env::var("BINDINGS_PATH")
            .map(PathBuf::from)
            .map_err(|_| "BINDINGS_PATH must be set".to_string())?;

        let bus_type = env::var("BUS_TYPE").unwrap_or_else(|_| "inmemory".to_string());
        let nats_url = env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());
        let river_stream = env::var("RIVER_STREAM").unwrap_or_else(|_| "RIVER".to_string());
        let river_subjects = env::var("RIVER_SUBJECTS")
            .unwrap_or_else(|_| ">".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let visibility_timeout = Duration::from_secs(parse_var("VISIBILITY_TIMEOUT_SECS", 30u64)?);

        let script_root = env::var("SCRIPT_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("scripts"));

        let inference_base_url = optional_var("INFERENCE_BASE_URL");
        let inference_api_key = optional_var("INFERENCE_API_KEY");
        let inference_model =
            env::var("INFERENCE_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let defaults = DispatcherConfig::default();
        let dispatcher = DispatcherConfig {
            consumer_group: env::var("CONSUMER_GROUP")
                .unwrap_or_else(|_| defaults.consumer_group.clone()),
            subscribe_pattern: env::var("SUBSCRIBE_PATTERN")
                .unwrap_or_else(|_| defaults.subscribe_pattern.clone()),
            subject_concurrency: parse_var("SUBJECT_CONCURRENCY", defaults.subject_concurrency)?,
            concurrency_overrides: match optional_var("SUBJECT_CONCURRENCY_OVERRIDES") {
                Some(raw) => parse_overrides(&raw)?,
                None => Vec::new(),
            },
            retry: RetryConfig {
                max_attempts: parse_var("MAX_ATTEMPTS", defaults.retry.max_attempts)?,
                initial_backoff: Duration::from_millis(parse_var("INITIAL_BACKOFF_MS", 100u64)?),
                max_backoff: Duration::from_millis(parse_var("MAX_BACKOFF_MS", 30_000u64)?),
            },
            max_deliveries: parse_var("MAX_DELIVERIES", defaults.max_deliveries)?,
            max_hops: parse_var("MAX_HOPS", defaults.max_hops)?,
            dead_letter_subject: env::var("DEAD_LETTER_SUBJECT")
                .unwrap_or_else(|_| DEFAULT_DEAD_LETTER_SUBJECT.to_string()),
            dedup_ttl: Duration::from_secs(parse_var("DEDUP_WINDOW_SECS", 3600u64)?),
            dedup_capacity: parse_var("DEDUP_CAPACITY", defaults.dedup_capacity)?,
            lease_refresh: Duration::from_millis(parse_var(
                "LEASE_REFRESH_MS",
                (visibility_timeout / 3).as_millis() as u64,
            )?),
            ..defaults
        };
        if dispatcher.lease_refresh.is_zero() || dispatcher.lease_refresh >= visibility_timeout {
            return Err("LEASE_REFRESH_MS must be positive and shorter than VISIBILITY_TIMEOUT_SECS".to_string());
        }

        let handler_defaults = HandlerDefaults::default();
        let handlers = HandlerDefaults {
            script_timeout: Duration::from_millis(parse_var("SCRIPT_TIMEOUT_MS", 2_000u64)?),
            inference_timeout: Duration::from_millis(parse_var("INFERENCE_TIMEOUT_MS", 30_000u64)?),
            max_instructions: parse_var("SCRIPT_MAX_INSTRUCTIONS", handler_defaults.max_instructions)?,
            max_memory_bytes: parse_var("SCRIPT_MAX_MEMORY_BYTES", handler_defaults.max_memory_bytes)?,
        };

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port: u16 = parse_var("PORT", 8095)?;

        Ok(Config {
            bus_type,
            nats_url,
            river_stream,
            river_subjects,
            visibility_timeout,
            bindings_path,
            script_root,
            inference_base_url,
            inference_api_key,
            inference_model,
            dispatcher,
            handlers,
            host,
            port,
        })
    }
}
