//! Worker configuration.
//!
//! Unlike a typical CLI tool, this worker is configured entirely from the
//! process environment — there is no config file. [`Settings::from_env`]
//! reads every variable once at startup and fails fast (naming the
//! offending variable) if something required is missing or malformed.
//!
//! # Example
//!
//! ```no_run
//! use benchmark_worker::config::Settings;
//!
//! let settings = Settings::from_env().expect("invalid configuration");
//! println!("consuming queue {}", settings.rabbitmq.experiment_queue);
//! ```

pub mod schema;

pub use schema::*;

use std::env;

use anyhow::{Context, Result, bail};

/// Reads a required environment variable, erroring with the variable name if absent.
fn must_env(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("missing required environment variable {name}"))
}

fn opt_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn as_int(name: &str, default: i64) -> Result<i64> {
    match opt_env(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<i64>()
            .with_context(|| format!("{name} must be an integer, got {raw:?}")),
    }
}

fn as_float(name: &str, default: f64) -> Result<f64> {
    match opt_env(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<f64>()
            .with_context(|| format!("{name} must be a number, got {raw:?}")),
    }
}

fn as_bool(name: &str, default: bool) -> Result<bool> {
    match opt_env(name) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => bail!("{name} must be a boolean (1/true/yes/on or 0/false/no/off), got {other:?}"),
        },
    }
}

fn as_pull_policy(name: &str, default: PullPolicy) -> Result<PullPolicy> {
    match opt_env(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<PullPolicy>()
            .with_context(|| format!("{name} must be one of always/if-not-present/never")),
    }
}

fn as_database_engine(name: &str, default: DatabaseEngine) -> Result<DatabaseEngine> {
    match opt_env(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<DatabaseEngine>()
            .with_context(|| format!("{name} must be one of postgres/mysql")),
    }
}

impl Settings {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first missing or malformed variable
    /// encountered.
    pub fn from_env() -> Result<Self> {
        let rabbitmq = RabbitMqSettings {
            host: must_env("CONSUMER_RABBITMQ_HOST")?,
            port: as_int("CONSUMER_RABBITMQ_PORT", 5672)? as u16,
            user: must_env("CONSUMER_RABBITMQ_USER")?,
            password: must_env("CONSUMER_RABBITMQ_PASSWORD")?,
            vhost: opt_env("CONSUMER_RABBITMQ_VHOST").unwrap_or_else(|| "/".to_string()),
            experiment_queue: must_env("CONSUMER_EXPERIMENT_QUEUE")?,
        };

        let redis = RedisSettings {
            host: must_env("CONSUMER_REDIS_HOST")?,
            port: as_int("CONSUMER_REDIS_PORT", 6379)? as u16,
            username: opt_env("CONSUMER_REDIS_USERNAME"),
            password: opt_env("CONSUMER_REDIS_PASSWORD"),
            db: as_int("CONSUMER_REDIS_DB", 0)? as i64,
            processing_lock_ttl_seconds: as_int("CONSUMER_REDIS_PROCESSING_LOCK_TTL_SECONDS", 900)? as u64,
            processed_ttl_seconds: as_int("CONSUMER_REDIS_PROCESSED_TTL_SECONDS", 86_400)? as u64,
        };

        let database_engine = as_database_engine("CONSUMER_DATABASE_ENGINE", DatabaseEngine::Postgres)?;
        if database_engine != DatabaseEngine::Postgres {
            bail!("E_UNSUPPORTED_DATABASE_ENGINE: {database_engine:?} is not implemented by this worker");
        }
        let postgres = PostgresSettings {
            server: must_env("CONSUMER_POSTGRES_SERVER")?,
            port: as_int("CONSUMER_POSTGRES_PORT", 5432)? as u16,
            user: must_env("CONSUMER_POSTGRES_USER")?,
            password: must_env("CONSUMER_POSTGRES_PASSWORD")?,
            db: must_env("CONSUMER_POSTGRES_DB")?,
        };

        let otel = OtelSettings {
            enabled: as_bool("CONSUMER_OTEL_ENABLED", true)?,
            endpoint: opt_env("CONSUMER_OTEL_ENDPOINT"),
            query_timeout_seconds: as_int("CONSUMER_OTEL_QUERY_TIMEOUT_SECONDS", 10)? as u64,
            protocol: opt_env("CONSUMER_OTEL_PROTOCOL").unwrap_or_else(|| "http/protobuf".to_string()),
            collector_enabled: as_bool("CONSUMER_OTEL_COLLECTOR_ENABLED", true)?,
            collector_host: opt_env("CONSUMER_OTEL_COLLECTOR_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            collector_port: as_int("CONSUMER_OTEL_COLLECTOR_PORT", 4318)? as u16,
            collector_path: opt_env("CONSUMER_OTEL_COLLECTOR_PATH").unwrap_or_else(|| "/v1/traces".to_string()),
            public_endpoint: opt_env("CONSUMER_OTEL_PUBLIC_ENDPOINT"),
        };

        let evaluator = EvaluatorSettings {
            timeout_seconds: as_float("CONSUMER_EVALUATOR_TIMEOUT_SECONDS", 60.0)?,
            connect_timeout_seconds: as_float("CONSUMER_EVALUATOR_CONNECT_TIMEOUT_SECONDS", 10.0)?,
            read_timeout_seconds: as_float("CONSUMER_EVALUATOR_READ_TIMEOUT_SECONDS", 60.0)?,
            max_retries: as_int("CONSUMER_EVALUATOR_MAX_RETRIES", 3)? as u32,
            retry_backoff_seconds: as_float("CONSUMER_EVALUATOR_RETRY_BACKOFF_SECONDS", 1.0)?,
            scorer_hard_timeout_seconds: as_float("CONSUMER_SCORER_HARD_TIMEOUT_SECONDS", 60.0)?,
        };

        Ok(Settings {
            rabbitmq,
            redis,
            postgres,
            otel,
            evaluator,
            concurrent_cases: as_int("CONSUMER_CONCURRENT_CASES", 2)? as usize,
            scorer_concurrent_cases: as_int("CONSUMER_SCORER_CONCURRENT_CASES", 2)? as usize,
            max_message_retries: as_int("CONSUMER_MAX_MESSAGE_RETRIES", 3)? as u32,
            case_timeout_seconds: as_int("CONSUMER_CASE_TIMEOUT_SECONDS", 900)? as u64,
            docker_network: opt_env("CONSUMER_DOCKER_NETWORK"),
            agent_exec_command: opt_env("CONSUMER_AGENT_EXEC_COMMAND"),
            docker_pull_policy: as_pull_policy("CONSUMER_DOCKER_PULL_POLICY", PullPolicy::Always)?,
            docker_pull_timeout_seconds: as_int("CONSUMER_DOCKER_PULL_TIMEOUT_SECONDS", 600)? as u64,
            docker_run_timeout_seconds: as_int("CONSUMER_DOCKER_RUN_TIMEOUT_SECONDS", 60)? as u64,
            docker_inspect_timeout_seconds: as_int("CONSUMER_DOCKER_INSPECT_TIMEOUT_SECONDS", 30)? as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variable tests must not run concurrently with each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn as_bool_accepts_common_spellings() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { env::set_var("TEST_BOOL_FLAG", "Yes") };
        assert!(as_bool("TEST_BOOL_FLAG", false).unwrap());
        unsafe { env::set_var("TEST_BOOL_FLAG", "off") };
        assert!(!as_bool("TEST_BOOL_FLAG", true).unwrap());
        unsafe { env::remove_var("TEST_BOOL_FLAG") };
    }

    #[test]
    fn as_bool_rejects_garbage() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { env::set_var("TEST_BOOL_FLAG_2", "maybe") };
        assert!(as_bool("TEST_BOOL_FLAG_2", true).is_err());
        unsafe { env::remove_var("TEST_BOOL_FLAG_2") };
    }

    #[test]
    fn as_int_falls_back_to_default_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { env::remove_var("TEST_INT_UNSET") };
        assert_eq!(as_int("TEST_INT_UNSET", 42).unwrap(), 42);
    }

    #[test]
    fn pull_policy_parses_all_variants() {
        let _guard = ENV_LOCK.lock().unwrap();
        for (raw, expected) in [
            ("always", PullPolicy::Always),
            ("if-not-present", PullPolicy::IfNotPresent),
            ("never", PullPolicy::Never),
        ] {
            unsafe { env::set_var("TEST_PULL_POLICY", raw) };
            assert_eq!(
                as_pull_policy("TEST_PULL_POLICY", PullPolicy::Always).unwrap(),
                expected
            );
        }
        unsafe { env::remove_var("TEST_PULL_POLICY") };
    }
}
