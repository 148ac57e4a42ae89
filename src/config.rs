// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application configuration loaded from environment variables.
//!
//! A `.env` file in the working directory is honored for local development.

use std::env;
use std::path::PathBuf;

/// Default listen port when `PORT` is unset or unparsable.
pub const DEFAULT_PORT: u16 = 8001;
/// Base URL clients use when running against a local server.
pub const LOCAL_API_URL: &str = "http://localhost:8001";
/// File name of the classifier inside `MODEL_DIR`.
pub const SVM_MODEL_FILE: &str = "svm_model.json";

const DEFAULT_FRONTEND_URL: &str = "http://localhost:3000";
const DEFAULT_MONGODB_URL: &str = "mongodb://localhost:27017";
const DEFAULT_MONGODB_DATABASE: &str = "emotion_recognition";

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server port
    pub port: u16,
    /// Frontend origin allowed by CORS
    pub frontend_url: String,
    /// Development mode: clients talk to the local server
    pub dev_mode: bool,
    /// Public deployed base URL of this API
    pub public_api_url: String,
    pub redis: RedisSettings,
    pub mongo: MongoSettings,
    /// Directory holding the trained classifier
    pub model_dir: PathBuf,
    /// Reverse proxies in front of the server that append to
    /// `X-Forwarded-For`. Zero means the header is ignored.
    pub trusted_proxy_hops: usize,
}

impl Default for Config {
    /// Default config for testing only.
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            frontend_url: DEFAULT_FRONTEND_URL.to_string(),
            dev_mode: true,
            public_api_url: LOCAL_API_URL.to_string(),
            redis: RedisSettings::default(),
            mongo: MongoSettings {
                url: DEFAULT_MONGODB_URL.to_string(),
                database: "emotion_recognition_test".to_string(),
                require_tls: false,
            },
            model_dir: PathBuf::from("models"),
            trusted_proxy_hops: 0,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let mongo_url = env::var("MONGODB_URL").unwrap_or_else(|_| DEFAULT_MONGODB_URL.to_string());
        let require_tls = match env::var("MONGODB_TLS") {
            Ok(v) => parse_bool(&v).ok_or(ConfigError::Invalid("MONGODB_TLS"))?,
            Err(_) => mongo_tls_required_by_default(&mongo_url),
        };
        let mongo = MongoSettings {
            url: mongo_url,
            database: env::var("MONGODB_DATABASE")
                .unwrap_or_else(|_| DEFAULT_MONGODB_DATABASE.to_string()),
            require_tls,
        };
        mongo.validate()?;

        Ok(Self {
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(DEFAULT_PORT),
            frontend_url: env::var("FRONTEND_URL")
                .unwrap_or_else(|_| DEFAULT_FRONTEND_URL.to_string()),
            dev_mode: env::var("DEV_MODE")
                .ok()
                .and_then(|v| parse_bool(&v))
                .unwrap_or(false),
            public_api_url: env::var("API_PUBLIC_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| LOCAL_API_URL.to_string()),
            redis: RedisSettings::from_env()?,
            mongo,
            model_dir: env::var("MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("models")),
            trusted_proxy_hops: match env::var("TRUSTED_PROXY_HOPS") {
                Ok(v) => v
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::Invalid("TRUSTED_PROXY_HOPS"))?,
                Err(_) => 0,
            },
        })
    }

    /// Base URL clients should use for this deployment.
    pub fn api_base_url(&self) -> &str {
        if self.dev_mode {
            LOCAL_API_URL
        } else {
            &self.public_api_url
        }
    }

    /// Socket address the server binds to.
    pub fn bind_address(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    pub fn svm_model_path(&self) -> PathBuf {
        self.model_dir.join(SVM_MODEL_FILE)
    }
}

/// Redis connection settings for the rate limiter.
#[derive(Debug, Clone, PartialEq)]
pub enum RedisSettings {
    /// Full connection URL (hosted deployments)
    Url(String),
    /// Discrete host/port/db (local development)
    Parts { host: String, port: u16, db: i64 },
}

impl Default for RedisSettings {
    fn default() -> Self {
        RedisSettings::Parts {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
        }
    }
}

impl RedisSettings {
    fn from_env() -> Result<Self, ConfigError> {
        if let Ok(url) = env::var("REDIS_URL") {
            if !url.trim().is_empty() {
                return Ok(RedisSettings::Url(url.trim().to_string()));
            }
        }

        Ok(RedisSettings::Parts {
            host: env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: match env::var("REDIS_PORT") {
                Ok(p) => p.parse().map_err(|_| ConfigError::Invalid("REDIS_PORT"))?,
                Err(_) => 6379,
            },
            db: match env::var("REDIS_DB") {
                Ok(d) => d.parse().map_err(|_| ConfigError::Invalid("REDIS_DB"))?,
                Err(_) => 0,
            },
        })
    }

    /// Connection URL understood by the redis client.
    pub fn url(&self) -> String {
        match self {
            RedisSettings::Url(url) => url.clone(),
            RedisSettings::Parts { host, port, db } => format!("redis://{}:{}/{}", host, port, db),
        }
    }
}

/// Document store connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct MongoSettings {
    pub url: String,
    pub database: String,
    /// Refuse to connect without TLS (managed providers require 1.2+)
    pub require_tls: bool,
}

impl MongoSettings {
    /// Reject URL options that would weaken a required TLS connection.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.require_tls {
            return Ok(());
        }

        let query = self.url.split_once('?').map(|(_, q)| q).unwrap_or("");
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let enabled = parse_bool(value);
            let weakens = match key.to_ascii_lowercase().as_str() {
                "tlsinsecure" | "tlsallowinvalidcertificates" | "tlsallowinvalidhostnames" => {
                    enabled == Some(true)
                }
                "tls" | "ssl" => enabled == Some(false),
                _ => false,
            };
            if weakens {
                return Err(ConfigError::InsecureTls(key.to_string()));
            }
        }
        Ok(())
    }
}

/// TLS is required for every host except loopback and SRV lookups always use it.
fn mongo_tls_required_by_default(url: &str) -> bool {
    if url.starts_with("mongodb+srv://") {
        return true;
    }
    let rest = url.trim_start_matches("mongodb://");
    let authority = rest.split(['/', '?']).next().unwrap_or("");
    let hosts = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);
    !hosts.split(',').all(|host| {
        let name = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
        matches!(name, "localhost" | "127.0.0.1" | "[::1]")
    })
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("MONGODB_URL option '{0}' weakens the required TLS connection")]
    InsecureTls(String),
}
