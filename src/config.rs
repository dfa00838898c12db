use mongodb::{Client, Database};
use std::{env, path::PathBuf, str::FromStr};
use dotenv::dotenv;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("JWT_SECRET must be set to a non-empty value")]
    MissingJwtSecret,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub mongo_uri: String,
    pub database_name: String,
    pub bind_address: String,
    pub jwt_secret: String,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();

        let jwt_secret = require_secret(env::var("JWT_SECRET").ok())?;

        Ok(Settings {
            mongo_uri: env::var("MONGODB_URI")
                .unwrap_or_else(|_| "mongodb://localhost:27017".to_string()),
            database_name: env::var("DATABASE_NAME")
                .unwrap_or_else(|_| "products_db".to_string()),
            bind_address: env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            jwt_secret,
            upload_dir: env::var("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("uploads")),
            max_upload_bytes: parse_or("MAX_UPLOAD_BYTES", 5 * 1024 * 1024),
        })
    }
}

fn require_secret(value: Option<String>) -> Result<String, ConfigError> {
    match value {
        Some(secret) if !secret.trim().is_empty() => Ok(secret),
        _ => Err(ConfigError::MissingJwtSecret),
    }
}

fn parse_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Ignoring unparsable {}={:?}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

pub struct MongoConfig {
    pub database: Database,
}

impl MongoConfig {
    pub async fn init(settings: &Settings) -> Result<Self, mongodb::error::Error> {
        let client = Client::with_uri_str(&settings.mongo_uri).await?;
        let database = client.database(&settings.database_name);

        Ok(MongoConfig { database })
    }
}
