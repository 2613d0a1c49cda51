use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};

/// Secrets that must never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &["", "changeme", "change-me", "dev-secret-change-me", "secret"];

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub upload_dir: PathBuf,
    pub turn_secret: Option<String>,
    pub turn_urls: Vec<String>,
    pub turn_ttl_secs: u64,
    pub notify_interval: Duration,
    pub email_webhook: Option<String>,
    pub sms_webhook: Option<String>,
    pub whatsapp_webhook: Option<String>,
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw.parse().map_err(|e| anyhow::anyhow!("{} is invalid: {}", name, e)),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let jwt_secret = var("CAMPUS_JWT_SECRET").context("CAMPUS_JWT_SECRET must be set")?;
        if PLACEHOLDER_SECRETS.contains(&jwt_secret.to_lowercase().as_str()) {
            bail!("CAMPUS_JWT_SECRET is a placeholder value; set a real secret");
        }

        let turn_urls = var("CAMPUS_TURN_URLS")
            .map(|raw| raw.split(',').map(|u| u.trim().to_string()).filter(|u| !u.is_empty()).collect())
            .unwrap_or_default();

        Ok(Self {
            host: var("CAMPUS_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed("CAMPUS_PORT", 3000)?,
            db_path: PathBuf::from(var("CAMPUS_DB_PATH").unwrap_or_else(|| "campus.db".into())),
            jwt_secret,
            upload_dir: PathBuf::from(var("CAMPUS_UPLOAD_DIR").unwrap_or_else(|| "./uploads".into())),
            turn_secret: var("CAMPUS_TURN_SECRET"),
            turn_urls,
            turn_ttl_secs: parsed("CAMPUS_TURN_TTL_SECS", 86_400)?,
            notify_interval: Duration::from_secs(parsed("CAMPUS_NOTIFY_INTERVAL_SECS", 30)?),
            email_webhook: var("CAMPUS_EMAIL_WEBHOOK"),
            sms_webhook: var("CAMPUS_SMS_WEBHOOK"),
            whatsapp_webhook: var("CAMPUS_WHATSAPP_WEBHOOK"),
        })
    }
}
