//! CLI arguments, environment configuration and startup validation.

use argon2::password_hash::{PasswordHash, PasswordHasher, SaltString};
use argon2::Argon2;
use clap::Parser;
use rand::rngs::OsRng;
use shadow_rs::formatcp;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::build;
use crate::rate_limit::Limit;
use crate::upload::AllowedExtensions;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const SESSION_COOKIE_NAME: &str = "DROP_SESSION";
pub const FLASH_COOKIE_NAME: &str = "DROP_FLASH";
pub const DEFAULT_UPLOAD_FOLDER: &str = "/paperless-consume";
pub const DEFAULT_ALLOWED_EXTENSIONS: &str = "pdf,png,jpg,jpeg,gif,tiff,txt,doc,docx";
pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_LIMITS: &str = "200 per day,50 per hour";
pub const DEFAULT_LOGIN_LIMIT: &str = "10 per minute";
pub const DEFAULT_UPLOAD_LIMIT: &str = "20 per minute";
pub const PLACEHOLDER_PASSWORD: &str = "changeme";
pub const MIN_SECRET_KEY_LEN: usize = 32;
pub const RATE_PRUNE_INTERVAL_SECS: u64 = 300;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "consume-drop", version = VERSION_INFO, about = "Password-gated upload form for a consume directory")]
pub struct Args {
    #[arg(
        long,
        env = "SECRET_KEY",
        hide_env_values = true,
        help = "Session signing secret (at least 32 bytes)"
    )]
    pub secret_key: Option<String>,
    #[arg(
        long,
        env = "PASSWORD_HASH",
        hide_env_values = true,
        help = "Argon2 password hash; `$$` is read as `$`"
    )]
    pub password_hash: Option<String>,
    #[arg(
        short = 'u',
        long,
        env = "UPLOAD_FOLDER",
        default_value = DEFAULT_UPLOAD_FOLDER,
        help = "Directory accepted files are written to"
    )]
    pub upload_folder: String,
    #[arg(
        long,
        env = "ALLOWED_EXTENSIONS",
        default_value = DEFAULT_ALLOWED_EXTENSIONS,
        help = "Comma separated list of accepted extensions"
    )]
    pub allowed_extensions: String,
    #[arg(
        long,
        env = "MAX_FILE_SIZE",
        default_value_t = DEFAULT_MAX_FILE_SIZE,
        help = "Max total upload request size in bytes"
    )]
    pub max_file_size: u64,
    #[arg(
        short = 'b',
        long,
        env = "BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(short = 'p', long, env = "PORT", default_value_t = 5000, help = "HTTP port")]
    pub port: u16,
    #[arg(
        long,
        env = "SESSION_TTL_SECS",
        default_value_t = DEFAULT_SESSION_TTL_SECS,
        help = "Session expiration in seconds"
    )]
    pub session_ttl_secs: u64,
    #[arg(
        long,
        env = "TRUST_PROXY",
        help = "Use X-Forwarded-For as the client address"
    )]
    pub trust_proxy: bool,
    #[arg(
        long,
        env = "DEFAULT_LIMITS",
        default_value = DEFAULT_LIMITS,
        value_delimiter = ',',
        help = "Rate limits applied to every throttled route"
    )]
    pub default_limits: Vec<Limit>,
    #[arg(
        long,
        env = "LOGIN_LIMIT",
        default_value = DEFAULT_LOGIN_LIMIT,
        help = "Additional rate limit for /login"
    )]
    pub login_limit: Limit,
    #[arg(
        long,
        env = "UPLOAD_LIMIT",
        default_value = DEFAULT_UPLOAD_LIMIT,
        help = "Additional rate limit for the upload page"
    )]
    pub upload_limit: Limit,
}

/// Validated settings, immutable for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: IpAddr,
    pub port: u16,
    pub secret_key: String,
    pub password_hash: String,
    pub upload_folder: PathBuf,
    pub allowed_extensions: AllowedExtensions,
    pub max_file_size: usize,
    pub session_ttl: Duration,
    pub trust_proxy: bool,
    pub default_limits: Vec<Limit>,
    pub login_limit: Limit,
    pub upload_limit: Limit,
}

#[derive(Debug)]
pub enum ConfigError {
    MissingSecretKey,
    SecretKeyTooShort(usize),
    InvalidPasswordHash(String),
    NoAllowedExtensions,
    InvalidMaxFileSize(u64),
    InvalidSessionTtl,
    InvalidHost(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingSecretKey => {
                write!(f, "SECRET_KEY is not set; generate one with consume-drop-credentials")
            }
            ConfigError::SecretKeyTooShort(len) => write!(
                f,
                "SECRET_KEY must be at least {MIN_SECRET_KEY_LEN} bytes (got {len})"
            ),
            ConfigError::InvalidPasswordHash(reason) => {
                write!(f, "PASSWORD_HASH is not a valid password hash: {reason}")
            }
            ConfigError::NoAllowedExtensions => write!(f, "ALLOWED_EXTENSIONS is empty"),
            ConfigError::InvalidMaxFileSize(value) => {
                write!(f, "MAX_FILE_SIZE must be between 1 and {} (got {value})", usize::MAX)
            }
            ConfigError::InvalidSessionTtl => write!(f, "SESSION_TTL_SECS must be positive"),
            ConfigError::InvalidHost(value) => write!(f, "invalid bind address: {value}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Settings {
    /// Validates parsed arguments; every failure here aborts startup.
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let secret_key = args
            .secret_key
            .filter(|value| !value.trim().is_empty())
            .ok_or(ConfigError::MissingSecretKey)?;
        if secret_key.len() < MIN_SECRET_KEY_LEN {
            return Err(ConfigError::SecretKeyTooShort(secret_key.len()));
        }

        let password_hash = match args.password_hash.filter(|value| !value.trim().is_empty()) {
            Some(value) => {
                let decoded = unescape_password_hash(value.trim());
                PasswordHash::new(&decoded)
                    .map_err(|err| ConfigError::InvalidPasswordHash(err.to_string()))?;
                decoded
            }
            None => {
                warn!(
                    "PASSWORD_HASH is not set, falling back to the placeholder password; set it before exposing the service"
                );
                placeholder_password_hash()?
            }
        };

        let allowed_extensions = AllowedExtensions::parse(&args.allowed_extensions);
        if allowed_extensions.is_empty() {
            return Err(ConfigError::NoAllowedExtensions);
        }

        let max_file_size = usize::try_from(args.max_file_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or(ConfigError::InvalidMaxFileSize(args.max_file_size))?;

        if args.session_ttl_secs == 0 {
            return Err(ConfigError::InvalidSessionTtl);
        }

        let host = args
            .host
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidHost(args.host.clone()))?;

        Ok(Self {
            host,
            port: args.port,
            secret_key,
            password_hash,
            upload_folder: PathBuf::from(args.upload_folder),
            allowed_extensions,
            max_file_size,
            session_ttl: Duration::from_secs(args.session_ttl_secs),
            trust_proxy: args.trust_proxy,
            default_limits: args.default_limits,
            login_limit: args.login_limit,
            upload_limit: args.upload_limit,
        })
    }
}

/// Decodes the `$$` escaping used to get hashes through compose files.
pub fn unescape_password_hash(value: &str) -> String {
    value.replace("$$", "$")
}

fn placeholder_password_hash() -> Result<String, ConfigError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(PLACEHOLDER_PASSWORD.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| ConfigError::InvalidPasswordHash(err.to_string()))
}
