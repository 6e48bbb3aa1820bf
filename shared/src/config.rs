use std::env;
use std::process;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        let database_url = get_required_env("DATABASE_URL");
        let database_url = validate_url(&database_url, "DATABASE_URL");

        Self {
            database_url,
            max_connections: parse_env_or("DB_MAX_CONNECTIONS", 10),
            acquire_timeout_seconds: parse_env_or("DB_ACQUIRE_TIMEOUT_SECONDS", 3),
        }
    }
}

pub fn get_required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| {
        eprintln!("ERROR: Required environment variable '{}' is not set", key);
        eprintln!("Please set this variable in your .env file or environment");
        process::exit(1);
    })
}

pub fn get_optional_env(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Reads `key` and parses it, exiting the process when the value is present
/// but malformed. A missing variable yields `default`.
pub fn parse_env_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse::<T>().unwrap_or_else(|_| {
            eprintln!("ERROR: Invalid value in '{}': '{}'", key, raw);
            process::exit(1);
        }),
        _ => default,
    }
}

pub fn parse_port(port_str: &str, var_name: &str) -> u16 {
    port_str.parse::<u16>().unwrap_or_else(|_| {
        eprintln!(
            "ERROR: Invalid port number in '{}': '{}'",
            var_name, port_str
        );
        eprintln!("Port must be a number between 1 and 65535");
        process::exit(1);
    })
}

pub fn validate_url(url: &str, var_name: &str) -> String {
    if url.is_empty() {
        eprintln!("ERROR: Environment variable '{}' cannot be empty", var_name);
        process::exit(1);
    }

    if !url.starts_with("http://")
        && !url.starts_with("https://")
        && !url.starts_with("postgres://")
        && !url.starts_with("postgresql://")
    {
        eprintln!("ERROR: Invalid URL format in '{}': '{}'", var_name, url);
        eprintln!("URL must start with http://, https://, postgres://, or postgresql://");
        process::exit(1);
    }

    url.trim_end_matches('/').to_string()
}
