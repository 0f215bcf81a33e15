//! Connection settings read from the environment.

use crate::error::ConfigError;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrmConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl OrmConfig {
    /// Load `.env` if present, then read `DATABASE_URL` (required) and
    /// `ORM_MAX_CONNECTIONS` (default 5).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let max_connections = match lookup("ORM_MAX_CONNECTIONS") {
            None => DEFAULT_MAX_CONNECTIONS,
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "ORM_MAX_CONNECTIONS",
                        value: raw,
                    })
                }
            },
        };
        Ok(OrmConfig {
            database_url,
            max_connections,
        })
    }
}
