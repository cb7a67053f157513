//! Credentials loaded once at startup and handed to each collaborator.
//!
//! `Credentials::bootstrap` is the only place that touches the process
//! environment for secrets: it loads an optional `.env` file, reads the
//! known variables, and removes them so spawned subprocesses and containers
//! never inherit them implicitly.

use std::fmt;
use std::path::Path;

use crate::errors::{ReesError, Result};

pub const REGISTRY_USERNAME_VAR: &str = "DOCKER_PRIVATE_REGISTRY_USERNAME";
pub const REGISTRY_PASSWORD_VAR: &str = "DOCKER_PRIVATE_REGISTRY_PASSWORD";
pub const CURVENOTE_TOKEN_VAR: &str = "CURVENOTE_TOKEN";

/// Basic-auth credentials for the private container registry.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub registry: Option<RegistryAuth>,
    pub curvenote_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("registry", &self.registry)
            .field(
                "curvenote_token",
                &self.curvenote_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl Credentials {
    /// Build credentials from raw values. Registry auth needs both halves.
    pub fn from_values(
        username: Option<String>,
        password: Option<String>,
        curvenote_token: Option<String>,
    ) -> Self {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        let registry = match (non_empty(username), non_empty(password)) {
            (Some(username), Some(password)) => Some(RegistryAuth { username, password }),
            _ => None,
        };
        Self {
            registry,
            curvenote_token: non_empty(curvenote_token),
        }
    }

    /// Load `<dir>/.env` (if present) and the process environment, then
    /// scrub the secret variables from the environment.
    ///
    /// Runs before logging is initialised, so it reports nothing itself.
    ///
    /// # Safety
    ///
    /// Mutates the process environment. Call it before any other thread is
    /// started, which in this crate means before the logging writer and the
    /// async runtime exist.
    pub unsafe fn bootstrap(dotenv_dir: &Path) -> Result<Self> {
        let env_file = dotenv_dir.join(".env");
        if env_file.is_file() {
            dotenvy::from_path(&env_file).map_err(|e| {
                ReesError::configuration(format!(
                    "failed to load credentials file {}: {}",
                    env_file.display(),
                    e
                ))
            })?;
        }

        let credentials = Self::from_values(
            std::env::var(REGISTRY_USERNAME_VAR).ok(),
            std::env::var(REGISTRY_PASSWORD_VAR).ok(),
            std::env::var(CURVENOTE_TOKEN_VAR).ok(),
        );

        for var in [REGISTRY_USERNAME_VAR, REGISTRY_PASSWORD_VAR, CURVENOTE_TOKEN_VAR] {
            // SAFETY: upheld by the caller of `bootstrap`.
            unsafe { std::env::remove_var(var) };
        }

        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_values_requires_both_registry_halves() {
        let c = Credentials::from_values(Some("u".into()), None, None);
        assert!(c.registry.is_none());
        let c = Credentials::from_values(Some("u".into()), Some("".into()), None);
        assert!(c.registry.is_none());
        let c = Credentials::from_values(Some("u".into()), Some("p".into()), None);
        assert_eq!(
            c.registry,
            Some(RegistryAuth {
                username: "u".into(),
                password: "p".into()
            })
        );
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let c = Credentials::from_values(
            Some("alice".into()),
            Some("hunter2".into()),
            Some("cn-token".into()),
        );
        let rendered = format!("{:?}", c);
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("cn-token"));
    }

    #[test]
    fn test_default_is_anonymous() {
        let c = Credentials::default();
        assert!(c.registry.is_none());
        assert!(c.curvenote_token.is_none());
    }
}
