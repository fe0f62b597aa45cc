use crate::error::{GatewayError, Result};
use secrecy::Secret;
use std::env;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Secret string wrapper that prevents accidental exposure
pub type SecretString = Secret<String>;

/// Environment prefix for `secret://key` references
pub const SECRET_ENV_PREFIX: &str = "GATEWAY_SECRET_";

/// Directory searched for `secret://key` references (Kubernetes mounted secrets)
pub const SECRET_DIR: &str = "/var/run/secrets/gateway";

fn read_file(path: &Path) -> Result<SecretString> {
    fs::read_to_string(path)
        .map(|s| Secret::new(s.trim().to_string()))
        .map_err(|e| {
            GatewayError::Config(format!("Failed to read secret from {}: {}", path.display(), e))
        })
}

/// Resolve a secret reference
///
/// Supports formats:
/// - "env://VAR" - environment variable
/// - "file:///path/to/file" - file contents, trimmed
/// - "secret://key" - `GATEWAY_SECRET_KEY`, then `/var/run/secrets/gateway/key`
/// - Any other value is taken literally
pub fn resolve_secret(reference: &str) -> Result<SecretString> {
    if let Some(var) = reference.strip_prefix("env://") {
        debug!(var = %var, "Resolving secret from environment");
        env::var(var)
            .map(Secret::new)
            .map_err(|_| GatewayError::Config(format!("Environment variable '{}' not found", var)))
    } else if let Some(path) = reference.strip_prefix("file://") {
        debug!(path = %path, "Resolving secret from file");
        read_file(Path::new(path))
    } else if let Some(key) = reference.strip_prefix("secret://") {
        debug!(key = %key, "Resolving named secret");
        let env_key = format!("{}{}", SECRET_ENV_PREFIX, key.to_uppercase());
        match env::var(&env_key) {
            Ok(value) => Ok(Secret::new(value)),
            Err(_) => {
                let path = Path::new(SECRET_DIR).join(key);
                if path.exists() {
                    read_file(&path)
                } else {
                    Err(GatewayError::Config(format!("Secret '{}' not found", key)))
                }
            }
        }
    } else {
        Ok(Secret::new(reference.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_literal_value() {
        let secret = resolve_secret("redis://127.0.0.1:6379").unwrap();
        assert_eq!(secret.expose_secret(), "redis://127.0.0.1:6379");
    }

    #[test]
    fn test_env_reference() {
        std::env::set_var("ADMISSION_TEST_REDIS_URL", "redis://cache:6379");
        let secret = resolve_secret("env://ADMISSION_TEST_REDIS_URL").unwrap();
        assert_eq!(secret.expose_secret(), "redis://cache:6379");
        std::env::remove_var("ADMISSION_TEST_REDIS_URL");

        assert!(resolve_secret("env://ADMISSION_TEST_MISSING_VAR").is_err());
    }

    #[test]
    fn test_named_secret_from_env() {
        std::env::set_var("GATEWAY_SECRET_REDIS_PASSWORD", "hunter2");
        let secret = resolve_secret("secret://redis_password").unwrap();
        assert_eq!(secret.expose_secret(), "hunter2");
        std::env::remove_var("GATEWAY_SECRET_REDIS_PASSWORD");

        assert!(resolve_secret("secret://admission_test_absent").is_err());
    }

    #[test]
    fn test_file_reference() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "redis://file-host:6379").unwrap();

        let reference = format!("file://{}", file.path().display());
        let secret = resolve_secret(&reference).unwrap();
        assert_eq!(secret.expose_secret(), "redis://file-host:6379");
    }
}
