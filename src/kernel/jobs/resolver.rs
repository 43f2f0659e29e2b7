//! Parameter resolver (§4.C): interpolates prior task outputs into parameter
//! strings and decrypts referenced secrets into a separate env map.

use crate::kernel::jobs::model::TaskConfig;
use crate::kernel::jobs::secrets::{Secret, SecretCipher, SecretError};
use sqlx::PgPool;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("secret '{0}' not found")]
    SecretNotFound(String),
    #[error("failed to decrypt secret '{0}': {1}")]
    DecryptFailed(String, String),
}

pub struct Resolved {
    pub params: HashMap<String, String>,
    pub secret_env: HashMap<String, String>,
}

/// Replace every `${TASK_OUTPUT.<name>}` or `${<name>.output}` occurrence
/// with `task_outputs[name]`. Unknown names are left as the literal
/// placeholder (§9 design note: no raise on unknown placeholder).
pub fn interpolate(value: &str, task_outputs: &HashMap<String, String>) -> String {
    let mut result = String::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
            if let Some(end) = value[i..].find('}') {
                let inner = &value[i + 2..i + end];
                let name = if let Some(rest) = inner.strip_prefix("TASK_OUTPUT.") {
                    Some(rest)
                } else {
                    inner.strip_suffix(".output")
                };
                match name.and_then(|n| task_outputs.get(n)) {
                    Some(output) => {
                        result.push_str(output);
                        i += end + 1;
                        continue;
                    }
                    None => {
                        // Unknown placeholder (or not one of our two patterns): keep literal.
                        result.push_str(&value[i..i + end + 1]);
                        i += end + 1;
                        continue;
                    }
                }
            }
        }
        // Safe: we only ever split at ASCII '$'/'{'/'}' boundaries, so byte
        // indexing here always lands on a char boundary.
        let ch = value[i..].chars().next().unwrap();
        result.push(ch);
        i += ch.len_utf8();
    }
    result
}

pub async fn resolve(
    pool: &PgPool,
    cipher: &SecretCipher,
    owner: Uuid,
    config: &TaskConfig,
    task_outputs: &HashMap<String, String>,
) -> Result<Resolved, ResolveError> {
    let mut params = HashMap::with_capacity(config.parameters.len());
    for (key, value) in &config.parameters {
        params.insert(key.clone(), interpolate(value, task_outputs));
    }

    let mut secret_env = HashMap::with_capacity(config.secrets.len());
    for (secret_name, env_var_name) in &config.secrets {
        let secret = Secret::find_by_name(pool, owner, secret_name)
            .await
            .map_err(|e| match e {
                SecretError::NotFound => ResolveError::SecretNotFound(secret_name.clone()),
                SecretError::DecryptFailed(msg) => {
                    ResolveError::DecryptFailed(secret_name.clone(), msg)
                }
            })?;
        let plaintext = cipher
            .decrypt(&secret.encrypted_value)
            .map_err(|e| ResolveError::DecryptFailed(secret_name.clone(), e.to_string()))?;
        secret_env.insert(env_var_name.clone(), plaintext);
    }

    Ok(Resolved { params, secret_env })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_on_string_without_placeholders() {
        let outputs = HashMap::new();
        assert_eq!(interpolate("plain value", &outputs), "plain value");
    }

    #[test]
    fn resolves_task_output_dot_notation() {
        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), "hello".to_string());
        assert_eq!(interpolate("${TASK_OUTPUT.a}", &outputs), "hello");
        assert_eq!(interpolate("${a.output}", &outputs), "hello");
    }

    #[test]
    fn unknown_placeholder_is_left_literal() {
        let outputs = HashMap::new();
        assert_eq!(interpolate("${TASK_OUTPUT.missing}", &outputs), "${TASK_OUTPUT.missing}");
    }

    #[test]
    fn interpolates_inside_surrounding_text() {
        let mut outputs = HashMap::new();
        outputs.insert("a".to_string(), "WORLD".to_string());
        assert_eq!(interpolate("hello ${a.output}!", &outputs), "hello WORLD!");
    }
}
