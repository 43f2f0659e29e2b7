//! Custom script runner (§4.B second half): writes an inline script to a
//! fresh temp directory, execs the closed-set interpreter, enforces the
//! 5-minute wall-clock ceiling, and injects params/secrets/prior-outputs
//! into the child's environment with the 1>2>3>4 priority rule.

use crate::kernel::jobs::model::ScriptConfig;
use crate::kernel::jobs::registry::TaskError;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const SCRIPT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Build the child environment: process env, then params, then secrets,
/// then prior task outputs — earlier sources win on key collision.
pub fn build_env(
    params: &HashMap<String, String>,
    secret_env: &HashMap<String, String>,
    task_outputs: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    for (k, v) in params {
        env.entry(k.clone()).or_insert_with(|| v.clone());
    }
    for (k, v) in secret_env {
        env.entry(k.clone()).or_insert_with(|| v.clone());
    }
    for (name, output) in task_outputs {
        let key = format!("TASK_OUTPUT_{}", name.to_uppercase().replace('-', "_"));
        env.entry(key).or_insert_with(|| output.clone());
    }
    env
}

pub async fn run(
    ctx: CancellationToken,
    script: &ScriptConfig,
    params: HashMap<String, String>,
    secret_env: HashMap<String, String>,
    task_outputs: HashMap<String, String>,
) -> Result<String, TaskError> {
    let dir = tempfile::tempdir().map_err(|e| TaskError::Failed(format!("tempdir: {e}")))?;
    let script_path = dir.path().join(format!("script.{}", script.language.file_extension()));

    {
        let mut file = tokio::fs::File::create(&script_path)
            .await
            .map_err(|e| TaskError::Failed(format!("write script: {e}")))?;
        file.write_all(script.code.as_bytes())
            .await
            .map_err(|e| TaskError::Failed(format!("write script: {e}")))?;
        let mut perms = file
            .metadata()
            .await
            .map_err(|e| TaskError::Failed(e.to_string()))?
            .permissions();
        perms.set_mode(0o600);
        tokio::fs::set_permissions(&script_path, perms)
            .await
            .map_err(|e| TaskError::Failed(e.to_string()))?;
    }

    let (interpreter, leading_args) = script.language.interpreter();
    let env = build_env(&params, &secret_env, &task_outputs);

    let mut command = Command::new(interpreter);
    command
        .args(leading_args)
        .arg(&script_path)
        .env_clear()
        .envs(env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| TaskError::Failed(format!("spawn {interpreter}: {e}")))?;
    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");

    let status = tokio::select! {
        _ = ctx.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(TaskError::Cancelled);
        }
        result = tokio::time::timeout(SCRIPT_TIMEOUT, child.wait()) => {
            match result {
                Ok(status) => status.map_err(|e| TaskError::Failed(e.to_string()))?,
                Err(_) => {
                    let _ = child.start_kill();
                    return Err(TaskError::Failed("script timed out after 5 minutes".into()));
                }
            }
        }
    };

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut stdout_pipe, &mut stdout)
        .await
        .map_err(|e| TaskError::Failed(e.to_string()))?;
    tokio::io::AsyncReadExt::read_to_end(&mut stderr_pipe, &mut stderr)
        .await
        .map_err(|e| TaskError::Failed(e.to_string()))?;

    if !status.success() {
        let stderr = String::from_utf8_lossy(&stderr);
        return Err(TaskError::Failed(format!(
            "script exited with {status}: {stderr}"
        )));
    }

    Ok(String::from_utf8_lossy(&stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::model::ScriptLanguage;

    #[test]
    fn build_env_priority_params_before_outputs() {
        let mut params = HashMap::new();
        params.insert("NAME".to_string(), "from-param".to_string());
        let secret_env = HashMap::new();
        let mut outputs = HashMap::new();
        outputs.insert("name".to_string(), "from-output".to_string());

        let env = build_env(&params, &secret_env, &outputs);
        assert_eq!(env.get("NAME"), Some(&"from-param".to_string()));
        assert_eq!(env.get("TASK_OUTPUT_NAME"), Some(&"from-output".to_string()));
    }

    #[test]
    fn build_env_secrets_outrank_outputs_but_not_params() {
        let mut params = HashMap::new();
        params.insert("X".to_string(), "param".to_string());
        let mut secret_env = HashMap::new();
        secret_env.insert("X".to_string(), "secret".to_string());
        let outputs = HashMap::new();

        let env = build_env(&params, &secret_env, &outputs);
        assert_eq!(env.get("X"), Some(&"param".to_string()));
    }

    #[tokio::test]
    async fn runs_bash_script_and_captures_stdout() {
        let script = ScriptConfig {
            language: ScriptLanguage::Bash,
            code: "echo hello".to_string(),
        };
        let output = run(
            CancellationToken::new(),
            &script,
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
        )
        .await
        .unwrap();
        assert_eq!(output.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_surfaces_stderr() {
        let script = ScriptConfig {
            language: ScriptLanguage::Bash,
            code: "echo oops 1>&2; exit 1".to_string(),
        };
        let err = run(
            CancellationToken::new(),
            &script,
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
        )
        .await
        .unwrap_err();
        match err {
            TaskError::Failed(msg) => assert!(msg.contains("oops")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }
}
