//! Reference built-in task implementations. Registered by
//! [`crate::kernel::jobs::registry::default_registry`] at start-up.

use crate::kernel::jobs::registry::TaskError;
use lettre::message::Message;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

pub async fn echo(
    ctx: CancellationToken,
    params: HashMap<String, String>,
) -> Result<String, TaskError> {
    if ctx.is_cancelled() {
        return Err(TaskError::Cancelled);
    }
    let message = params.get("message").cloned().unwrap_or_default();
    Ok(format!("Echo: {message}"))
}

pub async fn http_request(
    ctx: CancellationToken,
    params: HashMap<String, String>,
) -> Result<String, TaskError> {
    let url = params
        .get("url")
        .ok_or_else(|| TaskError::Failed("missing required parameter 'url'".into()))?;
    let method = params
        .get("method")
        .map(|m| m.to_uppercase())
        .unwrap_or_else(|| "GET".to_string());

    let client = reqwest::Client::new();
    let mut builder = match method.as_str() {
        "GET" => client.get(url),
        "POST" => client.post(url),
        "PUT" => client.put(url),
        "DELETE" => client.delete(url),
        other => return Err(TaskError::Failed(format!("unsupported http method '{other}'"))),
    };
    if let Some(body) = params.get("body") {
        builder = builder.body(body.clone());
    }

    let response = tokio::select! {
        _ = ctx.cancelled() => return Err(TaskError::Cancelled),
        result = builder.send() => result.map_err(|e| TaskError::Failed(e.to_string()))?,
    };

    response
        .text()
        .await
        .map_err(|e| TaskError::Failed(e.to_string()))
}

pub async fn send_email(
    ctx: CancellationToken,
    params: HashMap<String, String>,
) -> Result<String, TaskError> {
    if ctx.is_cancelled() {
        return Err(TaskError::Cancelled);
    }

    for key in ["smtp_host", "smtp_user", "smtp_password", "from", "to", "subject", "body"] {
        if !params.contains_key(key) {
            return Err(TaskError::Failed(format!("missing required parameter: {key}")));
        }
    }

    let message = Message::builder()
        .from(params["from"].parse().map_err(|e| TaskError::Failed(format!("invalid 'from': {e}")))?)
        .to(params["to"].parse().map_err(|e| TaskError::Failed(format!("invalid 'to': {e}")))?)
        .subject(&params["subject"])
        .body(params["body"].clone())
        .map_err(|e| TaskError::Failed(e.to_string()))?;

    let creds = Credentials::new(params["smtp_user"].clone(), params["smtp_password"].clone());
    let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&params["smtp_host"])
        .map_err(|e| TaskError::Failed(e.to_string()))?
        .credentials(creds)
        .build();

    tokio::select! {
        _ = ctx.cancelled() => Err(TaskError::Cancelled),
        result = transport.send(message) => {
            result.map_err(|e| TaskError::Failed(e.to_string()))?;
            Ok(format!("email sent to {}", params["to"]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_formats_message_parameter() {
        let mut params = HashMap::new();
        params.insert("message".to_string(), "hello".to_string());
        let output = echo(CancellationToken::new(), params).await.unwrap();
        assert_eq!(output, "Echo: hello");
    }

    #[tokio::test]
    async fn http_request_requires_url() {
        let err = http_request(CancellationToken::new(), HashMap::new()).await.unwrap_err();
        assert!(matches!(err, TaskError::Failed(_)));
    }

    #[tokio::test]
    async fn send_email_requires_all_fields() {
        let err = send_email(CancellationToken::new(), HashMap::new()).await.unwrap_err();
        assert!(matches!(err, TaskError::Failed(_)));
    }
}
