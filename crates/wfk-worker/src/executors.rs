// SPDX-License-Identifier: MIT OR Apache-2.0
//! Built-in executors.
//!
//! These are deliberately thin: the contract work (config resolution,
//! deadlines, signalling) lives in the worker skeleton. Agent executors
//! are provided by embedders through the same [`NodeExecutor`] trait.

use crate::NodeExecutor;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use wfk_core::Token;

/// Function/transform executor.
///
/// Returns the config's `output` value when present (which lets workflow
/// authors script node results), otherwise echoes the token metadata under
/// a success envelope.
pub struct FunctionExecutor;

#[async_trait]
impl NodeExecutor for FunctionExecutor {
    fn name(&self) -> &str {
        "function"
    }

    async fn execute(&self, token: &Token) -> Result<Value> {
        if let Some(output) = token.config.get("output") {
            return Ok(output.clone());
        }
        Ok(json!({
            "status": "success",
            "input": token.metadata,
        }))
    }
}

/// Outbound HTTP call executor.
///
/// Config shape: `{url, method?, headers?, body?}`. The response lands in
/// the result document as `{status, body}`, with JSON bodies parsed.
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    /// Create an executor with its own connection pool and a per-request
    /// timeout (the worker deadline still applies on top).
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying client cannot be built.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NodeExecutor for HttpExecutor {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(&self, token: &Token) -> Result<Value> {
        let url = token
            .config
            .get("url")
            .and_then(Value::as_str)
            .context("http node config requires a `url`")?;
        let method = token
            .config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET");

        let mut request = match method.to_ascii_uppercase().as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "PATCH" => self.client.patch(url),
            "DELETE" => self.client.delete(url),
            other => bail!("unsupported http method `{other}`"),
        };

        if let Some(headers) = token.config.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }
        if let Some(body) = token.config.get("body") {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("http request to {url}"))?;
        let status = response.status().as_u16();
        let text = response.text().await.context("read http response body")?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        Ok(json!({ "status": status, "body": body }))
    }
}
