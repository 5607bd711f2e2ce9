use anyhow::{bail, Context};

/// Simple JSON-RPC 2.0 client used by the CLI to talk to a running daemon.
///
/// Uses raw HTTP POST with serde_json rather than the full jsonrpsee client
/// to keep the CLI binary lean.
pub struct DaemonRpcClient {
    url: String,
    client: reqwest::Client,
}

impl DaemonRpcClient {
    pub fn new(url: &str) -> Self {
        Self { url: url.to_string(), client: reqwest::Client::new() }
    }

    /// Call a JSON-RPC method and return the `result` field.
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("connecting to daemon at {}", self.url))?;

        let json: serde_json::Value = resp.json().await.context("parsing RPC response")?;

        if let Some(err) = json.get("error") {
            bail!("RPC error: {}", err);
        }

        Ok(json["result"].clone())
    }
}
