use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use taskloom_common::{Error, Result};
use tracing::debug;

use crate::parser::ToolParams;
use crate::tools::{Tool, ToolContext, ToolOutput, required_param, truncate_output};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WebFetch {
    client: Client,
    max_output_bytes: usize,
}

impl WebFetch {
    pub fn new(max_output_bytes: usize) -> Self {
        let client = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("taskloom/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            max_output_bytes,
        }
    }
}

#[async_trait]
impl Tool for WebFetch {
    fn name(&self) -> &'static str {
        "web_fetch"
    }

    fn description(&self) -> &'static str {
        "Fetch a URL over HTTP(S) and return the response body as text."
    }

    fn parameters(&self) -> &'static [(&'static str, &'static str)] {
        &[("url", "absolute http:// or https:// URL")]
    }

    async fn execute(&self, _context: &ToolContext, params: &ToolParams) -> Result<ToolOutput> {
        let url = required_param(params, self.name(), "url")?.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Ok(ToolOutput::error(format!(
                "web_fetch: unsupported URL '{url}'"
            )));
        }

        debug!(%url, "fetching");
        // transport failures propagate so connection resets get retried
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Tool(format!("web_fetch: request failed: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Tool(format!("web_fetch: failed to read body: {e}")))?;

        if status.is_server_error() || status.as_u16() == 429 {
            return Err(Error::Tool(format!(
                "web_fetch: status={} from {url}",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Ok(ToolOutput::error(format!(
                "web_fetch: {url} returned {status}"
            )));
        }
        Ok(ToolOutput::success(truncate_output(body, self.max_output_bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn url_param(url: &str) -> ToolParams {
        [("url".to_string(), url.to_string())].into_iter().collect()
    }

    #[tokio::test]
    async fn returns_body_text() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doc"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;

        let out = WebFetch::new(1024)
            .execute(
                &ToolContext::new("."),
                &url_param(&format!("{}/doc", server.uri())),
            )
            .await
            .unwrap();
        assert_eq!(out, ToolOutput::success("hello"));
    }

    #[tokio::test]
    async fn server_errors_carry_a_status_code() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = WebFetch::new(1024)
            .execute(&ToolContext::new("."), &url_param(&server.uri()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("status=503"));
    }

    #[tokio::test]
    async fn rejects_other_schemes() {
        let out = WebFetch::new(1024)
            .execute(&ToolContext::new("."), &url_param("file:///etc/passwd"))
            .await
            .unwrap();
        assert!(out.is_error);
    }
}
