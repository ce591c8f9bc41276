// One tuned upstream HTTP client per mirror.

use anyhow::{Context, Result};
use http::{HeaderMap, HeaderValue, Method};
use reqwest::Response;
use tracing::debug;

use crate::config::UpstreamConfig;

/// Response header naming the mirror that served the bytes.
pub const REFRACTED_BY: &str = "x-refracted-by";

/// HTTP client bound to a single mirror. Connections, DNS lookups and idle
/// keep-alives are all scoped to this mirror and die with it.
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig, base_url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.pre_download_timeout())
            .read_timeout(config.pre_download_timeout())
            .pool_idle_timeout(config.pre_download_timeout())
            .timeout(config.download_timeout())
            .hickory_dns(true)
            .build()
            .with_context(|| format!("building client for {base_url}"))?;

        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The mirror supplies the host, the request supplies the path.
    pub fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Perform the request against this mirror, tagging the response with
    /// the mirror that produced it.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        headers: &HeaderMap,
    ) -> Result<Response, reqwest::Error> {
        let url = self.url_for(path);
        debug!("{method} {url}");

        let mut response = self
            .http
            .request(method, url.as_str())
            .headers(headers.clone())
            .send()
            .await?;

        let mirror = HeaderValue::from_str(&self.base_url)
            .unwrap_or_else(|_| HeaderValue::from_static("invalid-mirror-url"));
        response.headers_mut().append(REFRACTED_BY, mirror);

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> UpstreamClient {
        UpstreamClient::new(&UpstreamConfig::default().with_defaults(), base.to_string()).unwrap()
    }

    #[tokio::test]
    async fn url_join_normalizes_slashes() {
        let cases = [
            ("https://mirror.example/arch", "/core/os/pkg.tar.zst"),
            ("https://mirror.example/arch/", "/core/os/pkg.tar.zst"),
            ("https://mirror.example/arch", "core/os/pkg.tar.zst"),
            ("https://mirror.example/arch/", "core/os/pkg.tar.zst"),
        ];
        for (base, path) in cases {
            assert_eq!(
                client(base).url_for(path),
                "https://mirror.example/arch/core/os/pkg.tar.zst"
            );
        }
    }

    #[tokio::test]
    async fn url_join_keeps_query_strings() {
        let client = client("https://mirror.example");
        assert_eq!(
            client.url_for("/repo/x.iso?token=abc"),
            "https://mirror.example/repo/x.iso?token=abc"
        );
    }
}
