/// HTTP client for forwarding gateway traffic to service containers.
/// Uses reqwest-middleware so transient failures can be retried when enabled.
use bytes::Bytes;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use std::time::Duration;

pub struct UpstreamClient {
    client: ClientWithMiddleware,
}

impl UpstreamClient {
    /// `retries = 0` disables retrying, which keeps non-idempotent requests single-shot.
    pub fn new(timeout: Duration, retries: u32) -> Result<Self, reqwest::Error> {
        let reqwest_client = reqwest::Client::builder()
            .pool_max_idle_per_host(32)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            // redirects are the caller's business
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let mut builder = ClientBuilder::new(reqwest_client);
        if retries > 0 {
            let retry_policy = ExponentialBackoff::builder().build_with_max_retries(retries);
            builder = builder.with(RetryTransientMiddleware::new_with_policy(retry_policy));
        }

        Ok(Self {
            client: builder.build(),
        })
    }

    pub async fn forward(
        &self,
        method: reqwest::Method,
        url: &str,
        headers: reqwest::header::HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, reqwest_middleware::Error> {
        self.client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
    }
}
