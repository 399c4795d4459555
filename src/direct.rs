use std::time::Duration;

use anyhow::Result;
use reqwest::{Client as HttpClient, ClientBuilder};

use crate::exchange::{ProxyRequest, ProxyResponse};

/// Unproxied client used when the tunnel pipeline fails.
#[derive(Clone)]
pub struct DirectClient {
    http: HttpClient,
}

impl DirectClient {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let http = ClientBuilder::new()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .user_agent(user_agent)
            .no_proxy()
            .build()?;
        Ok(Self { http })
    }

    pub async fn fetch(&self, req: &ProxyRequest) -> Result<ProxyResponse, reqwest::Error> {
        let mut builder = self
            .http
            .request(req.method.clone(), req.url.clone())
            .headers(req.headers.clone());
        if !req.body.is_empty() {
            builder = builder.body(req.body.clone());
        }
        let resp = builder.send().await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?.to_vec();
        Ok(ProxyResponse {
            status,
            status_text: None,
            headers,
            body,
        })
    }
}
