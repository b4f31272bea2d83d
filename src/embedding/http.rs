use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::Embedder;
use crate::config::EmbedderSettings;
use crate::error::{Error, Result};

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

/// OpenAI 兼容的 `/embeddings` 接口
pub struct HttpEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
}

impl HttpEmbedder {
    pub fn new(settings: &EmbedderSettings, dimension: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| Error::Config(format!("无法创建 HTTP 客户端: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", settings.url.trim_end_matches('/')),
            model: settings.model.clone(),
            api_key: settings.api_key.clone(),
            dimension,
        })
    }
}

impl Embedder for HttpEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        if batch.is_empty() {
            return Ok(vec![]);
        }
        let service_error = |e: reqwest::Error| Error::EmbeddingService(e.to_string());

        let mut request =
            self.client.post(&self.endpoint).json(&EmbeddingRequest { model: &self.model, input: batch });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(service_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, format!("{} 返回 {status}: {body}", self.endpoint)));
        }

        let mut response: EmbeddingResponse = response.json().await.map_err(service_error)?;
        response.data.sort_by_key(|d| d.index);
        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// 只有限流和服务端错误值得重试
fn status_error(status: StatusCode, message: String) -> Error {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Error::EmbeddingService(message)
    } else {
        Error::EmbeddingRejected(message)
    }
}
