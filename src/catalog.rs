//! Remote model catalog (Hugging Face style `/api/models`).

use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::engine::has_model_extension;
use crate::error::DownloadError;

pub const PAGE_SIZE: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub rfilename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteModel {
    pub id: String,
    #[serde(default)]
    pub siblings: Vec<RemoteFile>,
}

impl RemoteModel {
    pub fn weight_file(&self) -> Option<&RemoteFile> {
        select_weight_file(self)
    }
}

/// The first sibling with a recognized weight extension.
pub fn select_weight_file(model: &RemoteModel) -> Option<&RemoteFile> {
    model
        .siblings
        .iter()
        .find(|f| has_model_extension(&f.rfilename))
}

/// `{base}/{id}/resolve/main/{filename}` with every path segment encoded.
pub fn resolve_download_url(base: &str, id: &str, filename: &str) -> Result<Url, DownloadError> {
    let mut url = Url::parse(base).map_err(|e| DownloadError::InvalidUrl(format!("{base}: {e}")))?;
    if id.trim().is_empty() || filename.trim().is_empty() {
        return Err(DownloadError::InvalidUrl(format!("{id}/{filename}")));
    }
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| DownloadError::InvalidUrl(base.to_string()))?;
        segments.pop_if_empty();
        for part in id.split('/').filter(|s| !s.is_empty()) {
            segments.push(part);
        }
        segments.push("resolve").push("main");
        for part in filename.split('/').filter(|s| !s.is_empty()) {
            segments.push(part);
        }
    }
    Ok(url)
}

pub struct CatalogClient {
    base_url: String,
    client: reqwest::Client,
}

impl CatalogClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// One page of models with their file lists.
    pub async fn search(
        &self,
        query: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RemoteModel>, String> {
        let limit = limit.max(1).to_string();
        let mut request = self
            .client
            .get(format!("{}/api/models", self.base_url))
            .query(&[("full", "true"), ("limit", limit.as_str())]);
        if let Some(q) = query.filter(|q| !q.trim().is_empty()) {
            request = request.query(&[("search", q)]);
        }
        let resp = request.send().await.map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("catalog returned HTTP {}", resp.status()));
        }
        resp.json::<Vec<RemoteModel>>().await.map_err(|e| e.to_string())
    }

    pub async fn model(&self, id: &str) -> Result<RemoteModel, String> {
        let mut url = Url::parse(&self.base_url).map_err(|e| e.to_string())?;
        url.path_segments_mut()
            .map_err(|_| format!("invalid catalog base {}", self.base_url))?
            .pop_if_empty()
            .push("api")
            .push("models")
            .extend(id.split('/').filter(|s| !s.is_empty()));
        let resp = self.client.get(url).send().await.map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("catalog returned HTTP {} for {}", resp.status(), id));
        }
        resp.json::<RemoteModel>().await.map_err(|e| e.to_string())
    }
}
