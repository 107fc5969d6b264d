/// Remote persistence boundary. The HTTP client speaks the content and
/// component endpoints and falls back to a legacy prefix when the
/// preferred endpoint 404s.
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use page::{ComponentId, ComponentInstance};

use crate::{CollaborationError, ConflictItem, ConflictResolution, Result};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
    pub key: String,
    pub value: String,
    #[serde(rename = "type")]
    pub content_type: String,
    pub page: String,
    pub expected_version: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SaveOk {
    version: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConflictBody {
    current_value: String,
    last_modified_by: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone)]
pub enum SaveOutcome {
    Saved {
        version: String,
    },
    Conflict {
        current_value: String,
        last_modified_by: String,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResolveRequest {
    conflict_id: String,
    subject: String,
    resolution: ConflictResolution,
}

/// What the engine needs from the persistence service. Semantics are
/// fixed here; the wire lives in the implementation.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn save_content(&self, request: &SaveRequest) -> Result<SaveOutcome>;
    async fn create_component(&self, component: &ComponentInstance) -> Result<()>;
    async fn update_component(&self, component: &ComponentInstance) -> Result<()>;
    async fn delete_component(&self, id: ComponentId) -> Result<()>;
    async fn resolve_conflict(
        &self,
        conflict: &ConflictItem,
        resolution: ConflictResolution,
    ) -> Result<()>;
}

pub struct HttpRemoteStore {
    client: reqwest::Client,
    base_url: String,
    legacy_base_url: Option<String>,
}

impl HttpRemoteStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            legacy_base_url: None,
        }
    }

    /// Older deployments serve the same routes, with the same request
    /// shapes, under a different prefix. A 404 on the preferred
    /// endpoint retries there.
    pub fn with_legacy_base(mut self, base_url: impl Into<String>) -> Self {
        self.legacy_base_url = Some(base_url.into());
        self
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let response = self
            .send_to(&self.base_url, method.clone(), path, body)
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            if let Some(legacy) = &self.legacy_base_url {
                tracing::debug!(path, "preferred endpoint missing; retrying legacy endpoint");
                return self.send_to(legacy, method, path, body).await;
            }
        }

        Ok(response)
    }

    async fn send_to(
        &self,
        base: &str,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let mut request = self.client.request(method, format!("{base}{path}"));
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .map_err(|e| CollaborationError::Network(e.to_string()))
    }
}

fn to_body<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| CollaborationError::Serialization(e.to_string()))
}

async fn expect_success(response: reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let message = response.text().await.unwrap_or_default();
    Err(CollaborationError::Remote {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn save_content(&self, request: &SaveRequest) -> Result<SaveOutcome> {
        let body = to_body(request)?;
        let response = self.request(Method::PUT, "/content", Some(&body)).await?;

        match response.status() {
            StatusCode::OK => {
                let ok: SaveOk = response
                    .json()
                    .await
                    .map_err(|e| CollaborationError::Serialization(e.to_string()))?;
                Ok(SaveOutcome::Saved { version: ok.version })
            }
            StatusCode::CONFLICT => {
                let conflict: ConflictBody = response
                    .json()
                    .await
                    .map_err(|e| CollaborationError::Serialization(e.to_string()))?;
                Ok(SaveOutcome::Conflict {
                    current_value: conflict.current_value,
                    last_modified_by: conflict.last_modified_by,
                    message: conflict.message,
                })
            }
            status => {
                let message = response.text().await.unwrap_or_default();
                Err(CollaborationError::Remote {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }

    async fn create_component(&self, component: &ComponentInstance) -> Result<()> {
        let body = to_body(component)?;
        let response = self.request(Method::POST, "/components", Some(&body)).await?;
        expect_success(response).await
    }

    async fn update_component(&self, component: &ComponentInstance) -> Result<()> {
        let body = to_body(component)?;
        let path = format!("/components/{}", component.id);
        let response = self.request(Method::PUT, &path, Some(&body)).await?;
        expect_success(response).await
    }

    async fn delete_component(&self, id: ComponentId) -> Result<()> {
        let path = format!("/components/{id}");
        let response = self.request(Method::DELETE, &path, None).await?;
        expect_success(response).await
    }

    async fn resolve_conflict(
        &self,
        conflict: &ConflictItem,
        resolution: ConflictResolution,
    ) -> Result<()> {
        let body = to_body(&ResolveRequest {
            conflict_id: conflict.id.to_string(),
            subject: conflict.subject.clone(),
            resolution,
        })?;
        let response = self
            .request(Method::POST, "/conflicts/resolve", Some(&body))
            .await?;
        expect_success(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_request_matches_the_wire_shape() {
        let request = SaveRequest {
            key: "hero_title".to_string(),
            value: "Welcome!".to_string(),
            content_type: "text".to_string(),
            page: "home".to_string(),
            expected_version: "1".to_string(),
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["expectedVersion"], "1");
        assert_eq!(json["page"], "home");
    }

    #[test]
    fn conflict_body_accepts_a_missing_message() {
        let body: ConflictBody = serde_json::from_value(serde_json::json!({
            "currentValue": "X",
            "lastModifiedBy": "bob",
        }))
        .unwrap();

        assert_eq!(body.current_value, "X");
        assert!(body.message.is_empty());
    }
}
