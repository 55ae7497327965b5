//! Out-of-process provider plugins spoken to over HTTP/JSON.
//!
//! The plugin server exposes:
//!
//! | call   | request                              | response                   |
//! |--------|--------------------------------------|----------------------------|
//! | create | `POST /resources/{type}`             | `{"id": .., "outputs": ..}`|
//! | read   | `GET /resources/{type}/{id}`         | `{"outputs": ..}`          |
//! | update | `PATCH /resources/{type}/{id}`       | `{"outputs": ..}`          |
//! | delete | `DELETE /resources/{type}/{id}`      | any 2xx                    |
//!
//! A 404 on read, update or delete means the object is gone. 429 and 5xx
//! responses are retried with backoff, except for create: a create that
//! failed with a 5xx or a dropped connection may already exist on the
//! server, so it is returned as an error and left to the pending journal.
//! Only 429 is retried for create.
//!
//! Every create carries an `Idempotency-Key` header derived from the
//! resource type and name. Plugin servers should deduplicate on it.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url, header};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::error::ProviderError;

use super::plugin::{
    Created, Outputs, Provider, ProviderContext, ProviderRequest, ProviderResult, ResolvedDiff,
    ResourceId,
};

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for transient failures.
const MAX_RETRIES: u32 = 3;

/// Base delay between retries in milliseconds.
const RETRY_DELAY_MS: u64 = 1000;

/// Upper bound on a server-requested back-off.
const MAX_RETRY_AFTER_SECS: u64 = 60;

/// Credential key holding the bearer token.
pub const TOKEN_CREDENTIAL: &str = "token";

/// Header carrying the create deduplication key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Which failures a request may be repeated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryPolicy {
    /// Network errors, 5xx and 429.
    Transient,
    /// 429 only; the server refused the call before doing anything.
    RateLimitOnly,
}

impl RetryPolicy {
    const fn allows(self, error: &ProviderError) -> bool {
        match self {
            Self::Transient => error.is_retryable(),
            Self::RateLimitOnly => matches!(error, ProviderError::RateLimited { .. }),
        }
    }
}

/// HTTP plugin client.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
    endpoint: Url,
    token: Option<String>,
    context: ProviderContext,
    max_retries: u32,
    retry_delay: Duration,
}

#[derive(Debug, Serialize)]
struct CreateBody<'a> {
    name: &'a str,
    properties: &'a Outputs,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tags: Option<&'a BTreeMap<String, String>>,
}

#[derive(Debug, Serialize)]
struct UpdateBody<'a> {
    name: &'a str,
    properties: &'a Outputs,
    changed_fields: &'a [String],
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
    #[serde(default)]
    outputs: Outputs,
}

#[derive(Debug, Deserialize)]
struct OutputsResponse {
    #[serde(default)]
    outputs: Outputs,
}

impl HttpProvider {
    /// Creates a client for the plugin server at `endpoint`.
    ///
    /// The bearer token, if any, is taken from the `token` credential.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not a valid base URL or the
    /// HTTP client cannot be built.
    pub fn new(endpoint: &str, context: ProviderContext, timeout_secs: u64) -> ProviderResult<Self> {
        let endpoint = Url::parse(endpoint).map_err(|e| ProviderError::InvalidResponse {
            message: format!("Invalid plugin endpoint '{endpoint}': {e}"),
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(ProviderError::InvalidResponse {
                message: format!("Plugin endpoint '{endpoint}' cannot be a base URL"),
            });
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            token: context.credential(TOKEN_CREDENTIAL).map(str::to_string),
            context,
            max_retries: MAX_RETRIES,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        })
    }

    /// Overrides the retry policy.
    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    /// `<endpoint>/resources/<type>[/<id>]`, each segment percent-encoded.
    fn url(&self, resource_type: &str, provider_id: Option<&str>) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("resources").push(resource_type);
            if let Some(id) = provider_id {
                segments.push(id);
            }
        }
        url
    }

    /// Sends a request, retrying the failures `policy` allows.
    #[allow(clippy::too_many_arguments)]
    async fn send<B: Serialize + Sync>(
        &self,
        operation: &str,
        name: &str,
        method: Method,
        url: Url,
        body: Option<&B>,
        policy: RetryPolicy,
        idempotency_key: Option<&str>,
    ) -> ProviderResult<reqwest::Response> {
        let mut attempt = 0;

        loop {
            let result = self
                .send_once(operation, name, method.clone(), url.clone(), body, idempotency_key)
                .await;
            match result {
                Ok(response) => return Ok(response),
                Err(e) if policy.allows(&e) && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = match e {
                        ProviderError::RateLimited { retry_after_secs } => {
                            Duration::from_secs(retry_after_secs.min(MAX_RETRY_AFTER_SECS))
                        }
                        _ => self.retry_delay * attempt,
                    };
                    warn!(
                        "{operation} {name}: {e}; retry {attempt}/{} in {delay:?}",
                        self.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once<B: Serialize + Sync>(
        &self,
        operation: &str,
        name: &str,
        method: Method,
        url: Url,
        body: Option<&B>,
        idempotency_key: Option<&str>,
    ) -> ProviderResult<reqwest::Response> {
        trace!("{method} {url}");

        let mut request = self
            .client
            .request(method, url)
            .header(header::ACCEPT, "application/json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(key) = idempotency_key {
            request = request.header(IDEMPOTENCY_KEY_HEADER, key);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::network(format!("Request failed: {e}")))?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(1);
            return Err(ProviderError::RateLimited { retry_after_secs });
        }

        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::network(format!("Plugin returned {status}: {body}")));
        }

        if status == StatusCode::NOT_FOUND || status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::failed(operation, name, format!("{status}: {body}")))
    }

    async fn outputs_of(response: reqwest::Response) -> ProviderResult<Outputs> {
        let parsed: OutputsResponse = response.json().await.map_err(|e| ProviderError::InvalidResponse {
            message: format!("Failed to parse outputs: {e}"),
        })?;
        Ok(parsed.outputs)
    }
}

/// Stable per-resource key; the same logical resource always maps to it.
fn idempotency_key(resource_type: &str, name: &str) -> String {
    let digest = Sha256::digest(format!("{resource_type}\n{name}").as_bytes());
    hex::encode(&digest[..16])
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        self.endpoint.as_str()
    }

    async fn create(&self, request: &ProviderRequest) -> ProviderResult<Created> {
        debug!("Creating {} via {}", request.name, self.endpoint);

        let body = CreateBody {
            name: &request.name,
            properties: &request.properties,
            location: self.context.location.as_deref(),
            tags: (!self.context.tags.is_empty()).then_some(&self.context.tags),
        };
        let url = self.url(&request.resource_type, None);
        let key = idempotency_key(&request.resource_type, &request.name);
        let response = self
            .send(
                "create",
                &request.name,
                Method::POST,
                url,
                Some(&body),
                RetryPolicy::RateLimitOnly,
                Some(&key),
            )
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ProviderError::NoProvider {
                resource_type: request.resource_type.clone(),
            });
        }

        let created: CreateResponse = response.json().await.map_err(|e| ProviderError::InvalidResponse {
            message: format!("Failed to parse create response: {e}"),
        })?;

        Ok(Created {
            provider_id: created.id,
            outputs: created.outputs,
        })
    }

    async fn read(&self, target: &ResourceId) -> ProviderResult<Outputs> {
        let url = self.url(&target.resource_type, Some(&target.provider_id));
        let response = self
            .send::<()>("read", &target.name, Method::GET, url, None, RetryPolicy::Transient, None)
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(target.not_found());
        }
        Self::outputs_of(response).await
    }

    async fn update(&self, target: &ResourceId, diff: &ResolvedDiff) -> ProviderResult<Outputs> {
        debug!("Updating {target} via {}", self.endpoint);

        let body = UpdateBody {
            name: &target.name,
            properties: &diff.properties,
            changed_fields: &diff.changed_fields,
        };
        let url = self.url(&target.resource_type, Some(&target.provider_id));
        let response = self
            .send(
                "update",
                &target.name,
                Method::PATCH,
                url,
                Some(&body),
                RetryPolicy::Transient,
                None,
            )
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(target.not_found());
        }
        Self::outputs_of(response).await
    }

    async fn delete(&self, target: &ResourceId) -> ProviderResult<()> {
        debug!("Deleting {target} via {}", self.endpoint);

        let url = self.url(&target.resource_type, Some(&target.provider_id));
        let response = self
            .send::<()>(
                "delete",
                &target.name,
                Method::DELETE,
                url,
                None,
                RetryPolicy::Transient,
                None,
            )
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(target.not_found());
        }
        Ok(())
    }

    fn configure(&self, overlay: &ProviderContext) -> ProviderResult<Arc<dyn Provider>> {
        let context = self.context.layered(overlay);
        let token = context.credential(TOKEN_CREDENTIAL).map(str::to_string);
        Ok(Arc::new(Self {
            token,
            context,
            ..self.clone()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn context() -> ProviderContext {
        ProviderContext {
            location: Some("eastus".into()),
            credentials: BTreeMap::from([(TOKEN_CREDENTIAL.to_string(), "t0ken".to_string())]),
            tags: BTreeMap::new(),
        }
    }

    fn provider(server: &MockServer) -> HttpProvider {
        HttpProvider::new(&server.uri(), context(), 5)
            .unwrap()
            .with_retries(2, Duration::from_millis(10))
    }

    fn registry_id() -> ResourceId {
        ResourceId::new("registry", "acr", "acr-123")
    }

    #[tokio::test]
    async fn test_create_posts_resolved_properties() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/resources/registry"))
            .and(header("authorization", "Bearer t0ken"))
            .and(body_json(json!({
                "name": "acr",
                "properties": { "sku": "basic" },
                "location": "eastus"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "acr-123",
                "outputs": { "login_server": "kzhou.azurecr.io" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let created = provider(&server)
            .create(&ProviderRequest {
                resource_type: "registry".into(),
                name: "acr".into(),
                properties: json!({ "sku": "basic" }).as_object().cloned().unwrap(),
            })
            .await
            .unwrap();

        assert_eq!(created.provider_id, "acr-123");
        assert_eq!(created.outputs["login_server"], "kzhou.azurecr.io");
    }

    #[tokio::test]
    async fn test_read_not_found() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/resources/registry/acr-123"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = provider(&server).read(&registry_id()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_sends_changed_fields() {
        let server = MockServer::start().await;

        Mock::given(method("PATCH"))
            .and(path("/resources/registry/acr-123"))
            .and(body_json(json!({
                "name": "acr",
                "properties": { "sku": "standard" },
                "changed_fields": ["sku"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "outputs": { "sku": "standard" }
            })))
            .mount(&server)
            .await;

        let diff = ResolvedDiff {
            properties: json!({ "sku": "standard" }).as_object().cloned().unwrap(),
            changed_fields: vec!["sku".into()],
        };
        let outputs = provider(&server).update(&registry_id(), &diff).await.unwrap();
        assert_eq!(outputs["sku"], "standard");
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/resources/registry/acr-123"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/resources/registry/acr-123"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        provider(&server).delete(&registry_id()).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_is_not_resent_after_server_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/resources/registry"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/resources/registry"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "acr-2" })))
            .expect(0)
            .mount(&server)
            .await;

        let err = provider(&server)
            .create(&ProviderRequest {
                resource_type: "registry".into(),
                name: "acr".into(),
                properties: Outputs::new(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::NetworkError { .. }));
        let posts = server.received_requests().await.unwrap();
        assert_eq!(posts.len(), 1);
    }

    #[tokio::test]
    async fn test_create_retries_rate_limit_with_same_key() {
        let server = MockServer::start().await;
        let key = idempotency_key("registry", "acr");

        Mock::given(method("POST"))
            .and(path("/resources/registry"))
            .and(header(IDEMPOTENCY_KEY_HEADER, key.as_str()))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/resources/registry"))
            .and(header(IDEMPOTENCY_KEY_HEADER, key.as_str()))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "acr-1" })))
            .expect(1)
            .mount(&server)
            .await;

        let created = provider(&server)
            .create(&ProviderRequest {
                resource_type: "registry".into(),
                name: "acr".into(),
                properties: Outputs::new(),
            })
            .await
            .unwrap();

        assert_eq!(created.provider_id, "acr-1");
        assert_ne!(key, idempotency_key("registry", "acr2"));
    }

    #[tokio::test]
    async fn test_rate_limit_gives_up_after_retries() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/resources/registry/acr-123"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .expect(3)
            .mount(&server)
            .await;

        let err = provider(&server).read(&registry_id()).await.unwrap_err();
        assert_eq!(err, ProviderError::RateLimited { retry_after_secs: 0 });
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/resources/registry"))
            .respond_with(ResponseTemplate::new(422).set_body_string("sku must be one of basic, standard"))
            .expect(1)
            .mount(&server)
            .await;

        let err = provider(&server)
            .create(&ProviderRequest {
                resource_type: "registry".into(),
                name: "acr".into(),
                properties: Outputs::new(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::OperationFailed { ref operation, .. } if operation == "create"));
    }

    #[test]
    fn test_url_encodes_type_segments() {
        let provider = HttpProvider::new("http://plugins.local/v1/", ProviderContext::default(), 5).unwrap();

        let url = provider.url("azure:core/ResourceGroup", Some("rg 1"));
        assert_eq!(
            url.as_str(),
            "http://plugins.local/v1/resources/azure:core%2FResourceGroup/rg%201"
        );
    }

    #[tokio::test]
    async fn test_configured_provider_uses_overlay_credentials() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/resources/namespace"))
            .and(header("authorization", "Bearer cluster-token"))
            .and(body_json(json!({
                "name": "ns",
                "properties": {},
                "location": "westeurope"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "ns-1" })))
            .expect(1)
            .mount(&server)
            .await;

        let overlay = ProviderContext {
            location: Some("westeurope".into()),
            credentials: BTreeMap::from([(TOKEN_CREDENTIAL.to_string(), "cluster-token".to_string())]),
            tags: BTreeMap::new(),
        };
        let bound = provider(&server).configure(&overlay).unwrap();

        let created = bound
            .create(&ProviderRequest {
                resource_type: "namespace".into(),
                name: "ns".into(),
                properties: Outputs::new(),
            })
            .await
            .unwrap();
        assert_eq!(created.provider_id, "ns-1");
    }
}
