//! reqwest-backed [`NasApi`] implementation speaking the TrueNAS v2.0 REST API.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use reqwest::{Method, RequestBuilder, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::client::NasApi;
use crate::error::{NasError, Result};
use crate::models::{
    AuthFilter, Created, Dataset, DatasetCreate, DatasetDelete, DatasetUpdate, IscsiAuth,
    IscsiAuthCreate, IscsiAuthUpdate, IscsiExtent, IscsiExtentCreate, IscsiGlobal, IscsiTarget,
    IscsiTargetCreate, NfsShare, NfsShareCreate, PermissionUpdate, TargetExtent,
    TargetExtentCreate,
};

/// Header asking the middleware to apply query filters in SQL.
pub const FORCE_SQL_FILTERS_HEADER: &str = "X-Truenas-Force-Sql-Filters";

/// Counter: NAS HTTP requests by method and response status
pub const NAS_REQUESTS_TOTAL: &str = "nas_requests_total";

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How requests authenticate against the NAS.
#[derive(Clone)]
pub enum Credentials {
    /// `Authorization: Bearer <key>`
    ApiKey(String),
    /// HTTP basic auth
    Basic { username: String, password: String },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// HTTP client for one NAS.
#[derive(Debug, Clone)]
pub struct HttpNasClient {
    base: Url,
    credentials: Credentials,
    http: reqwest::Client,
}

impl HttpNasClient {
    /// Build a client for the API rooted at `api_url` (e.g. `https://nas/api/v2.0`).
    pub fn new(api_url: &str, credentials: Credentials, timeout: Duration) -> Result<Self> {
        let base = Url::parse(api_url)
            .map_err(|e| NasError::InvalidEndpoint(format!("{}: {}", api_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(NasError::InvalidEndpoint(api_url.to_string()));
        }

        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base,
            credentials,
            http,
        })
    }

    /// Append path segments to the base URL. Each segment is escaped, so a
    /// dataset id like `tank/k8s/x` becomes a single `tank%2Fk8s%2Fx` segment.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| NasError::InvalidEndpoint(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut builder = self.http.request(method.clone(), url);
        if method == Method::GET {
            builder = builder.header(FORCE_SQL_FILTERS_HEADER, "true");
        }
        match &self.credentials {
            Credentials::ApiKey(key) => builder.bearer_auth(key),
            Credentials::Basic { username, password } => {
                builder.basic_auth(username, Some(password))
            }
        }
    }

    /// Send a request and return the body of a 2xx response.
    async fn send(&self, method: Method, builder: RequestBuilder) -> Result<String> {
        let response = builder.send().await?;
        let status = response.status();

        counter!(
            NAS_REQUESTS_TOTAL,
            "method" => method.as_str().to_string(),
            "status" => status.as_u16().to_string()
        )
        .increment(1);

        let body = response.text().await?;
        if status.is_success() {
            Ok(body)
        } else {
            debug!(status = status.as_u16(), body = %body, "NAS rejected request");
            Err(NasError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = self.url(segments)?;
        let builder = self.request(Method::GET, url).query(query);
        let body = self.send(Method::GET, builder).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn post<B: Serialize + ?Sized>(&self, segments: &[&str], body: &B) -> Result<String> {
        let url = self.url(segments)?;
        let builder = self.request(Method::POST, url).json(body);
        self.send(Method::POST, builder).await
    }

    async fn create<B: Serialize + ?Sized>(&self, segments: &[&str], body: &B) -> Result<i64> {
        let response = self.post(segments, body).await?;
        let created: Created = serde_json::from_str(&response)
            .map_err(|e| NasError::Parse(format!("no id in create response: {}", e)))?;
        Ok(created.id)
    }

    async fn put<B: Serialize + ?Sized>(&self, segments: &[&str], body: &B) -> Result<()> {
        let url = self.url(segments)?;
        let builder = self.request(Method::PUT, url).json(body);
        self.send(Method::PUT, builder).await.map(|_| ())
    }

    async fn delete(&self, segments: &[&str], body: Option<&serde_json::Value>) -> Result<()> {
        let url = self.url(segments)?;
        let mut builder = self.request(Method::DELETE, url);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        self.send(Method::DELETE, builder).await.map(|_| ())
    }
}

/// Keep only the entries the filter asked for; anything else means the NAS
/// ignored the filter and the result cannot be trusted.
fn verify_filtered<T: fmt::Debug>(
    items: Vec<T>,
    what: &str,
    matches: impl Fn(&T) -> bool,
) -> Result<Vec<T>> {
    if let Some(stray) = items.iter().find(|item| !matches(item)) {
        warn!(what = %what, item = ?stray, "NAS returned an entry outside the filter");
        return Err(NasError::Unexpected(format!(
            "{} filter returned non-matching entry: {:?}",
            what, stray
        )));
    }
    Ok(items)
}

#[async_trait]
impl NasApi for HttpNasClient {
    #[instrument(skip(self))]
    async fn get_dataset(&self, id: &str) -> Result<Option<Dataset>> {
        match self.get::<Dataset>(&["pool", "dataset", "id", id], &[]).await {
            Ok(dataset) => Ok(Some(dataset)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, create), fields(name = %create.name, kind = %create.kind))]
    async fn create_dataset(&self, create: &DatasetCreate) -> Result<()> {
        self.post(&["pool", "dataset"], create).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn update_dataset(&self, id: &str, update: &DatasetUpdate) -> Result<()> {
        self.put(&["pool", "dataset", "id", id], update).await
    }

    #[instrument(skip(self))]
    async fn delete_dataset(&self, id: &str, recursive: bool) -> Result<()> {
        let body = serde_json::to_value(DatasetDelete { recursive })?;
        self.delete(&["pool", "dataset", "id", id], Some(&body)).await
    }

    #[instrument(skip(self, permission))]
    async fn set_dataset_permission(&self, id: &str, permission: &PermissionUpdate) -> Result<()> {
        self.post(&["pool", "dataset", "id", id, "permission"], permission)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn find_nfs_shares(&self, comment: &str) -> Result<Vec<NfsShare>> {
        let shares: Vec<NfsShare> = self
            .get(&["sharing", "nfs"], &[("comment", comment.to_string())])
            .await?;
        verify_filtered(shares, "nfs share comment", |s| s.comment == comment)
    }

    #[instrument(skip(self, create), fields(comment = %create.comment))]
    async fn create_nfs_share(&self, create: &NfsShareCreate) -> Result<i64> {
        self.create(&["sharing", "nfs"], create).await
    }

    #[instrument(skip(self))]
    async fn delete_nfs_share(&self, id: i64) -> Result<()> {
        self.delete(&["sharing", "nfs", "id", &id.to_string()], None)
            .await
    }

    #[instrument(skip(self))]
    async fn find_iscsi_extents(&self, comment: &str) -> Result<Vec<IscsiExtent>> {
        let extents: Vec<IscsiExtent> = self
            .get(&["iscsi", "extent"], &[("comment", comment.to_string())])
            .await?;
        verify_filtered(extents, "iscsi extent comment", |e| e.comment == comment)
    }

    #[instrument(skip(self, create), fields(name = %create.name))]
    async fn create_iscsi_extent(&self, create: &IscsiExtentCreate) -> Result<i64> {
        self.create(&["iscsi", "extent"], create).await
    }

    #[instrument(skip(self))]
    async fn delete_iscsi_extent(&self, id: i64) -> Result<()> {
        self.delete(&["iscsi", "extent", "id", &id.to_string()], None)
            .await
    }

    #[instrument(skip(self))]
    async fn find_iscsi_targets(&self, name: &str) -> Result<Vec<IscsiTarget>> {
        let targets: Vec<IscsiTarget> = self
            .get(&["iscsi", "target"], &[("name", name.to_string())])
            .await?;
        verify_filtered(targets, "iscsi target name", |t| t.name == name)
    }

    #[instrument(skip(self, create), fields(name = %create.name))]
    async fn create_iscsi_target(&self, create: &IscsiTargetCreate) -> Result<i64> {
        self.create(&["iscsi", "target"], create).await
    }

    #[instrument(skip(self))]
    async fn delete_iscsi_target(&self, id: i64) -> Result<()> {
        self.delete(&["iscsi", "target", "id", &id.to_string()], None)
            .await
    }

    #[instrument(skip(self))]
    async fn find_iscsi_auths(&self, filter: &AuthFilter) -> Result<Vec<IscsiAuth>> {
        let auths: Vec<IscsiAuth> = self.get(&["iscsi", "auth"], &[filter.query()]).await?;
        verify_filtered(auths, "iscsi auth", |a| filter.matches(a))
    }

    // Secrets stay out of the span.
    #[instrument(skip(self, create), fields(user = %create.user))]
    async fn create_iscsi_auth(&self, create: &IscsiAuthCreate) -> Result<i64> {
        self.create(&["iscsi", "auth"], create).await
    }

    #[instrument(skip(self))]
    async fn update_iscsi_auth(&self, id: i64, update: &IscsiAuthUpdate) -> Result<()> {
        self.put(&["iscsi", "auth", "id", &id.to_string()], update)
            .await
    }

    #[instrument(skip(self))]
    async fn delete_iscsi_auth(&self, id: i64) -> Result<()> {
        self.delete(&["iscsi", "auth", "id", &id.to_string()], None)
            .await
    }

    #[instrument(skip(self))]
    async fn find_target_extents(&self, target: i64, extent: i64) -> Result<Vec<TargetExtent>> {
        let assocs: Vec<TargetExtent> = self
            .get(
                &["iscsi", "targetextent"],
                &[("target", target.to_string()), ("extent", extent.to_string())],
            )
            .await?;
        verify_filtered(assocs, "iscsi targetextent", |a| {
            a.target == target && a.extent == extent
        })
    }

    #[instrument(skip(self))]
    async fn create_target_extent(&self, create: &TargetExtentCreate) -> Result<i64> {
        self.create(&["iscsi", "targetextent"], create).await
    }

    #[instrument(skip(self))]
    async fn delete_target_extent(&self, id: i64) -> Result<()> {
        self.delete(&["iscsi", "targetextent", "id", &id.to_string()], None)
            .await
    }

    #[instrument(skip(self))]
    async fn iscsi_global(&self) -> Result<IscsiGlobal> {
        self.get(&["iscsi", "global"], &[]).await
    }
}
