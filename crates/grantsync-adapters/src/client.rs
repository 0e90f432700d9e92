//! SMApply REST client: bearer auth, `num_pages` pagination, refresh-token retry.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use grantsync_storage::{ArtifactStore, FetchError, FetchedResponse, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::SourceError;

/// Request seam over [`HttpFetcher`].
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn get(
        &self,
        url: &str,
        token: &str,
        query: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError>;

    async fn post_form(&self, url: &str, form: &[(&str, &str)])
        -> Result<FetchedResponse, FetchError>;
}

#[async_trait]
impl ApiTransport for HttpFetcher {
    async fn get(
        &self,
        url: &str,
        token: &str,
        query: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        self.get_with_bearer(url, token, query).await
    }

    async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        HttpFetcher::post_form(self, url, form).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_grant_type")]
    pub grant_type: String,
}

fn default_grant_type() -> String {
    "refresh_token".to_string()
}

/// On-disk credentials document. Unknown top-level keys survive a rewrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialsFile {
    pub api: ApiCredentials,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, JsonValue>,
}

impl CredentialsFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading credentials {}", path.display()))?;
        let parsed = serde_json::from_str(&text)
            .with_context(|| format!("parsing credentials {}", path.display()))?;
        Ok(parsed)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SourceError> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self).context("serializing credentials")?;
        std::fs::write(path, text)
            .with_context(|| format!("writing credentials {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub token_url: String,
    pub credentials_path: PathBuf,
}

pub struct SmApplyClient<T = HttpFetcher> {
    transport: T,
    settings: ClientSettings,
    credentials: CredentialsFile,
    archive: Option<ArtifactStore>,
}

/// Page count advertised by a page, defaulting to 1.
pub fn num_pages(page: &JsonValue) -> u64 {
    page.get("num_pages").and_then(JsonValue::as_u64).unwrap_or(1)
}

/// All `results` entries across pages, in page order.
pub fn page_results(pages: &[JsonValue]) -> impl Iterator<Item = &JsonValue> {
    pages.iter().flat_map(|page| {
        page.get("results")
            .and_then(JsonValue::as_array)
            .map(|items| items.as_slice())
            .unwrap_or_default()
    })
}

impl<T: ApiTransport> SmApplyClient<T> {
    pub fn new(transport: T, settings: ClientSettings) -> Result<Self, SourceError> {
        let credentials = CredentialsFile::load(&settings.credentials_path)?;
        Ok(Self::with_credentials(transport, settings, credentials))
    }

    pub fn with_credentials(
        transport: T,
        settings: ClientSettings,
        credentials: CredentialsFile,
    ) -> Self {
        Self {
            transport,
            settings,
            credentials,
            archive: None,
        }
    }

    /// Every raw page is also written to `archive`.
    pub fn with_archive(mut self, archive: ArtifactStore) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn credentials(&self) -> &CredentialsFile {
        &self.credentials
    }

    /// All pages of `endpoint`, or `None` when a page is not JSON or the token is rejected.
    pub async fn get_paginated(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<Option<Vec<JsonValue>>, SourceError> {
        let Some(first) = self.get_page(endpoint, params).await? else {
            return Ok(None);
        };
        let total = num_pages(&first);
        let mut pages = vec![first];
        for page in 2..=total {
            let mut paged = params.to_vec();
            paged.retain(|(k, _)| k != "page");
            paged.push(("page".to_string(), page.to_string()));
            match self.get_page(endpoint, &paged).await? {
                Some(body) => pages.push(body),
                None => return Ok(None),
            }
        }
        debug!(endpoint, pages = pages.len(), "fetched paginated endpoint");
        Ok(Some(pages))
    }

    async fn get_page(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<Option<JsonValue>, SourceError> {
        let url = format!("{}{}", self.settings.base_url, endpoint);
        let response = match self
            .transport
            .get(&url, &self.credentials.api.access_token, params)
            .await
        {
            Ok(response) => response,
            Err(err) if err.is_unauthorized() => {
                debug!(endpoint, "access token rejected");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        if let Some(archive) = &self.archive {
            archive
                .store_page(Utc::now(), endpoint, "json", &response.body)
                .await
                .with_context(|| format!("archiving page of {endpoint}"))?;
        }

        match serde_json::from_slice(&response.body) {
            Ok(page) => Ok(Some(page)),
            Err(err) => {
                debug!(endpoint, error = %err, "page is not json");
                Ok(None)
            }
        }
    }

    /// Exchanges the refresh token for a new access token and rewrites the credentials file.
    pub async fn refresh_token(&mut self) -> Result<(), SourceError> {
        let api = &self.credentials.api;
        let form = [
            ("client_id", api.client_id.as_str()),
            ("client_secret", api.client_secret.as_str()),
            ("grant_type", api.grant_type.as_str()),
            ("refresh_token", api.refresh_token.as_str()),
        ];
        let response = self
            .transport
            .post_form(&self.settings.token_url, &form)
            .await?;
        let token: TokenResponse = serde_json::from_slice(&response.body)
            .map_err(|err| SourceError::TokenRefresh(err.to_string()))?;

        self.credentials.api.access_token = token.access_token;
        self.credentials.api.refresh_token = token.refresh_token;
        self.credentials.save(&self.settings.credentials_path)?;
        info!("refreshed api access token");
        Ok(())
    }

    /// [`Self::get_paginated`], retried once after a token refresh. A second failure is
    /// "no data".
    pub async fn fetch_pages(
        &mut self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<Vec<JsonValue>, SourceError> {
        if let Some(pages) = self.get_paginated(endpoint, params).await? {
            return Ok(pages);
        }
        self.refresh_token().await?;
        match self.get_paginated(endpoint, params).await? {
            Some(pages) => Ok(pages),
            None => {
                warn!(endpoint, "no data after token refresh");
                Ok(Vec::new())
            }
        }
    }

    pub async fn program_id(&mut self, name: &str) -> Result<Option<i64>, SourceError> {
        let wanted = name.trim().to_lowercase();
        let pages = self.fetch_pages("programs", &[]).await?;
        let id = page_results(&pages)
            .find(|program| {
                program
                    .get("name")
                    .and_then(JsonValue::as_str)
                    .is_some_and(|n| n.trim().to_lowercase() == wanted)
            })
            .and_then(|program| program.get("id"))
            .and_then(JsonValue::as_i64);
        Ok(id)
    }

    pub async fn applications(&mut self, program_id: i64) -> Result<Vec<JsonValue>, SourceError> {
        self.fetch_pages(
            "applications",
            &[("program".to_string(), program_id.to_string())],
        )
        .await
    }

    pub async fn application_tasks(
        &mut self,
        application_id: i64,
    ) -> Result<Vec<JsonValue>, SourceError> {
        self.fetch_pages(&format!("applications/{application_id}/tasks"), &[])
            .await
    }

    pub async fn application_task(
        &mut self,
        application_id: i64,
        task_id: i64,
    ) -> Result<Vec<JsonValue>, SourceError> {
        self.fetch_pages(
            &format!("applications/{application_id}/tasks/{task_id}"),
            &[],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grantsync_storage::StatusCode;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Get {
            url: String,
            token: String,
            query: Vec<(String, String)>,
        },
        Post {
            url: String,
            form: Vec<(String, String)>,
        },
    }

    /// Replays canned responses in order and records every request.
    #[derive(Default)]
    struct FakeTransport {
        responses: Mutex<VecDeque<Result<Vec<u8>, u16>>>,
        calls: Mutex<Vec<Call>>,
    }

    impl FakeTransport {
        fn new(responses: Vec<Result<Vec<u8>, u16>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn next(&self, url: &str) -> Result<FetchedResponse, FetchError> {
            match self.responses.lock().unwrap().pop_front() {
                Some(Ok(body)) => Ok(FetchedResponse {
                    status: StatusCode::OK,
                    final_url: url.to_string(),
                    body,
                }),
                Some(Err(status)) => Err(FetchError::HttpStatus {
                    status,
                    url: url.to_string(),
                }),
                None => panic!("unexpected request to {url}"),
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ApiTransport for FakeTransport {
        async fn get(
            &self,
            url: &str,
            token: &str,
            query: &[(String, String)],
        ) -> Result<FetchedResponse, FetchError> {
            self.calls.lock().unwrap().push(Call::Get {
                url: url.to_string(),
                token: token.to_string(),
                query: query.to_vec(),
            });
            self.next(url)
        }

        async fn post_form(
            &self,
            url: &str,
            form: &[(&str, &str)],
        ) -> Result<FetchedResponse, FetchError> {
            self.calls.lock().unwrap().push(Call::Post {
                url: url.to_string(),
                form: form
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            });
            self.next(url)
        }
    }

    fn body(value: JsonValue) -> Result<Vec<u8>, u16> {
        Ok(serde_json::to_vec(&value).unwrap())
    }

    fn credentials() -> CredentialsFile {
        CredentialsFile {
            api: ApiCredentials {
                client_id: "cid".into(),
                client_secret: "secret".into(),
                access_token: "old-access".into(),
                refresh_token: "old-refresh".into(),
                grant_type: "refresh_token".into(),
            },
            extra: serde_json::Map::new(),
        }
    }

    fn client(
        dir: &Path,
        responses: Vec<Result<Vec<u8>, u16>>,
    ) -> SmApplyClient<FakeTransport> {
        let settings = ClientSettings {
            base_url: "https://grants.example.test/api/".into(),
            token_url: "https://grants.example.test/api/o/token/".into(),
            credentials_path: dir.join("credentials.json"),
        };
        credentials().save(&settings.credentials_path).unwrap();
        SmApplyClient::new(FakeTransport::new(responses), settings).unwrap()
    }

    #[tokio::test]
    async fn pages_are_followed_until_num_pages() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(
            dir.path(),
            vec![
                body(json!({"num_pages": 3, "results": [{"id": 1}]})),
                body(json!({"num_pages": 3, "results": [{"id": 2}]})),
                body(json!({"num_pages": 3, "results": [{"id": 3}]})),
            ],
        );
        let params = vec![("program".to_string(), "7".to_string())];
        let pages = client.get_paginated("applications", &params).await.unwrap().unwrap();
        let ids: Vec<_> = page_results(&pages).filter_map(|r| r["id"].as_i64()).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let calls = client.transport.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(
            calls[2],
            Call::Get {
                url: "https://grants.example.test/api/applications".into(),
                token: "old-access".into(),
                query: vec![
                    ("program".into(), "7".into()),
                    ("page".into(), "3".into())
                ],
            }
        );
    }

    #[tokio::test]
    async fn non_json_first_page_refreshes_token_and_retries_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(
            dir.path(),
            vec![
                Ok(b"<html>expired</html>".to_vec()),
                body(json!({"access_token": "new-access", "refresh_token": "new-refresh"})),
                body(json!({"results": [{"id": 11, "name": "Innovation Voucher Fund"}]})),
            ],
        );
        let id = client.program_id("  innovation voucher fund ").await.unwrap();
        assert_eq!(id, Some(11));

        let calls = client.transport.calls();
        assert!(matches!(&calls[1], Call::Post { form, .. }
            if form.contains(&("refresh_token".to_string(), "old-refresh".to_string()))));
        assert!(matches!(&calls[2], Call::Get { token, .. } if token == "new-access"));

        let saved = CredentialsFile::load(dir.path().join("credentials.json")).unwrap();
        assert_eq!(saved.api.access_token, "new-access");
        assert_eq!(saved.api.refresh_token, "new-refresh");
    }

    #[tokio::test]
    async fn unauthorized_is_treated_like_an_expired_token() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(
            dir.path(),
            vec![
                Err(401),
                body(json!({"access_token": "a2", "refresh_token": "r2"})),
                body(json!({"results": []})),
            ],
        );
        let pages = client.application_tasks(5).await.unwrap();
        assert_eq!(pages.len(), 1);
    }

    #[tokio::test]
    async fn second_failure_yields_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client(
            dir.path(),
            vec![
                Ok(b"not json".to_vec()),
                body(json!({"access_token": "a2", "refresh_token": "r2"})),
                Ok(b"still not json".to_vec()),
            ],
        );
        let pages = client.applications(3).await.unwrap();
        assert!(pages.is_empty());
        assert_eq!(client.transport.calls().len(), 3);
    }

    #[tokio::test]
    async fn server_errors_propagate() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(dir.path(), vec![Err(503)]);
        let err = client.get_paginated("programs", &[]).await.unwrap_err();
        assert!(matches!(err, SourceError::Fetch(FetchError::HttpStatus { status: 503, .. })));
    }

    #[tokio::test]
    async fn raw_pages_are_archived() {
        let dir = tempfile::tempdir().unwrap();
        let archive_dir = tempfile::tempdir().unwrap();
        let client = client(dir.path(), vec![body(json!({"results": []}))])
            .with_archive(ArtifactStore::new(archive_dir.path()));
        client.get_paginated("programs", &[]).await.unwrap();
        let stamps: Vec<_> = std::fs::read_dir(archive_dir.path()).unwrap().collect();
        assert_eq!(stamps.len(), 1);
    }

    #[test]
    fn credentials_keep_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(
            &path,
            r#"{"api":{"client_id":"c","client_secret":"s","access_token":"a","refresh_token":"r"},"program":"IVF"}"#,
        )
        .unwrap();
        let loaded = CredentialsFile::load(&path).unwrap();
        assert_eq!(loaded.api.grant_type, "refresh_token");
        loaded.save(&path).unwrap();
        let reread: JsonValue = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reread["program"], "IVF");
    }
}
