//! Model hub client. Local discovery only needs four things from a hub: the
//! repositories that quantize a base model, their file listings, the first
//! bytes of a weights file and the whole file.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, LINK, RANGE};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use super::apireq::{error_for_status, join_endpoint, Url};
use super::{Error, ErrorKind};
use crate::config::HubSettings;

/// A repository as returned by the hub's model listing.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub(crate) struct HubRepo {
    /// Listings also carry `_id` and a `modelId` duplicating this; both are
    /// ignored.
    pub id: String,
    #[serde(default)]
    pub downloads: u64,
    #[serde(default)]
    pub likes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HubFile {
    pub path: String,
    pub size: u64,
}

#[async_trait]
pub(crate) trait ModelHub: Send + Sync {
    /// Repositories tagged as quantizations of `base_model`.
    async fn quantized_repos(&self, base_model: &str) -> Result<Vec<HubRepo>, Error>;

    /// Every file of `repo_id`, recursively.
    async fn repo_files(&self, repo_id: &str) -> Result<Vec<HubFile>, Error>;

    /// At most `limit` bytes from the start of a file.
    async fn file_prefix(&self, repo_id: &str, path: &str, limit: u64) -> Result<Bytes, Error>;

    /// Streams a file into `dest`, returning the number of bytes written.
    async fn download(
        &self,
        repo_id: &str,
        path: &str,
        dest: &mut tokio::fs::File,
    ) -> Result<u64, Error>;
}

#[derive(Deserialize)]
struct TreeLfs {
    size: u64,
}

#[derive(Deserialize)]
struct TreeEntry {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    lfs: Option<TreeLfs>,
}

/// Extracts the `rel="next"` target from a `Link` header.
fn next_link(header: &str) -> Option<String> {
    for part in header.split(',') {
        let mut fields = part.split(';');

        let target = fields.next()?.trim();

        let is_next = fields.any(|f| {
            let f = f.trim();
            f == "rel=\"next\"" || f == "rel=next"
        });

        if is_next {
            let target = target.strip_prefix('<')?.strip_suffix('>')?;
            return Some(target.to_string());
        }
    }

    None
}

/// The Hugging Face hub over its public HTTP API.
pub(crate) struct HuggingFaceHub {
    endpoint: String,
    token: Option<String>,
    client: Client,
}

impl HuggingFaceHub {
    pub(crate) fn new(endpoint: &str, token: Option<String>) -> HuggingFaceHub {
        HuggingFaceHub {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            client: Client::new(),
        }
    }

    pub(crate) fn from_settings(settings: &HubSettings) -> HuggingFaceHub {
        Self::new(&settings.endpoint, settings.token())
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        if let Some(token) = &self.token {
            if let Ok(mut value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            }
        }

        headers
    }

    fn url(&self, path: &str) -> Result<Url, Error> {
        join_endpoint(&self.endpoint, path)
            .map_err(|e| Error::from_source(ErrorKind::BadRequest, Box::new(e)))
    }

    fn resolve_url(&self, repo_id: &str, path: &str) -> Result<Url, Error> {
        self.url(&format!("/{}/resolve/main/{}", repo_id, path))
    }

    async fn check_status(res: Response) -> Result<Response, Error> {
        let status = res.status();

        if status.is_success() {
            Ok(res)
        } else {
            let detail = res.text().await.unwrap_or_default();

            Err(error_for_status(status, detail))
        }
    }

    /// The page `Link` points to next. Links leaving the hub's origin are not
    /// followed, since every request carries the hub token.
    fn next_page(current: &Url, res: &Response) -> Option<Url> {
        let target = res
            .headers()
            .get(LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(next_link)?;

        let next = current.join(&target).ok()?;

        if next.origin() != current.origin() {
            warn!(link = %next, "not following pagination link to another origin");
            return None;
        }

        Some(next)
    }

    /// Collects a JSON array listing across every page.
    async fn get_all_pages<T: DeserializeOwned + Send>(&self, first: Url) -> Result<Vec<T>, Error> {
        let mut items = Vec::new();
        let mut next = Some(first);

        while let Some(url) = next.take() {
            let res = self
                .client
                .get(url.clone())
                .headers(self.headers())
                .send()
                .await?;

            let res = Self::check_status(res).await?;

            next = Self::next_page(&url, &res);

            let page: Vec<T> = res.json().await?;

            items.extend(page);
        }

        Ok(items)
    }
}

#[async_trait]
impl ModelHub for HuggingFaceHub {
    async fn quantized_repos(&self, base_model: &str) -> Result<Vec<HubRepo>, Error> {
        let mut url = self.url("/api/models")?;

        url.query_pairs_mut()
            .append_pair("filter", &format!("base_model:quantized:{}", base_model))
            .append_pair("limit", "1000");

        self.get_all_pages(url).await
    }

    async fn repo_files(&self, repo_id: &str) -> Result<Vec<HubFile>, Error> {
        let mut url = self.url(&format!("/api/models/{}/tree/main", repo_id))?;

        url.query_pairs_mut().append_pair("recursive", "true");

        let entries: Vec<TreeEntry> = self.get_all_pages(url).await?;

        let files = entries
            .into_iter()
            .filter(|entry| entry.kind == "file")
            .map(|entry| HubFile {
                size: entry.lfs.map(|lfs| lfs.size).unwrap_or(entry.size),
                path: entry.path,
            })
            .collect();

        Ok(files)
    }

    async fn file_prefix(&self, repo_id: &str, path: &str, limit: u64) -> Result<Bytes, Error> {
        if limit == 0 {
            return Ok(Bytes::new());
        }

        let url = self.resolve_url(repo_id, path)?;

        let res = self
            .client
            .get(url)
            .headers(self.headers())
            .header(RANGE, format!("bytes=0-{}", limit - 1))
            .send()
            .await?;

        let res = Self::check_status(res).await?;

        // A server ignoring the range answers with the whole file
        let limit = limit as usize;
        let mut buf = BytesMut::new();
        let mut stream = res.bytes_stream();

        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);

            if buf.len() >= limit {
                buf.truncate(limit);
                break;
            }
        }

        Ok(buf.freeze())
    }

    async fn download(
        &self,
        repo_id: &str,
        path: &str,
        dest: &mut tokio::fs::File,
    ) -> Result<u64, Error> {
        let url = self.resolve_url(repo_id, path)?;

        let res = self
            .client
            .get(url)
            .headers(self.headers())
            .send()
            .await?;

        let res = Self::check_status(res).await?;

        let mut written = 0u64;
        let mut stream = res.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;

            dest.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        dest.flush().await?;

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::SocketAddr;

    use axum::extract::{Path, Query};
    use axum::http::{header, HeaderMap as AxumHeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;

    async fn spawn_upstream(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        addr
    }

    #[test]
    fn test_next_link() {
        assert_eq!(
            next_link("<https://huggingface.co/api/models?cursor=abc>; rel=\"next\""),
            Some("https://huggingface.co/api/models?cursor=abc".to_string())
        );
        assert_eq!(
            next_link("<https://a/prev>; rel=\"prev\", <https://a/next>; rel=\"next\""),
            Some("https://a/next".to_string())
        );
        assert_eq!(next_link("<https://a/prev>; rel=\"prev\""), None);
        assert_eq!(next_link(""), None);
    }

    #[tokio::test]
    async fn test_quantized_repos_follows_pagination() {
        let addr_cell = std::sync::Arc::new(std::sync::OnceLock::<SocketAddr>::new());
        let cell = addr_cell.clone();

        let app = Router::new().route(
            "/api/models",
            get(move |Query(q): Query<HashMap<String, String>>| {
                let cell = cell.clone();
                async move {
                    assert_eq!(
                        q.get("filter").map(String::as_str),
                        Some("base_model:quantized:meta-llama/Llama-3.1-8B")
                    );

                    if q.contains_key("cursor") {
                        Json(json!([{"id": "unsloth/Llama-3.1-8B-GGUF", "downloads": 7}]))
                            .into_response()
                    } else {
                        let addr = cell.get().unwrap();
                        let link = format!(
                            "<http://{}/api/models?filter=base_model%3Aquantized%3Ameta-llama%2FLlama-3.1-8B&cursor=2>; rel=\"next\"",
                            addr
                        );

                        // Shaped like the hub's real listing entries
                        (
                            [(header::LINK, link)],
                            Json(json!([{
                                "_id": "66a1f0c2e3",
                                "id": "bartowski/Llama-3.1-8B-GGUF",
                                "likes": 3,
                                "downloads": 100,
                                "private": false,
                                "pipeline_tag": "text-generation",
                                "tags": ["gguf", "base_model:quantized:meta-llama/Llama-3.1-8B"],
                                "createdAt": "2024-07-23T15:36:34.000Z",
                                "modelId": "bartowski/Llama-3.1-8B-GGUF"
                            }])),
                        )
                            .into_response()
                    }
                }
            }),
        );

        let addr = spawn_upstream(app).await;
        addr_cell.set(addr).unwrap();

        let hub = HuggingFaceHub::new(&format!("http://{}", addr), None);

        let repos = hub
            .quantized_repos("meta-llama/Llama-3.1-8B")
            .await
            .unwrap();

        assert_eq!(
            repos,
            vec![
                HubRepo {
                    id: "bartowski/Llama-3.1-8B-GGUF".to_string(),
                    downloads: 100,
                    likes: 3,
                },
                HubRepo {
                    id: "unsloth/Llama-3.1-8B-GGUF".to_string(),
                    downloads: 7,
                    likes: 0,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_repo_files_prefers_lfs_size() {
        let app = Router::new().route(
            "/api/models/{owner}/{repo}/tree/main",
            get(
                |Path((owner, repo)): Path<(String, String)>,
                 Query(q): Query<HashMap<String, String>>| async move {
                    assert_eq!(owner, "bartowski");
                    assert_eq!(repo, "Llama-3.1-8B-GGUF");
                    assert_eq!(q.get("recursive").map(String::as_str), Some("true"));

                    Json(json!([
                        {"type": "directory", "path": "Q4_K_M", "size": 0},
                        {"type": "file", "path": "README.md", "size": 1200},
                        {"type": "file", "path": "Q4_K_M/model-Q4_K_M.gguf", "size": 135,
                         "lfs": {"oid": "abc", "size": 4920000000u64, "pointerSize": 135}}
                    ]))
                },
            ),
        );

        let addr = spawn_upstream(app).await;
        let hub = HuggingFaceHub::new(&format!("http://{}/", addr), None);

        let files = hub.repo_files("bartowski/Llama-3.1-8B-GGUF").await.unwrap();

        assert_eq!(
            files,
            vec![
                HubFile {
                    path: "README.md".to_string(),
                    size: 1200,
                },
                HubFile {
                    path: "Q4_K_M/model-Q4_K_M.gguf".to_string(),
                    size: 4920000000,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_file_prefix_and_download_send_token() {
        let app = Router::new().route(
            "/{owner}/{repo}/resolve/main/{*path}",
            get(|headers: AxumHeaderMap| async move {
                let authorized = headers
                    .get(header::AUTHORIZATION)
                    .map(|v| v == "Bearer hf_test")
                    .unwrap_or(false);

                if !authorized {
                    return StatusCode::UNAUTHORIZED.into_response();
                }

                // Ignores the range on purpose
                vec![7u8; 4096].into_response()
            }),
        );

        let addr = spawn_upstream(app).await;

        let hub = HuggingFaceHub::new(&format!("http://{}", addr), Some("hf_test".into()));

        let prefix = hub
            .file_prefix("owner/repo", "dir/model.gguf", 100)
            .await
            .unwrap();
        assert_eq!(prefix.len(), 100);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.gguf");
        let mut file = tokio::fs::File::create(&path).await.unwrap();

        let written = hub
            .download("owner/repo", "dir/model.gguf", &mut file)
            .await
            .unwrap();
        assert_eq!(written, 4096);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);

        let anonymous = HuggingFaceHub::new(&format!("http://{}", addr), None);
        let err = anonymous
            .file_prefix("owner/repo", "dir/model.gguf", 100)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn test_listing_entry_with_model_id_parses() {
        let repos: Vec<HubRepo> = serde_json::from_str(
            r#"[{"_id":"66a","id":"bartowski/Llama-3.1-8B-GGUF","likes":250,"downloads":90000,"modelId":"bartowski/Llama-3.1-8B-GGUF"}]"#,
        )
        .unwrap();

        assert_eq!(
            repos,
            vec![HubRepo {
                id: "bartowski/Llama-3.1-8B-GGUF".to_string(),
                downloads: 90000,
                likes: 250,
            }]
        );
    }

    #[tokio::test]
    async fn test_repo_files_follows_pagination() {
        let app = Router::new().route(
            "/api/models/{owner}/{repo}/tree/main",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                assert_eq!(q.get("recursive").map(String::as_str), Some("true"));

                if q.contains_key("cursor") {
                    Json(json!([
                        {"type": "file", "path": "Q8_0/model-Q8_0-00002-of-00002.gguf", "size": 20},
                        {"type": "file", "path": "imatrix.dat", "size": 5}
                    ]))
                    .into_response()
                } else {
                    // Relative targets resolve against the current page
                    (
                        [(
                            header::LINK,
                            "</api/models/bartowski/Big-GGUF/tree/main?recursive=true&cursor=2>; rel=\"next\"",
                        )],
                        Json(json!([
                            {"type": "directory", "path": "Q8_0", "size": 0},
                            {"type": "file", "path": "Q8_0/model-Q8_0-00001-of-00002.gguf", "size": 30}
                        ])),
                    )
                        .into_response()
                }
            }),
        );

        let addr = spawn_upstream(app).await;
        let hub = HuggingFaceHub::new(&format!("http://{}", addr), None);

        let files = hub.repo_files("bartowski/Big-GGUF").await.unwrap();

        assert_eq!(
            files.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
            vec![
                "Q8_0/model-Q8_0-00001-of-00002.gguf",
                "Q8_0/model-Q8_0-00002-of-00002.gguf",
                "imatrix.dat",
            ]
        );
    }

    #[tokio::test]
    async fn test_pagination_stays_on_hub_origin() {
        let app = Router::new().route(
            "/api/models",
            get(|headers: AxumHeaderMap| async move {
                assert_eq!(headers[header::AUTHORIZATION], "Bearer hf_test");

                (
                    [(
                        header::LINK,
                        "<http://127.0.0.1:1/api/models?cursor=2>; rel=\"next\"",
                    )],
                    Json(json!([{"id": "bartowski/Llama-3.1-8B-GGUF"}])),
                )
            }),
        );

        let addr = spawn_upstream(app).await;
        let hub = HuggingFaceHub::new(&format!("http://{}", addr), Some("hf_test".into()));

        // Following the link would fail to connect
        let repos = hub
            .quantized_repos("meta-llama/Llama-3.1-8B")
            .await
            .unwrap();

        assert_eq!(repos.len(), 1);
    }
}
