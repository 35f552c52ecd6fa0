// src/client/http.rs

//! HTTP implementation of the board client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{IF_MODIFIED_SINCE, LAST_MODIFIED};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use crate::client::{BoardClient, ThreadSnapshot, md5_matches};
use crate::error::{FetchError, Result};
use crate::models::{
    CatalogPage, HttpConfig, ImageRef, ThreadDocument, ThreadId, catalog_thread_ids,
};

/// Create a configured asynchronous HTTP client.
pub fn create_async_client(config: &HttpConfig) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;
    Ok(client)
}

/// Board client backed by `reqwest`.
#[derive(Clone)]
pub struct HttpBoardClient {
    client: reqwest::Client,
    api_base: Url,
    image_base: Url,
}

impl HttpBoardClient {
    /// Build a client from HTTP settings.
    pub fn new(config: &HttpConfig) -> Result<Self> {
        Ok(Self {
            client: create_async_client(config)?,
            api_base: base_url(&config.api_base)?,
            image_base: base_url(&config.image_base)?,
        })
    }

    fn endpoint(base: &Url, path: &str) -> std::result::Result<Url, FetchError> {
        base.join(path)
            .map_err(|e| FetchError::fatal(path.to_string(), e))
    }

    /// Send a request and classify the response status.
    async fn send(
        &self,
        request: RequestBuilder,
        context: &str,
        gone: Option<ThreadId>,
    ) -> std::result::Result<Response, FetchError> {
        let response = request
            .send()
            .await
            .map_err(|e| FetchError::transient(context, e))?;

        match classify_status(response.status(), context, gone) {
            Some(err) => Err(err),
            None => Ok(response),
        }
    }

    async fn body(response: Response, context: &str) -> std::result::Result<Vec<u8>, FetchError> {
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::transient(context, e))?;
        Ok(bytes.to_vec())
    }
}

/// Decode a JSON body; a half-written response from an overloaded edge is
/// worth retrying.
fn parse_json<T: DeserializeOwned>(bytes: &[u8], context: &str) -> std::result::Result<T, FetchError> {
    serde_json::from_slice(bytes).map_err(|e| FetchError::transient(context, e))
}

#[async_trait]
impl BoardClient for HttpBoardClient {
    async fn fetch_catalog(&self, board: &str) -> std::result::Result<Vec<ThreadId>, FetchError> {
        let context = format!("catalog /{board}/");
        let url = Self::endpoint(&self.api_base, &format!("{board}/threads.json"))?;
        let response = self.send(self.client.get(url), &context, None).await?;
        let pages: Vec<CatalogPage> = parse_json(&Self::body(response, &context).await?, &context)?;
        Ok(catalog_thread_ids(&pages))
    }

    async fn fetch_thread(
        &self,
        board: &str,
        thread_id: ThreadId,
        since: Option<&str>,
    ) -> std::result::Result<ThreadSnapshot, FetchError> {
        let context = format!("thread /{board}/{thread_id}");
        let url = Self::endpoint(&self.api_base, &format!("{board}/thread/{thread_id}.json"))?;

        let mut request = self.client.get(url);
        if let Some(since) = since {
            request = request.header(IF_MODIFIED_SINCE, since);
        }
        let response = self.send(request, &context, Some(thread_id)).await?;
        if response.status() == StatusCode::NOT_MODIFIED {
            log::debug!("{} not modified since {:?}", context, since);
            return Ok(ThreadSnapshot::NotModified);
        }

        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let document: ThreadDocument = parse_json(&Self::body(response, &context).await?, &context)?;
        Ok(ThreadSnapshot::Modified {
            posts: document.posts,
            last_modified,
        })
    }

    async fn fetch_image(
        &self,
        board: &str,
        image: &ImageRef,
    ) -> std::result::Result<Vec<u8>, FetchError> {
        let context = format!("image /{board}/{}", image.filename);
        let url = Self::endpoint(&self.image_base, &format!("{board}/{}", image.filename))?;
        let response = self.send(self.client.get(url), &context, None).await?;
        let data = Self::body(response, &context).await?;

        if let Some(expected) = &image.md5 {
            if !md5_matches(&data, expected) {
                return Err(FetchError::transient(context, "MD5 digest mismatch"));
            }
        }
        Ok(data)
    }
}

/// Parse a base URL, making sure relative joins append to its path.
fn base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Map a non-success status to the fetch error taxonomy.
///
/// `gone` names the thread a 404 refers to, if the request was a thread
/// fetch; other 404s are configuration errors. A 304 is only expected on
/// conditional thread fetches.
pub(crate) fn classify_status(
    status: StatusCode,
    context: &str,
    gone: Option<ThreadId>,
) -> Option<FetchError> {
    if status.is_success() || (status == StatusCode::NOT_MODIFIED && gone.is_some()) {
        return None;
    }
    if status == StatusCode::NOT_FOUND {
        if let Some(thread_id) = gone {
            return Some(FetchError::ThreadGone(thread_id));
        }
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Some(FetchError::transient(context, status));
    }
    if status.is_client_error() {
        return Some(FetchError::fatal(context, status));
    }
    // 1xx/3xx that reqwest did not follow
    Some(FetchError::transient(context, status))
}
