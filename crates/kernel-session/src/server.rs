//! HTTP control plane of a notebook server.
//!
//! | Operation        | Method | Path (Contents)           | Path (Legacy)          |
//! |------------------|--------|---------------------------|------------------------|
//! | login            | POST   | `login`                   | `login`                |
//! | list notebooks   | GET    | `api/contents`            | `notebooks`            |
//! | new notebook     | GET    | `new`                     | `new`                  |
//! | fetch / save     | GET/PUT| `api/contents/<id>`       | `notebooks/<id>`       |
//! | start kernel     | POST   | `kernels?notebook=<id>`   | `kernels?notebook=<id>`|
//! | restart kernel   | POST   | `kernels/<kid>/restart`   | same                   |
//! | interrupt kernel | POST   | `kernels/<kid>/interrupt` | same                   |
//! | shutdown kernel  | DELETE | `kernels/<kid>`           | same                   |
//!
//! Paths are relative to the configured base URL.

use std::sync::{Arc, LazyLock};

use log::{debug, info, warn};
use regex::Regex;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::channel::{self, ChannelConnection, ChannelKind};
use crate::config::{ServerConfig, ServerFlavor};
use crate::error::SessionError;

static NOTEBOOK_ID_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"data-notebook-(?:id|path)="([^"]+)""#).expect("notebook id regex should compile")
});

/// One entry of the server's notebook listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotebookEntry {
    /// Identifier used in document and kernel endpoints.
    pub id: String,
    pub name: String,
    /// Kernel already attached to the notebook, when the server reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_id: Option<String>,
}

/// HTTP client for one notebook server.
///
/// Cookies from `login` are kept in a shared jar and replayed on every
/// request and on channel handshakes.
pub struct NotebookServer {
    config: ServerConfig,
    client: reqwest::Client,
    cookies: Arc<Jar>,
}

impl NotebookServer {
    pub fn new(config: ServerConfig) -> Result<Self, SessionError> {
        let cookies = Arc::new(Jar::default());
        let client = reqwest::Client::builder()
            .cookie_provider(cookies.clone())
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            config,
            client,
            cookies,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Base URL joined with `segments`, each one percent-encoded.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, SessionError> {
        let mut url = self.config.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SessionError::InvalidAddress(self.config.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// WebSocket URL of a kernel channel: `ws(s)://…/kernels/<kid>/<channel>`.
    pub fn channel_url(&self, kernel_id: &str, kind: ChannelKind) -> Result<Url, SessionError> {
        let mut url = self.endpoint(&["kernels", kernel_id, kind.as_str()])?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| SessionError::InvalidAddress(url.to_string()))?;
        Ok(url)
    }

    /// Cookies the server has set, formatted as a `Cookie` header value.
    pub fn cookie_header(&self) -> Option<String> {
        self.cookies
            .cookies(&self.config.base_url)
            .and_then(|value| value.to_str().ok().map(str::to_string))
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        build: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> Result<Response, SessionError> {
        let path = url.path().to_string();
        debug!("[server] {} {}", method, path);
        let response = build(self.client.request(method.clone(), url)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SessionError::HttpStatus {
                method,
                path,
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn json(response: Response) -> Result<Value, SessionError> {
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| SessionError::KernelUnreachable(format!("invalid JSON reply: {}", e)))
    }

    /// Authenticate with the configured password. No-op without one.
    pub async fn login(&self) -> Result<(), SessionError> {
        let Some(password) = self.config.password.clone() else {
            return Ok(());
        };
        let url = self.endpoint(&["login"])?;
        self.send(Method::POST, url, |req| req.form(&[("password", password)]))
            .await?;
        if self.cookie_header().is_none() {
            warn!("[server] Login to {} set no cookie", self.config.base_url);
        }
        info!("[server] Logged in to {}", self.config.base_url);
        Ok(())
    }

    pub async fn list_notebooks(&self) -> Result<Vec<NotebookEntry>, SessionError> {
        let url = match self.config.flavor {
            ServerFlavor::Contents => self.endpoint(&["api", "contents"])?,
            ServerFlavor::Legacy => self.endpoint(&["notebooks"])?,
        };
        let value = Self::json(self.send(Method::GET, url, |req| req).await?).await?;
        Ok(parse_listing(&value))
    }

    /// Ask the server for a fresh notebook and return its identifier.
    pub async fn new_notebook(&self) -> Result<String, SessionError> {
        let url = self.endpoint(&["new"])?;
        let response = self.send(Method::GET, url, |req| req).await?;
        let final_url = response.url().clone();
        let body = response.text().await?;
        let id = notebook_id_from_page(&body)
            .or_else(|| notebook_id_from_url(&final_url))
            .ok_or_else(|| {
                SessionError::KernelUnreachable(format!(
                    "could not find the new notebook id at {}",
                    final_url
                ))
            })?;
        info!("[server] Created notebook {}", id);
        Ok(id)
    }

    /// The notebook's JSON document.
    pub async fn fetch_notebook(&self, notebook_id: &str) -> Result<Value, SessionError> {
        let url = self.document_url(notebook_id)?;
        let value = Self::json(self.send(Method::GET, url, |req| req).await?).await?;
        Ok(unwrap_document(value))
    }

    /// Replace the stored document. Contents servers get it wrapped in a
    /// notebook model.
    pub async fn save_notebook(
        &self,
        notebook_id: &str,
        document: Value,
    ) -> Result<(), SessionError> {
        let url = self.document_url(notebook_id)?;
        let body = match self.config.flavor {
            ServerFlavor::Contents => serde_json::json!({"type": "notebook", "content": document}),
            ServerFlavor::Legacy => document,
        };
        self.send(Method::PUT, url, |req| req.json(&body)).await?;
        info!("[server] Saved notebook {}", notebook_id);
        Ok(())
    }

    fn document_url(&self, notebook_id: &str) -> Result<Url, SessionError> {
        let mut segments = match self.config.flavor {
            ServerFlavor::Contents => vec!["api", "contents"],
            ServerFlavor::Legacy => vec!["notebooks"],
        };
        segments.extend(notebook_id.split('/').filter(|s| !s.is_empty()));
        self.endpoint(&segments)
    }

    /// Start (or attach to) the notebook's kernel and return its id.
    pub async fn start_kernel(&self, notebook_id: &str) -> Result<String, SessionError> {
        let mut url = self.endpoint(&["kernels"])?;
        url.query_pairs_mut().append_pair("notebook", notebook_id);
        let value = Self::json(self.send(Method::POST, url, |req| req).await?).await?;

        let kernel_id = match kernel_id_from_reply(&value) {
            Some(id) => id,
            None if self.config.flavor == ServerFlavor::Legacy => {
                self.kernel_id_from_listing(notebook_id).await?
            }
            None => {
                return Err(SessionError::KernelUnreachable(
                    "start kernel reply has no kernel id".to_string(),
                ))
            }
        };
        info!("[server] Kernel {} for notebook {}", kernel_id, notebook_id);
        Ok(kernel_id)
    }

    async fn kernel_id_from_listing(&self, notebook_id: &str) -> Result<String, SessionError> {
        self.list_notebooks()
            .await?
            .into_iter()
            .find(|entry| entry.id == notebook_id)
            .and_then(|entry| entry.kernel_id)
            .ok_or_else(|| {
                SessionError::KernelUnreachable(format!(
                    "no kernel listed for notebook {}",
                    notebook_id
                ))
            })
    }

    pub async fn restart_kernel(&self, kernel_id: &str) -> Result<(), SessionError> {
        let url = self.endpoint(&["kernels", kernel_id, "restart"])?;
        self.send(Method::POST, url, |req| req).await?;
        info!("[server] Restarted kernel {}", kernel_id);
        Ok(())
    }

    pub async fn interrupt_kernel(&self, kernel_id: &str) -> Result<(), SessionError> {
        let url = self.endpoint(&["kernels", kernel_id, "interrupt"])?;
        self.send(Method::POST, url, |req| req).await?;
        info!("[server] Interrupted kernel {}", kernel_id);
        Ok(())
    }

    pub async fn shutdown_kernel(&self, kernel_id: &str) -> Result<(), SessionError> {
        let url = self.endpoint(&["kernels", kernel_id])?;
        self.send(Method::DELETE, url, |req| req).await?;
        info!("[server] Shut down kernel {}", kernel_id);
        Ok(())
    }

    pub async fn open_channel(
        &self,
        kernel_id: &str,
        kind: ChannelKind,
        session_id: &str,
    ) -> Result<ChannelConnection, SessionError> {
        let url = self.channel_url(kernel_id, kind)?;
        channel::connect(&url, kind, session_id, self.cookie_header()).await
    }
}

/// Listing replies: a bare array of legacy entries, or a contents directory
/// model whose `content` holds the entries.
fn parse_listing(value: &Value) -> Vec<NotebookEntry> {
    let items = match value {
        Value::Array(items) => items.as_slice(),
        Value::Object(obj) => match obj.get("content") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };

    items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            if let Some(kind) = obj.get("type").and_then(Value::as_str) {
                if kind != "notebook" {
                    return None;
                }
            }
            let id = obj
                .get("notebook_id")
                .or_else(|| obj.get("path"))
                .and_then(Value::as_str)?
                .to_string();
            let name = obj
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(&id)
                .to_string();
            let kernel_id = obj
                .get("kernel_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            Some(NotebookEntry {
                id,
                name,
                kernel_id,
            })
        })
        .collect()
}

fn notebook_id_from_page(body: &str) -> Option<String> {
    NOTEBOOK_ID_ATTR
        .captures(body)
        .map(|caps| caps[1].to_string())
}

/// The path after the `notebooks` segment of a redirect target.
fn notebook_id_from_url(url: &Url) -> Option<String> {
    let segments: Vec<&str> = url.path_segments()?.collect();
    let start = segments.iter().position(|s| *s == "notebooks")? + 1;
    let rest: Vec<&str> = segments[start..]
        .iter()
        .copied()
        .filter(|s| !s.is_empty())
        .collect();
    if rest.is_empty() {
        return None;
    }
    Some(rest.join("/"))
}

fn kernel_id_from_reply(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Object(obj) => obj
            .get("id")
            .or_else(|| obj.get("kernel_id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// Contents-API replies wrap the document in a model.
fn unwrap_document(value: Value) -> Value {
    match value {
        Value::Object(mut obj) if obj.get("content").is_some_and(Value::is_object) => {
            obj.remove("content").unwrap_or(Value::Null)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn server(address: &str) -> NotebookServer {
        NotebookServer::new(ServerConfig::new(address).unwrap()).unwrap()
    }

    #[test]
    fn test_channel_url_scheme() {
        let plain = server("localhost:8888");
        assert_eq!(
            plain.channel_url("k-1", ChannelKind::Shell).unwrap().as_str(),
            "ws://localhost:8888/kernels/k-1/shell"
        );

        let tls = server("https://hub.example.org/user/ada/");
        assert_eq!(
            tls.channel_url("k-2", ChannelKind::Iopub).unwrap().as_str(),
            "wss://hub.example.org/user/ada/kernels/k-2/iopub"
        );
    }

    #[test]
    fn test_document_url_by_flavor() {
        let contents = server("localhost:8888");
        assert_eq!(
            contents.document_url("dir/a b.ipynb").unwrap().as_str(),
            "http://localhost:8888/api/contents/dir/a%20b.ipynb"
        );

        let legacy = NotebookServer::new(
            ServerConfig::new("localhost:8888")
                .unwrap()
                .with_flavor(ServerFlavor::Legacy),
        )
        .unwrap();
        assert_eq!(
            legacy.document_url("d2a1c3").unwrap().as_str(),
            "http://localhost:8888/notebooks/d2a1c3"
        );
    }

    #[test]
    fn test_parse_legacy_listing() {
        let entries = parse_listing(&json!([
            {"notebook_id": "abc", "name": "Untitled0", "kernel_id": "k-9"},
            {"notebook_id": "def", "name": "Analysis", "kernel_id": null}
        ]));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kernel_id.as_deref(), Some("k-9"));
        assert_eq!(entries[1].name, "Analysis");
        assert_eq!(entries[1].kernel_id, None);
    }

    #[test]
    fn test_parse_contents_listing_skips_directories() {
        let entries = parse_listing(&json!({
            "type": "directory",
            "content": [
                {"type": "directory", "name": "data", "path": "data"},
                {"type": "notebook", "name": "a.ipynb", "path": "a.ipynb"}
            ]
        }));
        assert_eq!(
            entries,
            vec![NotebookEntry {
                id: "a.ipynb".to_string(),
                name: "a.ipynb".to_string(),
                kernel_id: None
            }]
        );
    }

    #[test]
    fn test_notebook_id_from_page_and_url() {
        let page = r#"<body data-project="x" data-notebook-id="3f2c9e">"#;
        assert_eq!(notebook_id_from_page(page).as_deref(), Some("3f2c9e"));
        assert_eq!(notebook_id_from_page("<body>"), None);

        let url = Url::parse("http://localhost:8888/notebooks/sub/Untitled1.ipynb").unwrap();
        assert_eq!(
            notebook_id_from_url(&url).as_deref(),
            Some("sub/Untitled1.ipynb")
        );
        let tree = Url::parse("http://localhost:8888/tree").unwrap();
        assert_eq!(notebook_id_from_url(&tree), None);
    }

    #[test]
    fn test_kernel_id_from_reply() {
        assert_eq!(
            kernel_id_from_reply(&json!({"id": "k-1", "name": "python3"})).as_deref(),
            Some("k-1")
        );
        assert_eq!(
            kernel_id_from_reply(&json!({"kernel_id": "k-2", "ws_url": "ws://x"})).as_deref(),
            Some("k-2")
        );
        assert_eq!(kernel_id_from_reply(&json!("k-3")).as_deref(), Some("k-3"));
        assert_eq!(kernel_id_from_reply(&Value::Null), None);
    }

    #[test]
    fn test_unwrap_document() {
        let model = json!({"type": "notebook", "content": {"nbformat": 4, "cells": []}});
        assert_eq!(unwrap_document(model)["nbformat"], 4);
        let raw = json!({"nbformat": 3, "worksheets": []});
        assert_eq!(unwrap_document(raw.clone()), raw);
    }
}
