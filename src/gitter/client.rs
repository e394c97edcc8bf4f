use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::json;

use crate::error::BridgeError;
use crate::markup;

const API_BASE: &str = "https://api.gitter.im/";
const STREAM_BASE: &str = "https://stream.gitter.im/";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_ERROR_BODY: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct WhoAmI {
    pub username: String,
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitterRoom {
    pub id: String,
    pub url: String,
}

impl GitterRoom {
    /// Canonical room name, with Gitter's leading `/` stripped (spec.md §4.3
    /// `list_rooms`).
    pub fn name(&self) -> &str {
        self.url.strip_prefix('/').unwrap_or(&self.url)
    }
}

/// Stateless wrapper over the Gitter REST/streaming API (spec.md §4.3).
/// Holds no per-user state; every call takes the caller's bearer token.
#[derive(Clone)]
pub struct GitterClient {
    http: Client,
}

impl Default for GitterClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GitterClient {
    pub fn new() -> Self {
        GitterClient {
            http: Client::builder()
                .build()
                .expect("reqwest client builds with default TLS config"),
        }
    }

    async fn rest(
        &self,
        method: Method,
        path: &str,
        token: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, BridgeError> {
        let mut req = self
            .http
            .request(method, format!("{API_BASE}{path}"))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(token)
            .header("Accept", "application/json");
        if let Some(b) = body {
            req = req.json(&b);
        }
        Ok(req.send().await?)
    }

    async fn assert200_json(resp: reqwest::Response) -> Result<serde_json::Value, BridgeError> {
        let status = resp.status();
        if !status.is_success() {
            let bytes = resp.bytes().await.unwrap_or_default();
            let truncated = &bytes[..bytes.len().min(MAX_ERROR_BODY)];
            let body = String::from_utf8_lossy(truncated).into_owned();
            return Err(BridgeError::GitterApi {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }

    /// Like `assert200_json`, but for calls whose body is discarded: a 200
    /// with an empty body (e.g. the `DELETE` in `leave_room`) is success, not
    /// a parse error.
    async fn assert200(resp: reqwest::Response) -> Result<(), BridgeError> {
        let status = resp.status();
        if !status.is_success() {
            let bytes = resp.bytes().await.unwrap_or_default();
            let truncated = &bytes[..bytes.len().min(MAX_ERROR_BODY)];
            let body = String::from_utf8_lossy(truncated).into_owned();
            return Err(BridgeError::GitterApi {
                status: status.as_u16(),
                body,
            });
        }
        let _ = resp.json::<serde_json::Value>().await.unwrap_or(serde_json::Value::Null);
        Ok(())
    }

    pub async fn whoami(&self, token: &str) -> Result<WhoAmI, BridgeError> {
        let resp = self.rest(Method::GET, "v1/user", token, None).await?;
        let json = Self::assert200_json(resp).await?;
        let first = json
            .get(0)
            .ok_or_else(|| BridgeError::other("empty whoami response from Gitter"))?;
        Ok(serde_json::from_value(first.clone())?)
    }

    pub async fn list_rooms(&self, token: &str) -> Result<Vec<GitterRoom>, BridgeError> {
        let resp = self.rest(Method::GET, "v1/rooms", token, None).await?;
        let json = Self::assert200_json(resp).await?;
        Ok(serde_json::from_value(json)?)
    }

    /// Looks up a Gitter room by its `org/repo`-style uri without joining it
    /// (spec.md §4.3 `lookup_room`).
    pub async fn lookup_room(&self, name: &str, token: &str) -> Result<GitterRoom, BridgeError> {
        let resp = self
            .rest(Method::POST, "v1/rooms", token, Some(json!({ "uri": name })))
            .await?;
        let json = Self::assert200_json(resp).await?;
        Ok(serde_json::from_value(json)?)
    }

    pub async fn join_room(
        &self,
        token: &str,
        gitter_user_id: &str,
        gitter_room_id: &str,
    ) -> Result<(), BridgeError> {
        let path = format!("v1/user/{}/rooms", urlencoding::encode(gitter_user_id));
        let resp = self
            .rest(Method::POST, &path, token, Some(json!({ "id": gitter_room_id })))
            .await?;
        Self::assert200(resp).await?;
        Ok(())
    }

    pub async fn leave_room(
        &self,
        token: &str,
        gitter_user_id: &str,
        room_name: &str,
    ) -> Result<(), BridgeError> {
        let room = self.lookup_room(room_name, token).await?;
        let path = format!(
            "v1/rooms/{}/users/{}",
            urlencoding::encode(&room.id),
            urlencoding::encode(gitter_user_id)
        );
        let resp = self.rest(Method::DELETE, &path, token, None).await?;
        Self::assert200(resp).await?;
        Ok(())
    }

    /// Translates `text`'s markup and posts it to the given room
    /// (spec.md §4.3 `post_message`).
    pub async fn post_message(
        &self,
        token: &str,
        gitter_room_id: &str,
        text: &str,
    ) -> Result<(), BridgeError> {
        let translated = markup::matrix_to_gitter(text);
        let path = format!(
            "v1/rooms/{}/chatMessages",
            urlencoding::encode(gitter_room_id)
        );
        let resp = self
            .rest(Method::POST, &path, token, Some(json!({ "text": translated })))
            .await?;
        Self::assert200(resp).await?;
        Ok(())
    }

    /// Opens the infinite newline-framed JSON stream for a room. No timeout
    /// is applied; the caller handles framing and disconnects (§4.3, §4.5).
    pub async fn open_stream(
        &self,
        token: &str,
        gitter_room_id: &str,
    ) -> Result<impl Stream<Item = reqwest::Result<Bytes>>, BridgeError> {
        let url = format!(
            "{STREAM_BASE}v1/rooms/{}/chatMessages",
            urlencoding::encode(gitter_room_id)
        );
        let resp = self
            .http
            .get(&url)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let bytes = resp.bytes().await.unwrap_or_default();
            let truncated = &bytes[..bytes.len().min(MAX_ERROR_BODY)];
            let body = String::from_utf8_lossy(truncated).into_owned();
            return Err(BridgeError::GitterApi { status, body });
        }
        Ok(resp.bytes_stream())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_name_strips_leading_slash() {
        let room = GitterRoom {
            id: "R1".into(),
            url: "/matrix-org/matrix-js-sdk".into(),
        };
        assert_eq!(room.name(), "matrix-org/matrix-js-sdk");
    }
}
