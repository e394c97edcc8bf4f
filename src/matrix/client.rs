use std::time::Duration;

use chrono::Utc;
use reqwest::{Client, Method};
use serde_json::{json, Value};

use crate::error::BridgeError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_ERROR_BODY: usize = 2 * 1024 * 1024;

/// Outbound Matrix client-server API wrapper (spec.md §4.4), authenticated
/// as the application service and optionally puppeting a virtual user via
/// the `user_id` query parameter.
#[derive(Clone)]
pub struct MatrixClient {
    http: Client,
    homeserver_url: String,
    as_token: String,
}

impl MatrixClient {
    pub fn new(homeserver_url: String, as_token: String) -> Self {
        MatrixClient {
            http: Client::new(),
            homeserver_url,
            as_token,
        }
    }

    fn fresh_txid() -> String {
        Utc::now().format("%Y%m%dT%H%M%S%.6f").to_string()
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query_args: &[(&str, &str)],
        body: Option<Value>,
        as_user: Option<&str>,
        assert200: bool,
    ) -> Result<Value, BridgeError> {
        let mut url = format!(
            "{}_matrix/client/r0/{}?access_token={}",
            self.homeserver_url,
            path,
            urlencoding::encode(&self.as_token)
        );
        if let Some(user) = as_user {
            url.push_str(&format!("&user_id={}", urlencoding::encode(user)));
        }
        for (key, value) in query_args {
            url.push_str(&format!("&{key}={}", urlencoding::encode(value)));
        }
        let mut req = self
            .http
            .request(method, url)
            .timeout(REQUEST_TIMEOUT)
            .header("Accept", "application/json");
        if let Some(b) = &body {
            req = req.json(b);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if assert200 && !status.is_success() {
            let bytes = resp.bytes().await.unwrap_or_default();
            let truncated = &bytes[..bytes.len().min(MAX_ERROR_BODY)];
            return Err(BridgeError::MatrixApi {
                status: status.as_u16(),
                body: String::from_utf8_lossy(truncated).into_owned(),
            });
        }
        Ok(resp.json().await.unwrap_or(Value::Null))
    }

    /// Registers a virtual user under application-service privileges.
    /// "Already registered" is not a failure (spec.md §4.6.2 step 2).
    pub async fn register(&self, username: &str) -> Result<(), BridgeError> {
        let result = self
            .request(
                Method::POST,
                "register",
                &[],
                Some(json!({"type": "m.login.application_service", "username": username})),
                None,
                true,
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(BridgeError::MatrixApi { status, body })
                if status == 400 && body.contains("M_USER_IN_USE") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn set_displayname(&self, user_id: &str, displayname: &str) -> Result<(), BridgeError> {
        let path = format!("profile/{}/displayname", urlencoding::encode(user_id));
        self.request(Method::PUT, &path, &[], Some(json!({"displayname": displayname})), Some(user_id), true)
            .await?;
        Ok(())
    }

    pub async fn create_room(&self, name: Option<&str>, invite: &[String]) -> Result<String, BridgeError> {
        let mut body = json!({"preset": "private_chat"});
        if let Some(name) = name {
            body["name"] = json!(name);
        }
        if !invite.is_empty() {
            body["invite"] = json!(invite);
        }
        let resp = self.request(Method::POST, "createRoom", &[], Some(body), None, true).await?;
        resp.get("room_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BridgeError::other("createRoom response missing room_id"))
    }

    pub async fn invite(&self, room: &str, user_id: &str) -> Result<(), BridgeError> {
        let path = format!("rooms/{}/invite", urlencoding::encode(room));
        self.request(Method::POST, &path, &[], Some(json!({"user_id": user_id})), None, true)
            .await?;
        Ok(())
    }

    /// Joins `room` as the bot.
    pub async fn join_as_bot(&self, room: &str) -> Result<(), BridgeError> {
        let path = format!("join/{}", urlencoding::encode(room));
        self.request(Method::POST, &path, &[], Some(json!({})), None, true).await?;
        Ok(())
    }

    /// Joins `room` as a puppeted virtual user.
    pub async fn join_as_user(&self, room: &str, user_id: &str) -> Result<(), BridgeError> {
        let path = format!("rooms/{}/join", urlencoding::encode(room));
        self.request(Method::POST, &path, &[], Some(json!({})), Some(user_id), true)
            .await?;
        Ok(())
    }

    pub async fn leave(&self, room: &str, as_user: Option<&str>) -> Result<(), BridgeError> {
        let path = format!("rooms/{}/leave", urlencoding::encode(room));
        self.request(Method::POST, &path, &[], Some(json!({})), as_user, true).await?;
        Ok(())
    }

    pub async fn forget(&self, room: &str, as_user: Option<&str>) -> Result<(), BridgeError> {
        let path = format!("rooms/{}/forget", urlencoding::encode(room));
        self.request(Method::POST, &path, &[], Some(json!({})), as_user, true).await?;
        Ok(())
    }

    /// Matrix user ids currently joined to `room`, capped at 3 entries
    /// (enough to distinguish "private control room" from "bridged room",
    /// spec.md §4.6 step 2).
    pub async fn joined_member_ids(&self, room: &str) -> Result<Vec<String>, BridgeError> {
        let path = format!("rooms/{}/members", urlencoding::encode(room));
        let resp = self.request(Method::GET, &path, &[("limit", "3")], None, None, true).await?;
        let chunk = resp.get("chunk").and_then(Value::as_array).cloned().unwrap_or_default();
        Ok(chunk
            .into_iter()
            .filter(|ev| {
                ev.get("content")
                    .and_then(|c| c.get("membership"))
                    .and_then(Value::as_str)
                    == Some("join")
            })
            .filter_map(|ev| ev.get("state_key").and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    pub async fn send(&self, room: &str, body: &str, as_user: Option<&str>) -> Result<(), BridgeError> {
        let txid = Self::fresh_txid();
        let path = format!(
            "rooms/{}/send/m.room.message/{}",
            urlencoding::encode(room),
            urlencoding::encode(&txid)
        );
        self.request(Method::PUT, &path, &[], Some(json!({"msgtype": "m.text", "body": body})), as_user, true)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_txid_is_non_empty_and_varies_in_format() {
        let txid = MatrixClient::fresh_txid();
        assert!(!txid.is_empty());
        assert!(txid.contains('T'));
    }
}
