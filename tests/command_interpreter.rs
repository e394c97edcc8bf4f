use std::time::Duration;

use gitrix_bridge::bridge::Bridge;
use gitrix_bridge::config::Config;
use gitrix_bridge::gitter::GitterClient;
use gitrix_bridge::matrix::{MatrixClient, MatrixEvent};
use gitrix_bridge::rate_limiter::RateLimiter;
use gitrix_bridge::store::Store;
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(homeserver_url: String) -> Config {
    Config {
        unique_secret_key: "a-real-secret".to_string(),
        matrix_homeserver_url: homeserver_url,
        matrix_homeserver_domain: "example.org".to_string(),
        matrix_botname: "gitterbot".to_string(),
        matrix_appservice_port: 9000,
        matrix_appservice_token: "as-token".to_string(),
        matrix_homeserver_token: "hs-token".to_string(),
        gitter_login_port: 9001,
        gitter_login_url: "https://gitter.example.org/".to_string(),
        gitter_oauth_key: "key".to_string(),
        gitter_oauth_secret: "secret".to_string(),
        database_url: ":memory:".to_string(),
    }
}

fn message_event(room: &str, sender: &str, body: &str) -> MatrixEvent {
    MatrixEvent {
        event_type: "m.room.message".to_string(),
        room_id: room.to_string(),
        user_id: None,
        sender: Some(sender.to_string()),
        state_key: None,
        content: json!({"msgtype": "m.text", "body": body}),
    }
}

/// A message in an unauthenticated user's own private room never reaches the
/// command interpreter; it gets the not-logged-in reply instead (spec.md
/// §4.6 "Event dispatch state machine", end-to-end scenario 1).
#[tokio::test]
async fn unauthenticated_user_is_told_to_log_in_instead_of_running_commands() {
    let mock_server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/r0/rooms/priv-room/send/m\.room\.message/.+$"))
        .and(body_string_contains("You are not logged in."))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"event_id": "$1"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = test_config(format!("{}/", mock_server.uri()));
    let store = Store::new(&config.database_url).unwrap();
    store.create_user("@bob:example.org").unwrap();
    store.set_private_room("@bob:example.org", "priv-room").unwrap();

    let matrix = MatrixClient::new(config.matrix_homeserver_url.clone(), config.matrix_appservice_token.clone());
    let gitter = GitterClient::new();
    let limiter = RateLimiter::new(Duration::from_secs(10), Duration::from_secs(60), 1.8, 0.8);
    let bridge = Bridge::new(config, store, matrix, gitter, limiter);

    bridge
        .dispatch_event(message_event("priv-room", "@bob:example.org", "list"))
        .await;

    mock_server.verify().await;
}

/// Any message that doesn't match one of the five known commands gets the
/// literal fallback reply (spec.md §4.6.1's table).
#[tokio::test]
async fn unknown_command_gets_invalid_command_reply() {
    let mock_server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/r0/rooms/priv-room/send/m\.room\.message/.+$"))
        .and(body_string_contains("Invalid command!"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"event_id": "$1"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = test_config(format!("{}/", mock_server.uri()));
    let store = Store::new(&config.database_url).unwrap();
    store.create_user("@carol:example.org").unwrap();
    store.set_private_room("@carol:example.org", "priv-room").unwrap();
    store
        .set_gitter_info("@carol:example.org", "carol", "g1", "gitter-token")
        .unwrap();

    let matrix = MatrixClient::new(config.matrix_homeserver_url.clone(), config.matrix_appservice_token.clone());
    let gitter = GitterClient::new();
    let limiter = RateLimiter::new(Duration::from_secs(10), Duration::from_secs(60), 1.8, 0.8);
    let bridge = Bridge::new(config, store, matrix, gitter, limiter);

    bridge
        .dispatch_event(message_event("priv-room", "@carol:example.org", "frobnicate"))
        .await;

    mock_server.verify().await;
}

/// `logout` with no bridged rooms still clears Gitter credentials, replies,
/// and leaves/forgets the private room (spec.md §4.6.1 `logout` row).
#[tokio::test]
async fn logout_with_no_bridged_rooms_clears_state_and_replies() {
    let mock_server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/r0/rooms/priv-room/send/m\.room\.message/.+$"))
        .and(body_string_contains("You have been logged out."))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"event_id": "$1"})))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/_matrix/client/r0/rooms/priv-room/(leave|forget)$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&mock_server)
        .await;

    let config = test_config(format!("{}/", mock_server.uri()));
    let store = Store::new(&config.database_url).unwrap();
    store.create_user("@dave:example.org").unwrap();
    store.set_private_room("@dave:example.org", "priv-room").unwrap();
    store
        .set_gitter_info("@dave:example.org", "dave", "g2", "gitter-token")
        .unwrap();

    let matrix = MatrixClient::new(config.matrix_homeserver_url.clone(), config.matrix_appservice_token.clone());
    let gitter = GitterClient::new();
    let limiter = RateLimiter::new(Duration::from_secs(10), Duration::from_secs(60), 1.8, 0.8);
    let bridge = Bridge::new(config, store, matrix, gitter, limiter);

    bridge
        .dispatch_event(message_event("priv-room", "@dave:example.org", "logout"))
        .await;

    let user = bridge
        .store()
        .get_user_by_matrix_username("@dave:example.org")
        .unwrap()
        .expect("user row still exists after logout");
    assert!(!user.is_authenticated());

    mock_server.verify().await;
}
