use std::time::Duration;

use gitrix_bridge::bridge::Bridge;
use gitrix_bridge::config::Config;
use gitrix_bridge::gitter::GitterClient;
use gitrix_bridge::matrix::{MatrixClient, MatrixEvent};
use gitrix_bridge::rate_limiter::RateLimiter;
use gitrix_bridge::store::Store;
use serde_json::json;
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ROOM: &str = "priv-room";

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

/// Regression test for the private-room probe (spec.md §4.6 step 2): a join
/// in an unindexed two-member room must fetch joined members with a single,
/// well-formed query string and classify the room as a private control room.
/// Previously `joined_member_ids` built `members?limit=3` and `request()`
/// then appended `?access_token=...`, producing `members?limit=3?access_token=...`
/// — a malformed query the homeserver would 401 on — so this exercises the
/// fix end to end rather than just at the URL-building layer.
#[tokio::test]
async fn join_in_two_member_room_is_adopted_as_private_room_and_greeted() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(format!("/_matrix/client/r0/rooms/{ROOM}/members")))
        .and(query_param("access_token", "as-token"))
        .and(query_param("limit", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "chunk": [
                {"state_key": "@gitterbot:example.org", "content": {"membership": "join"}},
                {"state_key": "@alice:example.org", "content": {"membership": "join"}},
            ]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("PUT"))
        .and(path_regex(format!(r"^/_matrix/client/r0/rooms/{ROOM}/send/m\.room\.message/.+$")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"event_id": "$1"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = test_config(format!("{}/", mock_server.uri()));
    let store = Store::new(&config.database_url).unwrap();
    let matrix = MatrixClient::new(config.matrix_homeserver_url.clone(), config.matrix_appservice_token.clone());
    let gitter = GitterClient::new();
    let limiter = RateLimiter::new(Duration::from_secs(10), Duration::from_secs(60), 1.8, 0.8);
    let bridge = Bridge::new(config, store, matrix, gitter, limiter);

    bridge
        .dispatch_event(MatrixEvent {
            event_type: "m.room.member".to_string(),
            room_id: ROOM.to_string(),
            user_id: None,
            sender: Some("@alice:example.org".to_string()),
            state_key: Some("@alice:example.org".to_string()),
            content: json!({"membership": "join"}),
        })
        .await;

    let user = bridge
        .store()
        .get_user_by_matrix_username("@alice:example.org")
        .unwrap()
        .expect("user should have been created by the probe");
    assert_eq!(user.matrix_private_room.as_deref(), Some(ROOM));

    mock_server.verify().await;
}
