use super::*;

use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fluxrun_core::config::ServerProxyConfig;

fn config_for(server: &MockServer) -> ServerProxyConfig {
    ServerProxyConfig {
        name: "test_runner".to_string(),
        id: Uuid::new_v4(),
        token: Uuid::new_v4(),
        api_url: server.uri().parse().unwrap(),
        api_port: server.address().port(),
        report_interval: 600,
    }
}

async fn mount_status_endpoint(server: &MockServer) {
    Mock::given(method("PATCH"))
        .and(path_regex("^/runner_manager/report_status/.+"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(server)
        .await;
}

#[tokio::test]
async fn connect_reports_idle_presence_with_auth_headers() {
    let server = MockServer::start().await;
    mount_status_endpoint(&server).await;

    let proxy = ServerProxy::connect(&config_for(&server)).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(
        request.url.path(),
        format!("/runner_manager/report_status/{}", proxy.runner_id())
    );
    let body: Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["state"], "idle");
    assert_eq!(
        request.headers.get("id").unwrap().to_str().unwrap(),
        proxy.runner_id().to_string()
    );
    assert!(request.headers.get("token").is_some());
    assert!(
        request
            .headers
            .get("authorization")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("Token ")
    );

    proxy.shutdown();
}

#[tokio::test]
async fn connect_fails_when_the_control_plane_is_unreachable() {
    let dead_config = {
        let server = MockServer::start().await;
        config_for(&server)
        // The server drops here, closing its port.
    };

    assert!(ServerProxy::connect(&dead_config).await.is_err());
}

#[tokio::test]
async fn response_future_resolves_once_with_the_decoded_body() {
    let server = MockServer::start().await;
    mount_status_endpoint(&server).await;
    Mock::given(method("POST"))
        .and(path_regex("^/test_endpoint/.+"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"answer": 42})),
        )
        .mount(&server)
        .await;

    let proxy = ServerProxy::connect(&config_for(&server)).await.unwrap();
    let future = proxy.push_with_response(Message::json(
        "test_endpoint",
        Method::POST,
        Some(serde_json::json!({"q": 1})),
    ));

    let body = future.wait().await.unwrap();
    assert_eq!(body["answer"], 42);
    // The correlation entry is gone once the future completes.
    assert_eq!(proxy.shared.pending_len(), 0);

    proxy.shutdown();
}

#[tokio::test]
async fn response_future_surfaces_http_failures() {
    let server = MockServer::start().await;
    mount_status_endpoint(&server).await;
    Mock::given(method("POST"))
        .and(path_regex("^/test_endpoint/.+"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let proxy = ServerProxy::connect(&config_for(&server)).await.unwrap();
    let future =
        proxy.push_with_response(Message::json("test_endpoint", Method::POST, None));

    let err = future.wait().await.unwrap_err();
    match err {
        ProxyError::Status { status, body } => {
            assert_eq!(status.as_u16(), 500);
            assert_eq!(body, "boom");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(proxy.shared.pending_len(), 0);

    proxy.shutdown();
}

#[tokio::test]
async fn missing_payload_file_fails_the_send_as_not_found() {
    let server = MockServer::start().await;
    mount_status_endpoint(&server).await;

    let proxy = ServerProxy::connect(&config_for(&server)).await.unwrap();
    let future = proxy.push_with_response(Message::file_upload(
        "job_manager/resource",
        Method::POST,
        "/definitely/not/here.log".into(),
    ));

    let err = future.wait().await.unwrap_err();
    assert!(matches!(err, ProxyError::PayloadMissing(_)), "{err}");

    proxy.shutdown();
}

#[tokio::test]
async fn queued_messages_reach_the_server_with_params_and_runner_id() {
    let server = MockServer::start().await;
    mount_status_endpoint(&server).await;
    Mock::given(method("POST"))
        .and(path_regex("^/job_manager/resource/.+"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("job_out.log");
    std::fs::write(&log_path, b"log body").unwrap();

    let proxy = ServerProxy::connect(&config_for(&server)).await.unwrap();
    let future = proxy.push_with_response(
        Message::file_upload("job_manager/resource", Method::POST, log_path)
            .with_param("resource_type", "LOG"),
    );
    future.wait().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let upload = requests
        .iter()
        .find(|request| request.url.path().starts_with("/job_manager/resource/"))
        .unwrap();
    assert_eq!(
        upload.url.path(),
        format!("/job_manager/resource/{}", proxy.runner_id())
    );
    assert_eq!(upload.body, b"log body");
    assert!(
        upload
            .url
            .query_pairs()
            .any(|(key, value)| key == "resource_type" && value == "LOG")
    );

    proxy.shutdown();
}

#[tokio::test]
async fn heartbeat_fires_on_the_report_interval() {
    let server = MockServer::start().await;
    mount_status_endpoint(&server).await;

    let mut config = config_for(&server);
    config.report_interval = 1;
    let proxy = ServerProxy::connect(&config).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1300)).await;

    let reports = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.url.path().starts_with("/runner_manager/report_status/"))
        .count();
    // Initial presence report plus at least one heartbeat.
    assert!(reports >= 2, "saw {reports} status reports");

    proxy.shutdown();
}

#[tokio::test]
async fn report_offline_is_best_effort() {
    let server = MockServer::start().await;
    mount_status_endpoint(&server).await;

    let proxy = ServerProxy::connect(&config_for(&server)).await.unwrap();
    proxy.report_offline().await;

    let requests = server.received_requests().await.unwrap();
    let last: Value = serde_json::from_slice(&requests.last().unwrap().body).unwrap();
    assert_eq!(last["state"], "offline");

    // Offline reporting against a dead server must not error or hang.
    server.reset().await;
    drop(server);
    proxy.report_offline().await;

    proxy.shutdown();
}

#[tokio::test]
async fn push_with_response_correlates_by_message_id() {
    let server = MockServer::start().await;
    mount_status_endpoint(&server).await;
    Mock::given(method("GET"))
        .and(path_regex("^/slow/.+"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"which": "slow"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex("^/fast/.+"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"which": "fast"})),
        )
        .mount(&server)
        .await;

    let proxy = ServerProxy::connect(&config_for(&server)).await.unwrap();
    let slow = proxy.push_with_response(Message::json("slow", Method::GET, None));
    let fast = proxy.push_with_response(Message::json("fast", Method::GET, None));

    assert_eq!(slow.wait().await.unwrap()["which"], "slow");
    assert_eq!(fast.wait().await.unwrap()["which"], "fast");
    assert_eq!(proxy.shared.pending_len(), 0);

    proxy.shutdown();
}
