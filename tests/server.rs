mod common;

use cart_pilot::analysis::analyze_page;
use cart_pilot::catalog::SiteCatalog;
use cart_pilot::config::ServerSettings;
use cart_pilot::error::DriverError;
use cart_pilot::face::{MissionCommand, PublicConfig, start_server};
use cart_pilot::registry::SessionRegistry;
use cart_pilot::types::SessionStatus;
use common::{FakePage, ScriptedReasoner};
use reqwest::StatusCode;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

async fn serve() -> (String, mpsc::Receiver<MissionCommand>) {
    let settings = ServerSettings {
        host: "127.0.0.1".into(),
        port: 0,
    };
    let public = PublicConfig {
        max_iterations: 7,
        headless: true,
        model: "gpt-4o".into(),
        model_configured: false,
    };
    let (cmd_rx, _events, addr) = start_server(&settings, SessionRegistry::new(), public)
        .await
        .unwrap();
    (format!("http://{addr}"), cmd_rx)
}

/// Answers every analysis request against `page`, the way the runner does
/// with a real browser.
fn answer_analyses(
    mut cmd_rx: mpsc::Receiver<MissionCommand>,
    page: Arc<FakePage>,
    reasoner: Arc<ScriptedReasoner>,
) {
    tokio::spawn(async move {
        while let Some(command) = cmd_rx.recv().await {
            if let MissionCommand::Analyze { goal, url, reply } = command {
                let outcome = analyze_page(
                    &*page,
                    &*reasoner,
                    Arc::new(SiteCatalog::default()),
                    &goal,
                    &url,
                    Duration::from_secs(1),
                    Duration::ZERO,
                )
                .await;
                let _ = reply.send(outcome);
            }
        }
    });
}

#[tokio::test]
async fn starting_a_mission_registers_and_dispatches_it() {
    let (base, mut cmd_rx) = serve().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/missions"))
        .json(&json!({"goal": "buy a usb-c cable", "url": "shop.example"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body: Value = response.json().await.unwrap();
    let id: Uuid = body["id"].as_str().unwrap().parse().unwrap();

    let Some(MissionCommand::Start { session, .. }) = cmd_rx.recv().await else {
        panic!("no mission dispatched");
    };
    assert_eq!(session.id, id);
    assert_eq!(session.start_url, "https://shop.example");
    assert_eq!(session.max_iterations, 7);

    let snapshot: Value = client
        .get(format!("{base}/missions/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(snapshot["status"], json!(SessionStatus::Idle));
    assert_eq!(snapshot["goal"], "buy a usb-c cable");

    let list: Vec<Value> = client
        .get(format!("{base}/missions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list.len(), 1);
}

#[tokio::test]
async fn approval_outside_a_pending_request_conflicts() {
    let (base, mut cmd_rx) = serve().await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{base}/missions"))
        .json(&json!({"goal": "buy socks", "url": "https://shop.example"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = body["id"].as_str().unwrap().to_string();
    let _keep_alive = cmd_rx.recv().await;

    let response = client
        .post(format!("{base}/missions/{id}/approval"))
        .json(&json!({"approved": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = client
        .post(format!("{base}/missions/{id}/cancel"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn bad_requests_are_rejected() {
    let (base, _cmd_rx) = serve().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/missions"))
        .json(&json!({"goal": "  ", "url": "shop.example"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = client
        .get(format!("{base}/missions/{}", Uuid::new_v4()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
}

#[tokio::test]
async fn public_config_is_exposed() {
    let (base, _cmd_rx) = serve().await;

    let config: Value = reqwest::get(format!("{base}/config"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(config["max_iterations"], 7);
    assert_eq!(config["headless"], true);
    assert_eq!(config["model"], "gpt-4o");
    assert_eq!(config["model_configured"], false);
}

#[tokio::test]
async fn analyze_returns_one_validated_action_without_a_session() {
    let (base, cmd_rx) = serve().await;
    let page = Arc::new(FakePage::storefront());
    let reasoner = Arc::new(ScriptedReasoner::replies(&[
        r#"{"action":"type","target":1,"value":"usb-c cable","reasoning":"search first"}"#,
    ]));
    answer_analyses(cmd_rx, page.clone(), reasoner);
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/analyze"))
        .json(&json!({"goal": "buy a usb-c cable", "url": "shop.example"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();

    assert_eq!(body["url"], "https://shop.example");
    assert_eq!(body["action"]["command"]["kind"], "type");
    assert_eq!(body["action"]["command"]["target"], 1);
    assert!(!body["screenshot"].as_str().unwrap().is_empty());
    assert_eq!(body["markers"]["markers"].as_array().unwrap().len(), 3);
    assert!(
        body["markers_formatted"]
            .as_str()
            .unwrap()
            .contains("[3] BUTTON - \"Place your order\"")
    );
    assert!(page.effects().is_empty());
    assert!(!page.state().marks_painted);

    let sessions: Vec<Value> = client
        .get(format!("{base}/missions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(sessions.is_empty());
}

#[tokio::test]
async fn analyze_reports_navigation_failure_as_bad_request() {
    let (base, cmd_rx) = serve().await;
    let page = Arc::new(FakePage::storefront());
    page.state().navigate_error = Some(DriverError::Navigation {
        url: "https://nowhere.example".into(),
        reason: "net::ERR_NAME_NOT_RESOLVED".into(),
    });
    let reasoner = Arc::new(ScriptedReasoner::replies(&[]));
    answer_analyses(cmd_rx, page, reasoner.clone());

    let response = reqwest::Client::new()
        .post(format!("{base}/analyze"))
        .json(&json!({"goal": "buy socks", "url": "nowhere.example"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["failure"]["kind"], "navigation_failure");
    assert_eq!(reasoner.rounds(), 0);
}
