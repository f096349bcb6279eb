mod common;

use cart_pilot::catalog::SiteCatalog;
use cart_pilot::controller::{ApprovalReply, Collaborators, SessionController, SessionSignals};
use cart_pilot::error::{DriverError, FailureKind, Stage};
use cart_pilot::registry::SessionRegistry;
use cart_pilot::session::Session;
use cart_pilot::types::{ActionOutcome, ApprovalDecision, Command, SessionStatus};
use common::{
    ADD_TO_CART, FakePage, Mission, PLACE_ORDER, ScriptedClassifier, ScriptedReasoner, fast_config,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const DONE: &str = r#"{"action":"done","summary":"cable added to cart","reasoning":"cart shows 1 item"}"#;
const PLACE: &str = r#"{"action":"click","target":3,"reasoning":"finish the order"}"#;
const ADD: &str = r#"{"action":"click","target":2,"reasoning":"add the cable"}"#;

fn storefront() -> Arc<FakePage> {
    Arc::new(FakePage::storefront())
}

fn not_checkout() -> Arc<ScriptedClassifier> {
    Arc::new(ScriptedClassifier::not_checkout())
}

#[tokio::test]
async fn done_on_first_round_completes_without_actions() {
    let page = storefront();
    let reasoner = Arc::new(ScriptedReasoner::replies(&[DONE]));
    let mission = Mission::start(&fast_config(5), page.clone(), reasoner, not_checkout());

    let session = mission.finish().await;

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.iteration, 0);
    assert!(session.history.is_empty());
    assert!(session.messages.iter().any(|m| m.contains("cable added to cart")));
    assert!(page.effects().is_empty());
}

#[tokio::test]
async fn unknown_target_twice_fails_with_decision_error() {
    let reasoner = Arc::new(ScriptedReasoner::repeating(
        r#"{"action":"click","target":99}"#,
    ));
    let mission = Mission::start(&fast_config(5), storefront(), reasoner.clone(), not_checkout());

    let session = mission.finish().await;

    assert_eq!(session.status, SessionStatus::Failed);
    let error = session.last_error.unwrap();
    assert_eq!(error.kind, FailureKind::DecisionError);
    assert_eq!(error.stage, Stage::Reason);
    assert_eq!(reasoner.rounds(), 2);
    assert!(reasoner.feedback_at(1).unwrap().contains("unknown_target"));
}

#[tokio::test]
async fn invalid_first_reply_is_retried_with_feedback() {
    let reasoner = Arc::new(ScriptedReasoner::replies(&["I am not sure", DONE]));
    let mission = Mission::start(&fast_config(5), storefront(), reasoner.clone(), not_checkout());

    let session = mission.finish().await;

    assert_eq!(session.status, SessionStatus::Completed);
    assert!(reasoner.feedback_at(0).is_none());
    assert!(reasoner.feedback_at(1).unwrap().contains("no_payload"));
}

#[tokio::test]
async fn unavailable_reasoner_fails_the_session() {
    let reasoner = Arc::new(ScriptedReasoner::replies(&[]));
    let mission = Mission::start(&fast_config(5), storefront(), reasoner, not_checkout());

    let session = mission.finish().await;

    assert_eq!(
        session.last_error.unwrap().kind,
        FailureKind::ReasoningUnavailable
    );
}

#[tokio::test]
async fn grounding_failure_returns_to_observing() {
    let page = storefront();
    page.state().elements.clear();
    let reasoner = Arc::new(ScriptedReasoner::replies(&[
        r#"{"action":"type","target":1,"value":"usb-c cable"}"#,
        DONE,
    ]));
    let mission = Mission::start(&fast_config(5), page.clone(), reasoner.clone(), not_checkout());

    let session = mission.finish().await;

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.iteration, 1);
    let record = session.history.last().unwrap();
    assert!(matches!(record.outcome, ActionOutcome::GroundingFailed(_)));
    assert_eq!(record.status_after, SessionStatus::Observing);
    assert!(!page.effects().iter().any(|c| c.starts_with("type:")));
    assert_eq!(reasoner.rounds(), 2);
}

#[tokio::test]
async fn typing_round_trip_runs_the_input_sequence() {
    let page = storefront();
    let reasoner = Arc::new(ScriptedReasoner::replies(&[
        r#"{"action":"type","target":1,"value":"usb-c cable"}"#,
        DONE,
    ]));
    let mission = Mission::start(&fast_config(5), page.clone(), reasoner, not_checkout());

    let session = mission.finish().await;

    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.history.last().unwrap().outcome.succeeded());
    assert_eq!(
        page.effects(),
        vec![
            "focus:#search".to_string(),
            "clear:#search".to_string(),
            "type:usb-c cable".to_string(),
            "key:Enter".to_string(),
        ]
    );
}

#[tokio::test]
async fn iteration_cap_fails_after_exact_number_of_cycles() {
    let page = storefront();
    let reasoner = Arc::new(ScriptedReasoner::repeating(
        r#"{"action":"scroll","direction":"down"}"#,
    ));
    let mission = Mission::start(&fast_config(3), page.clone(), reasoner, not_checkout());

    let session = mission.finish().await;

    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(
        session.last_error.unwrap().kind,
        FailureKind::IterationCapExceeded
    );
    assert_eq!(session.iteration, 3);
    assert_eq!(session.history.len(), 3);
    assert_eq!(page.effects().len(), 3);
}

#[tokio::test]
async fn denied_purchase_goes_back_to_reasoning() {
    let page = storefront();
    let reasoner = Arc::new(ScriptedReasoner::replies(&[PLACE, DONE]));
    let mission = Mission::start(&fast_config(5), page.clone(), reasoner.clone(), not_checkout());

    let pending = mission.wait_for(SessionStatus::AwaitingApproval).await;
    let request = pending.pending_approval.unwrap();
    assert_eq!(request.target_label.as_deref(), Some("Place your order"));
    assert_eq!(request.action.command, Command::Click { target: 3 });

    mission
        .registry
        .resolve_approval(
            mission.id,
            ApprovalDecision::Deny {
                reason: Some("too expensive".into()),
            },
        )
        .unwrap();
    let session = mission.finish().await;

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.iteration, 0);
    let record = session.history.last().unwrap();
    assert_eq!(
        record.outcome,
        ActionOutcome::Denied {
            reason: Some("too expensive".into())
        }
    );
    assert_eq!(record.status_after, SessionStatus::Reasoning);
    assert!(!page.effects().iter().any(|c| c.starts_with("click:")));
    assert!(reasoner.feedback_at(1).unwrap().contains("denied"));
}

#[tokio::test]
async fn approved_purchase_executes_the_pending_click() {
    let page = storefront();
    let reasoner = Arc::new(ScriptedReasoner::replies(&[PLACE, DONE]));
    let mut mission = Mission::start(
        &fast_config(5),
        page.clone(),
        reasoner,
        Arc::new(ScriptedClassifier::checkout(0.95, "$12.99")),
    );

    mission.wait_for(SessionStatus::AwaitingApproval).await;
    mission
        .registry
        .resolve_approval(mission.id, ApprovalDecision::Approve)
        .unwrap();

    let mut saw_approval_event = false;
    while let Ok(event) = mission.events.try_recv() {
        if let Some(approval) = event.approval {
            assert_eq!(approval.summary.total_price.as_deref(), Some("$12.99"));
            saw_approval_event = true;
        }
    }
    assert!(saw_approval_event);

    let session = mission.finish().await;

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.iteration, 1);
    assert!(session.history.as_slice()[0].outcome.succeeded());
    assert_eq!(
        page.effects(),
        vec![format!("click:{PLACE_ORDER}#0:Standard")]
    );
}

#[tokio::test]
async fn approval_timeout_counts_as_denial() {
    let mut config = fast_config(5);
    config.agent.approval_timeout_ms = Some(20);
    let page = storefront();
    let reasoner = Arc::new(ScriptedReasoner::replies(&[PLACE, DONE]));
    let mission = Mission::start(&config, page.clone(), reasoner, not_checkout());

    let session = mission.finish().await;

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(
        session.history.last().unwrap().outcome,
        ActionOutcome::Denied {
            reason: Some("approval timed out".into())
        }
    );
    assert!(page.effects().is_empty());
}

#[tokio::test]
async fn cancel_while_awaiting_approval() {
    let page = storefront();
    let reasoner = Arc::new(ScriptedReasoner::replies(&[PLACE]));
    let mission = Mission::start(&fast_config(5), page.clone(), reasoner, not_checkout());

    mission.wait_for(SessionStatus::AwaitingApproval).await;
    mission.registry.cancel(mission.id).unwrap();
    let session = mission.finish().await;

    assert_eq!(session.status, SessionStatus::Cancelled);
    assert!(session.pending_approval.is_none());
    assert!(page.effects().is_empty());
}

#[tokio::test]
async fn navigation_failure_ends_the_session() {
    let page = storefront();
    page.state().navigate_error = Some(DriverError::Navigation {
        url: "https://shop.example/".into(),
        reason: "net::ERR_NAME_NOT_RESOLVED".into(),
    });
    let reasoner = Arc::new(ScriptedReasoner::replies(&[DONE]));
    let mission = Mission::start(&fast_config(5), page, reasoner.clone(), not_checkout());

    let session = mission.finish().await;

    let error = session.last_error.unwrap();
    assert_eq!(error.kind, FailureKind::NavigationFailure);
    assert_eq!(error.stage, Stage::Navigate);
    assert_eq!(reasoner.rounds(), 0);
}

#[tokio::test]
async fn closed_browser_fails_with_page_gone() {
    let page = storefront();
    page.state().screenshot_error = Some(DriverError::SessionGone("tab crashed".into()));
    let mission = Mission::start(
        &fast_config(5),
        page,
        Arc::new(ScriptedReasoner::replies(&[DONE])),
        not_checkout(),
    );

    let session = mission.finish().await;

    assert_eq!(session.status, SessionStatus::Failed);
    let error = session.last_error.unwrap();
    assert_eq!(error.kind, FailureKind::PageGone);
    assert_eq!(error.stage, Stage::Observe);
}

#[tokio::test]
async fn detached_page_is_observed_again_before_reasoning() {
    let page = storefront();
    page.state()
        .mark_failures
        .push_back(DriverError::Detached("navigating".into()));
    let reasoner = Arc::new(ScriptedReasoner::replies(&[ADD, DONE]));
    let mission = Mission::start(&fast_config(5), page.clone(), reasoner.clone(), not_checkout());

    let session = mission.finish().await;

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(reasoner.rounds(), 2);
    assert!(reasoner.feedback_at(0).is_none());
    assert_eq!(session.iteration, 1);
    assert_eq!(
        page.effects(),
        vec![format!("click:{ADD_TO_CART}#0:Standard")]
    );
    let marks = page.calls().iter().filter(|c| *c == "mark").count();
    assert_eq!(marks, 3);
}

#[tokio::test]
async fn observation_retries_are_bounded() {
    let page = storefront();
    page.state().mark_error = Some(DriverError::Detached("still loading".into()));
    let reasoner = Arc::new(ScriptedReasoner::replies(&[DONE]));
    let mission = Mission::start(&fast_config(5), page.clone(), reasoner.clone(), not_checkout());

    let session = mission.finish().await;

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(reasoner.rounds(), 1);
    let marks = page.calls().iter().filter(|c| *c == "mark").count();
    assert_eq!(marks, 3);
}

#[tokio::test]
async fn cancel_during_reasoning_stops_before_acting() {
    let page = storefront();
    let registry = SessionRegistry::new();
    let reasoner = Arc::new(ScriptedReasoner::replies(&[ADD]));
    reasoner.cancel_while_deciding(registry.clone());
    let mission = Mission::start_in(
        registry,
        &fast_config(5),
        page.clone(),
        reasoner.clone(),
        not_checkout(),
    );

    let session = mission.finish().await;

    assert_eq!(session.status, SessionStatus::Cancelled);
    assert_eq!(reasoner.rounds(), 1);
    assert_eq!(session.iteration, 0);
    assert!(session.history.is_empty());
    assert!(page.effects().is_empty());
}

#[tokio::test]
async fn replies_to_an_earlier_approval_request_are_ignored() {
    let page = storefront();
    let reasoner = Arc::new(ScriptedReasoner::replies(&[PLACE, DONE]));
    let session = Session::new("buy a usb-c cable", "https://shop.example/", 5);
    let (approvals_tx, approvals) = mpsc::channel(4);
    let (snapshot, mut watcher) = watch::channel(session.snapshot());
    approvals_tx
        .send(ApprovalReply {
            request_id: Uuid::new_v4(),
            decision: ApprovalDecision::Approve,
        })
        .await
        .unwrap();

    let controller = SessionController::new(
        &fast_config(5),
        session,
        Collaborators {
            page: page.clone(),
            reasoner,
            classifier: not_checkout(),
            catalog: Arc::new(SiteCatalog::default()),
        },
        broadcast::channel(64).0,
        SessionSignals {
            cancel: CancellationToken::new(),
            approvals,
            snapshot,
        },
    );
    let handle = tokio::spawn(controller.run());

    let request_id = {
        let pending = watcher
            .wait_for(|s| s.pending_approval.is_some())
            .await
            .unwrap();
        pending.pending_approval.as_ref().unwrap().id
    };
    approvals_tx
        .send(ApprovalReply {
            request_id,
            decision: ApprovalDecision::Deny {
                reason: Some("not now".into()),
            },
        })
        .await
        .unwrap();
    let session = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(
        session.history.last().unwrap().outcome,
        ActionOutcome::Denied {
            reason: Some("not now".into())
        }
    );
    assert!(page.effects().is_empty());
}
