use msr_relay_lib::build_context;
use msr_relay_lib::config::AppConfig;
use msr_relay_lib::pipeline::{SampleOrigin, SamplePipeline};
use msr_relay_lib::session::{
    run_session, ChannelPeer, ChannelTransport, ErrorKind, Outbound, PeerEvent, Role,
    SessionContext,
};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

fn context() -> SessionContext {
    let mut config = AppConfig::default();
    for (name, role) in [
        ("olga", Role::Operator),
        ("carl", Role::Calibrator),
        ("ada", Role::Admin),
    ] {
        config.users.insert(name.to_string(), role);
    }
    build_context(&config)
}

async fn connect(ctx: &SessionContext, who: &str) -> (ChannelPeer, JoinHandle<anyhow::Result<()>>) {
    let (transport, mut peer) = ChannelTransport::pair();
    let task = tokio::spawn(run_session(
        transport,
        Some(who.to_string()),
        ctx.clone(),
        CancellationToken::new(),
    ));
    match next(&mut peer).await {
        Outbound::ConnectionEstablished { .. } => {}
        other => panic!("expected greeting, got {other:?}"),
    }
    (peer, task)
}

async fn next(peer: &mut ChannelPeer) -> Outbound {
    match timeout(Duration::from_secs(5), peer.events.recv()).await {
        Ok(Some(PeerEvent::Message(message))) => message,
        other => panic!("expected a message, got {other:?}"),
    }
}

async fn next_json(peer: &mut ChannelPeer) -> Value {
    serde_json::to_value(next(peer).await).unwrap()
}

async fn publish_demo_sample(ctx: &SessionContext, value: f64) {
    let engine = &ctx.engine;
    let mut pipeline = SamplePipeline::new(
        engine.settings.clone(),
        engine.link.clone(),
        engine.metrics.clone(),
        SampleOrigin::Demo,
    );
    let sample = pipeline.process_value(value).await.unwrap();
    engine.publish(sample).await;
}

#[tokio::test]
async fn each_role_receives_its_own_view_of_the_same_sample() {
    let ctx = context();
    let (mut operator, _) = connect(&ctx, "olga").await;
    let (mut calibrator, _) = connect(&ctx, "carl").await;
    let (mut admin, _) = connect(&ctx, "ada").await;
    assert_eq!(ctx.engine.hub.subscriber_count(), 3);

    publish_demo_sample(&ctx, 30.0).await;

    let view = next_json(&mut operator).await;
    assert_eq!(view["type"], "data");
    assert_eq!(view["data"]["calibrated_value"], 30.0);
    assert!(view["data"].get("raw_value").is_none());
    assert!(view["data"].get("admin_data").is_none());
    assert_eq!(view["data"]["is_demo_data"], true);

    let view = next_json(&mut calibrator).await;
    assert_eq!(view["data"]["raw_value"], 30.0);
    assert!(view["data"].get("admin_data").is_none());

    let view = next_json(&mut admin).await;
    assert!(view["data"]["admin_data"]["system_stats"].is_object());
    assert_eq!(
        view["data"]["connection_state"]["last_error"],
        Value::Null
    );
}

#[tokio::test]
async fn calibrator_offset_applies_to_following_samples() {
    let ctx = context();
    let (mut calibrator, _) = connect(&ctx, "carl").await;

    calibrator
        .frames
        .send(r#"{"action":"calibrate","parameters":{"offset":2.0}}"#.into())
        .await
        .unwrap();
    let reply = next_json(&mut calibrator).await;
    assert_eq!(reply["type"], "response");
    assert_eq!(reply["settings"]["offset"], 2.0);
    assert_eq!(reply["settings"]["gain"], 1.0);

    publish_demo_sample(&ctx, 10.0).await;
    let view = next_json(&mut calibrator).await;
    assert_eq!(view["data"]["raw_value"], 10.0);
    assert_eq!(view["data"]["calibrated_value"], 12.0);
}

#[tokio::test]
async fn denied_operator_keeps_streaming_and_answering() {
    let ctx = context();
    let (mut operator, task) = connect(&ctx, "olga").await;

    operator
        .frames
        .send(r#"{"action":"admin_action","command":"update_settings","parameters":{"port":1}}"#.into())
        .await
        .unwrap();
    assert_eq!(next(&mut operator).await.kind(), Some(ErrorKind::PermissionDenied));
    assert_eq!(ctx.engine.settings.connection().port, 2345);

    operator
        .frames
        .send(r#"{"action":"get_status"}"#.into())
        .await
        .unwrap();
    let status = next_json(&mut operator).await;
    assert_eq!(status["type"], "status");
    assert!(status["connection"].get("last_connected").is_some());
    assert!(status["connection"].get("settings").is_none());

    publish_demo_sample(&ctx, 5.0).await;
    assert!(matches!(next(&mut operator).await, Outbound::Data { .. }));

    drop(operator);
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
    assert_eq!(ctx.engine.hub.subscriber_count(), 0);
}

#[tokio::test]
async fn slow_session_does_not_hold_back_others() {
    let mut config = AppConfig::default();
    config.hub_capacity = 2;
    config.users.insert("ada".into(), Role::Admin);
    let ctx = build_context(&config);

    // A subscriber that never drains its queue.
    let stalled = ctx.engine.hub.subscribe(uuid::Uuid::new_v4());
    let (mut admin, _) = connect(&ctx, "ada").await;

    for value in 0..5 {
        publish_demo_sample(&ctx, value as f64 * 10.0 + 10.0).await;
        let view = next_json(&mut admin).await;
        assert_eq!(view["data"]["raw_value"], value as f64 * 10.0 + 10.0);
    }
    assert_eq!(ctx.engine.hub.subscriber_count(), 2);
    drop(stalled);
    let counters = ctx.engine.metrics.get_snapshot().await.counters;
    assert_eq!(counters.demo_samples, 5);
}
