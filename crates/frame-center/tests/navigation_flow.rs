//! End-to-end navigation scenarios through the hub: protocol events in,
//! resolved navigations out.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use cdp_channel::StubChannel;
use frame_center::{AutomationHub, NavigationOptions, WaitUntil};
use wheelhouse_core_types::{CoreErrorKind, FrameId};

const MAIN_FRAME: &str = "f-main";

async fn started_hub(channel: &Arc<StubChannel>) -> Arc<AutomationHub> {
    channel.queue_result(
        "Page.getFrameTree",
        Ok(json!({ "frameTree": {
            "frame": { "id": MAIN_FRAME, "loaderId": "l-0", "url": "about:blank" },
            "childFrames": [],
        }})),
    );
    let hub = AutomationHub::new(channel.clone(), false);
    hub.start().await.expect("hub start");
    hub
}

/// Wait until the stub has recorded a command, so event emission cannot race
/// ahead of the navigation being issued.
async fn await_command(channel: &Arc<StubChannel>, method: &str) {
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if !channel.commands_for(method).is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{method} was never sent"));
}

fn emit(channel: &Arc<StubChannel>, method: &str, params: Value) {
    channel.emit(method, params);
}

#[tokio::test]
async fn navigate_resolves_with_the_main_resource_response() {
    let channel = Arc::new(StubChannel::new());
    let hub = started_hub(&channel).await;
    let frame_id = FrameId(MAIN_FRAME.into());

    let nav = {
        let hub = Arc::clone(&hub);
        let frame_id = frame_id.clone();
        tokio::spawn(async move {
            hub.navigate(
                &frame_id,
                "http://site.test/",
                NavigationOptions::default(),
            )
            .await
        })
    };
    await_command(&channel, "Page.navigate").await;

    emit(
        &channel,
        "Network.requestWillBeSent",
        json!({
            "requestId": "nav-1",
            "loaderId": "nav-1",
            "request": { "url": "http://site.test/", "method": "GET", "headers": {} },
            "type": "Document",
            "frameId": MAIN_FRAME,
        }),
    );
    emit(
        &channel,
        "Network.responseReceived",
        json!({
            "requestId": "nav-1",
            "response": { "url": "http://site.test/", "status": 200, "mimeType": "text/html" },
            "hasExtraInfo": false,
        }),
    );
    emit(&channel, "Network.loadingFinished", json!({ "requestId": "nav-1" }));
    emit(
        &channel,
        "Page.lifecycleEvent",
        json!({ "frameId": MAIN_FRAME, "loaderId": "nav-1", "name": "init" }),
    );
    emit(
        &channel,
        "Page.frameNavigated",
        json!({ "frame": { "id": MAIN_FRAME, "loaderId": "nav-1", "url": "http://site.test/" } }),
    );
    emit(
        &channel,
        "Page.lifecycleEvent",
        json!({ "frameId": MAIN_FRAME, "loaderId": "nav-1", "name": "load" }),
    );

    let response = tokio::time::timeout(Duration::from_secs(2), nav)
        .await
        .expect("navigation completes")
        .expect("task join")
        .expect("navigation ok")
        .expect("new-document navigation has a response");
    assert_eq!(response.status(), 200);
    assert_eq!(response.url(), "http://site.test/");

    let frame = hub
        .frame_tree()
        .frame(&frame_id)
        .expect("main frame tracked");
    assert_eq!(frame.url(), "http://site.test/");
    hub.shutdown().await;
}

#[tokio::test]
async fn same_document_navigation_resolves_without_a_response() {
    let channel = Arc::new(StubChannel::new());
    let hub = started_hub(&channel).await;
    let frame_id = FrameId(MAIN_FRAME.into());

    // lifecycle state replayed for the already-loaded document
    emit(
        &channel,
        "Page.lifecycleEvent",
        json!({ "frameId": MAIN_FRAME, "loaderId": "l-0", "name": "init" }),
    );
    emit(
        &channel,
        "Page.lifecycleEvent",
        json!({ "frameId": MAIN_FRAME, "loaderId": "l-0", "name": "load" }),
    );

    let nav = {
        let hub = Arc::clone(&hub);
        let frame_id = frame_id.clone();
        tokio::spawn(async move {
            hub.navigate(
                &frame_id,
                "http://site.test/#anchor",
                NavigationOptions::default(),
            )
            .await
        })
    };
    await_command(&channel, "Page.navigate").await;

    emit(
        &channel,
        "Page.navigatedWithinDocument",
        json!({ "frameId": MAIN_FRAME, "url": "http://site.test/#anchor" }),
    );

    let response = tokio::time::timeout(Duration::from_secs(2), nav)
        .await
        .expect("navigation completes")
        .expect("task join")
        .expect("navigation ok");
    assert!(response.is_none(), "same-document navigation has no response");
    assert_eq!(
        hub.frame_tree().frame(&frame_id).expect("frame").url(),
        "http://site.test/#anchor"
    );
    hub.shutdown().await;
}

#[tokio::test]
async fn navigation_error_text_is_surfaced() {
    let channel = Arc::new(StubChannel::new());
    let hub = started_hub(&channel).await;
    channel.queue_result(
        "Page.navigate",
        Ok(json!({ "errorText": "net::ERR_NAME_NOT_RESOLVED" })),
    );

    let err = hub
        .navigate(
            &FrameId(MAIN_FRAME.into()),
            "http://nxdomain.test/",
            NavigationOptions::default(),
        )
        .await
        .expect_err("failed navigation");
    assert_eq!(err.kind, CoreErrorKind::CdpIo);
    assert!(err.to_string().contains("ERR_NAME_NOT_RESOLVED"));
    hub.shutdown().await;
}

#[tokio::test]
async fn watched_frame_detach_terminates_the_wait() {
    let channel = Arc::new(StubChannel::new());
    let hub = started_hub(&channel).await;

    emit(
        &channel,
        "Page.frameAttached",
        json!({ "frameId": "f-child", "parentFrameId": MAIN_FRAME }),
    );
    // let the attach land before watching the frame
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if hub.frame_tree().frame(&FrameId("f-child".into())).is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("child frame attached");

    let wait = {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            hub.wait_for_navigation(
                &FrameId("f-child".into()),
                NavigationOptions {
                    wait_until: vec![WaitUntil::Load],
                    timeout: Duration::from_secs(5),
                    referrer: None,
                },
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    emit(&channel, "Page.frameDetached", json!({ "frameId": "f-child" }));

    let err = tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .expect("terminates")
        .expect("task join")
        .expect_err("detach is fatal");
    assert_eq!(err.kind, CoreErrorKind::FrameDetached);
    hub.shutdown().await;
}

#[tokio::test]
async fn connection_loss_terminates_the_wait() {
    let channel = Arc::new(StubChannel::new());
    let hub = started_hub(&channel).await;

    let wait = {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            hub.wait_for_navigation(
                &FrameId(MAIN_FRAME.into()),
                NavigationOptions::default(),
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    channel.close();

    let err = tokio::time::timeout(Duration::from_secs(2), wait)
        .await
        .expect("terminates")
        .expect("task join")
        .expect_err("disconnect is fatal");
    assert_eq!(err.kind, CoreErrorKind::CdpIo);
}

#[tokio::test]
async fn navigation_timeout_is_a_typed_error() {
    let channel = Arc::new(StubChannel::new());
    let hub = started_hub(&channel).await;

    let err = hub
        .wait_for_navigation(
            &FrameId(MAIN_FRAME.into()),
            NavigationOptions {
                wait_until: vec![WaitUntil::Load],
                timeout: Duration::from_millis(40),
                referrer: None,
            },
        )
        .await
        .expect_err("times out");
    assert!(err.is_timeout());
    assert!(err.to_string().contains("waiting for navigation"));
    hub.shutdown().await;
}

#[tokio::test]
async fn lifecycle_waits_for_every_frame_in_the_subtree() {
    let channel = Arc::new(StubChannel::new());
    let hub = started_hub(&channel).await;
    let frame_id = FrameId(MAIN_FRAME.into());

    let nav = {
        let hub = Arc::clone(&hub);
        let frame_id = frame_id.clone();
        tokio::spawn(async move {
            hub.navigate(
                &frame_id,
                "http://site.test/frames",
                NavigationOptions::default(),
            )
            .await
        })
    };
    await_command(&channel, "Page.navigate").await;

    emit(
        &channel,
        "Page.lifecycleEvent",
        json!({ "frameId": MAIN_FRAME, "loaderId": "nav-2", "name": "init" }),
    );
    emit(
        &channel,
        "Page.frameNavigated",
        json!({ "frame": { "id": MAIN_FRAME, "loaderId": "nav-2", "url": "http://site.test/frames" } }),
    );
    // a child attaches and has not loaded yet
    emit(
        &channel,
        "Page.frameAttached",
        json!({ "frameId": "f-ad", "parentFrameId": MAIN_FRAME }),
    );
    emit(
        &channel,
        "Page.lifecycleEvent",
        json!({ "frameId": MAIN_FRAME, "loaderId": "nav-2", "name": "load" }),
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        !nav.is_finished(),
        "navigation must not complete while a child frame lacks the milestone"
    );

    emit(
        &channel,
        "Page.lifecycleEvent",
        json!({ "frameId": "f-ad", "loaderId": "l-ad", "name": "init" }),
    );
    emit(
        &channel,
        "Page.lifecycleEvent",
        json!({ "frameId": "f-ad", "loaderId": "l-ad", "name": "load" }),
    );

    let response = tokio::time::timeout(Duration::from_secs(2), nav)
        .await
        .expect("completes once the child reaches the milestone")
        .expect("task join")
        .expect("navigation ok");
    assert!(response.is_none(), "no navigation request was captured in this scenario");
    hub.shutdown().await;
}
