use serde_json::json;
use translib::api::GetRequest;
use translib::api::SetRequest;
use translib::config::NotificationConfig;
use translib::config::TranslibConfig;
use translib::BackendError;
use translib::Error;

use crate::common::acl_set_path;
use crate::common::admin;
use crate::common::closed;
use crate::common::json;
use crate::common::next;
use crate::common::quiet;
use crate::common::runtime;
use crate::common::subscribe;
use crate::common::ACL_ROOT;

fn set(
    path: &str,
    payload: &str,
) -> SetRequest {
    SetRequest::new(path.to_string(), payload.to_string()).with_principal(admin())
}

#[tokio::test]
async fn priming_matches_get_and_marks_the_sync_boundary() {
    let (translib, _client) = runtime(TranslibConfig::default());
    let paths: Vec<String> = ["A", "B", "C"].iter().map(|n| acl_set_path(n)).collect();
    for path in &paths {
        translib.create(set(path, r#"{"type": "ACL_IPV4"}"#)).await.unwrap();
    }

    let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    let (result, mut rx, _stop) = subscribe(&translib, &refs).await;
    assert_eq!(result.unwrap().len(), 3);

    let mut flags = Vec::new();
    for path in &paths {
        let item = next(&mut rx).await;
        assert_eq!(&item.path, path);
        let got = translib.get(GetRequest::new(path.clone())).await.unwrap();
        assert_eq!(item.payload, got.payload);
        flags.push(item.sync_complete);
    }
    assert_eq!(flags, vec![false, false, true]);
}

#[tokio::test]
async fn identical_recomputes_are_not_emitted() {
    let (translib, _client) = runtime(TranslibConfig::default());
    let path = acl_set_path("DATAACL");
    translib
        .create(set(&path, r#"{"description": "v1", "type": "ACL_IPV4"}"#))
        .await
        .unwrap();

    let (result, mut rx, _stop) = subscribe(&translib, &[path.as_str()]).await;
    result.unwrap();
    next(&mut rx).await;

    translib.update(set(&path, r#"{"description": "v1"}"#)).await.unwrap();
    quiet(&mut rx).await;

    translib.update(set(&path, r#"{"description": "v2"}"#)).await.unwrap();
    let item = next(&mut rx).await;
    assert!(item.sync_complete);
    assert_eq!(json(&item.payload)["description"], "v2");
}

#[tokio::test]
async fn root_subscription_tracks_every_set() {
    let (translib, _client) = runtime(TranslibConfig::default());

    let (result, mut rx, _stop) = subscribe(&translib, &[ACL_ROOT]).await;
    result.unwrap();
    assert_eq!(json(&next(&mut rx).await.payload), json!({"acl-sets": {"acl-set": []}}));

    translib.create(set(&acl_set_path("A"), r#"{"type": "ACL_IPV4"}"#)).await.unwrap();
    let item = next(&mut rx).await;
    assert_eq!(json(&item.payload)["acl-sets"]["acl-set"][0]["name"], "A");

    translib.delete(set(&acl_set_path("A"), "")).await.unwrap();
    let item = next(&mut rx).await;
    assert_eq!(json(&item.payload), json!({"acl-sets": {"acl-set": []}}));
}

#[tokio::test]
async fn deleted_set_streams_an_empty_payload() {
    let (translib, _client) = runtime(TranslibConfig::default());
    let path = acl_set_path("GONE");
    translib.create(set(&path, r#"{"type": "ACL_IPV4"}"#)).await.unwrap();

    let (result, mut rx, _stop) = subscribe(&translib, &[path.as_str()]).await;
    result.unwrap();
    next(&mut rx).await;

    translib.delete(set(&path, "")).await.unwrap();
    let item = next(&mut rx).await;
    assert!(item.payload.is_empty());
    assert!(!item.terminated);
}

#[tokio::test]
async fn stop_ends_the_session_and_unsubscribes() {
    let (translib, client) = runtime(TranslibConfig::default());

    let (result, mut rx, stop) = subscribe(&translib, &["/VLAN", ACL_ROOT]).await;
    result.unwrap();
    next(&mut rx).await;
    next(&mut rx).await;
    assert_eq!(client.subscription_count(), 1);

    stop.cancel();
    closed(&mut rx).await;
    assert_eq!(client.subscription_count(), 0);
    assert_eq!(translib.active_sessions(), 0);

    translib.create(set("/VLAN/Vlan5", r#"{"vlanid": "5"}"#)).await.unwrap();
}

#[tokio::test]
async fn backend_failure_terminates_only_that_session() {
    let (translib, client) = runtime(TranslibConfig::default());

    let (r1, mut broken, _s1) = subscribe(&translib, &["/VLAN"]).await;
    r1.unwrap();
    next(&mut broken).await;
    let broken_handle = client.subscription_handles()[0];

    let (r2, mut healthy, _s2) = subscribe(&translib, &["/PORT"]).await;
    r2.unwrap();
    next(&mut healthy).await;

    client.fail_subscription(broken_handle);
    let terminal = next(&mut broken).await;
    assert!(terminal.terminated);
    assert!(terminal.sync_complete);
    closed(&mut broken).await;

    translib.create(set("/PORT/Ethernet0", r#"{"mtu": "9100"}"#)).await.unwrap();
    let item = next(&mut healthy).await;
    assert!(!item.terminated);
    assert_eq!(json(&item.payload), json!({"Ethernet0": {"mtu": "9100"}}));
    assert_eq!(translib.active_sessions(), 1);
}

#[tokio::test]
async fn session_limit_comes_from_configuration() {
    let config = TranslibConfig {
        notification: NotificationConfig {
            max_sessions: 2,
            ..Default::default()
        },
        ..Default::default()
    };
    let (translib, _client) = runtime(config);

    let (a, _rx_a, _stop_a) = subscribe(&translib, &["/VLAN"]).await;
    let (b, _rx_b, stop_b) = subscribe(&translib, &["/PORT"]).await;
    a.unwrap();
    b.unwrap();

    let (c, _rx_c, _stop_c) = subscribe(&translib, &["/ACL_RULE"]).await;
    assert!(matches!(c.unwrap_err(), Error::Backend(BackendError::Subscription(_))));

    stop_b.cancel();
    while translib.active_sessions() > 1 {
        tokio::task::yield_now().await;
    }
    let (d, _rx_d, _stop_d) = subscribe(&translib, &["/ACL_RULE"]).await;
    d.unwrap();
}
