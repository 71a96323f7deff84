use serde_json::json;
use translib::api::BulkItem;
use translib::api::BulkRequest;
use translib::api::GetRequest;
use translib::api::ItemStatus;
use translib::api::SetRequest;
use translib::auth::Principal;
use translib::config::AuthConfig;
use translib::config::TranslibConfig;
use translib::handler::Verb;
use translib::store::StoreIndex;
use translib::store::Table;
use translib::AppError;
use translib::Error;
use translib::ErrorSource;

use crate::common::acl_set_path;
use crate::common::admin;
use crate::common::json;
use crate::common::runtime;
use crate::common::ACL_TABLE;

#[tokio::test]
async fn failing_create_rolls_back_two_deletes() {
    let (translib, client) = runtime(TranslibConfig::default());
    for name in ["A", "B", "C"] {
        translib
            .create(SetRequest::new(acl_set_path(name), r#"{"type": "ACL_IPV4"}"#).with_principal(admin()))
            .await
            .unwrap();
    }
    let before = client.dump_table(StoreIndex::ConfigDb, &Table::new(ACL_TABLE));

    let err = translib
        .bulk(BulkRequest {
            delete: vec![BulkItem::new(acl_set_path("A"), ""), BulkItem::new(acl_set_path("B"), "")],
            create: vec![BulkItem::new(acl_set_path("C"), r#"{"type": "MIRROR"}"#)],
            principal: admin(),
            ..Default::default()
        })
        .await
        .unwrap_err();

    assert!(matches!(err.error, Error::App(AppError::AlreadyExists(_))));
    assert_eq!(err.response.delete[0].status, ItemStatus::Ok);
    assert_eq!(err.response.delete[1].status, ItemStatus::Ok);
    let (verb, slot) = err.response.failed().unwrap();
    assert_eq!(verb, Verb::Create);
    match &slot.status {
        ItemStatus::Failed(e) => {
            assert_eq!(e.source, ErrorSource::App);
            assert!(e.message.contains("acl-set C"));
        }
        other => panic!("unexpected status {other:?}"),
    }

    assert_eq!(client.dump_table(StoreIndex::ConfigDb, &Table::new(ACL_TABLE)), before);
}

#[tokio::test]
async fn one_batch_spans_several_handlers() {
    let (translib, client) = runtime(TranslibConfig::default());

    let response = translib
        .bulk(BulkRequest {
            replace: vec![BulkItem::new("/VLAN/Vlan100", r#"{"vlanid": "100"}"#)],
            update: vec![BulkItem::new(acl_set_path("EDGE"), r#"{"description": "edge"}"#)],
            create: vec![BulkItem::new("/VLAN_MEMBER/Vlan100|Ethernet0", r#"{"tagging_mode": "untagged"}"#)],
            principal: admin(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(response.is_ok());
    assert_eq!(client.committed_transactions(), 1);

    let member = translib
        .get(GetRequest::new("/VLAN_MEMBER/Vlan100|Ethernet0"))
        .await
        .unwrap();
    assert_eq!(json(&member.payload), json!({"tagging_mode": "untagged"}));
    let acl = translib.get(GetRequest::new(acl_set_path("EDGE"))).await.unwrap();
    assert_eq!(json(&acl.payload)["description"], "edge");
}

#[tokio::test]
async fn bulk_needs_a_write_role_once() {
    let config = TranslibConfig {
        auth: AuthConfig {
            enabled: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let (translib, client) = runtime(config);

    let err = translib
        .bulk(BulkRequest {
            create: vec![BulkItem::new("/VLAN/Vlan1", r#"{"vlanid": "1"}"#)],
            principal: Principal::new("viewer", ["read-only"]),
            ..Default::default()
        })
        .await
        .unwrap_err();

    assert!(matches!(err.error, Error::App(AppError::Unauthorized { .. })));
    assert_eq!(err.response.create[0].status, ItemStatus::NotAttempted);
    assert!(client.dump_table(StoreIndex::ConfigDb, &Table::new("VLAN")).is_empty());
}
