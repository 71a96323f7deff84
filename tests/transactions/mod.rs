use std::sync::Arc;

use futures::future::join_all;
use serde_json::json;
use translib::api::GetRequest;
use translib::api::SetRequest;
use translib::auth::Principal;
use translib::config::AuthConfig;
use translib::config::TranslibConfig;
use translib::store::MemStoreClient;
use translib::store::StoreIndex;
use translib::store::Table;
use translib::AppError;
use translib::Error;
use translib::ErrorSource;
use translib::ProtocolError;
use translib::TranslibBuilder;

use crate::common::acl_set_path;
use crate::common::admin;
use crate::common::json;
use crate::common::runtime;
use crate::common::AclApp;
use crate::common::ACL_ROOT;
use crate::common::ACL_TABLE;

fn set(
    path: &str,
    payload: &str,
) -> SetRequest {
    SetRequest::new(path.to_string(), payload.to_string()).with_principal(admin())
}

#[tokio::test]
async fn schema_handler_round_trips_through_the_store() {
    let (translib, client) = runtime(TranslibConfig::default());

    translib
        .create(set(&acl_set_path("DATAACL"), r#"{"description": "data plane", "type": "ACL_IPV4"}"#))
        .await
        .unwrap();

    let rows = client.dump_table(StoreIndex::ConfigDb, &Table::new(ACL_TABLE));
    assert_eq!(rows.len(), 1);

    let got = translib.get(GetRequest::new(acl_set_path("DATAACL"))).await.unwrap();
    assert_eq!(
        json(&got.payload),
        json!({"name": "DATAACL", "description": "data plane", "type": "ACL_IPV4"})
    );

    let root = translib.get(GetRequest::new(ACL_ROOT)).await.unwrap();
    assert_eq!(json(&root.payload)["acl-sets"]["acl-set"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn longest_prefix_wins_over_the_catch_all() {
    let (translib, _client) = runtime(TranslibConfig::default());

    for _ in 0..20 {
        let info = translib.registry().resolve(&acl_set_path("X")).unwrap();
        assert_eq!(info.handler_type, "acl");
    }
    assert_eq!(translib.registry().resolve("/VLAN/Vlan10").unwrap().handler_type, "table");
}

#[tokio::test]
async fn failed_create_leaves_the_table_untouched() {
    let (translib, client) = runtime(TranslibConfig::default());
    translib
        .create(set(&acl_set_path("EVERFLOW"), r#"{"type": "MIRROR"}"#))
        .await
        .unwrap();
    let before = client.dump_table(StoreIndex::ConfigDb, &Table::new(ACL_TABLE));

    let err = translib
        .create(set(&acl_set_path("EVERFLOW"), r#"{"type": "ACL_IPV4"}"#))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::App(AppError::AlreadyExists(_))));
    assert_eq!(err.error_source(), ErrorSource::App);
    assert_eq!(client.dump_table(StoreIndex::ConfigDb, &Table::new(ACL_TABLE)), before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disjoint_creates_are_serialized() {
    let (translib, client) = runtime(TranslibConfig::default());

    let writers = (0..24).map(|i| {
        let translib = translib.clone();
        tokio::spawn(async move {
            if i % 2 == 0 {
                translib.create(set(&acl_set_path(&format!("ACL{i}")), r#"{"type": "ACL_IPV4"}"#)).await
            } else {
                translib.create(set(&format!("/VLAN/Vlan{i}"), r#"{"vlanid": "1"}"#)).await
            }
        })
    });
    for result in join_all(writers).await {
        result.unwrap().unwrap();
    }

    assert_eq!(client.max_concurrent_transactions(), 1);
    assert_eq!(client.dump_table(StoreIndex::ConfigDb, &Table::new(ACL_TABLE)).len(), 12);
    assert_eq!(client.dump_table(StoreIndex::ConfigDb, &Table::new("VLAN")).len(), 12);
}

#[tokio::test]
async fn writes_require_a_write_role_when_auth_is_enabled() {
    let config = TranslibConfig {
        auth: AuthConfig {
            enabled: true,
            write_roles: vec!["netadmin".to_string()],
        },
        ..Default::default()
    };
    let (translib, client) = runtime(config);

    let operator = Principal::new("oper", ["operator"]);
    let err = translib
        .create(SetRequest::new("/VLAN/Vlan10", r#"{"vlanid": "10"}"#).with_principal(operator.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::App(AppError::Unauthorized { .. })));
    assert!(client.dump_table(StoreIndex::ConfigDb, &Table::new("VLAN")).is_empty());

    let netadmin = Principal::new("alice", ["netadmin"]);
    translib
        .create(SetRequest::new("/VLAN/Vlan10", r#"{"vlanid": "10"}"#).with_principal(netadmin))
        .await
        .unwrap();

    // Reads stay open to every principal
    translib
        .get(GetRequest::new("/VLAN/Vlan10").with_principal(operator))
        .await
        .unwrap();
}

#[tokio::test]
async fn actions_run_on_read_only_connections() {
    let (translib, _client) = runtime(TranslibConfig::default());
    for name in ["A", "B"] {
        translib.create(set(&acl_set_path(name), r#"{"type": "ACL_IPV4"}"#)).await.unwrap();
    }

    let response = translib.action(set(&format!("{ACL_ROOT}/count"), "{}")).await.unwrap();
    assert_eq!(json(&response.payload), json!({"count": 2}));

    let err = translib.action(set(&format!("{ACL_ROOT}/reset"), "{}")).await.unwrap_err();
    assert!(matches!(err, Error::App(AppError::NotSupported(_))));
}

#[tokio::test]
async fn unroutable_paths_are_protocol_errors() {
    let translib = TranslibBuilder::from_config(TranslibConfig::default())
        .store_client(Arc::new(MemStoreClient::new()))
        .handler(AclApp::info(), AclApp::factory)
        .unwrap()
        .build();

    let err = translib.get(GetRequest::new("/VLAN")).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(ProtocolError::NoHandlerForPath { .. })));

    let err = translib.get(GetRequest::new("VLAN")).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(ProtocolError::InvalidPath { .. })));
    assert_eq!(err.error_source(), ErrorSource::Protocol);
}

#[tokio::test]
async fn unreachable_store_is_a_backend_error() {
    let (translib, client) = runtime(TranslibConfig::default());
    client.set_reachable(false);

    let err = translib.create(set("/VLAN/Vlan10", r#"{"vlanid": "10"}"#)).await.unwrap_err();
    assert_eq!(err.error_source(), ErrorSource::Backend);

    client.set_reachable(true);
    translib.create(set("/VLAN/Vlan10", r#"{"vlanid": "10"}"#)).await.unwrap();
}

#[tokio::test]
async fn registered_models_are_listed() {
    let (translib, _client) = runtime(TranslibConfig::default());
    let models = translib.models();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].name, "openconfig-acl");
}
