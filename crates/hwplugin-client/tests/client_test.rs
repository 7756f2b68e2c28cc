//! HTTP behaviour tests for the hardware plugin client
//!
//! Runs the real client against a wiremock server.

use hwplugin_client::{
    AuthConfig, HardwarePluginClient, HardwarePluginClientTrait, HardwarePluginError,
    NodeAllocationRequest, NodeGroup, NodeGroupData, PluginClientConfig,
};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer, auth: AuthConfig) -> HardwarePluginClient {
    HardwarePluginClient::new(PluginClientConfig {
        name: "loopback".to_string(),
        base_url: format!("{}/", server.uri()),
        auth,
        timeout: Duration::from_secs(5),
    })
    .expect("client")
}

fn sample_request() -> NodeAllocationRequest {
    NodeAllocationRequest {
        cluster_id: "cluster-1".to_string(),
        site: "site-a".to_string(),
        boot_interface_label: "bootable-interface".to_string(),
        config_transaction_id: 1,
        node_group: vec![NodeGroup {
            node_group_data: NodeGroupData {
                name: "controller".to_string(),
                role: "master".to_string(),
                hw_profile: "profile-64G".to_string(),
                resource_pool_id: "pool-1".to_string(),
                size: 1,
                ..Default::default()
            },
        }],
    }
}

#[tokio::test]
async fn test_get_missing_allocation_is_not_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hardware-manager/provisioning/v1/node-allocation-requests/nar-1"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "status": 404,
            "title": "Not Found",
            "detail": "node allocation request nar-1 not found"
        })))
        .mount(&server)
        .await;

    let client = client_for(&server, AuthConfig::None);
    let result = client.get_node_allocation_request("nar-1").await.unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn test_create_returns_job_reference_with_basic_auth() {
    let server = MockServer::start().await;
    // "admin:secret" base64-encoded
    Mock::given(method("POST"))
        .and(path("/hardware-manager/provisioning/v1/node-allocation-requests"))
        .and(header("authorization", "Basic YWRtaW46c2VjcmV0"))
        .and(body_string_contains("\"resourceGroupId\":\"pool-1\""))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!("nar-42")))
        .mount(&server)
        .await;

    let client = client_for(
        &server,
        AuthConfig::Basic {
            username: "admin".to_string(),
            password: "secret".to_string(),
        },
    );
    let id = client.create_node_allocation_request(&sample_request()).await.unwrap();
    assert_eq!(id, "nar-42");
}

#[tokio::test]
async fn test_error_carries_status_text_and_problem_detail() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hardware-manager/provisioning/v1/node-allocation-requests"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "status": 400,
            "title": "Bad Request",
            "detail": "unknown hardware profile profile-64G"
        })))
        .mount(&server)
        .await;

    let client = client_for(&server, AuthConfig::None);
    let err = client
        .create_node_allocation_request(&sample_request())
        .await
        .unwrap_err();

    match &err {
        HardwarePluginError::Api { status, message } => {
            assert_eq!(*status, 400);
            assert!(message.contains("Bad Request"), "{message}");
            assert!(message.contains("unknown hardware profile profile-64G"), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_server_error_without_problem_body_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hardware-manager/provisioning/v1/node-allocation-requests/nar-1/allocated-nodes"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = client_for(&server, AuthConfig::None);
    let err = client.get_allocated_nodes("nar-1").await.unwrap_err();
    assert!(err.to_string().contains("Service Unavailable"), "{err}");
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_oauth_token_is_fetched_once_and_reused() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=client_credentials"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "tok-1",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/hardware-manager/provisioning/api-versions"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "uriPrefix": "/hardware-manager/provisioning/v1",
            "apiVersions": [{"version": "v1"}]
        })))
        .expect(2)
        .mount(&server)
        .await;

    let client = client_for(
        &server,
        AuthConfig::OAuth {
            token_url: format!("{}/token", server.uri()),
            client_id: "o2ims".to_string(),
            client_secret: "s3cr3t".to_string(),
            scopes: vec!["hwmgr".to_string()],
        },
    );

    let versions = client.get_api_versions().await.unwrap();
    assert_eq!(versions.api_versions.len(), 1);
    client.get_api_versions().await.unwrap();
    // Mock expectations are verified when `server` is dropped
}

#[tokio::test]
async fn test_get_allocation_decodes_provisioned_condition() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hardware-manager/provisioning/v1/node-allocation-requests/nar-7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "nodeAllocationRequest": {
                "clusterId": "cluster-1",
                "site": "site-a",
                "bootInterfaceLabel": "bootable-interface",
                "configTransactionId": 1,
                "nodeGroup": []
            },
            "status": {
                "conditions": [{
                    "type": "Provisioned",
                    "status": "True",
                    "reason": "Completed",
                    "message": "Hardware provisioning completed successfully"
                }],
                "observedConfigTransactionId": 1
            }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server, AuthConfig::None);
    let response = client.get_node_allocation_request("nar-7").await.unwrap().unwrap();
    let provisioned = response.condition("Provisioned").unwrap();
    assert!(provisioned.is_true());
    assert_eq!(provisioned.reason, "Completed");
}
