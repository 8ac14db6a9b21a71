//! HTTP-level tests for the XenOrchestra REST client
//!
//! A wiremock server stands in for XenOrchestra's `/rest/v0` API.

use tokio_util::sync::CancellationToken;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_partial_json, header, method, path, path_regex, query_param},
};
use xo_client::{
    BalancerPort, BalancerTargetSpec, ConnectionError, PowerState, Protocol, Session, VM_FIELDS,
    VmQuery, XoClient, XoClientTrait, XoConfig, XoError,
};

const VM_ID: &str = "4b1e2c3d-5e6f-4a7b-8c9d-0e1f2a3b4c5d";

fn token_config(server: &MockServer) -> XoConfig {
    XoConfig::from_slice(format!("url: {}\ntoken: secret\nmaxRetries: 0\n", server.uri()).as_bytes())
        .unwrap()
}

fn lb_config(server: &MockServer) -> XoConfig {
    XoConfig::from_slice(
        format!(
            "url: {}\ntoken: secret\nloadBalancer:\n  template: tpl-lb\n  pool: pool-lb\n  network: net-1\n",
            server.uri()
        )
        .as_bytes(),
    )
    .unwrap()
}

fn vm_json() -> serde_json::Value {
    serde_json::json!({
        "id": VM_ID,
        "uuid": VM_ID,
        "name_label": "worker-1",
        "power_state": "Running",
        "addresses": {
            "0/ipv4/0": "203.0.113.20",
            "1/ipv4/0": "10.0.0.20"
        },
        "$pool": "pool-1",
        "$container": "host-7",
        "other": { "base_template_name": "Ubuntu Noble 24.04" },
        "tags": ["k8s"]
    })
}

#[tokio::test]
async fn test_validate_sends_token_cookie() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v0/pools"))
        .and(header("cookie", "authenticationToken=secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let session = Session::connect(&token_config(&server), CancellationToken::new())
        .await
        .unwrap();
    assert!(session.base_url().starts_with("http://"));
}

#[tokio::test]
async fn test_validate_uses_basic_auth_without_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v0/pools"))
        .and(header("authorization", "Basic YWRtaW46c2VjcmV0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let config = XoConfig::from_slice(
        format!("url: {}\nusername: admin\npassword: secret\n", server.uri()).as_bytes(),
    )
    .unwrap();
    XoClient::new(&config).unwrap().validate().await.unwrap();
}

#[tokio::test]
async fn test_connect_with_rejected_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v0/pools"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid credentials"))
        .mount(&server)
        .await;

    let err = Session::connect(&token_config(&server), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::Auth(_)));
}

#[tokio::test]
async fn test_connect_without_rest_api() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v0/pools"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = Session::connect(&token_config(&server), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::Unsupported(_)));
}

#[tokio::test]
async fn test_connect_to_unreachable_endpoint() {
    // Nothing listens on the discard port
    let config = XoConfig::from_slice(b"url: http://127.0.0.1:9\ntoken: secret\nrequestTimeoutSeconds: 2\n").unwrap();
    let err = Session::connect(&config, CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ConnectionError::Network(_)));
}

#[tokio::test]
async fn test_get_vm_maps_fields() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/rest/v0/vms/{}", VM_ID)))
        .respond_with(ResponseTemplate::new(200).set_body_json(vm_json()))
        .mount(&server)
        .await;

    let client = XoClient::new(&token_config(&server)).unwrap();
    let vm = client.get_vm(VM_ID).await.unwrap();

    assert_eq!(vm.id, VM_ID);
    assert_eq!(vm.power_state, PowerState::Running);
    assert_eq!(vm.pool_id, "pool-1");
    assert_eq!(vm.host_id.as_deref(), Some("host-7"));
    assert_eq!(vm.template.as_deref(), Some("Ubuntu Noble 24.04"));
    let addresses: Vec<String> = vm.ordered_addresses().iter().map(|a| a.ip.to_string()).collect();
    assert_eq!(addresses, vec!["10.0.0.20", "203.0.113.20"]);
}

#[tokio::test]
async fn test_get_missing_vm_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/rest/v0/vms/{}", VM_ID)))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such object"))
        .mount(&server)
        .await;

    let client = XoClient::new(&token_config(&server)).unwrap();
    assert!(client.get_vm(VM_ID).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_query_vms_sends_fields_and_filter() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v0/vms"))
        .and(query_param("fields", VM_FIELDS))
        .and(query_param("filter", "name_label:\"worker-1\" $pool:\"pool-1\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([vm_json()])))
        .expect(1)
        .mount(&server)
        .await;

    let client = XoClient::new(&token_config(&server)).unwrap();
    let query = VmQuery {
        name: Some("worker-1".to_string()),
        pool: Some("pool-1".to_string()),
        tag: None,
    };
    let vms = client.query_vms(&query).await.unwrap();
    assert_eq!(vms.len(), 1);
    assert_eq!(vms[0].name, "worker-1");
}

#[tokio::test]
async fn test_find_vm_by_name_keeps_exact_match_only() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v0/pools"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
        .mount(&server)
        .await;
    let mut near = vm_json();
    near["id"] = serde_json::json!("4b1e2c3d-5e6f-4a7b-8c9d-0e1f2a3b4c10");
    near["uuid"] = serde_json::json!("4b1e2c3d-5e6f-4a7b-8c9d-0e1f2a3b4c10");
    near["name_label"] = serde_json::json!("worker-10");
    Mock::given(method("GET"))
        .and(path("/rest/v0/vms"))
        .and(query_param("filter", "name_label:\"worker-1\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([vm_json(), near])))
        .expect(1)
        .mount(&server)
        .await;

    let session = Session::connect(&token_config(&server), CancellationToken::new())
        .await
        .unwrap();
    let vm = session.find_vm("worker-1").await.unwrap();
    assert_eq!(vm.id, VM_ID);
    assert_eq!(vm.name, "worker-1");
}

#[tokio::test]
async fn test_server_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v0/vms"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = XoClient::new(&token_config(&server)).unwrap();
    assert!(client.query_vms(&VmQuery::default()).await.unwrap_err().is_transient());
}

#[tokio::test]
async fn test_garbage_body_is_serialization_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v0/vms"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
        .mount(&server)
        .await;

    let client = XoClient::new(&token_config(&server)).unwrap();
    assert!(matches!(
        client.query_vms(&VmQuery::default()).await,
        Err(XoError::Serialization(_))
    ));
}

fn spec() -> BalancerTargetSpec {
    BalancerTargetSpec {
        name: "k8s-lb-a1234".to_string(),
        service_uid: "1234".to_string(),
        ports: [BalancerPort {
            protocol: Protocol::Tcp,
            port: 443,
            node_port: 30443,
        }]
        .into_iter()
        .collect(),
        backends: [VM_ID.to_string()].into_iter().collect(),
    }
}

#[tokio::test]
async fn test_create_balancer_vm_creates_and_tags() {
    let server = MockServer::start().await;
    let new_id = "9a8b7c6d-0000-4000-8000-00000000beef";

    Mock::given(method("POST"))
        .and(path("/rest/v0/pools/pool-lb/actions/create_vm"))
        .and(query_param("sync", "true"))
        .and(body_partial_json(serde_json::json!({
            "name_label": "k8s-lb-a1234",
            "template": "tpl-lb",
            "vifs": [{ "network": "net-1" }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!(new_id)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex(format!("^/rest/v0/vms/{}/tags/.+$", new_id)))
        .respond_with(ResponseTemplate::new(204))
        .expect(3)
        .mount(&server)
        .await;

    let client = XoClient::new(&lb_config(&server)).unwrap();
    let id = client.create_balancer_vm(&spec()).await.unwrap();
    assert_eq!(id, new_id);
}

#[tokio::test]
async fn test_create_without_template_is_provisioning_error() {
    let server = MockServer::start().await;
    let client = XoClient::new(&token_config(&server)).unwrap();
    assert!(matches!(
        client.create_balancer_vm(&spec()).await,
        Err(XoError::Provisioning(_))
    ));
}

#[tokio::test]
async fn test_create_out_of_space_is_provisioning_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v0/pools/pool-lb/actions/create_vm"))
        .respond_with(ResponseTemplate::new(507).set_body_string("SR_BACKEND_FAILURE_44"))
        .mount(&server)
        .await;

    let client = XoClient::new(&lb_config(&server)).unwrap();
    assert!(matches!(
        client.create_balancer_vm(&spec()).await,
        Err(XoError::Provisioning(_))
    ));
}

#[tokio::test]
async fn test_tag_paths_are_encoded() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path(format!("/rest/v0/vms/{}/tags/xo-ccm%2Fbackend%3Dvm-2", VM_ID)))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = XoClient::new(&token_config(&server)).unwrap();
    client.remove_vm_tag(VM_ID, "xo-ccm/backend=vm-2").await.unwrap();
}
