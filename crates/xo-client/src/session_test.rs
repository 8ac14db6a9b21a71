//! Unit tests for the session manager

#[cfg(test)]
mod tests {
    use crate::balancer::{BalancerPort, BalancerTargetSpec, Protocol};
    use crate::error::{ConnectionError, XoError};
    use crate::mock::{MockXoClient, VmBuilder, ops};
    use crate::models::PowerState;
    use crate::session::{ConnectionState, ReconnectPolicy, Session, SessionSettings};
    use futures::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const UUID_A: &str = "0b3d4a8e-1111-4c1c-9d7a-4f0e0d7c000a";
    const UUID_B: &str = "0b3d4a8e-1111-4c1c-9d7a-4f0e0d7c000b";

    fn settings() -> SessionSettings {
        SessionSettings {
            request_timeout: Duration::from_secs(2),
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            reconnect_policy: ReconnectPolicy::FailFast,
        }
    }

    async fn connected(mock: &MockXoClient, settings: SessionSettings) -> Session {
        let session = Session::new(Arc::new(mock.clone()), settings, CancellationToken::new());
        session.establish().await.expect("mock accepts any credentials");
        session
    }

    fn lb_spec(backends: &[&str]) -> BalancerTargetSpec {
        BalancerTargetSpec {
            name: "k8s-lb-a1234".to_string(),
            service_uid: "1234".to_string(),
            ports: [BalancerPort {
                protocol: Protocol::Tcp,
                port: 80,
                node_port: 30080,
            }]
            .into_iter()
            .collect(),
            backends: backends.iter().map(|b| b.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_establish_reaches_connected() {
        let mock = MockXoClient::new("http://xo.test");
        let session = Session::new(Arc::new(mock.clone()), settings(), CancellationToken::new());
        assert_eq!(session.state(), ConnectionState::Disconnected);

        session.establish().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(mock.call_count(ops::VALIDATE), 1);
    }

    #[tokio::test]
    async fn test_establish_rejects_bad_credentials() {
        let mock = MockXoClient::new("http://xo.test");
        mock.fail_next(ops::VALIDATE, XoError::Authentication("401 Unauthorized".into()));
        let session = Session::new(Arc::new(mock.clone()), settings(), CancellationToken::new());

        let err = session.establish().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Auth(_)));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_establish_reports_unsupported_api() {
        let mock = MockXoClient::new("http://xo.test");
        mock.fail_next(ops::VALIDATE, XoError::Unsupported("no /rest/v0".into()));
        let session = Session::new(Arc::new(mock.clone()), settings(), CancellationToken::new());

        assert!(matches!(
            session.establish().await,
            Err(ConnectionError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_find_vm_by_uuid_survives_rename() {
        let mock = MockXoClient::new("http://xo.test");
        mock.add_vm(VmBuilder::new(UUID_A, "worker-1").build());
        let session = connected(&mock, settings()).await;

        mock.add_vm(VmBuilder::new(UUID_A, "worker-1-renamed").build());
        let vm = session.find_vm(UUID_A).await.unwrap();
        assert_eq!(vm.id, UUID_A);
        assert_eq!(vm.name, "worker-1-renamed");
        assert_eq!(mock.call_count(ops::QUERY_VMS), 0, "UUID lookups never query by name");
    }

    #[tokio::test]
    async fn test_missing_uuid_is_not_found_without_name_fallback() {
        let mock = MockXoClient::new("http://xo.test");
        // A VM whose *name* happens to be the UUID we look up
        mock.add_vm(VmBuilder::new(UUID_B, UUID_A).build());
        let session = connected(&mock, settings()).await;

        let err = session.find_vm(UUID_A).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_find_vm_by_name() {
        let mock = MockXoClient::new("http://xo.test");
        mock.add_vm(VmBuilder::new(UUID_A, "worker-1").build());
        mock.add_vm(VmBuilder::new(UUID_B, "dup").build());
        mock.add_vm(VmBuilder::new("0b3d4a8e-1111-4c1c-9d7a-4f0e0d7c000c", "dup").build());
        let session = connected(&mock, settings()).await;

        assert_eq!(session.find_vm("worker-1").await.unwrap().id, UUID_A);
        assert!(session.find_vm("nope").await.unwrap_err().is_not_found());
        assert!(matches!(
            session.find_vm("dup").await,
            Err(XoError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_find_vm_ignores_names_containing_the_identifier() {
        let mock = MockXoClient::new("http://xo.test");
        mock.add_vm(VmBuilder::new(UUID_A, "worker-1").build());
        mock.add_vm(VmBuilder::new(UUID_B, "worker-10").build());
        mock.add_vm(VmBuilder::new("0b3d4a8e-1111-4c1c-9d7a-4f0e0d7c000c", "Worker-1-old").build());
        let session = connected(&mock, settings()).await;

        assert_eq!(session.find_vm("worker-1").await.unwrap().id, UUID_A);
        assert!(session.find_vm("worker").await.unwrap_err().is_not_found());
        assert!(session.find_balancer_target("worker-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let mock = MockXoClient::new("http://xo.test");
        mock.add_vm(VmBuilder::new(UUID_A, "worker-1").build());
        let session = connected(&mock, settings()).await;

        mock.fail_next(ops::GET_VM, XoError::Transient("502 Bad Gateway".into()));
        mock.fail_next(ops::GET_VM, XoError::Transient("502 Bad Gateway".into()));

        let vm = session.find_vm(UUID_A).await.unwrap();
        assert_eq!(vm.id, UUID_A);
        assert_eq!(mock.call_count(ops::GET_VM), 3);
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_non_transient_errors_are_not_retried() {
        let mock = MockXoClient::new("http://xo.test");
        mock.add_vm(VmBuilder::new(UUID_A, "worker-1").build());
        let session = connected(&mock, settings()).await;

        mock.fail_next(ops::GET_VM, XoError::Authentication("token expired".into()));
        let err = session.find_vm(UUID_A).await.unwrap_err();
        assert!(matches!(err, XoError::Authentication(_)));
        assert_eq!(mock.call_count(ops::GET_VM), 1);

        mock.fail_next(ops::GET_VM, XoError::InvalidRequest("bad field".into()));
        assert!(matches!(
            session.find_vm(UUID_A).await,
            Err(XoError::InvalidRequest(_))
        ));
        assert_eq!(mock.call_count(ops::GET_VM), 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let mock = MockXoClient::new("http://xo.test");
        let session = connected(&mock, SessionSettings {
            max_retries: 2,
            ..settings()
        })
        .await;

        mock.set_unreachable(true);
        let err = session.find_vm(UUID_A).await.unwrap_err();
        assert!(err.is_transient());

        // 1 initial attempt + 2 retries, each either the call or the reconnect
        let attempts = mock.call_count(ops::GET_VM) + mock.call_count(ops::VALIDATE) - 1;
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_timeout_surfaces_as_transient() {
        let mock = MockXoClient::new("http://xo.test");
        mock.add_vm(VmBuilder::new(UUID_A, "worker-1").build());
        let session = connected(&mock, SessionSettings {
            request_timeout: Duration::from_millis(50),
            max_retries: 0,
            ..settings()
        })
        .await;

        mock.delay_next(ops::GET_VM, Duration::from_millis(500));
        let err = session.find_vm(UUID_A).await.unwrap_err();
        assert!(err.is_transient(), "expected transient, got {:?}", err);
        assert_eq!(session.state(), ConnectionState::Degraded);

        // The next call reconnects transparently
        assert_eq!(session.find_vm(UUID_A).await.unwrap().id, UUID_A);
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(mock.call_count(ops::VALIDATE), 2);
    }

    #[tokio::test]
    async fn test_closed_session_issues_no_calls() {
        let mock = MockXoClient::new("http://xo.test");
        mock.add_vm(VmBuilder::new(UUID_A, "worker-1").build());
        let session = connected(&mock, settings()).await;

        session.close();
        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(matches!(session.find_vm(UUID_A).await, Err(XoError::Cancelled)));
        assert_eq!(mock.call_count(ops::GET_VM), 0);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let mock = MockXoClient::new("http://xo.test");
        let cancel = CancellationToken::new();
        let session = Arc::new(Session::new(
            Arc::new(mock.clone()),
            SessionSettings {
                initial_backoff: Duration::from_secs(60),
                max_backoff: Duration::from_secs(60),
                ..settings()
            },
            cancel.clone(),
        ));
        session.establish().await.unwrap();
        mock.set_unreachable(true);

        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.find_vm(UUID_A).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("call must return promptly after cancellation")
            .unwrap();
        assert!(matches!(result, Err(XoError::Cancelled)));
    }

    async fn degraded_session(mock: &MockXoClient, policy: ReconnectPolicy) -> Arc<Session> {
        let session = connected(mock, SessionSettings {
            max_retries: 0,
            reconnect_policy: policy,
            ..settings()
        })
        .await;
        mock.fail_next(ops::GET_VM, XoError::Transient("connection reset".into()));
        assert!(session.find_vm(UUID_A).await.is_err());
        assert_eq!(session.state(), ConnectionState::Degraded);
        Arc::new(session)
    }

    #[tokio::test]
    async fn test_fail_fast_during_reconnect() {
        let mock = MockXoClient::new("http://xo.test");
        mock.add_vm(VmBuilder::new(UUID_A, "worker-1").build());
        let session = degraded_session(&mock, ReconnectPolicy::FailFast).await;

        mock.delay_next(ops::VALIDATE, Duration::from_millis(300));
        let reconnecting = {
            let session = session.clone();
            tokio::spawn(async move { session.find_vm(UUID_A).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.state(), ConnectionState::Authenticating);

        let err = session.find_vm(UUID_A).await.unwrap_err();
        assert!(err.is_transient());

        assert!(reconnecting.await.unwrap().is_ok());
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_block_waits_for_reconnect() {
        let mock = MockXoClient::new("http://xo.test");
        mock.add_vm(VmBuilder::new(UUID_A, "worker-1").build());
        let session = degraded_session(&mock, ReconnectPolicy::Block).await;

        mock.delay_next(ops::VALIDATE, Duration::from_millis(200));
        let reconnecting = {
            let session = session.clone();
            tokio::spawn(async move { session.find_vm(UUID_A).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(session.find_vm(UUID_A).await.is_ok());
        assert!(reconnecting.await.unwrap().is_ok());
        assert_eq!(mock.call_count(ops::VALIDATE), 2, "only one reconnection");
    }

    #[tokio::test]
    async fn test_list_vms_is_lazy_and_restartable() {
        let mock = MockXoClient::new("http://xo.test");
        mock.add_vm(VmBuilder::new(UUID_A, "worker-1").build());
        mock.add_vm(VmBuilder::new(UUID_B, "worker-2").build());
        mock.add_vm(
            VmBuilder::new("0b3d4a8e-1111-4c1c-9d7a-4f0e0d7c000c", "other")
                .pool("pool-2")
                .build(),
        );
        let session = connected(&mock, settings()).await;

        let sweep = session.list_vms(Some("pool-1"));
        assert_eq!(mock.call_count(ops::QUERY_VMS), 0);
        let first: Vec<_> = sweep.collect().await;
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|vm| vm.as_ref().unwrap().pool_id == "pool-1"));

        let all: Vec<_> = session.list_vms(None).collect().await;
        assert_eq!(all.len(), 3);
        assert_eq!(mock.call_count(ops::QUERY_VMS), 2);
    }

    #[tokio::test]
    async fn test_list_vms_yields_errors() {
        let mock = MockXoClient::new("http://xo.test");
        let session = connected(&mock, settings()).await;
        mock.fail_next(ops::QUERY_VMS, XoError::Authentication("expired".into()));

        let items: Vec<_> = session.list_vms(None).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(XoError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_create_balancer_target_is_idempotent() {
        let mock = MockXoClient::new("http://xo.test");
        let session = connected(&mock, settings()).await;
        let spec = lb_spec(&["uuid-B", "uuid-C"]);

        let first = session.create_or_update_balancer_target(&spec).await.unwrap();
        assert_eq!(first.power_state, PowerState::Running);
        assert_eq!(first.backends, spec.backends);
        assert!(!first.ingress.is_empty());
        let mutations = mock.mutation_count();

        let second = session.create_or_update_balancer_target(&spec).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(mock.mutation_count(), mutations, "no mutation on converged target");
        assert_eq!(mock.create_count(), 1);
    }

    #[tokio::test]
    async fn test_update_keeps_target_identity() {
        let mock = MockXoClient::new("http://xo.test");
        let session = connected(&mock, settings()).await;

        let first = session
            .create_or_update_balancer_target(&lb_spec(&["uuid-B", "uuid-C"]))
            .await
            .unwrap();
        let before = mock.mutation_count();

        let updated = session
            .create_or_update_balancer_target(&lb_spec(&["uuid-C"]))
            .await
            .unwrap();
        assert_eq!(updated.id, first.id);
        assert_eq!(updated.backends.iter().collect::<Vec<_>>(), vec!["uuid-C"]);
        assert_eq!(mock.mutation_count(), before + 1, "only the stale backend tag is removed");
    }

    #[tokio::test]
    async fn test_timed_out_create_is_not_duplicated() {
        let mock = MockXoClient::new("http://xo.test");
        let session = connected(&mock, SessionSettings {
            request_timeout: Duration::from_millis(100),
            max_retries: 0,
            ..settings()
        })
        .await;
        let spec = lb_spec(&["uuid-B"]);

        mock.delay_next(ops::CREATE_BALANCER_VM, Duration::from_millis(500));
        let err = session.create_or_update_balancer_target(&spec).await.unwrap_err();
        assert!(err.is_transient());

        let target = session.create_or_update_balancer_target(&spec).await.unwrap();
        assert_eq!(mock.create_count(), 1);
        assert_eq!(target.power_state, PowerState::Running);
    }

    #[tokio::test]
    async fn test_target_owned_by_other_service_conflicts() {
        let mock = MockXoClient::new("http://xo.test");
        let session = connected(&mock, settings()).await;
        mock.add_vm(
            VmBuilder::new(UUID_A, "k8s-lb-a1234")
                .tag("xo-ccm/service=other")
                .build(),
        );

        assert!(matches!(
            session.create_or_update_balancer_target(&lb_spec(&[])).await,
            Err(XoError::Conflict(_))
        ));
        assert_eq!(mock.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_paused_target_conflicts_without_start() {
        let mock = MockXoClient::new("http://xo.test");
        let session = connected(&mock, settings()).await;
        let spec = lb_spec(&["uuid-B"]);
        let target = session.create_or_update_balancer_target(&spec).await.unwrap();
        mock.set_power_state(&target.id, PowerState::Paused);
        let before = mock.mutation_count();

        assert!(matches!(
            session.create_or_update_balancer_target(&spec).await,
            Err(XoError::Conflict(_))
        ));
        assert_eq!(mock.mutation_count(), before);
        assert_eq!(mock.call_count(ops::START_VM), 1, "only the initial start");
    }

    #[tokio::test]
    async fn test_delete_absent_target_succeeds() {
        let mock = MockXoClient::new("http://xo.test");
        let session = connected(&mock, settings()).await;

        let target = session
            .create_or_update_balancer_target(&lb_spec(&["uuid-B"]))
            .await
            .unwrap();
        session.delete_balancer_target(&target.id).await.unwrap();
        assert!(mock.vm(&target.id).is_none());

        session.delete_balancer_target(&target.id).await.unwrap();
        assert!(session.find_balancer_target("k8s-lb-a1234").await.unwrap().is_none());
    }
}
