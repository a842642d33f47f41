//! End-to-end tests against a live cluster running the manager.
//!
//! Expect a deployment configured with a rule matching `ci-e2e-*`
//! (ttl 2m, settling period 30s) before running with
//! `cargo test --features e2e-tests`.

#[cfg(all(test, feature = "e2e-tests"))]
mod test {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use k8s_openapi::api::core::v1::Namespace;
    use kube::api::{Api, ObjectMeta, PostParams};
    use kube::client::Client;
    use kube::runtime::wait::{await_condition, Condition};
    use ns_manager::record::{
        FAILING_RESOURCES_ANNOTATION, STATUS_ANNOTATION, STATUS_SINCE_ANNOTATION,
    };
    use tokio::time::timeout;

    fn has_status(expected: &'static str) -> impl Condition<Namespace> {
        move |obj: Option<&Namespace>| {
            obj.and_then(|ns| ns.metadata.annotations.as_ref())
                .and_then(|annotations| annotations.get(STATUS_ANNOTATION))
                .is_some_and(|status| status == expected)
        }
    }

    fn is_gone() -> impl Condition<Namespace> {
        |obj: Option<&Namespace>| obj.is_none()
    }

    async fn wait_for<C: Condition<Namespace>>(
        api: Api<Namespace>,
        name: &str,
        condition: C,
        budget: Duration,
    ) {
        timeout(budget, await_condition(api, name, condition))
            .await
            .expect("condition not met in time")
            .expect("watch failed");
    }

    async fn create_namespace(client: Client, name: &str) -> Api<Namespace> {
        let api: Api<Namespace> = Api::all(client);
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(
                    "cicd.skao.int/author".to_string(),
                    "e2e-bot".to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        };
        api.create(&PostParams::default(), &namespace).await.unwrap();
        api
    }

    #[tokio::test]
    async fn healthy_namespace_is_classified_ok() {
        let client = Client::try_default().await.unwrap();
        let api = create_namespace(client, "ci-e2e-healthy").await;

        wait_for(
            api.clone(),
            "ci-e2e-healthy",
            has_status("OK"),
            Duration::from_secs(60),
        )
        .await;

        let ns = api.get("ci-e2e-healthy").await.unwrap();
        let annotations = ns.metadata.annotations.unwrap();
        assert!(annotations.contains_key(STATUS_SINCE_ANNOTATION));
        assert!(
            !annotations.contains_key(FAILING_RESOURCES_ANNOTATION),
            "healthy namespaces carry no failing-resources annotation"
        );

        api.delete("ci-e2e-healthy", &Default::default()).await.unwrap();
    }

    #[tokio::test]
    async fn expired_namespace_is_marked_stale_and_evicted() {
        let client = Client::try_default().await.unwrap();
        let api = create_namespace(client, "ci-e2e-expiring").await;

        // the e2e rule sets ttl to 2m; eviction follows on the next
        // action pass after the STALE mark
        wait_for(
            api.clone(),
            "ci-e2e-expiring",
            has_status("STALE"),
            Duration::from_secs(4 * 60),
        )
        .await;
        wait_for(
            api.clone(),
            "ci-e2e-expiring",
            is_gone(),
            Duration::from_secs(8 * 60),
        )
        .await;
    }
}
