//! Unit tests for the Parameter Renderer

#[cfg(test)]
mod tests {
    use crate::reconciler::parse_yaml_map;
    use crate::reconciler::render::*;
    use crate::reconciler::template::{
        DEFAULT_CONFIGURATION_TIMEOUT, DEFAULT_INSTALLATION_TIMEOUT, TemplateConfig,
    };
    use crate::store::memory::InMemoryStore;
    use crate::store::{ClusterInstanceDoc, ProvisioningStore};
    use crate::test_utils::*;
    use crds::{
        CLUSTER_INSTANCE_DEFAULTS_KEY, ConditionStatus, ConditionType, ProvisioningRequestStatus,
        find_condition,
    };
    use hwplugin_client::MockHardwarePluginClient;
    use serde_json::{Value, json};
    use std::sync::Arc;

    fn defaults() -> Value {
        parse_yaml_map(&create_test_defaults_config("default"), CLUSTER_INSTANCE_DEFAULTS_KEY).unwrap()
    }

    fn params(cluster_instance: Value) -> RequestParams {
        RequestParams {
            cluster_name: "cluster-1".to_string(),
            site_id: "site-1".to_string(),
            cluster_instance,
            policy: json!({}),
        }
    }

    fn template_config() -> TemplateConfig {
        TemplateConfig {
            template_namespace: "default".to_string(),
            cluster_instance_defaults: defaults(),
            installation_timeout: DEFAULT_INSTALLATION_TIMEOUT,
            policy_defaults: json!({}),
            configuration_timeout: DEFAULT_CONFIGURATION_TIMEOUT,
            hardware: None,
        }
    }

    #[test]
    fn test_request_params_from_document() {
        let params = RequestParams::from_document(&create_test_parameters("cluster-1")).unwrap();
        assert_eq!(params.cluster_name, "cluster-1");
        assert_eq!(params.site_id, "site-1");
        assert_eq!(params.cluster_instance["baseDomain"], "example.com");
        assert_eq!(params.policy["sriov-network-vlan-1"], "140");

        let minimal = RequestParams::from_document(&json!({
            "nodeClusterName": "c", "oCloudSiteId": "s"
        }))
        .unwrap();
        assert_eq!(minimal.cluster_instance, json!({}));
        assert_eq!(minimal.policy, json!({}));
    }

    #[test]
    fn test_request_params_reject_bad_shapes() {
        let err = RequestParams::from_document(&json!({"oCloudSiteId": "s"})).unwrap_err();
        assert_eq!(err, "templateParameters.nodeClusterName must be a non-empty string");

        let err = RequestParams::from_document(&json!({
            "nodeClusterName": "c", "oCloudSiteId": "s", "policyTemplateParameters": "x"
        }))
        .unwrap_err();
        assert_eq!(err, "templateParameters.policyTemplateParameters must be a map");
    }

    #[test]
    fn test_render_merges_request_over_defaults() {
        let input = create_test_parameters("cluster-1")["clusterInstanceParameters"].clone();
        let rendered = render_cluster_instance(&defaults(), &params(input)).unwrap();

        assert_eq!(rendered["clusterName"], "cluster-1");
        assert_eq!(rendered["baseDomain"], "example.com");
        assert_eq!(rendered["clusterImageSetNameRef"], "img-4.16.3");
        assert_eq!(rendered["pullSecretRef"]["name"], "pull-secret");

        let node = &rendered["nodes"][0];
        assert_eq!(node["role"], "master");
        assert_eq!(node["bootMode"], "UEFI");
        assert_eq!(node["hostName"], "node1.cluster-1.example.com");
        let interface = &node["nodeNetwork"]["interfaces"][0];
        assert_eq!(interface["label"], BOOT_LABEL);
        assert_eq!(interface["macAddress"], "00:00:00:01:20:30");

        let labels = &rendered["extraLabels"]["ManagedCluster"];
        assert_eq!(labels["cluster-version"], "v4.16");
        assert_eq!(labels["env"], "lab");
        assert_eq!(labels[SITE_ID_LABEL], "site-1");
    }

    #[test]
    fn test_render_with_empty_input_keeps_defaults() {
        let rendered = render_cluster_instance(&defaults(), &params(json!({}))).unwrap();
        let mut expected = defaults();
        expected["clusterName"] = json!("cluster-1");
        expected["extraLabels"]["ManagedCluster"][SITE_ID_LABEL] = json!("site-1");
        assert_eq!(rendered, expected);
    }

    #[test]
    fn test_default_extra_metadata_wins_on_shared_keys() {
        let defaults = json!({
            "extraAnnotations": {"ManagedCluster": {"owner": "platform"}},
            "extraLabels": {"ManagedCluster": {"cluster-version": "v4.16"}},
            "nodes": [{"role": "master", "extraLabels": {"BareMetalHost": {"tier": "gold"}}}]
        });
        let input = json!({
            "extraAnnotations": {"ManagedCluster": {"owner": "someone", "team": "ran"}},
            "extraLabels": {
                "ManagedCluster": {"cluster-version": "custom"},
                "AgentClusterInstall": {"flavour": "sno"}
            },
            "nodes": [{"hostName": "n1", "extraLabels": {"BareMetalHost": {"tier": "silver", "rack": "r1"}}}]
        });

        let rendered = render_cluster_instance(&defaults, &params(input)).unwrap();
        assert_eq!(rendered["extraAnnotations"]["ManagedCluster"]["owner"], "platform");
        assert_eq!(rendered["extraAnnotations"]["ManagedCluster"]["team"], "ran");
        assert_eq!(rendered["extraLabels"]["ManagedCluster"]["cluster-version"], "v4.16");
        assert_eq!(rendered["extraLabels"]["AgentClusterInstall"]["flavour"], "sno");
        assert_eq!(rendered["nodes"][0]["extraLabels"]["BareMetalHost"]["tier"], "gold");
        assert_eq!(rendered["nodes"][0]["extraLabels"]["BareMetalHost"]["rack"], "r1");
    }

    #[test]
    fn test_render_reports_type_mismatches() {
        let err = render_cluster_instance(
            &defaults(),
            &params(json!({"extraLabels": ["not", "a", "map"]})),
        )
        .unwrap_err();
        assert_eq!(err, "type mismatch for field extraLabels: expected a map of resource kinds");

        let err = render_cluster_instance(&defaults(), &params(json!({"nodes": {"role": "master"}})))
            .unwrap_err();
        assert!(
            err.starts_with("failed to merge the ClusterInstance parameters into the defaults: type mismatch for key: nodes"),
            "{err}"
        );
    }

    #[test]
    fn test_sync_extra_metadata_copies_labels_only() {
        let rendered = json!({
            "baseDomain": "new.example.com",
            "extraLabels": {"ManagedCluster": {"env": "prod"}},
            "nodes": [{"hostName": "n1", "extraAnnotations": {"BareMetalHost": {"a": "b"}}}]
        });
        let mut existing = json!({
            "baseDomain": "example.com",
            "extraLabels": {"ManagedCluster": {"env": "lab"}},
            "nodes": [{"hostName": "n1"}]
        });

        assert!(sync_extra_metadata(&rendered, &mut existing));
        assert_eq!(existing["baseDomain"], "example.com");
        assert_eq!(existing["extraLabels"]["ManagedCluster"]["env"], "prod");
        assert_eq!(existing["nodes"][0]["extraAnnotations"]["BareMetalHost"]["a"], "b");

        assert!(!sync_extra_metadata(&rendered, &mut existing));
    }

    #[tokio::test]
    async fn test_render_stage_records_success() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler =
            create_test_reconciler(Arc::clone(&store), Arc::new(MockHardwarePluginClient::new("mock")));
        let input = create_test_parameters("cluster-1")["clusterInstanceParameters"].clone();
        let mut status = ProvisioningRequestStatus::default();

        let doc = reconciler
            .render_stage(&params(input), &template_config(), &mut status)
            .await
            .unwrap();
        assert_eq!(doc.namespace, "cluster-1");
        assert_eq!(doc.name, "cluster-1");
        assert!(store.has_namespace("cluster-1"));
        assert_eq!(store.dry_runs(), 1);
        // Dry runs never create the instance
        assert!(store.instance("cluster-1", "cluster-1").is_none());

        let condition = find_condition(&status.conditions, ConditionType::ClusterInstanceRendered).unwrap();
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(status.cluster_details.unwrap().name, "cluster-1");
    }

    #[tokio::test]
    async fn test_render_stage_records_dry_run_rejection() {
        let store = Arc::new(InMemoryStore::new());
        store.reject_dry_run("spec.baseDomain: Invalid value");
        let reconciler =
            create_test_reconciler(Arc::clone(&store), Arc::new(MockHardwarePluginClient::new("mock")));
        let mut status = ProvisioningRequestStatus::default();

        let err = reconciler
            .render_stage(&params(json!({})), &template_config(), &mut status)
            .await
            .unwrap_err();
        assert!(err.is_input());

        let condition = find_condition(&status.conditions, ConditionType::ClusterInstanceRendered).unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, "Failed");
        assert_eq!(
            condition.message,
            "Failed to render and validate ClusterInstance: failed to validate the rendered ClusterInstance cluster-1/cluster-1: spec.baseDomain: Invalid value"
        );
        assert!(status.cluster_details.is_none());
    }

    #[tokio::test]
    async fn test_metadata_sync_updates_only_labels() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler =
            create_test_reconciler(Arc::clone(&store), Arc::new(MockHardwarePluginClient::new("mock")));
        store.ensure_namespace("cluster-1").await.unwrap();
        let existing = ClusterInstanceDoc {
            namespace: "cluster-1".to_string(),
            name: "cluster-1".to_string(),
            spec: json!({"baseDomain": "installed.example.com", "extraLabels": {}}),
        };
        store.apply_cluster_instance(&existing, false).await.unwrap();

        let input = json!({"baseDomain": "changed.example.com", "extraLabels": {"ManagedCluster": {"env": "prod"}}});
        reconciler
            .sync_rendered_metadata(&params(input), &template_config())
            .await
            .unwrap();

        let spec = store.instance("cluster-1", "cluster-1").unwrap().doc.spec;
        assert_eq!(spec["baseDomain"], "installed.example.com");
        assert_eq!(spec["extraLabels"]["ManagedCluster"]["env"], "prod");
        assert_eq!(spec["extraLabels"]["ManagedCluster"][SITE_ID_LABEL], "site-1");
    }

    #[tokio::test]
    async fn test_metadata_sync_ignores_render_failures() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler =
            create_test_reconciler(Arc::clone(&store), Arc::new(MockHardwarePluginClient::new("mock")));

        let result = reconciler
            .sync_rendered_metadata(&params(json!({"nodes": "broken"})), &template_config())
            .await;
        assert_eq!(result.unwrap(), None);
    }
}
