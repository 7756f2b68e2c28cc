//! Unit tests for the deep merge

#[cfg(test)]
mod tests {
    use crate::reconciler::merge::*;
    use serde_json::{Map, Value, json};

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected a map, got {other}"),
        }
    }

    fn defaults() -> Value {
        json!({
            "clusterImageSetNameRef": "4.16",
            "holdInstallation": false,
            "extraLabels": {"ManagedCluster": {"cluster-version": "v4.16"}},
            "nodes": [
                {"role": "master", "bootMode": "UEFI", "nodeNetwork": {"interfaces": [{"name": "eno1", "label": "bootable-interface"}]}},
                {"role": "worker", "bootMode": "UEFI"}
            ]
        })
    }

    #[test]
    fn test_merge_with_empty_overlay_is_identity() {
        let mut dst = as_map(defaults());
        deep_merge_maps(&mut dst, &Map::new(), true).unwrap();
        assert_eq!(Value::Object(dst), defaults());

        let merged = merge_documents(&defaults(), &Value::Null, true).unwrap();
        assert_eq!(merged, defaults());
    }

    #[test]
    fn test_overlay_wins_and_maps_merge_recursively() {
        let overlay = json!({
            "clusterImageSetNameRef": "4.16.3",
            "extraLabels": {"ManagedCluster": {"site": "dallas"}},
            "clusterName": "sno1"
        });
        let merged = merge_documents(&defaults(), &overlay, true).unwrap();

        assert_eq!(merged["clusterImageSetNameRef"], "4.16.3");
        assert_eq!(merged["clusterName"], "sno1");
        // Both sides of the nested map survive
        assert_eq!(merged["extraLabels"]["ManagedCluster"]["cluster-version"], "v4.16");
        assert_eq!(merged["extraLabels"]["ManagedCluster"]["site"], "dallas");
    }

    #[test]
    fn test_sequences_merge_by_index_and_keep_trailing_elements() {
        let overlay = json!({
            "nodes": [
                {"hostName": "node1", "nodeNetwork": {"interfaces": [{"name": "eno1", "macAddress": "00:00:00:01:20:30"}]}}
            ]
        });
        let merged = merge_documents(&defaults(), &overlay, true).unwrap();
        let nodes = merged["nodes"].as_array().unwrap();

        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0]["hostName"], "node1");
        assert_eq!(nodes[0]["bootMode"], "UEFI");
        let iface = &nodes[0]["nodeNetwork"]["interfaces"][0];
        assert_eq!(iface["label"], "bootable-interface");
        assert_eq!(iface["macAddress"], "00:00:00:01:20:30");
        // Default-only trailing element preserved
        assert_eq!(nodes[1]["role"], "worker");

        // Overlay-only trailing element appended
        let mut longer = vec![json!(1)];
        deep_merge_slices(&mut longer, &[json!(2), json!(3)], true).unwrap();
        assert_eq!(longer, vec![json!(2), json!(3)]);
    }

    #[test]
    fn test_type_mismatch_overrides_without_strict_checking() {
        let overlay = json!({"holdInstallation": "yes"});
        let merged = merge_documents(&defaults(), &overlay, false).unwrap();
        assert_eq!(merged["holdInstallation"], "yes");
    }

    #[test]
    fn test_type_mismatch_fails_with_strict_checking() {
        let overlay = json!({"holdInstallation": "yes"});
        let err = merge_documents(&defaults(), &overlay, true).unwrap_err();
        assert_eq!(
            err,
            "type mismatch for key: holdInstallation (dst: bool, src: string)"
        );
    }

    #[test]
    fn test_nested_mismatch_names_the_path() {
        let overlay = json!({"extraLabels": {"ManagedCluster": ["not", "a", "map"]}});
        let err = merge_documents(&defaults(), &overlay, true).unwrap_err();
        assert!(err.starts_with("error merging maps for key: extraLabels: "), "{err}");
        assert!(err.contains("type mismatch for key: ManagedCluster"), "{err}");

        let overlay = json!({"nodes": ["master"]});
        let err = merge_documents(&defaults(), &overlay, true).unwrap_err();
        assert!(err.contains("error merging slices for key: nodes: type mismatch at index: 0"), "{err}");
    }
}
