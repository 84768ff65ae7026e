//! Annotation and label keys.

use k8s_openapi::api::core::v1::Pod;

/// Selects the network plugin handling a pod
pub const NETWORK_TYPE_ANNOTATION: &str = "game.kruise.io/network-type";

/// JSON list of `{name, value}` plugin parameters
pub const NETWORK_CONF_ANNOTATION: &str = "game.kruise.io/network-conf";

/// JSON `NetworkStatus` written by the plugin
pub const NETWORK_STATUS_ANNOTATION: &str = "game.kruise.io/network-status";

/// `"true"` takes the pod out of traffic while keeping its allocation
pub const NETWORK_DISABLED_ANNOTATION: &str = "game.kruise.io/network-disabled";

/// JSON `AllocationAnnotation` recording host ports held by the pod
pub const NETWORK_ALLOCATION_ANNOTATION: &str = "game.kruise.io/network-allocation";

/// Label put on every object a plugin creates, value is the plugin name
pub const NETWORK_PLUGIN_LABEL: &str = "game.kruise.io/network-plugin";

/// Annotation on plugin-owned objects naming the owning pod UID
pub const OWNER_POD_UID_ANNOTATION: &str = "game.kruise.io/owner-pod-uid";

/// Label the StatefulSet controller sets on every pod
pub const POD_NAME_LABEL: &str = "statefulset.kubernetes.io/pod-name";

/// Well-known node hostname label
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Returns the value of a pod annotation, if set.
pub fn pod_annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Returns the network type a pod asks for.
pub fn network_type(pod: &Pod) -> Option<&str> {
    pod_annotation(pod, NETWORK_TYPE_ANNOTATION).filter(|t| !t.is_empty())
}

/// Whether the pod has its network switched off.
pub fn network_disabled(pod: &Pod) -> bool {
    pod_annotation(pod, NETWORK_DISABLED_ANNOTATION)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Sets (or overwrites) an annotation on the pod.
pub fn set_pod_annotation(pod: &mut Pod, key: &str, value: String) {
    pod.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value);
}

/// `namespace/name` of a pod.
pub fn pod_key(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or("default"),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod_with(annotations: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("gs-0".to_string()),
                namespace: Some("games".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_network_type_absent_or_empty() {
        assert_eq!(network_type(&Pod::default()), None);
        assert_eq!(network_type(&pod_with(&[(NETWORK_TYPE_ANNOTATION, "")])), None);
        assert_eq!(
            network_type(&pod_with(&[(NETWORK_TYPE_ANNOTATION, "Kubernetes-HostPort")])),
            Some("Kubernetes-HostPort")
        );
    }

    #[test]
    fn test_network_disabled_is_case_insensitive() {
        assert!(network_disabled(&pod_with(&[(NETWORK_DISABLED_ANNOTATION, "True")])));
        assert!(!network_disabled(&pod_with(&[(NETWORK_DISABLED_ANNOTATION, "no")])));
        assert!(!network_disabled(&Pod::default()));
    }

    #[test]
    fn test_pod_key() {
        assert_eq!(pod_key(&pod_with(&[])), "games/gs-0");
    }
}
