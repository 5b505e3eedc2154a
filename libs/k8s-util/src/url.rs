const NAMESPACE_PLACEHOLDER: &str = "{namespace}";
const NAME_PLACEHOLDER: &str = "{name}";

/// Replace namespace and object names in a Kubernetes API path by placeholders, keeping the
/// metric `endpoint` label bounded.
///
/// `/api/v1/namespaces/default/secrets/alice-auth` becomes
/// `/api/v1/namespaces/{namespace}/secrets/{name}`.
pub fn template_path(path: &str) -> String {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    let prefix_len = match segments.first() {
        Some(&"api") => 2,
        Some(&"apis") => 3,
        _ => return path.to_string(),
    };
    if segments.len() <= prefix_len {
        return path.to_string();
    }

    let mut templated: Vec<&str> = segments[..prefix_len].to_vec();
    let mut rest = &segments[prefix_len..];
    if rest[0] == "namespaces" && rest.len() > 1 {
        templated.push("namespaces");
        templated.push(NAMESPACE_PLACEHOLDER);
        rest = &rest[2..];
    }
    for (i, segment) in rest.iter().enumerate() {
        match i {
            1 => templated.push(NAME_PLACEHOLDER),
            _ => templated.push(*segment),
        }
    }
    format!("/{}", templated.join("/"))
}

#[cfg(test)]
mod tests {
    use super::template_path;

    #[test]
    fn test_template_core_namespaced_object() {
        assert_eq!(
            template_path("/api/v1/namespaces/default/secrets/alice-auth"),
            "/api/v1/namespaces/{namespace}/secrets/{name}"
        );
    }

    #[test]
    fn test_template_group_status_subresource() {
        assert_eq!(
            template_path(
                "/apis/platform.pixovr.com/v1/namespaces/team-a/pixoserviceaccounts/alice/status"
            ),
            "/apis/platform.pixovr.com/v1/namespaces/{namespace}/pixoserviceaccounts/{name}/status"
        );
    }

    #[test]
    fn test_template_collections() {
        assert_eq!(
            template_path("/apis/apps/v1/namespaces/default/deployments"),
            "/apis/apps/v1/namespaces/{namespace}/deployments"
        );
        assert_eq!(
            template_path("/apis/platform.pixovr.com/v1/pixoserviceaccounts"),
            "/apis/platform.pixovr.com/v1/pixoserviceaccounts"
        );
    }

    #[test]
    fn test_template_namespace_object() {
        assert_eq!(
            template_path("/api/v1/namespaces/default"),
            "/api/v1/namespaces/{namespace}"
        );
    }

    #[test]
    fn test_template_unknown_path() {
        assert_eq!(template_path("/version"), "/version");
    }
}
