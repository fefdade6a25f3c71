//! Request path grammar for aggregated API groups
//!
//! Below `/apis/{group}/{version}` the aggregation layer uses:
//!
//! ```text
//! namespaces/{ns}/{resource}[/{name}[/{subresource}]]   namespaced
//! {resource}[/{name}[/{subresource}]]                    cluster scoped
//! namespaces[/{name}]                                    the namespaces resource
//! ```

/// Parsed location of a resource request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePath {
    /// Namespace, empty for cluster-scoped requests
    pub namespace: String,
    /// Plural resource name
    pub resource: String,
    /// Object name, absent for collections
    pub name: Option<String>,
    /// Subresource, if any
    pub subresource: Option<String>,
}

impl ResourcePath {
    /// Whether the request addresses a namespaced resource
    pub fn is_namespaced(&self) -> bool {
        !self.namespace.is_empty()
    }
}

/// Parse the part of a path that follows `/apis/{group}/{version}/`
///
/// Returns `None` for paths outside the grammar.
pub fn parse_resource_path(rest: &str) -> Option<ResourcePath> {
    let segments: Vec<&str> = rest.trim_matches('/').split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return None;
    }

    let (namespace, tail) = match segments.as_slice() {
        ["namespaces", ns, resource, tail @ ..] => (ns.to_string(), {
            let mut parts = vec![*resource];
            parts.extend_from_slice(tail);
            parts
        }),
        _ => (String::new(), segments.clone()),
    };

    match tail.as_slice() {
        [resource] => Some(ResourcePath {
            namespace,
            resource: resource.to_string(),
            name: None,
            subresource: None,
        }),
        [resource, name] => Some(ResourcePath {
            namespace,
            resource: resource.to_string(),
            name: Some(name.to_string()),
            subresource: None,
        }),
        [resource, name, subresource] => Some(ResourcePath {
            namespace,
            resource: resource.to_string(),
            name: Some(name.to_string()),
            subresource: Some(subresource.to_string()),
        }),
        _ => None,
    }
}

/// Split `/apis/{group}/{version}/{rest}` into its parts
///
/// `rest` is empty for the group-version root.
pub fn split_api_path(path: &str) -> Option<(&str, &str, &str)> {
    let path = path.strip_prefix("/apis/")?;
    let mut parts = path.splitn(3, '/');
    let group = parts.next().filter(|g| !g.is_empty())?;
    let version = parts.next().filter(|v| !v.is_empty())?;
    Some((group, version, parts.next().unwrap_or("")))
}
