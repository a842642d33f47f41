// Path templating modeled on client-go's request.go so metric labels
// stay low-cardinality: concrete namespace and resource names are
// replaced with `{namespace}` and `{name}` placeholders.

const CORE_GROUP_PREFIX: &str = "api";
const NAMED_GROUP_PREFIX: &str = "apis";

fn is_subresource(segment: &str) -> bool {
    segment == "status" || segment == "finalize"
}

/// Template a Kubernetes API request path. Paths that do not look like
/// an API group route collapse to `/{prefix}`.
pub fn template_path(path: &str, base_path: Option<&str>) -> String {
    let (prefix, rest) = match base_path {
        Some(base) if path.starts_with(base) => (base.trim_end_matches('/'), &path[base.len()..]),
        _ => ("", path),
    };
    let mut segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();

    if segments.len() <= 2 {
        return path.to_owned();
    }

    // Segments after the group/version part: /api/v1/... or /apis/GROUP/VERSION/...
    let index = match segments[0] {
        CORE_GROUP_PREFIX => 2,
        NAMED_GROUP_PREFIX => 3,
        _ => return "/{prefix}".to_owned(),
    };

    match segments.len() - index {
        // bare resource list, nothing to hide
        1 => {}
        // /RESOURCE/NAME
        2 => segments[index + 1] = "{name}",
        3 => {
            if is_subresource(segments[index + 2]) {
                // /RESOURCE/NAME/SUBRESOURCE
                segments[index + 1] = "{name}";
            } else {
                // /namespaces/NAMESPACE/RESOURCE
                segments[index + 1] = "{namespace}";
            }
        }
        // /namespaces/NAMESPACE/RESOURCE/NAME[/SUBRESOURCE]
        _ => {
            segments[index + 1] = "{namespace}";
            if !is_subresource(segments[index + 3]) {
                segments[index + 3] = "{name}";
            }
        }
    }

    format!("{}/{}", prefix, segments.join("/"))
}
