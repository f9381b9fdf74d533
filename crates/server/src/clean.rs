//! URL path normalization for the REST base path.

/// Normalize `p` so that it is non-empty, starts and ends with `/`, and
/// contains no `.` or `..` segments. The result is safe to use for prefix
/// checks and router mounting.
pub fn clean(p: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in p.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }

    if segments.is_empty() {
        return "/".to_string();
    }

    let mut out = String::with_capacity(p.len() + 2);
    for segment in segments {
        out.push('/');
        out.push_str(segment);
    }
    out.push('/');
    out
}
