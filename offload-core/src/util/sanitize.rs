/// Normalize a user-supplied remote path prefix.
///
/// Trims whitespace, lowercases, drops `../` and `./` segments, collapses
/// repeated slashes and strips leading/trailing slashes.
pub fn sanitize_path(path: &str) -> String {
    let lowered = path.trim().to_lowercase();
    let no_traversal = lowered.replace("../", "").replace("./", "");
    no_traversal
        .split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .collect::<Vec<_>>()
        .join("/")
}

/// Join key segments with `/`, skipping empty ones.
pub fn join_key<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts
        .into_iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
