use std::sync::LazyLock;

/// Defines the application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format_version(
        env!("IMAGE_VERSION"),
        option_env!("VERGEN_GIT_SHA"),
        option_env!("VERGEN_GIT_DIRTY") == Some("true"),
    )
});

fn format_version(image_version: &str, sha: Option<&str>, dirty: bool) -> String {
    let sha = sha.map(|s| &s[..s.len().min(8)]).unwrap_or("unknown");
    format!(
        "{image_version}-{sha}{}",
        if dirty { "-dirty" } else { "" }
    )
}
