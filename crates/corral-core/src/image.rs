//! Image naming shared by the build pipeline and the container launcher.

/// Length of the abbreviated revision used in image tags.
pub const SHORT_SHA_LEN: usize = 7;

const BUILD_MANIFEST_TEMPLATE: &str = "FROM {base}
ENV NBE 1
ADD {appname} /{appname}
WORKDIR /{appname}
RUN {build_cmd}
";

pub fn short_sha(sha: &str) -> &str {
    match sha.char_indices().nth(SHORT_SHA_LEN) {
        Some((idx, _)) => &sha[..idx],
        None => sha,
    }
}

/// `{registry}/{appname}`
pub fn image_repository(registry: &str, appname: &str) -> String {
    format!("{registry}/{appname}")
}

/// `{registry}/{appname}:{short_sha}`
pub fn image_tag(registry: &str, appname: &str, short_sha: &str) -> String {
    format!("{}:{short_sha}", image_repository(registry, appname))
}

/// Render the build manifest handed to the remote image builder.
pub fn render_build_manifest(base: &str, appname: &str, build_cmd: &str) -> String {
    BUILD_MANIFEST_TEMPLATE
        .replace("{base}", base)
        .replace("{appname}", appname)
        .replace("{build_cmd}", build_cmd)
}
