//! Version inputs for `utils::version`: the image tag from `VERSION` and the
//! git commit the binary was built from.

use vergen_git2::Emitter;
use vergen_git2::Git2Builder;

fn main() {
    println!("cargo:rerun-if-env-changed=VERSION");
    let image_version = std::env::var("VERSION").unwrap_or_else(|_| "latest".to_string());
    println!("cargo:rustc-env=IMAGE_VERSION={image_version}");

    // outside a git checkout the sha reads as unknown
    if let Err(e) = emit_commit() {
        println!("cargo:warning=git commit unavailable: {e}");
    }
}

fn emit_commit() -> anyhow::Result<()> {
    let git = Git2Builder::default().sha(true).dirty(true).build()?;
    Emitter::default().add_instructions(&git)?.emit()
}
