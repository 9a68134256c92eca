use std::env;
use std::process::Command;

/// Revision shown by `mtaild --version`: `MTAILD_BUILD_REV` when set (for
/// builds from a source tarball), otherwise `git describe` of the checkout.
fn revision() -> String {
    if let Some(rev) = env::var("MTAILD_BUILD_REV")
        .ok()
        .filter(|rev| !rev.trim().is_empty())
    {
        return rev.trim().to_string();
    }
    Command::new("git")
        .args(["describe", "--always", "--dirty", "--abbrev=10"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|rev| rev.trim().to_string())
        .filter(|rev| !rev.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    println!("cargo:rustc-env=MTAILD_REV={}", revision());
    println!("cargo:rerun-if-env-changed=MTAILD_BUILD_REV");
    println!("cargo:rerun-if-changed=../../.git/HEAD");
    println!("cargo:rerun-if-changed=../../.git/index");
}
