// Stamps the git commit into the build for the boot banner and panic dumps.

use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let hash = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|hash| hash.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=NPK_GIT_HASH={}", hash);
}
