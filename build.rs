// SPDX-License-Identifier: GPL-3.0-only

use std::process::Command;

fn main() {
    // Re-run build script if git HEAD changes
    println!("cargo::rerun-if-changed=.git/HEAD");
    println!("cargo::rerun-if-changed=.git/refs/tags");
    println!("cargo::rerun-if-env-changed=LOOPCAM_VERSION");

    // Packagers may pin the version
    let version = match std::env::var("LOOPCAM_VERSION") {
        Ok(v) if !v.is_empty() => v,
        _ => git_version().unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
    };

    println!("cargo::rustc-env=GIT_VERSION={}", version);
}

/// "0.1.0" on a tag, "0.1.0-3-abcdef1" after it, the short hash without tags
fn git_version() -> Option<String> {
    let describe = git(&["describe", "--tags", "--always", "--match", "v*"])?;
    let describe = describe.strip_prefix('v').unwrap_or(&describe);

    let parts: Vec<&str> = describe.rsplitn(3, '-').collect();
    match parts.as_slice() {
        [hash, commits, base] if hash.starts_with('g') => {
            Some(format!("{}-{}-{}", base, commits, &hash[1..]))
        }
        _ => Some(describe.to_string()),
    }
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}
