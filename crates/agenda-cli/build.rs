use std::process::Command;

/// Commit of the working tree, short form; packagers can pin it with
/// `AGENDA_COMMIT_HASH` when building outside a git checkout.
fn commit_hash() -> Option<String> {
    if let Some(hash) = std::env::var("AGENDA_COMMIT_HASH")
        .ok()
        .filter(|s| !s.trim().is_empty())
    {
        return Some(hash.trim().to_string());
    }
    let output = Command::new("git")
        .args(["rev-parse", "--short=12", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let hash = String::from_utf8(output.stdout).ok()?;
    Some(hash.trim().to_string()).filter(|h| !h.is_empty())
}

fn main() {
    println!("cargo::rerun-if-changed=../../.git/HEAD");
    println!("cargo::rerun-if-changed=../../.git/refs/heads/");
    println!("cargo::rerun-if-env-changed=AGENDA_COMMIT_HASH");

    let hash = commit_hash().unwrap_or_else(|| "unknown".to_string());
    println!("cargo::rustc-env=GIT_COMMIT_HASH={}", hash);
}
