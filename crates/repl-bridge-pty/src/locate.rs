//! Interpreter executable discovery.

use std::{
    collections::HashSet,
    env::{join_paths, split_paths},
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    time::Duration,
};

const PATH_REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

/// Install locations checked after every PATH lookup failed.
const WELL_KNOWN_DIRS: &[&str] = &[
    "/usr/local/bin",
    "/opt/homebrew/bin",
    "/usr/bin",
    "/Library/Frameworks/R.framework/Resources/bin",
    "/opt/R/current/bin",
];

/// Resolve an interpreter executable.
///
/// The search order is:
/// 1. `explicit`, when given (must exist).
/// 2. Absolute or separator-containing `name`.
/// 3. The current process PATH via `which`.
/// 4. PATH as seen by the user's login shell (GUI launches often lack it).
/// 5. Well-known install directories.
pub async fn resolve_interpreter(name: &str, explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.is_file().then(|| path.to_path_buf());
    }
    if name.trim().is_empty() {
        return None;
    }

    let path = Path::new(name);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }

    if let Some(found) = which_in(name, None).await {
        return Some(found);
    }

    if let Some(login_path) = login_shell_path().await {
        if let Some(found) = which_in(name, Some(login_path)).await {
            tracing::debug!(found = %found.display(), "Resolved interpreter via login shell PATH");
            return Some(found);
        }
    }

    let fallback = join_paths(WELL_KNOWN_DIRS.iter().map(PathBuf::from)).ok()?;
    which_in(name, Some(fallback)).await
}

/// Merge two PATH strings into a single, de-duplicated PATH.
#[must_use]
pub fn merge_paths(primary: impl AsRef<OsStr>, secondary: impl AsRef<OsStr>) -> OsString {
    let mut seen = HashSet::<PathBuf>::new();
    let merged: Vec<PathBuf> = split_paths(primary.as_ref())
        .chain(split_paths(secondary.as_ref()))
        .filter(|p| !p.as_os_str().is_empty() && seen.insert(p.clone()))
        .collect();

    join_paths(merged).unwrap_or_default()
}

async fn which_in(name: &str, paths: Option<OsString>) -> Option<PathBuf> {
    let name = name.to_string();
    tokio::task::spawn_blocking(move || match paths {
        Some(paths) => {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
            which::which_in(name, Some(paths), cwd)
        }
        None => which::which(name),
    })
    .await
    .ok()
    .and_then(Result::ok)
}

/// PATH of the current process merged with the login shell's.
async fn login_shell_path() -> Option<OsString> {
    let shell = login_shell()?;
    let fresh = run_login_shell(&shell).await?;
    let existing = std::env::var_os("PATH").unwrap_or_default();
    let merged = merge_paths(&existing, OsString::from(fresh));
    (merged != existing).then_some(merged)
}

#[cfg(not(windows))]
fn login_shell() -> Option<PathBuf> {
    let shell = std::env::var_os("SHELL").map(PathBuf::from)?;
    (shell.is_absolute() && shell.is_file()).then_some(shell)
}

#[cfg(windows)]
fn login_shell() -> Option<PathBuf> {
    None
}

async fn run_login_shell(shell: &Path) -> Option<String> {
    use std::process::Stdio;

    use tokio::process::Command;

    let login = matches!(
        shell.file_name().and_then(OsStr::to_str),
        Some("zsh" | "bash")
    );
    let rc = rc_file(shell);

    let mut cmd = Command::new(shell);
    if login {
        cmd.arg("-l");
    }
    let script = match rc.as_deref().and_then(|rc| shlex::try_quote(rc).ok()) {
        Some(quoted) => format!("source {quoted}; printf '%s' \"$PATH\""),
        None => "printf '%s' \"$PATH\"".to_string(),
    };
    cmd.arg("-c")
        .arg(script)
        .env("TERM", "dumb")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let child = cmd.spawn().ok()?;
    let output = match tokio::time::timeout(PATH_REFRESH_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            tracing::debug!(shell = %shell.display(), ?err, "Failed to read PATH from login shell");
            return None;
        }
        Err(_) => {
            tracing::warn!(shell = %shell.display(), "Timed out reading PATH from login shell");
            return None;
        }
    };

    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8(output.stdout).ok()?.trim().to_string();
    (!path.is_empty()).then_some(path)
}

fn rc_file(shell: &Path) -> Option<String> {
    let home = dirs::home_dir()?;
    let rc = match shell.file_name().and_then(OsStr::to_str)? {
        "zsh" => home.join(".zshrc"),
        "bash" => home.join(".bashrc"),
        _ => return None,
    };
    rc.is_file().then(|| rc.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_paths_dedups_and_keeps_order() {
        let a = join_paths(["/a", "/b"]).unwrap();
        let b = join_paths(["/b", "/c"]).unwrap();
        let merged: Vec<PathBuf> = split_paths(&merge_paths(a, b)).collect();
        assert_eq!(
            merged,
            vec![PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/c")]
        );
    }

    #[tokio::test]
    async fn test_explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("R");
        assert_eq!(resolve_interpreter("R", Some(&exe)).await, None);
        std::fs::write(&exe, "#!/bin/sh\n").unwrap();
        assert_eq!(resolve_interpreter("R", Some(&exe)).await, Some(exe));
    }

    #[tokio::test]
    async fn test_empty_name() {
        assert_eq!(resolve_interpreter("  ", None).await, None);
    }
}
