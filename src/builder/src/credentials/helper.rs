//! Docker credential helper subprocess contract.
//!
//! Helpers are executables named `docker-credential-<name>` on `PATH`.
//! `get` takes the server URL on stdin and prints
//! `{"ServerURL":…,"Username":…,"Secret":…}` on success. The stderr
//! messages `credentials not found` and `no credentials server URL` mean
//! "no credential", not failure.

use std::process::Stdio;

use serde::Deserialize;
use strata_core::error::Result;
use tokio::io::AsyncWriteExt;

use super::{Credential, TOKEN_USERNAME};

#[derive(Debug, Deserialize)]
struct HelperOutput {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

/// Invoke `docker-credential-<name> get` for `registry`.
///
/// Returns `Ok(None)` when the helper has no credential for the host or is
/// not installed at all; other failures surface as errors (the resolver
/// logs and skips them).
pub async fn fetch_from_helper(name: &str, registry: &str) -> Result<Option<Credential>> {
    let program = format!("docker-credential-{}", name);

    let mut child = match tokio::process::Command::new(&program)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(helper = %program, "Credential helper not installed");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(registry.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        // closes stdin
    }

    let output = child.wait_with_output().await?;

    if output.status.success() {
        let parsed: HelperOutput = serde_json::from_slice(&output.stdout)?;
        let credential = if parsed.username == TOKEN_USERNAME {
            Credential::refresh_token(parsed.secret)
        } else {
            Credential::basic(parsed.username, parsed.secret)
        };
        return Ok(Some(credential));
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if is_no_credential(&stderr) {
        tracing::debug!(helper = %program, registry = %registry, "Helper has no credential");
        return Ok(None);
    }

    Err(std::io::Error::other(format!(
        "{} exited with {}: {}",
        program,
        output.status,
        stderr.trim()
    ))
    .into())
}

fn is_no_credential(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("credentials not found")
        || stderr.contains("no credentials server url")
        || stderr.contains("serverurl not set")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_credential_messages() {
        assert!(is_no_credential("credentials not found in native keychain\n"));
        assert!(is_no_credential("no credentials server URL"));
        assert!(is_no_credential("ServerURL not set"));
        assert!(!is_no_credential("permission denied"));
    }

    #[tokio::test]
    async fn test_missing_helper_is_none() {
        let result = fetch_from_helper("does-not-exist-hopefully", "example.com")
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[cfg(unix)]
    mod with_fake_helper {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// Writes a shell-script helper into a temp dir and prepends it to
        /// PATH for the duration of the call.
        async fn run_with_helper(script: &str, registry: &str) -> Result<Option<Credential>> {
            let dir = tempfile::TempDir::new().unwrap();
            let path = dir.path().join("docker-credential-fake");
            std::fs::write(&path, script).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

            let old_path = std::env::var("PATH").unwrap_or_default();
            std::env::set_var(
                "PATH",
                format!("{}:{}", dir.path().display(), old_path),
            );
            let result = fetch_from_helper("fake", registry).await;
            std::env::set_var("PATH", old_path);
            result
        }

        #[tokio::test]
        async fn test_successful_helper() {
            let credential = run_with_helper(
                "#!/bin/sh\necho '{\"ServerURL\":\"my.reg\",\"Username\":\"u\",\"Secret\":\"p\"}'\n",
                "my.reg",
            )
            .await
            .unwrap()
            .unwrap();
            assert_eq!(credential, Credential::basic("u", "p"));
        }

        #[tokio::test]
        async fn test_token_username_yields_refresh_token() {
            let credential = run_with_helper(
                "#!/bin/sh\necho '{\"Username\":\"<token>\",\"Secret\":\"tok\"}'\n",
                "my.reg",
            )
            .await
            .unwrap()
            .unwrap();
            assert!(credential.is_refresh_token());
        }

        #[tokio::test]
        async fn test_not_found_stderr_is_none() {
            let result = run_with_helper(
                "#!/bin/sh\necho 'credentials not found in native keychain' >&2\nexit 1\n",
                "my.reg",
            )
            .await
            .unwrap();
            assert!(result.is_none());
        }

        #[tokio::test]
        async fn test_other_failure_is_error() {
            let result = run_with_helper("#!/bin/sh\necho 'kaboom' >&2\nexit 2\n", "my.reg").await;
            assert!(result.is_err());
        }
    }
}
