use anyhow::{Context, Result, bail};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

/// Runtimes tried in order.
const RUNTIMES: &[&str] = &["docker", "podman"];

const VERSION_TIMEOUT: Duration = Duration::from_secs(5);
const PULL_TIMEOUT: Duration = Duration::from_secs(600);
const INSPECT_TIMEOUT: Duration = Duration::from_secs(30);
const RMI_TIMEOUT: Duration = Duration::from_secs(30);

/// Uncompressed size of `image_ref` as reported by the first available
/// container runtime. Pulls the image for `linux/<arch>`, inspects it and
/// removes it again.
pub async fn measure_uncompressed(image_ref: &str, arch: &str) -> Result<u64> {
    let mut last_err = None;
    for runtime in RUNTIMES {
        if !is_available(runtime).await {
            tracing::debug!("{} not available", runtime);
            continue;
        }
        match measure_with(runtime, image_ref, arch).await {
            Ok(size) => return Ok(size),
            Err(e) => {
                tracing::warn!("{} could not measure {}: {:#}", runtime, image_ref, e);
                last_err = Some(e);
            }
        }
    }
    match last_err {
        Some(e) => Err(e),
        None => bail!("neither docker nor podman is available"),
    }
}

/// Run `program` to completion, killing it once `timeout` has passed.
async fn run(program: &str, args: &[&str], timeout: Duration) -> Result<Output> {
    let child = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(timeout, child).await {
        Ok(output) => output.with_context(|| format!("running {program} {}", args.join(" "))),
        Err(_) => bail!(
            "{program} {} timed out after {}s",
            args.first().copied().unwrap_or_default(),
            timeout.as_secs_f64()
        ),
    }
}

async fn is_available(runtime: &str) -> bool {
    run(runtime, &["--version"], VERSION_TIMEOUT)
        .await
        .is_ok_and(|o| o.status.success())
}

async fn measure_with(runtime: &str, image_ref: &str, arch: &str) -> Result<u64> {
    tracing::info!("pulling {} with {}", image_ref, runtime);
    let platform = format!("linux/{arch}");
    let pull = run(
        runtime,
        &["pull", "--platform", platform.as_str(), image_ref],
        PULL_TIMEOUT,
    )
    .await?;
    if !pull.status.success() {
        bail!(
            "{runtime} pull failed: {}",
            String::from_utf8_lossy(&pull.stderr).trim()
        );
    }

    let inspect = run(runtime, &["inspect", image_ref], INSPECT_TIMEOUT).await;

    // Remove the image whatever inspect said; it can be tens of gigabytes.
    let rmi = run(runtime, &["rmi", image_ref], RMI_TIMEOUT).await;
    if !rmi.as_ref().is_ok_and(|o| o.status.success()) {
        tracing::warn!("{} rmi {} failed", runtime, image_ref);
    }

    let inspect = inspect?;
    if !inspect.status.success() {
        bail!(
            "{runtime} inspect failed: {}",
            String::from_utf8_lossy(&inspect.stderr).trim()
        );
    }
    parse_inspect_size(&inspect.stdout)
}

/// `Size` of the first object in `inspect` output.
pub fn parse_inspect_size(stdout: &[u8]) -> Result<u64> {
    let value: serde_json::Value =
        serde_json::from_slice(stdout).context("parsing inspect output")?;
    let first = value
        .as_array()
        .and_then(|items| items.first())
        .context("inspect output is empty")?;
    first
        .get("Size")
        .and_then(|s| s.as_u64())
        .context("inspect output has no Size")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inspect_size() {
        let out = br#"[{"Id": "sha256:abc", "Size": 12884901888, "VirtualSize": 1}]"#;
        assert_eq!(parse_inspect_size(out).unwrap(), 12_884_901_888);
    }

    #[test]
    fn test_parse_inspect_size_rejects_empty_and_garbage() {
        assert!(parse_inspect_size(b"[]").is_err());
        assert!(parse_inspect_size(b"[{\"Id\": \"x\"}]").is_err());
        assert!(parse_inspect_size(b"Error: no such image").is_err());
    }

    #[tokio::test]
    async fn test_missing_runtime_is_unavailable() {
        assert!(!is_available("definitely-not-a-container-runtime").await);
    }

    #[tokio::test]
    async fn test_stalled_command_times_out_as_error() {
        let err = run("sleep", &["5"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err:#}");
    }

    #[tokio::test]
    async fn test_command_within_timeout_returns_output() {
        let output = run("sh", &["-c", "echo ok"], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "ok");
    }
}
