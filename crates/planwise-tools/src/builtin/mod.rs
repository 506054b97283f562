pub mod bash;
pub mod python_repl;
pub mod write_and_execute;

use std::path::Path;
use std::process::Output;
use std::time::Duration;

pub use bash::BashTool;
pub use python_repl::PythonReplTool;
pub use write_and_execute::WriteAndExecuteTool;

const MAX_OUTPUT_CHARS: usize = 30_000;

/// Run a command to completion, or `Ok(None)` if it outlives `timeout`.
/// The child is killed when the wait is abandoned.
pub(crate) async fn run_with_timeout(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    timeout: Duration,
) -> std::io::Result<Option<Output>> {
    let child = tokio::process::Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Ok(output) => output.map(Some),
        Err(_) => Ok(None),
    }
}

/// Grace period between a per-call timeout and the registry's outer one.
const OUTER_TIMEOUT_GRACE_SECS: u64 = 5;

/// Outer timeout for a tool that takes an optional `timeout` input.
/// Covers the requested value so the tool's own timeout fires first.
pub(crate) fn outer_timeout(input: &serde_json::Value, default_timeout: u64) -> u64 {
    let requested = input
        .get("timeout")
        .and_then(|t| t.as_u64())
        .unwrap_or(default_timeout);
    requested.max(default_timeout) + OUTER_TIMEOUT_GRACE_SECS
}

/// Cut `text` to the output cap on a char boundary.
pub(crate) fn truncate_output(mut text: String) -> String {
    if text.len() <= MAX_OUTPUT_CHARS {
        return text;
    }
    let mut end = MAX_OUTPUT_CHARS;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text.push_str("\n... (output truncated)");
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outer_timeout_covers_requested_value() {
        assert_eq!(outer_timeout(&serde_json::json!({}), 120), 125);
        assert_eq!(outer_timeout(&serde_json::json!({"timeout": 600}), 120), 605);
        assert_eq!(outer_timeout(&serde_json::json!({"timeout": 1}), 120), 125);
        assert_eq!(outer_timeout(&serde_json::json!({"timeout": "soon"}), 120), 125);
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let text = "é".repeat(MAX_OUTPUT_CHARS);
        let out = truncate_output(text);
        assert!(out.ends_with("(output truncated)"));
        assert!(out.len() < MAX_OUTPUT_CHARS + 30);
    }

    #[test]
    fn test_short_output_untouched() {
        assert_eq!(truncate_output("ok".into()), "ok");
    }

    #[tokio::test]
    async fn test_run_with_timeout_expires() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_with_timeout("sh", &["-c", "sleep 5"], dir.path(), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(out.is_none());
    }
}
