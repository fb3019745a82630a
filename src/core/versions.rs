/// n8n version detection
///
/// Asks the running application container for `n8n --version`. Detection is
/// best-effort: any failure yields `None` and callers render it as "unknown".

use regex::Regex;
use semver::Version;
use std::cmp::Ordering;
use tracing::debug;

use crate::core::docker::ComposeStack;
use crate::core::process::CommandRunner;

const VERSION_PATTERN: &str = r"(\d+\.\d+\.\d+(?:-[0-9A-Za-z.-]+)?)";

/// Extract the first semver-looking token from command output
pub fn parse_version(output: &str) -> Option<String> {
    Regex::new(VERSION_PATTERN)
        .ok()?
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Query the application container for its version
pub async fn detect_version<R: CommandRunner>(stack: &ComposeStack<'_, R>) -> Option<String> {
    let app = stack.config().services.app.as_str();
    let spec = stack.exec_spec(app, &["n8n", "--version"]);

    match stack.runner().run(&spec).await {
        Ok(output) if output.success => parse_version(&output.stdout),
        Ok(output) => {
            debug!(error = %output.failure_message(), "version detection failed");
            None
        }
        Err(e) => {
            debug!(error = %e, "version detection failed");
            None
        }
    }
}

/// Whether `detected` satisfies the requested image tag (`v` prefix ignored)
pub fn matches_target(detected: &str, target: &str) -> bool {
    let target = target.trim_start_matches('v');
    match (Version::parse(detected), Version::parse(target)) {
        (Ok(a), Ok(b)) => a == b,
        // Non-semver tags such as "latest" or "next" cannot be checked
        _ => !target.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) || detected == target,
    }
}

/// One-line summary of a version transition for the upgrade report
pub fn describe_change(previous: Option<&str>, current: Option<&str>) -> String {
    match (previous, current) {
        (Some(prev), Some(cur)) => match (Version::parse(prev), Version::parse(cur)) {
            (Ok(a), Ok(b)) => match a.cmp(&b) {
                Ordering::Less => format!("upgraded {} → {}", a, b),
                Ordering::Equal => format!("unchanged at {}", b),
                Ordering::Greater => format!("downgraded {} → {}", a, b),
            },
            _ => format!("{} → {}", prev, cur),
        },
        (None, Some(cur)) => format!("now at {}", cur),
        (Some(prev), None) => format!("was {}, now unknown", prev),
        (None, None) => "version unknown".to_string(),
    }
}
