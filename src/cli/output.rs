//! Output formatting and progress indicators
//!
//! Banners, the build timing summary and progress bars shown on the
//! terminal. Diagnostics go through `tracing`; this module only prints
//! what the user asked for.

use indicatif::{ProgressBar, ProgressStyle};

use crate::core::builder::{BuildOutcome, BuildSummary};

/// Terminal width from `COLUMNS`, 80 when unknown
pub fn terminal_width() -> usize {
    std::env::var("COLUMNS")
        .ok()
        .and_then(|c| c.trim().parse().ok())
        .filter(|&c| c > 0)
        .unwrap_or(80)
}

/// `msg` centered in a line of `fill` characters
pub fn full_line_banner(msg: &str, fill: char, width: usize) -> String {
    let bars = width.saturating_sub(msg.chars().count() + 2) / 2;
    let bar: String = std::iter::repeat(fill).take(bars).collect();
    format!("{bar} {msg} {bar}")
}

/// `H:MM:SS`, or "Download only" for packages that were not built
pub fn human_time(seconds: Option<f64>) -> String {
    match seconds {
        Some(s) if s >= 0.0 => {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let total = s as u64;
            format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
        }
        _ => "Download only".to_string(),
    }
}

/// Rows padded to a common column width, one line per row
pub fn format_column(rows: &[(String, String)]) -> String {
    let width = rows
        .iter()
        .flat_map(|(a, b)| [a.chars().count(), b.chars().count()])
        .max()
        .unwrap_or(0);
    let mut out = String::new();
    for (a, b) in rows {
        out.push_str(&format!("{a:<width$}\t{b:<width$}\n"));
    }
    out
}

/// The summary printed at the end of a build
pub fn render_build_timings(summary: &BuildSummary, width: usize) -> String {
    let rule = full_line_banner("", '=', width);
    let mut out = String::new();
    out.push_str(&rule);
    out.push('\n');
    out.push_str(&format!(
        "\t\tforestbuild Build {}\n",
        if summary.is_success() { "Successful" } else { "Failed" }
    ));
    out.push_str(&rule);
    out.push('\n');

    if let Some(failed) = summary.unbuilt.first() {
        out.push_str("Failed package:\n");
        out.push_str(failed);
        out.push('\n');
    }
    if !summary.timings.is_empty() {
        let rows: Vec<(String, String)> = summary
            .timings
            .iter()
            .map(|t| (t.name.clone(), human_time(t.seconds)))
            .collect();
        out.push_str("Package(s) built:\n");
        out.push_str(&format_column(&rows));
    }
    if summary.unbuilt.len() > 1 {
        out.push_str("Package(s) not built due to previous build failure:\n");
        out.push_str(&summary.unbuilt[1..].join(", "));
        out.push('\n');
    }
    out
}

pub fn print_build_timings(summary: &BuildSummary) {
    print!("{}", render_build_timings(summary, terminal_width()));
}

/// Machine-readable form of a finished (or failed) run
pub fn outcome_json(outcome: Result<&BuildOutcome, &BuildSummary>) -> serde_json::Value {
    match outcome {
        Ok(BuildOutcome::NothingToDo) => serde_json::json!({ "status": "nothing-to-do" }),
        Ok(BuildOutcome::QueueSaved { group, queue }) => serde_json::json!({
            "status": "saved",
            "group": group,
            "queue": queue,
        }),
        Ok(BuildOutcome::Built(summary)) => serde_json::json!({
            "status": "success",
            "timings": summary.timings,
            "unbuilt": summary.unbuilt,
        }),
        Err(summary) => serde_json::json!({
            "status": "failed",
            "timings": summary.timings,
            "unbuilt": summary.unbuilt,
        }),
    }
}

/// Create a progress bar counting removed entries
pub fn create_clear_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("[{percent:>3}%] {msg} [{bar:40.cyan/blue}] {pos}/{len}")
    {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}

/// Print an error with its chain of causes
pub fn display_error(error: &anyhow::Error) {
    eprintln!("{} {error}", status::ERROR);
    for cause in error.chain().skip(1) {
        eprintln!("  caused by: {cause}");
    }
}

/// Status message prefixes
pub mod status {
    /// Success prefix (green checkmark)
    pub const SUCCESS: &str = "✓";

    /// Error prefix (red X)
    pub const ERROR: &str = "✗";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::checkpoint::BuildTiming;

    #[test]
    fn test_full_line_banner() {
        assert_eq!(full_line_banner("hi", '-', 10), "--- hi ---");
        assert_eq!(full_line_banner("a very long message", '-', 10), " a very long message ");
    }

    #[test]
    fn test_human_time() {
        assert_eq!(human_time(None), "Download only");
        assert_eq!(human_time(Some(-1.0)), "Download only");
        assert_eq!(human_time(Some(0.4)), "0:00:00");
        assert_eq!(human_time(Some(65.9)), "0:01:05");
        assert_eq!(human_time(Some(3725.0)), "1:02:05");
    }

    #[test]
    fn test_format_column() {
        let rows = vec![
            ("foo".to_string(), "0:00:01".to_string()),
            ("bar-long".to_string(), "x".to_string()),
        ];
        assert_eq!(
            format_column(&rows),
            "foo     \t0:00:01 \nbar-long\tx       \n"
        );
    }

    #[test]
    fn test_render_successful_build() {
        let summary = BuildSummary {
            timings: vec![BuildTiming::built("foo (amd64 @ 1-0)", 61.0)],
            unbuilt: Vec::new(),
        };
        let out = render_build_timings(&summary, 20);
        assert!(out.contains("Build Successful"));
        assert!(out.contains("foo (amd64 @ 1-0)\t0:01:01"));
        assert!(!out.contains("Failed package"));
    }

    #[test]
    fn test_render_failed_build() {
        let summary = BuildSummary {
            timings: vec![BuildTiming::downloaded("foo")],
            unbuilt: vec!["bar".to_string(), "baz".to_string(), "qux".to_string()],
        };
        let out = render_build_timings(&summary, 20);
        assert!(out.contains("Build Failed"));
        assert!(out.contains("Failed package:\nbar\n"));
        assert!(out.contains("Download only"));
        assert!(out.contains("previous build failure:\nbaz, qux\n"));
    }

    #[test]
    fn test_outcome_json() {
        let saved = BuildOutcome::QueueSaved {
            group: "groups/acbs-1".to_string(),
            queue: vec!["a".to_string()],
        };
        let value = outcome_json(Ok(&saved));
        assert_eq!(value["status"], "saved");
        assert_eq!(value["queue"][0], "a");

        let failed = BuildSummary {
            timings: vec![BuildTiming::built("a", 1.0)],
            unbuilt: vec!["b".to_string()],
        };
        let value = outcome_json(Err(&failed));
        assert_eq!(value["status"], "failed");
        assert_eq!(value["timings"][0]["seconds"], 1.0);
    }
}
