// ABOUTME: Output helpers for the skiff CLI
// ABOUTME: Colors statuses and renders restart outcomes and cleanup reports

use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use skiff_sandbox::{CleanupReport, ContainerStatus, RestartOutcome};

pub fn status_label(status: ContainerStatus) -> ColoredString {
    let text = status.as_str();
    match status {
        ContainerStatus::Running => text.green().bold(),
        ContainerStatus::Creating | ContainerStatus::Syncing => text.yellow().bold(),
        ContainerStatus::Stopped => text.dimmed(),
        ContainerStatus::Error => text.red().bold(),
    }
}

pub fn describe_outcome(outcome: &RestartOutcome) -> String {
    match outcome {
        RestartOutcome::Signalled {
            framework,
            pid,
            signal,
        } => format!("Sent SIG{} to {} (pid {})", signal.as_str(), framework, pid),
        RestartOutcome::Broadcast => "No known app process, sent SIGHUP to interpreters".to_string(),
        RestartOutcome::Recovered => "Restart failed, relaunched the start command".to_string(),
        RestartOutcome::Abandoned => "Restart failed and the sandbox is not running".to_string(),
    }
}

fn join_or_dash(items: &[String]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join("\n")
    }
}

pub fn cleanup_table(reports: &[(String, CleanupReport)]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Project", "Removed", "Already gone", "Failed"]);

    for (project_id, report) in reports {
        let failed: Vec<String> = report
            .failed
            .iter()
            .map(|(name, reason)| format!("{}: {}", name, reason))
            .collect();
        table.add_row(vec![
            project_id.clone(),
            join_or_dash(&report.removed),
            join_or_dash(&report.absent),
            join_or_dash(&failed),
        ]);
    }
    table
}
