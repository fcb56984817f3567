// ABOUTME: Sandbox subcommands of the skiff CLI
// ABOUTME: Each command drives one SandboxManager operation and prints the result

use super::utils::{cleanup_table, describe_outcome, status_label};
use anyhow::{anyhow, bail, Context, Result};
use colored::*;
use comfy_table::{presets::UTF8_FULL, Table};
use skiff_sandbox::startup::generate_startup_script;
use skiff_sandbox::{
    ContainerStatus, Runtime, SandboxManager, SandboxSettings, StatusEvent, Subscription,
};
use std::time::Duration;

/// Print status events until the preview is announced or the project errors
async fn wait_until_settled(subscription: &mut Subscription, limit: Duration) -> Result<String> {
    let settled = tokio::time::timeout(limit, async {
        while let Some(event) = subscription.recv().await {
            match event {
                StatusEvent::ContainerStatus(update) => {
                    println!("  {} {}", status_label(update.status), update.message.dimmed());
                    if update.status == ContainerStatus::Error {
                        return Err(anyhow!(update.message));
                    }
                }
                StatusEvent::PreviewUpdated(preview) => return Ok(preview.url),
                _ => {}
            }
        }
        Err(anyhow!("status stream closed"))
    })
    .await;

    settled.map_err(|_| anyhow!("Sandbox did not settle within {:?}", limit))?
}

fn settle_limit(manager: &SandboxManager) -> Duration {
    manager.settings().ready_timeout * 2
}

pub async fn start_command(
    manager: &SandboxManager,
    project: &str,
    runtime: &str,
    detach: bool,
) -> Result<()> {
    let runtime = Runtime::from_name(runtime);
    println!("🚀 Starting {} sandbox for {}", runtime, project.cyan());

    let mut subscription = manager.subscribe(project);
    let response = manager.start(project, runtime).await?;

    if response.status == ContainerStatus::Running {
        println!("✅ Already running at {}", response.endpoint_url.cyan());
        return Ok(());
    }
    if detach {
        println!("📦 Sandbox is {}", status_label(response.status));
        println!("🔗 {}", response.endpoint_url.cyan());
        return Ok(());
    }

    let url = wait_until_settled(&mut subscription, settle_limit(manager)).await?;
    println!("✅ Running at {}", url.cyan());
    Ok(())
}

pub async fn stop_command(manager: &SandboxManager, project: &str) -> Result<()> {
    let status = manager.stop(project).await?;
    println!("🛑 {} is {}", project.cyan(), status_label(status));
    Ok(())
}

pub async fn restart_command(manager: &SandboxManager, project: &str, detach: bool) -> Result<()> {
    println!("🔄 Recreating sandbox for {}", project.cyan());

    let mut subscription = manager.subscribe(project);
    let status = manager.restart(project).await?;
    if detach {
        println!("📦 Sandbox is {}", status_label(status));
        return Ok(());
    }

    let url = wait_until_settled(&mut subscription, settle_limit(manager)).await?;
    println!("✅ Running at {}", url.cyan());
    Ok(())
}

pub async fn sync_command(manager: &SandboxManager, project: &str) -> Result<()> {
    let report = manager.sync(project).await?;
    if report.has_changes {
        println!(
            "📤 {} file(s) updated in {}",
            report.changed_count.to_string().cyan(),
            project.cyan()
        );
    } else {
        println!("{}", "Already up to date".dimmed());
    }
    Ok(())
}

pub async fn restart_app_command(manager: &SandboxManager, project: &str) -> Result<()> {
    let outcome = manager.restart_app(project).await?;
    println!("🔁 {}", describe_outcome(&outcome));
    Ok(())
}

pub async fn status_command(manager: &SandboxManager, project: &str, json: bool) -> Result<()> {
    let response = manager.status(project).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    println!("{} {}", "Project:".bold(), project);
    println!("{} {}", "Status:".bold(), status_label(response.status));
    println!("{} {}", "Message:".bold(), response.message);
    if let Some(url) = response.endpoint_url {
        println!("{} {}", "URL:".bold(), url.cyan());
    }
    Ok(())
}

pub async fn logs_command(manager: &SandboxManager, project: &str, tail: usize) -> Result<()> {
    let logs = manager
        .logs(project, tail)
        .await
        .with_context(|| format!("Failed to read logs of {}", project))?;
    println!("{}", logs);
    Ok(())
}

pub fn url_command(manager: &SandboxManager, project: &str) -> Result<()> {
    skiff_sandbox::manager::validate_project_id(project)?;
    println!("{}", manager.endpoint_url(project));
    Ok(())
}

pub async fn cleanup_command(
    manager: &SandboxManager,
    project: Option<&str>,
    all: bool,
) -> Result<()> {
    let reports = match (project, all) {
        (_, true) => manager.cleanup_all().await?,
        (Some(project), false) => vec![(project.to_string(), manager.cleanup(project).await?)],
        (None, false) => bail!("Pass a project ID or --all"),
    };

    if reports.is_empty() {
        println!("{}", "No managed sandboxes found".yellow());
        return Ok(());
    }
    println!("{}", cleanup_table(&reports));

    let failures: usize = reports.iter().map(|(_, r)| r.failed.len()).sum();
    if failures > 0 {
        bail!("{} resource(s) could not be removed", failures);
    }
    Ok(())
}

pub async fn watch_command(manager: &SandboxManager, project: &str, interval: u64) -> Result<()> {
    println!(
        "👀 Watching {} (Ctrl+C to stop)",
        project.cyan()
    );
    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
    let mut last: Option<(ContainerStatus, String)> = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = ticker.tick() => {
                let response = manager.status(project).await?;
                let current = (response.status, response.message.clone());
                if last.as_ref() != Some(&current) {
                    println!(
                        "{} {} {}",
                        chrono::Local::now().format("%H:%M:%S").to_string().dimmed(),
                        status_label(response.status),
                        response.message
                    );
                    last = Some(current);
                }
            }
        }
    }
}

pub fn script_command(runtime: &str, settings: &SandboxSettings) -> Result<()> {
    print!("{}", generate_startup_script(Runtime::from_name(runtime), settings));
    Ok(())
}

pub fn runtimes_command() -> Result<()> {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Runtime", "Image", "Detected by"]);
    for runtime in Runtime::ALL {
        table.add_row(vec![
            runtime.as_str().to_string(),
            runtime.image().to_string(),
            runtime.markers().join(", "),
        ]);
    }
    println!("{}", table);
    Ok(())
}
