// ABOUTME: In-sandbox application restart by signalling the detected app process
// ABOUTME: Falls back to a reload broadcast, then to a detached relaunch; never returns an error

use crate::error::Result;
use crate::executor::RemoteExecutor;
use crate::resources::ResourceController;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Lists `pid<TAB>cmdline` for every process, using /proc so busybox images without ps work.
pub const PROCESS_LISTING_SCRIPT: &str = r#"for dir in /proc/[0-9]*; do
  pid="${dir#/proc/}"
  [ "$pid" = "$$" ] && continue
  [ -r "$dir/cmdline" ] || continue
  cmd="$(tr '\000' ' ' < "$dir/cmdline" 2>/dev/null)"
  [ -n "$cmd" ] && printf '%s\t%s\n' "$pid" "$cmd"
done
exit 0"#;

/// Sends HUP to interpreter processes other than the supervisor and its shells.
pub const BROADCAST_SCRIPT: &str = r#"for dir in /proc/[0-9]*; do
  pid="${dir#/proc/}"
  [ "$pid" = "1" ] && continue
  [ "$pid" = "$$" ] && continue
  cmd="$(tr '\000' ' ' < "$dir/cmdline" 2>/dev/null)"
  case "$cmd" in
    "sh "*|"/bin/sh "*) continue ;;
    *node*|*python*|*ruby*|*php*|*java*|*"go run"*) kill -HUP "$pid" 2>/dev/null && echo "$pid" ;;
  esac
done
exit 0"#;

/// Relaunches the recorded start command as a detached process.
pub const RECOVERY_SCRIPT: &str = r#"if [ -s /tmp/skiff/start-command ]; then
  cd /workspace && nohup sh -c "$(cat /tmp/skiff/start-command)" > /tmp/skiff/recovery.log 2>&1 &
  echo relaunched
else
  echo "no start command recorded" >&2
  exit 1
fi"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Signal {
    Term,
    Hup,
    Int,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Term => "TERM",
            Signal::Hup => "HUP",
            Signal::Int => "INT",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Matcher {
    /// Every fragment appears in the command line
    All(&'static [&'static str]),
    /// The program's basename starts with this name
    Program(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessSignature {
    pub framework: &'static str,
    matcher: Matcher,
    pub signal: Signal,
}

const fn sig(framework: &'static str, matcher: Matcher, signal: Signal) -> ProcessSignature {
    ProcessSignature {
        framework,
        matcher,
        signal,
    }
}

/// Most specific first
pub const SIGNATURES: &[ProcessSignature] = &[
    sig("next", Matcher::All(&["next", "dev"]), Signal::Term),
    sig("nuxt", Matcher::All(&["nuxt", "dev"]), Signal::Term),
    sig("vite", Matcher::All(&["vite"]), Signal::Term),
    sig("create-react-app", Matcher::All(&["react-scripts"]), Signal::Term),
    sig("angular", Matcher::All(&["ng", "serve"]), Signal::Term),
    sig("nodemon", Matcher::All(&["nodemon"]), Signal::Term),
    sig("django", Matcher::All(&["manage.py", "runserver"]), Signal::Term),
    sig("uvicorn", Matcher::All(&["uvicorn"]), Signal::Term),
    sig("gunicorn", Matcher::All(&["gunicorn"]), Signal::Hup),
    sig("flask", Matcher::All(&["flask", "run"]), Signal::Term),
    sig("rack", Matcher::All(&["rackup"]), Signal::Term),
    sig("npm", Matcher::All(&["npm", "run"]), Signal::Term),
    sig("npm", Matcher::All(&["npm", "start"]), Signal::Term),
    sig("yarn", Matcher::Program("yarn"), Signal::Term),
    sig("pnpm", Matcher::Program("pnpm"), Signal::Term),
    sig("node", Matcher::Program("node"), Signal::Term),
    sig("python", Matcher::Program("python"), Signal::Term),
    sig("go", Matcher::All(&["go", "run"]), Signal::Term),
    sig("php", Matcher::All(&["php", "-S"]), Signal::Term),
    sig("ruby", Matcher::Program("ruby"), Signal::Term),
    sig("java", Matcher::Program("java"), Signal::Term),
];

impl ProcessSignature {
    pub fn matches(&self, cmdline: &str) -> bool {
        match self.matcher {
            Matcher::All(fragments) => {
                let words: Vec<&str> = cmdline.split_whitespace().collect();
                fragments.iter().all(|fragment| {
                    words.iter().any(|word| {
                        *word == *fragment || word.rsplit('/').next() == Some(*fragment)
                    })
                })
            }
            Matcher::Program(name) => cmdline
                .split_whitespace()
                .next()
                .and_then(|program| program.rsplit('/').next())
                .is_some_and(|base| base.starts_with(name)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub cmdline: String,
}

/// Parse `pid<TAB>cmdline` lines, dropping pid 1 and shell wrappers
pub fn parse_process_listing(listing: &str) -> Vec<ProcessEntry> {
    listing
        .lines()
        .filter_map(|line| {
            let (pid, cmdline) = line.split_once('\t')?;
            let pid = pid.trim().parse::<u32>().ok()?;
            let cmdline = cmdline.trim();
            if pid == 1
                || cmdline.is_empty()
                || cmdline.starts_with("sh -c")
                || cmdline.starts_with("/bin/sh -c")
            {
                return None;
            }
            Some(ProcessEntry {
                pid,
                cmdline: cmdline.to_string(),
            })
        })
        .collect()
}

/// First signature, in priority order, that matches any process
pub fn select_target(processes: &[ProcessEntry]) -> Option<(&'static ProcessSignature, u32)> {
    SIGNATURES.iter().find_map(|signature| {
        processes
            .iter()
            .find(|p| signature.matches(&p.cmdline))
            .map(|p| (signature, p.pid))
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum RestartOutcome {
    /// The app process was signalled and the supervisor relaunches it
    Signalled {
        framework: String,
        pid: u32,
        signal: Signal,
    },
    /// No known process matched; reload broadcast sent
    Broadcast,
    /// The restart sequence failed and a detached relaunch was started
    Recovered,
    /// The restart sequence failed and the sandbox was not running
    Abandoned,
}

pub struct AppRestartController {
    executor: RemoteExecutor,
    resources: Arc<ResourceController>,
    restart_grace: Duration,
}

fn shell(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

impl AppRestartController {
    pub fn new(
        executor: RemoteExecutor,
        resources: Arc<ResourceController>,
        restart_grace: Duration,
    ) -> Self {
        Self {
            executor,
            resources,
            restart_grace,
        }
    }

    /// Restart the running application. Failures are logged and absorbed.
    pub async fn restart_app(&self, project_id: &str) -> RestartOutcome {
        match self.signal_app(project_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Restart of project {} failed: {}", project_id, e);
                self.recover(project_id).await
            }
        }
    }

    async fn signal_app(&self, project_id: &str) -> Result<RestartOutcome> {
        let listing = self
            .executor
            .exec(project_id, &shell(PROCESS_LISTING_SCRIPT))
            .await?;
        let processes = parse_process_listing(&listing);

        let outcome = match select_target(&processes) {
            Some((signature, pid)) => {
                info!(
                    "Restarting {} app in project {} (pid {}, SIG{})",
                    signature.framework,
                    project_id,
                    pid,
                    signature.signal.as_str()
                );
                self.executor
                    .exec(
                        project_id,
                        &[
                            "kill".to_string(),
                            format!("-{}", signature.signal.as_str()),
                            pid.to_string(),
                        ],
                    )
                    .await?;
                RestartOutcome::Signalled {
                    framework: signature.framework.to_string(),
                    pid,
                    signal: signature.signal,
                }
            }
            None => {
                info!(
                    "No known app process in project {}, broadcasting SIGHUP",
                    project_id
                );
                self.executor
                    .exec(project_id, &shell(BROADCAST_SCRIPT))
                    .await?;
                RestartOutcome::Broadcast
            }
        };

        tokio::time::sleep(self.restart_grace).await;
        Ok(outcome)
    }

    async fn recover(&self, project_id: &str) -> RestartOutcome {
        match self.resources.get_sandbox_status(project_id).await {
            Ok(observed) if observed.is_running() => {
                info!("Relaunching start command in project {}", project_id);
                let executor = self.executor.clone();
                let project_id = project_id.to_string();
                tokio::spawn(async move {
                    if let Err(e) = executor.exec(&project_id, &shell(RECOVERY_SCRIPT)).await {
                        warn!("Relaunch in project {} failed: {}", project_id, e);
                    }
                });
                RestartOutcome::Recovered
            }
            Ok(_) => {
                warn!(
                    "Sandbox for project {} is not running, skipping relaunch",
                    project_id
                );
                RestartOutcome::Abandoned
            }
            Err(e) => {
                error!("Could not check sandbox of project {}: {}", project_id, e);
                RestartOutcome::Abandoned
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(rows: &[(u32, &str)]) -> Vec<ProcessEntry> {
        rows.iter()
            .map(|(pid, cmdline)| ProcessEntry {
                pid: *pid,
                cmdline: cmdline.to_string(),
            })
            .collect()
    }

    #[test]
    fn test_parse_listing_drops_supervisor_and_wrappers() {
        let listing = "1\tsh /scripts/startup.sh\n\
                       12\tsh -c npx next dev -H 0.0.0.0 -p 3000\n\
                       13\tnode /workspace/node_modules/.bin/next dev -H 0.0.0.0\n\
                       garbage line\n";
        let parsed = parse_process_listing(listing);
        assert_eq!(parsed, entries(&[(13, "node /workspace/node_modules/.bin/next dev -H 0.0.0.0")]));
    }

    #[test]
    fn test_most_specific_signature_wins() {
        let processes = entries(&[
            (20, "node /workspace/server.js"),
            (21, "node /workspace/node_modules/.bin/vite --host 0.0.0.0"),
        ]);
        let (signature, pid) = select_target(&processes).unwrap();
        assert_eq!(signature.framework, "vite");
        assert_eq!(pid, 21);
    }

    #[test]
    fn test_signature_table_matches_common_commands() {
        let cases = [
            ("python manage.py runserver 0.0.0.0:3000", "django"),
            ("/usr/local/bin/python /usr/local/bin/uvicorn main:app", "uvicorn"),
            ("gunicorn app:app", "gunicorn"),
            ("/usr/local/bin/python3 /usr/local/bin/flask --app app run", "flask"),
            ("npm run dev", "npm"),
            ("node index.js", "node"),
            ("python3 app.py", "python"),
            ("go run .", "go"),
            ("php -S 0.0.0.0:3000 -t /workspace", "php"),
            ("ruby app.rb", "ruby"),
            ("java Main.java", "java"),
        ];
        for (cmdline, framework) in cases {
            let processes = entries(&[(50, cmdline)]);
            let (signature, _) = select_target(&processes)
                .unwrap_or_else(|| panic!("no signature for {}", cmdline));
            assert_eq!(signature.framework, framework, "{}", cmdline);
        }
    }

    #[test]
    fn test_gunicorn_reloads_with_hup() {
        let processes = entries(&[(7, "gunicorn app:app")]);
        let (signature, _) = select_target(&processes).unwrap();
        assert_eq!(signature.signal, Signal::Hup);
    }

    #[test]
    fn test_unknown_processes_do_not_match() {
        let processes = entries(&[(9, "/usr/sbin/crond -f"), (10, "tail -f /dev/null")]);
        assert!(select_target(&processes).is_none());
    }
}
