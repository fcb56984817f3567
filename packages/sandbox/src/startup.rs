// ABOUTME: Runtime selection and bootstrap script generation for sandboxes
// ABOUTME: Produces the POSIX sh entrypoint embedded in each project's startup config

use crate::settings::{SandboxSettings, STATE_DIR, WORKDIR};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// File name of the bootstrap script inside the startup config bundle
pub const STARTUP_SCRIPT_FILE: &str = "startup.sh";
/// Where the bootstrap records the command it launched
pub const START_COMMAND_FILE: &str = "/tmp/skiff/start-command";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Node,
    Python,
    Java,
    Go,
    Php,
    Ruby,
}

impl Runtime {
    pub const ALL: [Runtime; 6] = [
        Runtime::Node,
        Runtime::Python,
        Runtime::Java,
        Runtime::Go,
        Runtime::Php,
        Runtime::Ruby,
    ];

    /// Resolve a runtime name or alias, `None` when unrecognized
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "node" | "nodejs" | "javascript" | "typescript" => Some(Runtime::Node),
            "python" | "python3" => Some(Runtime::Python),
            "java" => Some(Runtime::Java),
            "go" | "golang" => Some(Runtime::Go),
            "php" => Some(Runtime::Php),
            "ruby" => Some(Runtime::Ruby),
            _ => None,
        }
    }

    /// Resolve a runtime name. Unknown names fall back to node.
    pub fn from_name(name: &str) -> Self {
        Self::parse(name).unwrap_or_else(|| {
            warn!("Unknown runtime '{}', defaulting to node", name.trim());
            Runtime::Node
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Runtime::Node => "node",
            Runtime::Python => "python",
            Runtime::Java => "java",
            Runtime::Go => "go",
            Runtime::Php => "php",
            Runtime::Ruby => "ruby",
        }
    }

    pub fn image(&self) -> &'static str {
        match self {
            Runtime::Node => "node:18-alpine",
            Runtime::Python => "python:3.11-alpine",
            Runtime::Java => "eclipse-temurin:21-jdk-alpine",
            Runtime::Go => "golang:1.21-alpine",
            Runtime::Php => "php:8.2-cli-alpine",
            Runtime::Ruby => "ruby:3.2-alpine",
        }
    }

    /// Files whose presence means project content has arrived
    pub fn markers(&self) -> &'static [&'static str] {
        self.template().markers
    }

    fn template(&self) -> &'static RuntimeTemplate {
        match self {
            Runtime::Node => &NODE,
            Runtime::Python => &PYTHON,
            Runtime::Java => &JAVA,
            Runtime::Go => &GO,
            Runtime::Php => &PHP,
            Runtime::Ruby => &RUBY,
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve an npm registry preset name or URL.
pub fn resolve_npm_registry(value: &str) -> Option<&str> {
    let value = value.trim();
    match value.to_lowercase().as_str() {
        "npmmirror" | "taobao" => Some("https://registry.npmmirror.com/"),
        "tencent" => Some("https://mirrors.cloud.tencent.com/npm/"),
        "huawei" => Some("https://repo.huaweicloud.com/repository/npm/"),
        "official" | "npm" | "npmjs" => Some("https://registry.npmjs.org/"),
        _ if value.starts_with("https://") || value.starts_with("http://") => Some(value),
        _ => None,
    }
}

const SCRIPT_HEADER_PREFIX: &str = "# Sandbox bootstrap (";

/// Runtime a generated bootstrap script was built for, read from its header line
pub fn script_runtime(script: &str) -> Option<Runtime> {
    script
        .lines()
        .take(3)
        .find_map(|line| line.strip_prefix(SCRIPT_HEADER_PREFIX))
        .and_then(|rest| rest.strip_suffix(')'))
        .and_then(Runtime::parse)
}

struct RuntimeTemplate {
    markers: &'static [&'static str],
    /// Body of `install_deps`
    install: &'static str,
    /// Body of `detect_start`; sets FRAMEWORK and START_CMD
    detect: &'static str,
    /// Body of `use_fallback`; writes a placeholder app and sets START_CMD
    fallback: &'static str,
}

/// Build the bootstrap script for `runtime`.
pub fn generate_startup_script(runtime: Runtime, settings: &SandboxSettings) -> String {
    let template = runtime.template();

    let mut script = String::with_capacity(8 * 1024);
    script.push_str(
        &PREAMBLE
            .replace("@RUNTIME@", runtime.as_str())
            .replace("@WORKDIR@", WORKDIR)
            .replace("@STATE_DIR@", STATE_DIR)
            .replace("@START_COMMAND_FILE@", START_COMMAND_FILE)
            .replace("@PORT@", &settings.app_port.to_string())
            .replace("@WAIT_SECS@", &settings.startup_wait.as_secs().to_string())
            .replace(
                "@BACKOFF_SECS@",
                &settings.supervisor_backoff.as_secs().max(1).to_string(),
            )
            .replace("@MARKERS@", &template.markers.join(" ")),
    );

    if runtime == Runtime::Node {
        if let Some(value) = settings.npm_registry.as_deref() {
            match resolve_npm_registry(value) {
                Some(url) => script.push_str(&NPM_REGISTRY.replace("@REGISTRY@", url)),
                None => warn!("Ignoring unrecognized npm registry '{}'", value),
            }
        }
    }

    script.push_str("\ninstall_deps() {\n");
    script.push_str(template.install);
    script.push_str("}\n\ndetect_start() {\n");
    script.push_str(template.detect);
    script.push_str("}\n\nuse_fallback() {\n");
    script.push_str(template.fallback);
    script.push_str("}\n");
    script.push_str(SUPERVISOR);
    script
}

const PREAMBLE: &str = r#"#!/bin/sh
# Sandbox bootstrap (@RUNTIME@)
set -u

WORKDIR="@WORKDIR@"
STATE_DIR="@STATE_DIR@"
START_COMMAND_FILE="@START_COMMAND_FILE@"
PORT="${PORT:-@PORT@}"
WAIT_SECS=@WAIT_SECS@
BACKOFF_SECS=@BACKOFF_SECS@
MARKERS="@MARKERS@"
export PORT

mkdir -p "$WORKDIR" "$STATE_DIR"
cd "$WORKDIR" || exit 1

log() {
  echo "[bootstrap] $*"
}

has_markers() {
  for marker in $MARKERS; do
    [ -e "$WORKDIR/$marker" ] && return 0
  done
  return 1
}

file_hash() {
  sha256sum "$1" 2>/dev/null | cut -d' ' -f1
}

# Reinstall only when the manifest changed since the last successful install.
install_if_changed() {
  manifest="$1"
  command="$2"
  [ -f "$manifest" ] || return 0
  stamp="$STATE_DIR/$(basename "$manifest").sha256"
  current="$(file_hash "$manifest")"
  if [ -f "$stamp" ] && [ "$(cat "$stamp")" = "$current" ]; then
    log "$manifest unchanged, skipping install"
    return 0
  fi
  log "installing dependencies: $command"
  if sh -c "$command"; then
    echo "$current" > "$stamp"
  else
    log "dependency install failed"
  fi
}

write_placeholder_page() {
  mkdir -p "$STATE_DIR/placeholder"
  cat > "$STATE_DIR/placeholder/index.html" <<'PAGE'
<!doctype html>
<html><head><title>Sandbox ready</title></head>
<body><h1>Sandbox ready</h1><p>Waiting for project files.</p></body></html>
PAGE
}

waited=0
while ! has_markers; do
  if [ "$waited" -ge "$WAIT_SECS" ]; then
    log "no project files after ${WAIT_SECS}s"
    break
  fi
  sleep 1
  waited=$((waited + 1))
done
"#;

const NPM_REGISTRY: &str = r#"
npm config set registry "@REGISTRY@"
npm config set cache /tmp/.npm
npm config set prefer-offline true
npm config set audit false
npm config set fund false
"#;

const SUPERVISOR: &str = r#"
while true; do
  FRAMEWORK=""
  START_CMD=""
  if has_markers; then
    install_deps
    detect_start
  fi
  if [ -z "$START_CMD" ]; then
    FRAMEWORK="fallback"
    use_fallback
  fi
  echo "$START_CMD" > "$START_COMMAND_FILE"
  log "starting $FRAMEWORK: $START_CMD"
  sh -c "$START_CMD"
  log "application exited with $?, restarting in ${BACKOFF_SECS}s"
  sleep "$BACKOFF_SECS"
done
"#;

static NODE: RuntimeTemplate = RuntimeTemplate {
    markers: &["package.json", "server.js", "index.js", "app.js", "index.html"],
    install: r#"  install_if_changed package.json "npm install --no-audit --no-fund"
"#,
    detect: r#"  if [ -f package.json ]; then
    if grep -q '"next"' package.json; then
      FRAMEWORK="next"; START_CMD="npx next dev -H 0.0.0.0 -p $PORT"
    elif grep -q '"nuxt"' package.json; then
      FRAMEWORK="nuxt"; START_CMD="npx nuxt dev --host 0.0.0.0 --port $PORT"
    elif grep -q '"vite"' package.json; then
      FRAMEWORK="vite"; START_CMD="npx vite --host 0.0.0.0 --port $PORT"
    elif grep -q '"react-scripts"' package.json; then
      FRAMEWORK="create-react-app"; START_CMD="HOST=0.0.0.0 BROWSER=none npx react-scripts start"
    elif grep -q '"@angular/cli"' package.json; then
      FRAMEWORK="angular"; START_CMD="npx ng serve --host 0.0.0.0 --port $PORT"
    elif grep -q '"dev"[[:space:]]*:' package.json; then
      FRAMEWORK="npm-dev"; START_CMD="npm run dev"
    elif grep -q '"start"[[:space:]]*:' package.json; then
      FRAMEWORK="npm-start"; START_CMD="npm start"
    fi
  fi
  if [ -z "$START_CMD" ]; then
    for entry in server.js index.js app.js; do
      if [ -f "$entry" ]; then
        FRAMEWORK="node"; START_CMD="node $entry"
        break
      fi
    done
  fi
  if [ -z "$START_CMD" ] && [ -f index.html ]; then
    FRAMEWORK="static"; START_CMD="npx --yes serve -l $PORT ."
  fi
"#,
    fallback: r#"  cat > "$STATE_DIR/fallback.js" <<'APP'
const http = require('http');
const port = process.env.PORT || 3000;
http.createServer((req, res) => {
  res.writeHead(200, { 'Content-Type': 'text/html' });
  res.end('<h1>Sandbox ready</h1><p>Waiting for project files.</p>');
}).listen(port, '0.0.0.0');
APP
  START_CMD="node $STATE_DIR/fallback.js"
"#,
};

static PYTHON: RuntimeTemplate = RuntimeTemplate {
    markers: &["requirements.txt", "manage.py", "app.py", "main.py", "index.html"],
    install: r#"  install_if_changed requirements.txt "pip install --no-cache-dir -r requirements.txt"
"#,
    detect: r#"  if [ -f manage.py ]; then
    FRAMEWORK="django"; START_CMD="python manage.py runserver 0.0.0.0:$PORT"
  elif grep -qiE '^(fastapi|uvicorn)' requirements.txt 2>/dev/null; then
    for module in main app; do
      if [ -f "$module.py" ]; then
        FRAMEWORK="fastapi"; START_CMD="uvicorn $module:app --host 0.0.0.0 --port $PORT --reload"
        break
      fi
    done
  elif grep -qi '^flask' requirements.txt 2>/dev/null; then
    for module in app main; do
      if [ -f "$module.py" ]; then
        FRAMEWORK="flask"; START_CMD="flask --app $module run --host 0.0.0.0 --port $PORT --debug"
        break
      fi
    done
  fi
  if [ -z "$START_CMD" ]; then
    for entry in app.py main.py; do
      if [ -f "$entry" ]; then
        FRAMEWORK="python"; START_CMD="python $entry"
        break
      fi
    done
  fi
  if [ -z "$START_CMD" ] && [ -f index.html ]; then
    FRAMEWORK="static"; START_CMD="python -m http.server $PORT --bind 0.0.0.0"
  fi
"#,
    fallback: r#"  write_placeholder_page
  START_CMD="python -m http.server $PORT --bind 0.0.0.0 --directory $STATE_DIR/placeholder"
"#,
};

static JAVA: RuntimeTemplate = RuntimeTemplate {
    markers: &["pom.xml", "build.gradle", "Main.java", "index.html"],
    install: r#"  if [ -x ./mvnw ]; then
    install_if_changed pom.xml "./mvnw -q dependency:go-offline"
  elif [ -x ./gradlew ]; then
    install_if_changed build.gradle "./gradlew --quiet dependencies"
  fi
"#,
    detect: r#"  if [ -f pom.xml ] && [ -x ./mvnw ]; then
    FRAMEWORK="maven"; START_CMD="./mvnw spring-boot:run -Dspring-boot.run.arguments=--server.port=$PORT"
  elif [ -f build.gradle ] && [ -x ./gradlew ]; then
    FRAMEWORK="gradle"; START_CMD="./gradlew bootRun --args=--server.port=$PORT"
  elif [ -f Main.java ]; then
    FRAMEWORK="java"; START_CMD="java Main.java"
  elif [ -f index.html ]; then
    FRAMEWORK="static"; START_CMD="jwebserver -b 0.0.0.0 -p $PORT -d $WORKDIR"
  fi
"#,
    fallback: r#"  write_placeholder_page
  START_CMD="jwebserver -b 0.0.0.0 -p $PORT -d $STATE_DIR/placeholder"
"#,
};

static GO: RuntimeTemplate = RuntimeTemplate {
    markers: &["go.mod", "main.go"],
    install: r#"  install_if_changed go.mod "go mod download"
"#,
    detect: r#"  if [ -f go.mod ] || [ -f main.go ]; then
    FRAMEWORK="go"; START_CMD="go run ."
  fi
"#,
    fallback: r#"  mkdir -p "$STATE_DIR/fallback"
  cat > "$STATE_DIR/fallback/main.go" <<'APP'
package main

import (
	"fmt"
	"net/http"
	"os"
)

func main() {
	port := os.Getenv("PORT")
	if port == "" {
		port = "3000"
	}
	http.HandleFunc("/", func(w http.ResponseWriter, r *http.Request) {
		fmt.Fprint(w, "<h1>Sandbox ready</h1><p>Waiting for project files.</p>")
	})
	http.ListenAndServe("0.0.0.0:"+port, nil)
}
APP
  START_CMD="go run $STATE_DIR/fallback/main.go"
"#,
};

static PHP: RuntimeTemplate = RuntimeTemplate {
    markers: &["index.php", "composer.json", "index.html"],
    install: r#"  if command -v composer >/dev/null 2>&1; then
    install_if_changed composer.json "composer install --no-interaction"
  fi
"#,
    detect: r#"  if [ -f index.php ] || [ -f index.html ]; then
    FRAMEWORK="php"; START_CMD="php -S 0.0.0.0:$PORT -t $WORKDIR"
  elif [ -f public/index.php ]; then
    FRAMEWORK="php"; START_CMD="php -S 0.0.0.0:$PORT -t $WORKDIR/public"
  fi
"#,
    fallback: r#"  write_placeholder_page
  START_CMD="php -S 0.0.0.0:$PORT -t $STATE_DIR/placeholder"
"#,
};

static RUBY: RuntimeTemplate = RuntimeTemplate {
    markers: &["Gemfile", "config.ru", "app.rb"],
    install: r#"  install_if_changed Gemfile "bundle install"
"#,
    detect: r#"  if [ -f config.ru ]; then
    FRAMEWORK="rack"; START_CMD="bundle exec rackup -o 0.0.0.0 -p $PORT"
  elif [ -f app.rb ]; then
    FRAMEWORK="ruby"; START_CMD="ruby app.rb -o 0.0.0.0 -p $PORT"
  fi
"#,
    fallback: r#"  cat > "$STATE_DIR/fallback.rb" <<'APP'
require 'socket'
server = TCPServer.new('0.0.0.0', Integer(ENV.fetch('PORT', '3000')))
body = '<h1>Sandbox ready</h1><p>Waiting for project files.</p>'
loop do
  client = server.accept
  client.gets
  client.print "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: #{body.bytesize}\r\nConnection: close\r\n\r\n#{body}"
  client.close
end
APP
  START_CMD="ruby $STATE_DIR/fallback.rb"
"#,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_unknown_runtime_defaults_to_node() {
        assert_eq!(Runtime::from_name("cobol"), Runtime::Node);
        assert_eq!(Runtime::from_name("Python"), Runtime::Python);
        assert_eq!(Runtime::from_name("golang"), Runtime::Go);
    }

    #[test]
    fn test_script_header_names_its_runtime() {
        let settings = SandboxSettings::default();
        for runtime in Runtime::ALL {
            let script = generate_startup_script(runtime, &settings);
            assert_eq!(script_runtime(&script), Some(runtime));
        }
        assert_eq!(script_runtime("#!/bin/sh\necho hi\n"), None);
        assert_eq!(script_runtime("#!/bin/sh\n# Sandbox bootstrap (cobol)\n"), None);
    }

    #[test]
    fn test_every_runtime_has_image_and_markers() {
        for runtime in Runtime::ALL {
            assert!(!runtime.image().is_empty());
            assert!(!runtime.markers().is_empty());
            assert_eq!(Runtime::from_name(runtime.as_str()), runtime);
        }
    }

    #[test]
    fn test_script_waits_with_configured_bound() {
        let settings = SandboxSettings {
            startup_wait: Duration::from_secs(42),
            ..SandboxSettings::default()
        };
        let script = generate_startup_script(Runtime::Node, &settings);
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("WAIT_SECS=42"));
        assert!(script.contains("MARKERS=\"package.json server.js index.js app.js index.html\""));
        assert!(script.contains("PORT=\"${PORT:-3000}\""));
    }

    #[test]
    fn test_script_has_hash_gated_install_and_supervisor() {
        for runtime in Runtime::ALL {
            let script = generate_startup_script(runtime, &SandboxSettings::default());
            assert!(script.contains("install_if_changed() {"), "{}", runtime);
            assert!(script.contains(".sha256\""), "{}", runtime);
            assert!(script.contains("use_fallback\n"), "{}", runtime);
            assert!(script.contains("while true; do"), "{}", runtime);
            assert!(script.contains("BACKOFF_SECS=2"), "{}", runtime);
            assert!(script.contains("echo \"$START_CMD\" > \"$START_COMMAND_FILE\""));
            for token in ["@RUNTIME@", "@PORT@", "@WAIT_SECS@", "@MARKERS@", "@STATE_DIR@"] {
                assert!(!script.contains(token), "{} left in {} script", token, runtime);
            }
        }
    }

    #[test]
    fn test_node_framework_detection_order() {
        let script = generate_startup_script(Runtime::Node, &SandboxSettings::default());
        let next = script.find("'\"next\"'").unwrap();
        let vite = script.find("'\"vite\"'").unwrap();
        let dev = script.find("npm run dev").unwrap();
        let entry = script.find("for entry in server.js").unwrap();
        assert!(next < vite && vite < dev && dev < entry);
    }

    #[test]
    fn test_npm_registry_presets() {
        assert_eq!(
            resolve_npm_registry("npmmirror"),
            Some("https://registry.npmmirror.com/")
        );
        assert_eq!(
            resolve_npm_registry("https://npm.internal/"),
            Some("https://npm.internal/")
        );
        assert_eq!(resolve_npm_registry("nowhere"), None);

        let settings = SandboxSettings {
            npm_registry: Some("tencent".to_string()),
            ..SandboxSettings::default()
        };
        let node = generate_startup_script(Runtime::Node, &settings);
        assert!(node.contains("npm config set registry \"https://mirrors.cloud.tencent.com/npm/\""));
        assert!(node.contains("npm config set prefer-offline true"));

        let python = generate_startup_script(Runtime::Python, &settings);
        assert!(!python.contains("npm config"));
    }
}
