use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::SupervisorError;
use crate::config::HostMcpConfig;

/// A host-side capability server that drones reach over the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Playwright,
    Ios,
    Clipboard,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 3] = [Self::Playwright, Self::Ios, Self::Clipboard];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Playwright => "playwright",
            Self::Ios => "ios",
            Self::Clipboard => "clipboard",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Playwright => 8931,
            Self::Ios => 8932,
            Self::Clipboard => 8933,
        }
    }

    /// Environment variable that tells containers where to find this server.
    pub fn port_env_var(self) -> &'static str {
        match self {
            Self::Playwright => "HOST_MCP_PLAYWRIGHT_PORT",
            Self::Ios => "HOST_MCP_IOS_PORT",
            Self::Clipboard => "HOST_MCP_CLIPBOARD_PORT",
        }
    }

    /// Node script run for this kind, if it is not launched through npx.
    pub fn script_name(self) -> Option<&'static str> {
        match self {
            Self::Playwright => None,
            Self::Ios => Some("hive-ios-mcp.js"),
            Self::Clipboard => Some("hive-clipboard-mcp.js"),
        }
    }

    pub fn is_supported(self) -> bool {
        match self {
            Self::Playwright => true,
            Self::Ios | Self::Clipboard => cfg!(target_os = "macos"),
        }
    }

    pub fn ensure_supported(self) -> Result<(), SupervisorError> {
        if self.is_supported() {
            Ok(())
        } else {
            Err(SupervisorError::Unsupported { kind: self })
        }
    }

    pub fn launch(
        self,
        config: &HostMcpConfig,
        port: u16,
        scripts: &ScriptLocator,
    ) -> Result<LaunchSpec, SupervisorError> {
        let port = port.to_string();
        match self.script_name() {
            None => {
                let mut args = vec![
                    "@playwright/mcp@latest".to_string(),
                    "--port".to_string(),
                    port,
                    // Containers connect through host.docker.internal.
                    "--host".to_string(),
                    "0.0.0.0".to_string(),
                    "--allowed-hosts".to_string(),
                    "*".to_string(),
                ];
                if let Some(browser) = config.browser.as_deref().filter(|b| !b.is_empty()) {
                    args.push("--browser".to_string());
                    args.push(browser.to_string());
                }
                if config.headless {
                    args.push("--headless".to_string());
                }
                Ok(LaunchSpec::new("npx", args))
            }
            Some(script) => {
                let path = scripts
                    .find(script)
                    .ok_or(SupervisorError::ScriptNotFound(script))?;
                Ok(LaunchSpec::new(
                    "node",
                    vec![path.to_string_lossy().into_owned(), "--port".to_string(), port],
                ))
            }
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "playwright" => Ok(Self::Playwright),
            "ios" => Ok(Self::Ios),
            "clipboard" => Ok(Self::Clipboard),
            other => Err(format!("unknown capability: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

/// Where capability scripts may be installed, searched in order:
/// project `.hive/scripts/mcp`, a development checkout's `scripts/mcp`,
/// `~/.hive/scripts/mcp`, then next to the executable.
#[derive(Debug, Clone)]
pub struct ScriptLocator {
    project_dir: PathBuf,
    home_dir: Option<PathBuf>,
    exe_dir: Option<PathBuf>,
}

impl ScriptLocator {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            home_dir: dirs::home_dir(),
            exe_dir: std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf)),
        }
    }

    pub fn with_dirs(project_dir: impl Into<PathBuf>, home_dir: Option<PathBuf>, exe_dir: Option<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            home_dir,
            exe_dir,
        }
    }

    pub fn candidates(&self, file: &str) -> Vec<PathBuf> {
        let mut paths = vec![
            self.project_dir.join(".hive").join("scripts").join("mcp").join(file),
            self.project_dir.join("scripts").join("mcp").join(file),
        ];
        if let Some(home) = &self.home_dir {
            paths.push(home.join(".hive").join("scripts").join("mcp").join(file));
        }
        if let Some(exe_dir) = &self.exe_dir {
            paths.push(exe_dir.join("scripts").join("mcp").join(file));
            paths.push(exe_dir.join("..").join("share").join("hive").join(file));
        }
        paths
    }

    /// First existing candidate, made absolute when possible.
    pub fn find(&self, file: &str) -> Option<PathBuf> {
        self.candidates(file)
            .into_iter()
            .find(|path| path.exists())
            .map(|path| std::fs::canonicalize(&path).unwrap_or(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "// script").unwrap();
    }

    #[test]
    fn test_defaults_and_parsing() {
        assert_eq!(CapabilityKind::Playwright.default_port(), 8931);
        assert_eq!(CapabilityKind::Ios.default_port(), 8932);
        assert_eq!(CapabilityKind::Clipboard.default_port(), 8933);
        assert_eq!("IOS".parse::<CapabilityKind>().unwrap(), CapabilityKind::Ios);
        assert!("camera".parse::<CapabilityKind>().is_err());
        assert_eq!(
            serde_json::to_string(&CapabilityKind::Clipboard).unwrap(),
            "\"clipboard\""
        );
    }

    #[test]
    fn test_playwright_launch_args() {
        let config = HostMcpConfig {
            enabled: true,
            port: None,
            browser: Some("firefox".to_string()),
            headless: true,
        };
        let scripts = ScriptLocator::with_dirs("/nonexistent", None, None);
        let spec = CapabilityKind::Playwright.launch(&config, 9000, &scripts).unwrap();

        assert_eq!(spec.program, "npx");
        assert_eq!(spec.args[0], "@playwright/mcp@latest");
        assert!(spec.args.windows(2).any(|w| w == ["--port", "9000"]));
        assert!(spec.args.windows(2).any(|w| w == ["--browser", "firefox"]));
        assert_eq!(spec.args.last().map(String::as_str), Some("--headless"));
    }

    #[test]
    fn test_script_lookup_prefers_project() {
        let project = TempDir::new().unwrap();
        let home = TempDir::new().unwrap();
        touch(&home.path().join(".hive/scripts/mcp/hive-ios-mcp.js"));

        let scripts = ScriptLocator::with_dirs(project.path(), Some(home.path().to_path_buf()), None);
        let found = scripts.find("hive-ios-mcp.js").unwrap();
        assert!(found.starts_with(std::fs::canonicalize(home.path()).unwrap()));

        touch(&project.path().join(".hive/scripts/mcp/hive-ios-mcp.js"));
        let found = scripts.find("hive-ios-mcp.js").unwrap();
        assert!(found.starts_with(std::fs::canonicalize(project.path()).unwrap()));
        assert!(found.is_absolute());
    }

    #[test]
    fn test_script_lookup_falls_back_to_exe_share() {
        let exe = TempDir::new().unwrap();
        std::fs::create_dir_all(exe.path().join("bin")).unwrap();
        touch(&exe.path().join("share/hive/hive-clipboard-mcp.js"));

        let scripts = ScriptLocator::with_dirs("/nonexistent", None, Some(exe.path().join("bin")));
        assert!(scripts.find("hive-clipboard-mcp.js").is_some());
        assert!(scripts.find("hive-ios-mcp.js").is_none());
    }

    #[test]
    fn test_missing_script_is_an_error() {
        let scripts = ScriptLocator::with_dirs("/nonexistent", None, None);
        let err = CapabilityKind::Ios
            .launch(&HostMcpConfig::default(), 8932, &scripts)
            .unwrap_err();
        assert!(matches!(err, SupervisorError::ScriptNotFound("hive-ios-mcp.js")));
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_macos_only_kinds_are_gated() {
        assert!(CapabilityKind::Playwright.ensure_supported().is_ok());
        assert!(matches!(
            CapabilityKind::Clipboard.ensure_supported(),
            Err(SupervisorError::Unsupported { kind: CapabilityKind::Clipboard })
        ));
    }
}
