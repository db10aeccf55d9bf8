//! Command lines for the forwarder processes

use std::path::{Path, PathBuf};

use crate::config::ConnectionConfig;
use crate::error::ForwarderError;

/// Common install locations checked when a binary is not on PATH
/// (GUI-launched processes often get a minimal PATH on macOS)
const FALLBACK_BIN_DIRS: &[&str] = &["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin"];

/// Program plus arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Printable command line for logs
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Resolve a binary: custom path, then PATH, then common install dirs
pub fn resolve_binary(name: &str, custom: Option<&Path>) -> Result<PathBuf, ForwarderError> {
    if let Some(path) = custom {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        tracing::warn!(
            "Custom {} path {:?} is not a file, falling back to PATH lookup",
            name,
            path
        );
    }

    if let Ok(path) = which::which(name) {
        return Ok(path);
    }

    FALLBACK_BIN_DIRS
        .iter()
        .map(|dir| Path::new(dir).join(name))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| ForwarderError::BinaryNotFound(name.to_string()))
}

/// `kubectl port-forward -n <ns> <resource> <local>:<remote> --address <bind> [--context <ctx>]`
pub fn port_forward_command(kubectl: &Path, config: &ConnectionConfig) -> CommandSpec {
    let mut args = vec![
        "port-forward".to_string(),
        "-n".to_string(),
        config.namespace.clone(),
        config.resource.clone(),
        format!("{}:{}", config.local_port, config.remote_port),
        "--address".to_string(),
        config.bind_address.clone(),
    ];
    if let Some(context) = &config.context {
        args.push("--context".to_string());
        args.push(context.clone());
    }
    CommandSpec {
        program: kubectl.to_path_buf(),
        args,
    }
}

/// `socat TCP-LISTEN:<proxy>,fork,reuseaddr TCP:127.0.0.1:<local>`
pub fn proxy_command(socat: &Path, config: &ConnectionConfig) -> Result<CommandSpec, ForwarderError> {
    let proxy_port = config.proxy_port.ok_or_else(|| {
        ForwarderError::InvalidConfig(format!("Connection {} has no proxy port", config.name))
    })?;
    Ok(CommandSpec {
        program: socat.to_path_buf(),
        args: vec![
            format!("TCP-LISTEN:{},fork,reuseaddr", proxy_port),
            format!("TCP:127.0.0.1:{}", config.local_port),
        ],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_forward_args() {
        let config = ConnectionConfig::new("pg", "db", "svc/postgres", 15432, 5432)
            .with_context("staging");
        let spec = port_forward_command(Path::new("/usr/local/bin/kubectl"), &config);
        assert_eq!(
            spec.args,
            vec![
                "port-forward",
                "-n",
                "db",
                "svc/postgres",
                "15432:5432",
                "--address",
                "127.0.0.1",
                "--context",
                "staging",
            ]
        );
        assert!(spec.display().starts_with("/usr/local/bin/kubectl port-forward"));
    }

    #[test]
    fn test_proxy_args() {
        let config =
            ConnectionConfig::new("api", "prod", "svc/api", 8080, 80).with_proxy_port(18080);
        let spec = proxy_command(Path::new("socat"), &config).unwrap();
        assert_eq!(
            spec.args,
            vec!["TCP-LISTEN:18080,fork,reuseaddr", "TCP:127.0.0.1:8080"]
        );
    }

    #[test]
    fn test_proxy_requires_port() {
        let config = ConnectionConfig::new("api", "prod", "svc/api", 8080, 80);
        assert!(proxy_command(Path::new("socat"), &config).is_err());
    }

    #[test]
    fn test_resolve_custom_path() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let resolved = resolve_binary("definitely-not-a-real-binary", Some(temp.path())).unwrap();
        assert_eq!(resolved, temp.path());
    }

    #[test]
    fn test_resolve_missing_binary() {
        let err = resolve_binary("definitely-not-a-real-binary-4f2a", None).unwrap_err();
        assert!(matches!(err, ForwarderError::BinaryNotFound(_)));
    }
}
