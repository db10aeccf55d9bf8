//! Output line classification for kubectl and socat

use std::sync::LazyLock;

use regex::Regex;

/// "Unable to listen on port 8080: ..."
static PORT_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bport (\d{1,5})\b").expect("valid regex"));

/// "127.0.0.1:8080", "[::1]:8080", "localhost:8080"
static SOCKET_ADDR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\d{1,3}(?:\.\d{1,3}){3}|\[[0-9A-Fa-f:]*\]|localhost):(\d{1,5})\b")
        .expect("valid regex")
});

/// kubectl prints this once the listener is up
pub fn is_forward_ready(line: &str) -> bool {
    line.trim_start().starts_with("Forwarding from")
}

pub fn is_port_conflict(line: &str) -> bool {
    line.to_ascii_lowercase().contains("address already in use")
}

/// Best-effort port extraction from a bind error line
pub fn extract_port(line: &str) -> Option<u16> {
    PORT_WORD_RE
        .captures(line)
        .or_else(|| SOCKET_ADDR_RE.captures(line))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok())
        .filter(|port| *port != 0)
}

/// Lines that should be flagged as errors in the connection log
pub fn looks_like_error(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.contains("error") || lower.contains("unable to") || lower.contains("failed")
}

/// PIDs printed by `lsof -t`
pub fn parse_pid_list(output: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .filter(|pid| *pid > 0)
        .collect()
}
