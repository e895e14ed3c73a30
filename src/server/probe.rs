use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Looks up a running instance of `executable` in the OS process list.
///
/// Used when the panel holds no handle itself, e.g. after the panel restarted while the
/// game server kept running.
#[async_trait]
pub trait ProcessProbe: Send + Sync {
    async fn find(&self, executable: &Path) -> Option<u32>;
}

/// `pgrep -f` on Unix, `tasklist` on Windows.
pub struct SystemProbe;

#[async_trait]
impl ProcessProbe for SystemProbe {
    async fn find(&self, executable: &Path) -> Option<u32> {
        let name = executable.file_name()?.to_string_lossy().into_owned();
        let output = if cfg!(windows) {
            Command::new("tasklist")
                .args(["/FI", &format!("IMAGENAME eq {name}"), "/FO", "CSV", "/NH"])
                .output()
                .await
        } else {
            Command::new("pgrep")
                .args(["-f", &pgrep_pattern(executable)])
                .output()
                .await
        };
        let output = match output {
            Ok(o) if o.status.success() => o,
            Ok(_) => return None,
            Err(e) => {
                debug!(error = %e, "process list query failed");
                return None;
            }
        };
        let text = String::from_utf8_lossy(&output.stdout);
        if cfg!(windows) {
            parse_tasklist(&text, &name)
        } else {
            parse_pgrep(&text)
        }
    }
}

/// Never finds anything.
pub struct NoProbe;

#[async_trait]
impl ProcessProbe for NoProbe {
    async fn find(&self, _executable: &Path) -> Option<u32> {
        None
    }
}

/// Matches `executable` only as the start of a command line, so an editor or `tail`
/// that merely mentions the path is not taken for the server.
fn pgrep_pattern(executable: &Path) -> String {
    let mut pattern = String::from("^");
    for c in executable.to_string_lossy().chars() {
        if r".[]{}()\*+?^$|".contains(c) {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push_str("( |$)");
    pattern
}

fn parse_pgrep(out: &str) -> Option<u32> {
    out.lines().find_map(|l| l.trim().parse().ok())
}

/// Rows look like `"ArmaReforgerServer.exe","1234","Console","1","1,234,567 K"`.
fn parse_tasklist(out: &str, name: &str) -> Option<u32> {
    out.lines()
        .filter(|l| l.contains(name))
        .find_map(|l| l.split("\",\"").nth(1)?.trim_matches('"').parse().ok())
}
