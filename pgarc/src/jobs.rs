//! Pipelined background job launching. Spawns an external
//! helper (typically `gzip` or a similar pipe-friendly executable) with its
//! stdin or stdout available for the caller to bridge, without a bespoke
//! exec shim — `std::process::Command` with `Stdio::piped()` already gives
//! us everything the original's fork-then-exec wrapper provided.

use std::io;
use std::process::{Child, Command, ExitStatus, Stdio};

use pgarc_utils::RoleContext;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("failed to spawn {program:?}: {source}")]
    Spawn { program: String, #[source] source: io::Error },
    #[error("failed to wait on {program:?}: {source}")]
    Wait { program: String, #[source] source: io::Error },
}

pub type Result<T> = std::result::Result<T, JobError>;

/// Which direction the pipe runs: the helper's stdin is fed by us
/// (`FeedIn`, e.g. piping plaintext into `gzip -c`), or its stdout is read
/// by us (`DrainOut`, e.g. reading compressed bytes back out).
pub enum PipeDirection {
    FeedIn,
    DrainOut,
}

/// Spawns `program` with `args`, returning the child with the requested
/// side of its pipe left open for the caller to read or write, and the
/// `RoleContext` that a Worker Registry child sub-slot should be tagged
/// with (`WorkerChild` — the launching process remains `Worker` or
/// `Launcher` and is unaffected).
pub fn spawn_piped(program: &str, args: &[&str], direction: PipeDirection) -> Result<(Child, RoleContext)> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    match direction {
        PipeDirection::FeedIn => {
            cmd.stdin(Stdio::piped());
        }
        PipeDirection::DrainOut => {
            cmd.stdout(Stdio::piped());
        }
    }
    let child = cmd.spawn().map_err(|source| JobError::Spawn { program: program.to_string(), source })?;
    info!(program, pid = child.id(), "spawned piped job");
    Ok((child, RoleContext::WorkerChild))
}

/// Waits for `child` to exit. Per the job-control contract:
/// the caller is responsible for draining/feeding the open pipe end before
/// calling this, or the helper may deadlock on a full pipe buffer.
pub fn wait(mut child: Child, program: &str) -> Result<ExitStatus> {
    child.wait().map_err(|source| JobError::Wait { program: program.to_string(), source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn spawn_piped_feed_in_roundtrips_through_cat() {
        let (mut child, role) = spawn_piped("cat", &[], PipeDirection::FeedIn).unwrap();
        assert_eq!(role, RoleContext::WorkerChild);
        {
            let stdin = child.stdin.as_mut().unwrap();
            stdin.write_all(b"hello from pgarc").unwrap();
        }
        child.stdin.take();
        let status = wait(child, "cat").unwrap();
        assert!(status.success());
    }

    #[test]
    fn spawn_piped_drain_out_reads_child_stdout() {
        let (mut child, _role) = spawn_piped("echo", &["hi"], PipeDirection::DrainOut).unwrap();
        let mut out = String::new();
        child.stdout.take().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out.trim(), "hi");
    }
}
