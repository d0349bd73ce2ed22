//! Start the consumer as a detached process.
//!
//! The only coupling between the two processes is the handshake: the
//! consumer binds `bind_addr`, producers dial it (retrying while refused),
//! register with their 4-byte index and wait for the ready `done`.

use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};

use crate::error::{SyncError, SyncResult};

/// Command line of a consumer process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    /// Store file the consumer follows
    pub store_path: PathBuf,
    pub bind_addr: String,
    pub n_clients: usize,
    pub fps: u32,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>, store_path: impl Into<PathBuf>, bind_addr: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            store_path: store_path.into(),
            bind_addr: bind_addr.into(),
            n_clients: 1,
            fps: 20,
        }
    }

    /// Arguments passed after the program name.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "--store".to_string(),
            self.store_path.to_string_lossy().into_owned(),
            "--bind".to_string(),
            self.bind_addr.clone(),
            "--clients".to_string(),
            self.n_clients.to_string(),
            "--fps".to_string(),
            self.fps.to_string(),
        ]
    }

    /// Parse a full argument list (program name first), as a consumer
    /// process receives it.
    pub fn from_args<I, S>(args: I) -> SyncResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = args.into_iter().map(Into::into);
        let program = args
            .next()
            .ok_or_else(|| SyncError::Launch("empty argument list".to_string()))?;
        let mut spec = Self::new(program, PathBuf::new(), String::new());
        let mut store = None;
        let mut bind = None;

        while let Some(flag) = args.next() {
            let value = args
                .next()
                .ok_or_else(|| SyncError::Launch(format!("{flag} needs a value")))?;
            match flag.as_str() {
                "--store" => store = Some(PathBuf::from(value)),
                "--bind" => bind = Some(value),
                "--clients" => spec.n_clients = parse_number(&flag, &value)?,
                "--fps" => spec.fps = parse_number(&flag, &value)?,
                other => return Err(SyncError::Launch(format!("unknown argument {other}"))),
            }
        }
        spec.store_path = store.ok_or_else(|| SyncError::Launch("missing --store".to_string()))?;
        spec.bind_addr = bind.ok_or_else(|| SyncError::Launch("missing --bind".to_string()))?;
        Ok(spec)
    }
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: &str) -> SyncResult<T> {
    value
        .parse()
        .map_err(|_| SyncError::Launch(format!("{flag}: '{value}' is not a number")))
}

/// Spawn the consumer. The child keeps running if the handle is dropped.
pub fn spawn_consumer(spec: &LaunchSpec) -> SyncResult<Child> {
    let child = Command::new(&spec.program)
        .args(spec.to_args())
        .stdin(Stdio::null())
        .kill_on_drop(false)
        .spawn()
        .map_err(|e| SyncError::Launch(format!("{}: {e}", spec.program.display())))?;
    log::info!(
        "Launched consumer {} (pid {:?}) on {}",
        spec.program.display(),
        child.id(),
        spec.bind_addr
    );
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_round_trip() {
        let spec = LaunchSpec {
            n_clients: 3,
            fps: 30,
            ..LaunchSpec::new("viewer", "/tmp/run.db", "127.0.0.1:20000")
        };
        let mut argv = vec!["viewer".to_string()];
        argv.extend(spec.to_args());
        assert_eq!(LaunchSpec::from_args(argv).unwrap(), spec);
    }

    #[test]
    fn test_from_args_errors() {
        assert!(LaunchSpec::from_args(Vec::<String>::new()).is_err());
        assert!(LaunchSpec::from_args(["viewer", "--bind", "x"]).is_err());
        assert!(LaunchSpec::from_args(["viewer", "--store", "a.db", "--bind", "x", "--fps"]).is_err());
        assert!(LaunchSpec::from_args(["viewer", "--store", "a.db", "--bind", "x", "--clients", "two"]).is_err());
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let spec = LaunchSpec::new("/nonexistent/stepwise-viewer", "run.db", "127.0.0.1:0");
        let err = spawn_consumer(&spec).unwrap_err();
        assert!(matches!(err, SyncError::Launch(_)));
    }
}
