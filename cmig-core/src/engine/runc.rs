// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! runc-backed checkpoint engine.
//!
//! Shells out to the `runc` binary, which in turn drives CRIU.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;

use super::{CheckpointEngine, ContainerExit};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::types::ContainerId;

/// Engine that invokes `runc` for every operation.
#[derive(Debug, Clone)]
pub struct RuncEngine {
    runc_path: PathBuf,
    tcp_established: bool,
    shell_job: bool,
}

impl RuncEngine {
    /// Create a new RuncEngine.
    ///
    /// # Errors
    /// Returns EngineError if no runc binary can be found.
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let runc_path = match &config.runc_path {
            Some(path) if path.exists() => path.clone(),
            Some(_) => return Err(EngineError::BinaryNotFound),
            None => Self::find_runc()?,
        };

        tracing::info!(
            runc_path = %runc_path.display(),
            tcp_established = config.tcp_established,
            shell_job = config.shell_job,
            "Checkpoint engine initialized"
        );

        Ok(Self {
            runc_path,
            tcp_established: config.tcp_established,
            shell_job: config.shell_job,
        })
    }

    /// Find the runc binary.
    fn find_runc() -> Result<PathBuf, EngineError> {
        let candidates = [
            "/usr/sbin/runc",
            "/usr/bin/runc",
            "/sbin/runc",
            "/bin/runc",
            "/usr/local/sbin/runc",
            "/usr/local/bin/runc",
        ];

        for path in candidates {
            let p = PathBuf::from(path);
            if p.exists() {
                return Ok(p);
            }
        }

        if let Ok(output) = Command::new("which").arg("runc").output() {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    return Ok(PathBuf::from(path));
                }
            }
        }

        Err(EngineError::BinaryNotFound)
    }

    fn checkpoint_args(
        &self,
        id: &ContainerId,
        image_path: &Path,
        parent_path: Option<&str>,
        pre_dump: bool,
        leave_running: bool,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["checkpoint".into()];
        if pre_dump {
            args.push("--pre-dump".into());
        }
        args.push("--image-path".into());
        args.push(image_path.as_os_str().to_owned());
        if let Some(parent) = parent_path.filter(|p| !p.is_empty()) {
            args.push("--parent-path".into());
            args.push(parent.into());
        }
        if leave_running && !pre_dump {
            args.push("--leave-running".into());
        }
        if self.shell_job {
            args.push("--shell-job".into());
        }
        if self.tcp_established && !pre_dump {
            args.push("--tcp-established".into());
        }
        args.push(id.as_str().into());
        args
    }

    fn restore_args(&self, id: &ContainerId, image_path: &Path, bundle: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "restore".into(),
            "--image-path".into(),
            image_path.as_os_str().to_owned(),
            "--bundle".into(),
            bundle.as_os_str().to_owned(),
        ];
        if self.shell_job {
            args.push("--shell-job".into());
        }
        if self.tcp_established {
            args.push("--tcp-established".into());
        }
        args.push(id.as_str().into());
        args
    }

    /// Run a short-lived runc command and fail on non-zero exit.
    fn run_checked(
        &self,
        action: &'static str,
        id: &ContainerId,
        args: Vec<OsString>,
    ) -> Result<(), EngineError> {
        let start = Instant::now();
        let output = Command::new(&self.runc_path)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| EngineError::SpawnFailed {
                action,
                reason: format!("Failed to execute runc: {}", e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::CommandFailed {
                action,
                container_id: id.clone(),
                reason: stderr.trim().to_string(),
            });
        }

        tracing::debug!(
            container_id = %id,
            action = action,
            elapsed_ms = start.elapsed().as_millis(),
            "runc command completed"
        );
        Ok(())
    }

    /// Run a container-owning runc command and wait for the container.
    fn run_attached(
        &self,
        action: &'static str,
        args: Vec<OsString>,
    ) -> Result<ContainerExit, EngineError> {
        let status = Command::new(&self.runc_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|e| EngineError::SpawnFailed {
                action,
                reason: format!("Failed to execute runc: {}", e),
            })?;
        Ok(ContainerExit::from_status(status))
    }
}

impl CheckpointEngine for RuncEngine {
    fn run(&self, id: &ContainerId, bundle: &Path) -> Result<ContainerExit, EngineError> {
        tracing::debug!(container_id = %id, bundle = %bundle.display(), "Running container");
        let args: Vec<OsString> = vec![
            "run".into(),
            "--bundle".into(),
            bundle.as_os_str().to_owned(),
            id.as_str().into(),
        ];
        self.run_attached("run", args)
    }

    fn pre_dump(
        &self,
        id: &ContainerId,
        image_path: &Path,
        parent_path: Option<&str>,
    ) -> Result<(), EngineError> {
        tracing::debug!(
            container_id = %id,
            image_path = %image_path.display(),
            parent_path = parent_path.unwrap_or(""),
            "Pre-dumping container"
        );
        let args = self.checkpoint_args(id, image_path, parent_path, true, true);
        self.run_checked("pre-dump", id, args)
    }

    fn dump(
        &self,
        id: &ContainerId,
        image_path: &Path,
        parent_path: Option<&str>,
        leave_running: bool,
    ) -> Result<(), EngineError> {
        tracing::debug!(
            container_id = %id,
            image_path = %image_path.display(),
            parent_path = parent_path.unwrap_or(""),
            leave_running = leave_running,
            "Dumping container"
        );
        let args = self.checkpoint_args(id, image_path, parent_path, false, leave_running);
        self.run_checked("dump", id, args)
    }

    fn restore(
        &self,
        id: &ContainerId,
        image_path: &Path,
        bundle: &Path,
    ) -> Result<ContainerExit, EngineError> {
        tracing::debug!(
            container_id = %id,
            image_path = %image_path.display(),
            bundle = %bundle.display(),
            "Restoring container"
        );
        let args = self.restore_args(id, image_path, bundle);
        self.run_attached("restore", args)
    }

    fn kill(&self, id: &ContainerId) -> Result<(), EngineError> {
        tracing::debug!(container_id = %id, "Killing container");
        let args: Vec<OsString> = vec!["kill".into(), id.as_str().into(), "KILL".into()];
        self.run_checked("kill", id, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(tcp_established: bool) -> RuncEngine {
        RuncEngine {
            runc_path: PathBuf::from("/usr/bin/runc"),
            tcp_established,
            shell_job: true,
        }
    }

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_pre_dump_args() {
        let id = ContainerId::new("box").unwrap();
        let args = strings(engine(true).checkpoint_args(
            &id,
            Path::new("/dumps/p2"),
            Some("../p1"),
            true,
            true,
        ));
        assert_eq!(
            args,
            vec![
                "checkpoint",
                "--pre-dump",
                "--image-path",
                "/dumps/p2",
                "--parent-path",
                "../p1",
                "--shell-job",
                "box"
            ]
        );
    }

    #[test]
    fn test_final_dump_args() {
        let id = ContainerId::new("box").unwrap();
        let args = strings(engine(true).checkpoint_args(
            &id,
            Path::new("/dumps/d4"),
            Some("../p3"),
            false,
            false,
        ));
        assert!(!args.contains(&"--leave-running".to_string()));
        assert!(args.contains(&"--tcp-established".to_string()));
        assert_eq!(args.last().unwrap(), "box");
    }

    #[test]
    fn test_empty_parent_is_omitted() {
        let id = ContainerId::new("box").unwrap();
        let args = strings(engine(false).checkpoint_args(
            &id,
            Path::new("/dumps/p4"),
            Some(""),
            false,
            true,
        ));
        assert!(!args.contains(&"--parent-path".to_string()));
        assert!(args.contains(&"--leave-running".to_string()));
    }

    #[test]
    fn test_restore_args() {
        let id = ContainerId::new("box").unwrap();
        let args = strings(engine(false).restore_args(
            &id,
            Path::new("/dumps/d4"),
            Path::new("/bundles/box"),
        ));
        assert_eq!(
            args,
            vec![
                "restore",
                "--image-path",
                "/dumps/d4",
                "--bundle",
                "/bundles/box",
                "--shell-job",
                "box"
            ]
        );
    }

    #[test]
    fn test_missing_configured_binary() {
        let config = EngineConfig {
            runc_path: Some(PathBuf::from("/nonexistent/runc")),
            tcp_established: false,
            shell_job: true,
        };
        assert!(matches!(
            RuncEngine::new(&config),
            Err(EngineError::BinaryNotFound)
        ));
    }
}
