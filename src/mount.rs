//! Disk-image mount lifecycle, layered on a session's exec channel.
//!
//! A mount walks Publishing -> Mounting -> Verifying -> Completed, or
//! diverts to Failed at whichever step breaks; phases never move backward.
//! Publishing asks the backup appliance to export the selected disk image
//! over NFS, Mounting attaches the export locally, Verifying confirms the
//! mountpoint actually took. Nothing is rolled back on failure; cleanup is
//! an explicit `unmount`, which is best-effort and always removes the
//! record.
//!
//! Records are owned by their session and die with it: a disconnect or a
//! keepalive teardown fails every non-terminal record before the session
//! goes away.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::SessionError;
use crate::session::Session;
use crate::types::ExecOutput;

/// Phases of one mount operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountPhase {
    Publishing,
    Mounting,
    Verifying,
    Completed,
    Failed,
}

impl MountPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Publishing => 0,
            Self::Mounting => 1,
            Self::Verifying => 2,
            Self::Completed => 3,
            Self::Failed => 4,
        }
    }

    /// Phases only advance forward or divert to Failed.
    pub fn can_advance_to(self, next: MountPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Self::Failed || next.rank() == self.rank() + 1
    }
}

/// Tracking record for one disk-image mount.
#[derive(Debug, Clone, Serialize)]
pub struct MountRecord {
    pub mount_path: String,
    pub vm_name: String,
    pub disk_selector: String,
    pub phase: MountPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// RFC3339, set when the record was created.
    pub started_at: String,
}

impl MountRecord {
    fn new(mount_path: &str, vm_name: &str, disk_selector: &str) -> Self {
        Self {
            mount_path: mount_path.to_string(),
            vm_name: vm_name.to_string(),
            disk_selector: disk_selector.to_string(),
            phase: MountPhase::Publishing,
            last_error: None,
            started_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Single-quote a string for the remote shell (`'` becomes `'\''`).
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub(crate) fn publish_command(vm_name: &str, disk_selector: &str) -> String {
    format!(
        "vproxy-ctl publish --vm {} --disk {}",
        shell_quote(vm_name),
        shell_quote(disk_selector)
    )
}

pub(crate) fn mount_command(vm_name: &str, disk_selector: &str, mount_path: &str) -> String {
    format!(
        "mkdir -p {path} && mount -t nfs -o ro,nolock localhost:/vproxy/{vm}/{disk} {path}",
        path = shell_quote(mount_path),
        vm = vm_name,
        disk = disk_selector,
    )
}

pub(crate) fn verify_command(mount_path: &str) -> String {
    format!("mountpoint -q {}", shell_quote(mount_path))
}

pub(crate) fn unmount_command(mount_path: &str) -> String {
    format!("umount -l {}", shell_quote(mount_path))
}

fn step_error(result: &Result<ExecOutput, SessionError>) -> Option<String> {
    match result {
        Ok(output) if output.success() => None,
        Ok(output) => {
            let stderr = output.stderr.trim();
            if stderr.is_empty() {
                Some(format!("command exited with status {}", output.exit_code))
            } else {
                Some(stderr.to_string())
            }
        }
        Err(e) => Some(e.to_string()),
    }
}

impl Session {
    fn set_mount_phase(&self, mount_path: &str, next: MountPhase, error: Option<String>) {
        if let Some(mut record) = self.mounts.get_mut(mount_path) {
            if record.phase.can_advance_to(next) {
                record.phase = next;
                record.last_error = error;
            }
        }
    }

    fn mount_snapshot(&self, mount_path: &str) -> Option<MountRecord> {
        self.mounts.get(mount_path).map(|e| e.value().clone())
    }

    /// Drive a disk-image mount through publish, mount, and verify.
    ///
    /// Returns the final record: `Completed` when every step succeeded,
    /// `Failed` with `last_error` populated when one broke. Earlier steps
    /// are not rolled back on failure.
    pub async fn mount(
        &self,
        vm_name: &str,
        disk_selector: &str,
        mount_path: &str,
    ) -> Result<MountRecord, SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected {
                identity: self.identity().clone(),
            });
        }
        // The slot is claimed through the entry API so two racing callers
        // can never both pass the in-progress check: one reserves, the
        // other sees a non-terminal record and bails.
        match self.mounts.entry(mount_path.to_string()) {
            Entry::Occupied(mut slot) => {
                if !slot.get().phase.is_terminal() {
                    return Err(SessionError::Exec {
                        identity: self.identity().clone(),
                        message: format!("mount already in progress at {mount_path}"),
                    });
                }
                // Terminal leftovers are replaced by the new attempt
                slot.insert(MountRecord::new(mount_path, vm_name, disk_selector));
            }
            Entry::Vacant(slot) => {
                slot.insert(MountRecord::new(mount_path, vm_name, disk_selector));
            }
        }
        info!(identity = %self.identity(), mount_path, vm_name, "mount started");

        let steps: [(String, MountPhase); 3] = [
            (publish_command(vm_name, disk_selector), MountPhase::Mounting),
            (
                mount_command(vm_name, disk_selector, mount_path),
                MountPhase::Verifying,
            ),
            (verify_command(mount_path), MountPhase::Completed),
        ];

        for (command, next_phase) in steps {
            let result = self.run(&command).await;
            if let Some(error) = step_error(&result) {
                warn!(identity = %self.identity(), mount_path, error, "mount step failed");
                self.set_mount_phase(mount_path, MountPhase::Failed, Some(error));
                // The record survives for inspection; the caller decides
                // whether to unmount.
                return self.mount_snapshot(mount_path).ok_or_else(|| {
                    SessionError::MountNotFound {
                        identity: self.identity().clone(),
                        mount_path: mount_path.to_string(),
                    }
                });
            }
            self.set_mount_phase(mount_path, next_phase, None);
        }

        info!(identity = %self.identity(), mount_path, "mount completed");
        self.mount_snapshot(mount_path)
            .ok_or_else(|| SessionError::MountNotFound {
                identity: self.identity().clone(),
                mount_path: mount_path.to_string(),
            })
    }

    /// Best-effort unmount. The record must exist; the record is removed
    /// whatever the remote command says, since leaving a stale entry helps
    /// nobody.
    pub async fn unmount(&self, mount_path: &str) -> Result<(), SessionError> {
        if !self.mounts.contains_key(mount_path) {
            return Err(SessionError::MountNotFound {
                identity: self.identity().clone(),
                mount_path: mount_path.to_string(),
            });
        }

        match self.run(&unmount_command(mount_path)).await {
            Ok(output) if output.success() => {
                info!(identity = %self.identity(), mount_path, "unmounted");
            }
            Ok(output) => {
                warn!(
                    identity = %self.identity(),
                    mount_path,
                    exit_code = output.exit_code,
                    "unmount command failed, removing record anyway"
                );
            }
            Err(e) => {
                warn!(
                    identity = %self.identity(),
                    mount_path,
                    error = %e,
                    "unmount errored, removing record anyway"
                );
            }
        }

        self.mounts.remove(mount_path);
        Ok(())
    }

    /// Snapshot of every mount record on this session.
    pub fn list_mounts(&self) -> Vec<MountRecord> {
        self.mounts.iter().map(|e| e.value().clone()).collect()
    }

    /// Invalidate every non-terminal mount, used when the session goes
    /// away underneath them.
    pub(crate) fn fail_all_mounts(&self, reason: &str) {
        for mut entry in self.mounts.iter_mut() {
            if !entry.phase.is_terminal() {
                entry.phase = MountPhase::Failed;
                entry.last_error = Some(reason.to_string());
            }
        }
    }
}

/// A fresh record in Publishing, for tests that need one mid-flight.
#[cfg(test)]
pub(crate) fn test_record(mount_path: &str) -> MountRecord {
    MountRecord::new(mount_path, "vm-test", "disk-0")
}

#[cfg(test)]
mod tests {
    use super::*;

    mod phases {
        use super::*;

        #[test]
        fn test_forward_only() {
            assert!(MountPhase::Publishing.can_advance_to(MountPhase::Mounting));
            assert!(MountPhase::Mounting.can_advance_to(MountPhase::Verifying));
            assert!(MountPhase::Verifying.can_advance_to(MountPhase::Completed));
        }

        #[test]
        fn test_no_regression() {
            assert!(!MountPhase::Verifying.can_advance_to(MountPhase::Publishing));
            assert!(!MountPhase::Mounting.can_advance_to(MountPhase::Mounting));
            assert!(!MountPhase::Verifying.can_advance_to(MountPhase::Mounting));
        }

        #[test]
        fn test_no_skipping() {
            assert!(!MountPhase::Publishing.can_advance_to(MountPhase::Verifying));
            assert!(!MountPhase::Publishing.can_advance_to(MountPhase::Completed));
        }

        #[test]
        fn test_any_active_phase_can_fail() {
            assert!(MountPhase::Publishing.can_advance_to(MountPhase::Failed));
            assert!(MountPhase::Mounting.can_advance_to(MountPhase::Failed));
            assert!(MountPhase::Verifying.can_advance_to(MountPhase::Failed));
        }

        #[test]
        fn test_terminal_phases_stay_put() {
            assert!(!MountPhase::Completed.can_advance_to(MountPhase::Failed));
            assert!(!MountPhase::Failed.can_advance_to(MountPhase::Completed));
        }
    }

    mod commands {
        use super::*;

        #[test]
        fn test_shell_quote_plain() {
            assert_eq!(shell_quote("/mnt/vm1"), "'/mnt/vm1'");
        }

        #[test]
        fn test_shell_quote_embedded_quote() {
            assert_eq!(shell_quote("it's"), r"'it'\''s'");
        }

        #[test]
        fn test_publish_command_quotes_arguments() {
            let cmd = publish_command("vm one", "scsi0:1");
            assert_eq!(cmd, "vproxy-ctl publish --vm 'vm one' --disk 'scsi0:1'");
        }

        #[test]
        fn test_verify_uses_mountpoint() {
            assert_eq!(verify_command("/mnt/vm1"), "mountpoint -q '/mnt/vm1'");
        }

        #[test]
        fn test_unmount_is_lazy() {
            assert_eq!(unmount_command("/mnt/vm1"), "umount -l '/mnt/vm1'");
        }
    }

    mod lifecycle {
        use super::*;
        use std::time::Duration;

        use crate::session::Session;
        use crate::testutil::{connection_parameters, exec_ok, MockTransport};
        use crate::types::ExecOutput;

        fn session_with(transport: std::sync::Arc<MockTransport>) -> Session {
            Session::new(connection_parameters("host-a"), Box::new(transport))
        }

        #[tokio::test]
        async fn test_happy_path_completes() {
            let transport = MockTransport::ok();
            let session = session_with(transport.clone());

            let record = session.mount("vm1", "disk-0", "/mnt/vm1").await.unwrap();
            assert_eq!(record.phase, MountPhase::Completed);
            assert!(record.last_error.is_none());

            let commands = transport.commands();
            assert_eq!(commands.len(), 3);
            assert!(commands[0].starts_with("vproxy-ctl publish"));
            assert!(commands[1].contains("mount -t nfs"));
            assert!(commands[2].starts_with("mountpoint -q"));
        }

        #[tokio::test]
        async fn test_verify_failure_yields_failed_record() {
            let transport = MockTransport::ok();
            transport.push_output(exec_ok());
            transport.push_output(exec_ok());
            transport.push_output(ExecOutput {
                exit_code: 32,
                stdout: String::new(),
                stderr: "not a mountpoint".into(),
            });
            let session = session_with(transport.clone());

            let record = session.mount("vm1", "disk-0", "/mnt/vm1").await.unwrap();
            assert_eq!(record.phase, MountPhase::Failed);
            assert_eq!(record.last_error.as_deref(), Some("not a mountpoint"));

            // A later unmount still removes the record.
            session.unmount("/mnt/vm1").await.unwrap();
            assert!(session.list_mounts().is_empty());
        }

        #[tokio::test]
        async fn test_publish_failure_stops_early() {
            let transport = MockTransport::ok();
            transport.push_output(ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "no such vm".into(),
            });
            let session = session_with(transport.clone());

            let record = session.mount("ghost", "disk-0", "/mnt/ghost").await.unwrap();
            assert_eq!(record.phase, MountPhase::Failed);
            assert_eq!(record.last_error.as_deref(), Some("no such vm"));
            // Only the publish command was issued
            assert_eq!(transport.commands().len(), 1);
        }

        #[tokio::test]
        async fn test_unmount_unknown_path_errors() {
            let session = session_with(MockTransport::ok());
            let err = session.unmount("/mnt/nothing").await.unwrap_err();
            assert!(matches!(err, SessionError::MountNotFound { .. }));
        }

        #[tokio::test]
        async fn test_unmount_removes_record_despite_command_failure() {
            let transport = MockTransport::ok();
            let session = session_with(transport.clone());
            session.mount("vm1", "disk-0", "/mnt/vm1").await.unwrap();

            transport.push_output(ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "target is busy".into(),
            });
            session.unmount("/mnt/vm1").await.unwrap();
            assert!(session.list_mounts().is_empty());
        }

        #[tokio::test]
        async fn test_concurrent_mount_at_same_path_rejected() {
            let transport = MockTransport::ok();
            let session = session_with(transport.clone());
            session.mount("vm1", "disk-0", "/mnt/vm1").await.unwrap();

            // Completed records may be replaced...
            assert!(session.mount("vm1", "disk-0", "/mnt/vm1").await.is_ok());

            // ...but an in-flight one may not. Simulate by inserting a
            // non-terminal record directly.
            session.mounts.insert(
                "/mnt/busy".to_string(),
                MountRecord::new("/mnt/busy", "vm2", "disk-1"),
            );
            let err = session.mount("vm2", "disk-1", "/mnt/busy").await.unwrap_err();
            assert!(matches!(err, SessionError::Exec { .. }));
        }

        #[tokio::test(start_paused = true)]
        async fn test_racing_mount_neither_resets_nor_duplicates() {
            let transport = MockTransport::ok();
            transport.set_delay(Duration::from_millis(50));
            let session = std::sync::Arc::new(session_with(transport.clone()));

            let first = {
                let session = session.clone();
                tokio::spawn(async move { session.mount("vm1", "disk-0", "/mnt/vm1").await })
            };
            // Let the first caller claim the slot and start publishing.
            tokio::time::sleep(Duration::from_millis(10)).await;

            let phase_before = session.mounts.get("/mnt/vm1").unwrap().phase;
            let err = session.mount("vm1", "disk-0", "/mnt/vm1").await.unwrap_err();
            assert!(matches!(err, SessionError::Exec { .. }));
            // The loser did not clobber the winner's record.
            assert_eq!(session.mounts.get("/mnt/vm1").unwrap().phase, phase_before);

            let record = first.await.unwrap().unwrap();
            assert_eq!(record.phase, MountPhase::Completed);
            // Exactly one set of mount commands went over the wire.
            assert_eq!(transport.commands().len(), 3);
        }

        #[tokio::test]
        async fn test_fail_all_mounts_spares_terminal_records() {
            let transport = MockTransport::ok();
            let session = session_with(transport.clone());
            session.mount("vm1", "disk-0", "/mnt/vm1").await.unwrap();
            session.mounts.insert(
                "/mnt/pending".to_string(),
                MountRecord::new("/mnt/pending", "vm2", "disk-1"),
            );

            session.fail_all_mounts("session torn down");

            let mounts = session.list_mounts();
            let completed = mounts.iter().find(|m| m.mount_path == "/mnt/vm1").unwrap();
            let pending = mounts.iter().find(|m| m.mount_path == "/mnt/pending").unwrap();
            assert_eq!(completed.phase, MountPhase::Completed);
            assert_eq!(pending.phase, MountPhase::Failed);
            assert_eq!(pending.last_error.as_deref(), Some("session torn down"));
        }

        #[tokio::test]
        async fn test_mount_requires_connected_session() {
            let transport = MockTransport::ok();
            let session = session_with(transport.clone());
            session.mark_failed("link dropped");

            let err = session.mount("vm1", "disk-0", "/mnt/vm1").await.unwrap_err();
            assert!(matches!(err, SessionError::NotConnected { .. }));
            assert!(transport.commands().is_empty());
        }
    }
}
