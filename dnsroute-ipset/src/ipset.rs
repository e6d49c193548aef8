//! `ipset` command-line backend
//!
//! Each operation is one invocation of the tool, bounded by a timeout and
//! killed if it overruns. Failures are classified from the tool's stderr so
//! that "not a member" stays distinguishable from a broken command.

use std::net::IpAddr;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::{validate_set_name, AddressSet, IpSetError, Result};

/// Default per-invocation timeout
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Set type and family used by [`AddressSet::create`]
const SET_TYPE: &str = "hash:ip";
const SET_FAMILY: &str = "inet";

/// [`AddressSet`] backed by the `ipset` binary
///
/// Sets hold IPv4 host addresses (`hash:ip family inet`).
#[derive(Debug, Clone)]
pub struct IpsetCommand {
    program: String,
    timeout: Duration,
    maxelem: Option<u32>,
}

impl Default for IpsetCommand {
    fn default() -> Self {
        Self::new("ipset")
    }
}

impl IpsetCommand {
    /// Create a backend invoking `program`
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            maxelem: None,
        }
    }

    /// Bound every invocation by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Capacity of sets created by [`AddressSet::create`]; the tool's
    /// default when `None`
    pub fn with_maxelem(mut self, maxelem: Option<u32>) -> Self {
        self.maxelem = maxelem;
        self
    }

    fn create_args(&self, setname: &str) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            setname.to_string(),
            SET_TYPE.to_string(),
            "family".to_string(),
            SET_FAMILY.to_string(),
        ];
        if let Some(maxelem) = self.maxelem {
            args.push("maxelem".to_string());
            args.push(maxelem.to_string());
        }
        args.push("-exist".to_string());
        args
    }

    fn check(&self, setname: &str, addr: &IpAddr) -> Result<()> {
        validate_set_name(setname)?;
        if !addr.is_ipv4() {
            return Err(IpSetError::InvalidAddressFamily(*addr));
        }
        Ok(())
    }

    fn render(&self, args: &[String]) -> String {
        let mut command = self.program.clone();
        for arg in args {
            command.push(' ');
            command.push_str(arg);
        }
        command
    }

    async fn run(&self, args: Vec<String>) -> Result<Output> {
        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => {
                log::trace!("{} -> {}", self.render(&args), output.status);
                Ok(output)
            }
            Ok(Err(e)) => Err(IpSetError::Spawn(e)),
            Err(_) => {
                log::warn!("`{}` timed out after {:?}", self.render(&args), self.timeout);
                Err(IpSetError::Timeout(self.timeout))
            }
        }
    }

    fn failure(&self, setname: &str, args: &[String], output: &Output) -> IpSetError {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if set_missing(&stderr) {
            return IpSetError::SetNotFound(setname.to_string());
        }
        IpSetError::CommandFailed {
            command: self.render(args),
            status: output.status.to_string(),
            stderr,
        }
    }
}

/// The named set itself is absent
fn set_missing(stderr: &str) -> bool {
    stderr.contains("does not exist")
}

/// The element is absent from an existing set
fn element_missing(stderr: &str) -> bool {
    stderr.contains("is NOT in set") || stderr.contains("it's not added")
}

#[async_trait]
impl AddressSet for IpsetCommand {
    async fn create(&self, setname: &str) -> Result<()> {
        validate_set_name(setname)?;

        let args = self.create_args(setname);
        let output = self.run(args.clone()).await?;
        if output.status.success() {
            log::debug!("ipset {} ready", setname);
            Ok(())
        } else {
            Err(self.failure(setname, &args, &output))
        }
    }

    async fn add(&self, setname: &str, addr: IpAddr) -> Result<()> {
        self.check(setname, &addr)?;

        let args = vec![
            "add".to_string(),
            setname.to_string(),
            addr.to_string(),
            "-exist".to_string(),
        ];
        let output = self.run(args.clone()).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(self.failure(setname, &args, &output))
        }
    }

    async fn remove(&self, setname: &str, addr: IpAddr) -> Result<bool> {
        self.check(setname, &addr)?;

        let args = vec!["del".to_string(), setname.to_string(), addr.to_string()];
        let output = self.run(args.clone()).await?;
        if output.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if element_missing(&stderr) {
            Ok(false)
        } else {
            Err(self.failure(setname, &args, &output))
        }
    }

    async fn test(&self, setname: &str, addr: IpAddr) -> Result<bool> {
        self.check(setname, &addr)?;

        let args = vec!["test".to_string(), setname.to_string(), addr.to_string()];
        let output = self.run(args.clone()).await?;
        if output.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if element_missing(&stderr) {
            Ok(false)
        } else {
            Err(self.failure(setname, &args, &output))
        }
    }

    async fn save(&self) -> Result<String> {
        let args = vec!["save".to_string()];
        let output = self.run(args.clone()).await?;
        if !output.status.success() {
            return Err(self.failure("", &args, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_stderr_classification() {
        assert!(element_missing("ipset v7.15: Warning: 10.0.0.1 is NOT in set proxied."));
        assert!(element_missing(
            "ipset v7.15: Element cannot be deleted from the set: it's not added"
        ));
        assert!(!element_missing("ipset v7.15: Syntax error"));

        assert!(set_missing(
            "ipset v7.15: The set with the given name does not exist"
        ));
    }

    #[test]
    fn test_create_args() {
        assert_eq!(
            IpsetCommand::default().create_args("proxied_nl").join(" "),
            "create proxied_nl hash:ip family inet -exist"
        );
        assert_eq!(
            IpsetCommand::default()
                .with_maxelem(Some(262144))
                .create_args("proxied_nl")
                .join(" "),
            "create proxied_nl hash:ip family inet maxelem 262144 -exist"
        );
    }

    #[test]
    fn test_render() {
        let cmd = IpsetCommand::default();
        let args = vec!["add".to_string(), "s".to_string(), "1.2.3.4".to_string()];
        assert_eq!(cmd.render(&args), "ipset add s 1.2.3.4");
    }

    #[tokio::test]
    async fn test_rejects_bad_input_without_spawning() {
        // A program that cannot exist proves no process is started
        let cmd = IpsetCommand::new("/nonexistent/ipset");

        assert!(matches!(
            cmd.add("", v4("1.2.3.4")).await,
            Err(IpSetError::InvalidSetName(_))
        ));
        assert!(matches!(
            cmd.add("proxied", v4("::1")).await,
            Err(IpSetError::InvalidAddressFamily(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let cmd = IpsetCommand::new("/nonexistent/ipset");
        let err = cmd.add("proxied", v4("1.2.3.4")).await.unwrap_err();
        assert!(matches!(err, IpSetError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status_mapping() {
        assert!(IpsetCommand::new("true").add("proxied", v4("1.2.3.4")).await.is_ok());

        let err = IpsetCommand::new("false")
            .add("proxied", v4("1.2.3.4"))
            .await
            .unwrap_err();
        assert!(matches!(err, IpSetError::CommandFailed { .. }));
    }

    #[cfg(unix)]
    mod scripted {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        /// Write a fake ipset that prints `stderr` and exits with `code`
        fn fake_ipset(dir: &Path, stderr: &str, code: i32) -> String {
            let path = dir.join("ipset");
            let script = format!(
                "#!/bin/sh\necho '{}' >&2\nexit {}\n",
                stderr.replace('\'', "'\\''"),
                code
            );
            std::fs::write(&path, script).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.to_string_lossy().into_owned()
        }

        #[tokio::test]
        async fn test_create_passes_maxelem_to_tool() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("ipset");
            let log = dir.path().join("args");
            let script = format!("#!/bin/sh\necho \"$@\" > '{}'\n", log.display());
            std::fs::write(&path, script).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

            IpsetCommand::new(path.to_string_lossy())
                .with_maxelem(Some(1024))
                .create("proxied")
                .await
                .unwrap();

            assert_eq!(
                std::fs::read_to_string(&log).unwrap().trim(),
                "create proxied hash:ip family inet maxelem 1024 -exist"
            );
        }

        #[tokio::test]
        async fn test_not_member_is_false() {
            let dir = tempfile::tempdir().unwrap();
            let cmd = IpsetCommand::new(fake_ipset(
                dir.path(),
                "ipset v7.15: Warning: 10.0.0.1 is NOT in set proxied.",
                1,
            ));

            assert!(!cmd.test("proxied", v4("10.0.0.1")).await.unwrap());
        }

        #[tokio::test]
        async fn test_remove_non_member_is_false() {
            let dir = tempfile::tempdir().unwrap();
            let cmd = IpsetCommand::new(fake_ipset(
                dir.path(),
                "ipset v7.15: Element cannot be deleted from the set: it's not added",
                1,
            ));

            assert!(!cmd.remove("proxied", v4("10.0.0.1")).await.unwrap());
        }

        #[tokio::test]
        async fn test_missing_set_is_set_not_found() {
            let dir = tempfile::tempdir().unwrap();
            let cmd = IpsetCommand::new(fake_ipset(
                dir.path(),
                "ipset v7.15: The set with the given name does not exist",
                1,
            ));

            let err = cmd.test("absent", v4("10.0.0.1")).await.unwrap_err();
            assert!(matches!(err, IpSetError::SetNotFound(name) if name == "absent"));
        }

        #[tokio::test]
        async fn test_slow_tool_times_out() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("ipset");
            std::fs::write(&path, "#!/bin/sh\nsleep 5\n").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

            let cmd = IpsetCommand::new(path.to_string_lossy())
                .with_timeout(Duration::from_millis(200));
            let err = cmd.add("proxied", v4("10.0.0.1")).await.unwrap_err();
            assert!(matches!(err, IpSetError::Timeout(_)));
        }
    }
}
