//! Builder for sandboxed build invocations.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::error::SandboxError;

/// Host directories bound read-only in namespaced mode so the shell and the
/// declared tools can load their shared libraries.
const SYSTEM_RO_DIRS: &[&str] = &["/usr", "/bin", "/sbin", "/lib", "/lib64", "/etc/alternatives"];

/// Locate `bwrap` on the host `PATH`.
pub fn bwrap_available() -> Option<PathBuf> {
    which::which("bwrap").ok()
}

/// Builder for one `sh -c` build invocation.
///
/// The resulting process sees a cleared environment: only the variables set
/// through [`env`](Self::env), `PATH` made of [`path_dirs`](Self::path_dirs),
/// `HOME`/`TMPDIR` pointing into the scratch directory, and fixed
/// reproducibility variables.
#[derive(Debug, Clone)]
pub struct SandboxCommand {
    script: String,
    shell: PathBuf,
    workdir: Option<PathBuf>,
    scratch: Option<PathBuf>,
    env: BTreeMap<String, String>,
    path_dirs: Vec<PathBuf>,
    ro_paths: Vec<PathBuf>,
    rw_paths: Vec<PathBuf>,
    timeout: Option<Duration>,
    namespaced: bool,
}

impl SandboxCommand {
    /// A command running `script` through `/bin/sh -c`.
    pub fn new(script: &str) -> Self {
        Self {
            script: script.to_owned(),
            shell: PathBuf::from("/bin/sh"),
            workdir: None,
            scratch: None,
            env: BTreeMap::new(),
            path_dirs: Vec::new(),
            ro_paths: Vec::new(),
            rw_paths: Vec::new(),
            timeout: None,
            namespaced: false,
        }
    }

    pub fn workdir(mut self, dir: &Path) -> Self {
        self.workdir = Some(dir.to_path_buf());
        self
    }

    /// Directory used for `HOME` and `TMPDIR`.
    pub fn scratch(mut self, dir: &Path) -> Self {
        self.scratch = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn path_dirs(mut self, dirs: &[PathBuf]) -> Self {
        self.path_dirs = dirs.to_vec();
        self
    }

    /// Paths the build may read (dependency outputs, packages, toolchains).
    pub fn ro_path(mut self, path: &Path) -> Self {
        self.ro_paths.push(path.to_path_buf());
        self
    }

    /// Paths the build may write (its working copy and output directory).
    pub fn rw_path(mut self, path: &Path) -> Self {
        self.rw_paths.push(path.to_path_buf());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run inside a `bwrap` mount and network namespace.
    pub fn namespaced(mut self, enabled: bool) -> Self {
        self.namespaced = enabled;
        self
    }

    pub fn timeout_value(&self) -> Option<Duration> {
        self.timeout
    }

    /// The value `PATH` takes inside the build.
    pub fn path_var(&self) -> String {
        self.path_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":")
    }

    /// The full environment the build process starts with.
    pub fn effective_env(&self) -> BTreeMap<String, String> {
        let mut vars = self.env.clone();
        vars.insert("PATH".to_owned(), self.path_var());
        if let Some(scratch) = &self.scratch {
            let scratch = scratch.display().to_string();
            vars.insert("HOME".to_owned(), scratch.clone());
            vars.insert("TMPDIR".to_owned(), scratch);
        }
        vars.insert("SOURCE_DATE_EPOCH".to_owned(), "0".to_owned());
        vars.insert("TZ".to_owned(), "UTC".to_owned());
        vars.insert("LC_ALL".to_owned(), "C".to_owned());
        vars
    }

    /// Program and argument list, without executing.
    ///
    /// # Errors
    /// Returns an error if no working directory is set, or namespaced mode is
    /// requested and `bwrap` is not installed.
    pub fn build_args(&self) -> Result<(PathBuf, Vec<OsString>), SandboxError> {
        let Some(workdir) = &self.workdir else {
            return Err(SandboxError::NoWorkdir);
        };

        if !self.namespaced {
            let args = vec![OsString::from("-c"), OsString::from(&self.script)];
            return Ok((self.shell.clone(), args));
        }

        let bwrap = bwrap_available().ok_or(SandboxError::Unavailable)?;
        let mut args: Vec<OsString> = [
            "--unshare-all",
            "--die-with-parent",
            "--proc",
            "/proc",
            "--dev",
            "/dev",
            "--tmpfs",
            "/tmp",
        ]
        .iter()
        .map(OsString::from)
        .collect();

        for dir in SYSTEM_RO_DIRS {
            args.push("--ro-bind-try".into());
            args.push((*dir).into());
            args.push((*dir).into());
        }
        for dir in self.path_dirs.iter().chain(&self.ro_paths) {
            args.push("--ro-bind-try".into());
            args.push(dir.into());
            args.push(dir.into());
        }
        for dir in self.rw_paths.iter().chain(&self.scratch) {
            args.push("--bind".into());
            args.push(dir.into());
            args.push(dir.into());
        }
        args.push("--chdir".into());
        args.push(workdir.into());
        args.push("--".into());
        args.push(self.shell.clone().into());
        args.push("-c".into());
        args.push(OsString::from(&self.script));

        Ok((bwrap, args))
    }

    /// Build the [`Command`], with stdin closed and a cleared environment.
    /// Output redirection is left to the caller.
    ///
    /// # Errors
    /// See [`build_args`](Self::build_args).
    pub fn to_command(&self) -> Result<Command, SandboxError> {
        let (program, args) = self.build_args()?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(self.effective_env())
            .stdin(Stdio::null());
        if let Some(workdir) = &self.workdir {
            cmd.current_dir(workdir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        Ok(cmd)
    }
}
