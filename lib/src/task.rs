use std::{
    ffi::OsStr,
    io::Write,
    process::{Command, Stdio},
};

use anyhow::{Context, Result};

pub(crate) struct Task {
    description: String,
    quiet: bool,
    cmd: Command,
}

impl Task {
    pub(crate) fn new(description: impl AsRef<str>, exe: impl AsRef<str>) -> Self {
        Self::new_cmd(description, Command::new(exe.as_ref()))
    }

    pub(crate) fn new_cmd(description: impl AsRef<str>, mut cmd: Command) -> Self {
        let description = description.as_ref().to_string();
        // Default to noninteractive
        cmd.stdin(Stdio::null());
        Self {
            description,
            quiet: false,
            cmd,
        }
    }

    pub(crate) fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Let the child prompt on our terminal.
    pub(crate) fn interactive(mut self) -> Self {
        self.cmd.stdin(Stdio::inherit());
        self
    }

    pub(crate) fn args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cmd.args(args);
        self
    }

    /// Run the command, returning an error if the command does not exit successfully.
    pub(crate) fn run(self) -> Result<()> {
        self.run_with_stdin_buf(None)
    }

    /// Like [`run()`], but feed `stdin` to the child when provided.
    pub(crate) fn run_with_stdin_buf(self, stdin: Option<&[u8]>) -> Result<()> {
        let description = self.description;
        let mut cmd = self.cmd;
        if !self.quiet {
            println!("{description}");
        }
        tracing::debug!("exec: {cmd:?}");
        if stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Spawning {description} failed"))?;
        // The child may exit without reading all of its input; it is waited
        // for regardless, and its exit status takes precedence.
        let written = match stdin {
            Some(buf) => {
                // SAFETY: We piped stdin above
                let mut childin = child.stdin.take().unwrap();
                // Closing stdin (on drop) signals end of input
                childin.write_all(buf)
            }
            None => Ok(()),
        };
        let st = child
            .wait()
            .with_context(|| format!("Executing {description} failed"))?;
        if !st.success() {
            match written {
                Ok(()) => anyhow::bail!("Task {description} failed: {st:?}"),
                Err(e) => anyhow::bail!("Task {description} failed: {st:?} (writing stdin: {e})"),
            }
        }
        written.with_context(|| format!("Writing stdin of {description}"))?;
        Ok(())
    }
}
