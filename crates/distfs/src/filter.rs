//! Content transforms applied to every file read through the mount.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{bail, Context as _};
use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::FsError;

/// Synchronous, pure content transform. Runs on the blocking pool.
pub trait Filter: Send + Sync {
    /// Transform the raw content of the source file at `path`.
    fn apply(&self, path: &Path, raw: Bytes) -> anyhow::Result<Bytes>;

    /// Content served in place of a failed transform. Must be deterministic
    /// for a given error so repeated reads agree.
    fn fallback(&self, path: &Path, error: &FsError) -> Bytes {
        let _ = path;
        Bytes::from(format!("{}\n", error))
    }
}

impl<F> Filter for F
where
    F: Fn(&Path, Bytes) -> anyhow::Result<Bytes> + Send + Sync,
{
    fn apply(&self, path: &Path, raw: Bytes) -> anyhow::Result<Bytes> {
        self(path, raw)
    }
}

/// Passes content through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityFilter;

impl Filter for IdentityFilter {
    fn apply(&self, _path: &Path, raw: Bytes) -> anyhow::Result<Bytes> {
        Ok(raw)
    }
}

/// Apply `filter`, turning any failure into the filter's fallback content.
pub fn apply_or_fallback(filter: &dyn Filter, path: &Path, raw: Bytes) -> Bytes {
    match filter.apply(path, raw) {
        Ok(out) => out,
        Err(e) => {
            let err = FsError::TransformFailure {
                path: path.display().to_string(),
                reason: format!("{:#}", e),
            };
            warn!("{}", err);
            filter.fallback(path, &err)
        }
    }
}

/// Pipes file content through an external program.
///
/// The raw bytes go to the program's stdin and its stdout becomes the
/// served content. Any `{path}` argument is replaced by the source path.
/// Files whose extension is not in `extensions` pass through unchanged; an
/// empty list filters every file.
#[derive(Debug, Clone)]
pub struct CommandFilter {
    program: String,
    args: Vec<String>,
    extensions: Vec<String>,
}

impl CommandFilter {
    /// Run `argv` for files with one of `extensions`, or every file when
    /// `extensions` is empty. Fails on an empty `argv`.
    pub fn new(argv: &[String], extensions: &[String]) -> anyhow::Result<Self> {
        let Some((program, args)) = argv.split_first() else {
            bail!("filter command is empty");
        };
        Ok(CommandFilter {
            program: program.clone(),
            args: args.to_vec(),
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_string())
                .collect(),
        })
    }

    /// Whether `path` is filtered by this command.
    pub fn matches(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| self.extensions.iter().any(|want| want == ext))
            .unwrap_or(false)
    }
}

impl Filter for CommandFilter {
    fn apply(&self, path: &Path, raw: Bytes) -> anyhow::Result<Bytes> {
        if !self.matches(path) {
            return Ok(raw);
        }

        let path_arg = path.display().to_string();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace("{path}", &path_arg))
            .collect();
        debug!("filter {} {:?} for {}", self.program, args, path_arg);

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning {}", self.program))?;

        // Feed stdin from a separate thread so a large output cannot block
        // the child while we are still writing.
        let mut stdin = child.stdin.take().context("filter stdin unavailable")?;
        let writer = std::thread::spawn(move || stdin.write_all(&raw));

        let output = child
            .wait_with_output()
            .with_context(|| format!("waiting for {}", self.program))?;
        match writer.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => return Err(e).context("writing filter stdin"),
            Err(_) => bail!("filter stdin writer panicked"),
        }

        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(Bytes::from(output.stdout))
    }
}
