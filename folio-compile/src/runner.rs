//! External compiler invocation.
//!
//! A job compiles inside its project owner's directory. The source is
//! written over the target file, then the toolchain runs a fixed number of
//! passes no matter what earlier passes reported; every pass appends its
//! output to the job's own `.jobs/<job_id>/<stem>.compile.log`. Only the
//! presence of `<stem>.pdf` afterwards decides success, and that PDF is
//! copied next to the job's log so later runs of the same file cannot
//! clobber it.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use folio_core::store::resolve_within;
use folio_core::ProjectStore;

use crate::error::CompileError;
use crate::job::{CompileJob, JobId};

/// Per-job directory under the resource directory.
pub const JOBS_DIR: &str = ".jobs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Latex,
    Typst,
}

impl SourceKind {
    pub fn of(file_name: &str) -> Option<Self> {
        let extension = Path::new(file_name).extension()?.to_str()?;
        if extension.eq_ignore_ascii_case("tex") {
            Some(SourceKind::Latex)
        } else if extension.eq_ignore_ascii_case("typ") {
            Some(SourceKind::Typst)
        } else {
            None
        }
    }
}

/// Whether `file_name` names something the compile service accepts.
pub fn is_source_file(file_name: &str) -> bool {
    SourceKind::of(file_name).is_some()
}

/// Paths used by one compile run.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub dir: PathBuf,
    /// Source path relative to `dir`, as handed to the compiler.
    pub file_name: String,
    pub kind: SourceKind,
    pub source: PathBuf,
    /// Where the compiler writes its PDF. Shared by every run of the file.
    pub artifact: PathBuf,
    /// Log the compiler writes next to the source.
    pub native_log: PathBuf,
    /// Holds everything that belongs to this job alone.
    pub job_dir: PathBuf,
    pub log: PathBuf,
    pub kept_artifact: PathBuf,
    pub kept_native_log: PathBuf,
}

impl Workspace {
    pub fn new(dir: PathBuf, file_name: &str, job: JobId) -> Result<Self, CompileError> {
        let kind = SourceKind::of(file_name)
            .ok_or_else(|| CompileError::UnsupportedSource(file_name.to_string()))?;
        let source = resolve_within(&dir, file_name)?;
        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| CompileError::UnsupportedSource(file_name.to_string()))?
            .to_string();

        let job_dir = dir.join(JOBS_DIR).join(job.to_string());
        Ok(Self {
            artifact: dir.join(format!("{stem}.pdf")),
            native_log: dir.join(format!("{stem}.log")),
            log: job_dir.join(format!("{stem}.compile.log")),
            kept_artifact: job_dir.join(format!("{stem}.pdf")),
            kept_native_log: job_dir.join(format!("{stem}.log")),
            job_dir,
            file_name: file_name.to_string(),
            kind,
            source,
            dir,
        })
    }

    pub fn artifact_name(&self) -> String {
        self.artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Captured result of one compiler pass.
#[derive(Debug, Clone, Default)]
pub struct PassOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[async_trait]
pub trait Toolchain: Send + Sync {
    fn name(&self) -> &str;

    fn passes(&self) -> usize;

    /// Run pass `pass` (1-based). An `Err` means the compiler could not be
    /// started at all.
    async fn run_pass(&self, workspace: &Workspace, pass: usize) -> io::Result<PassOutput>;
}

/// A compiler binary run as a child process. The child is killed if the
/// pass future is dropped, which is how the compile timeout stops it.
pub struct ProcessToolchain {
    name: String,
    program: PathBuf,
    kind: SourceKind,
    passes: usize,
}

impl ProcessToolchain {
    /// pdflatex-compatible engine; three passes settle references.
    pub fn latex(program: impl Into<PathBuf>) -> Self {
        Self {
            name: "latex".into(),
            program: program.into(),
            kind: SourceKind::Latex,
            passes: 3,
        }
    }

    pub fn typst(program: impl Into<PathBuf>) -> Self {
        Self {
            name: "typst".into(),
            program: program.into(),
            kind: SourceKind::Typst,
            passes: 1,
        }
    }

    pub fn with_passes(mut self, passes: usize) -> Self {
        self.passes = passes.max(1);
        self
    }

    fn args(&self, workspace: &Workspace) -> Vec<String> {
        match self.kind {
            SourceKind::Latex => vec![
                "-interaction=nonstopmode".into(),
                workspace.file_name.clone(),
            ],
            SourceKind::Typst => vec![
                "compile".into(),
                workspace.file_name.clone(),
                workspace.artifact_name(),
            ],
        }
    }
}

#[async_trait]
impl Toolchain for ProcessToolchain {
    fn name(&self) -> &str {
        &self.name
    }

    fn passes(&self) -> usize {
        self.passes
    }

    async fn run_pass(&self, workspace: &Workspace, pass: usize) -> io::Result<PassOutput> {
        log::debug!(
            "Running {} pass {pass}/{} in {}",
            self.name,
            self.passes,
            workspace.dir.display()
        );
        let output = Command::new(&self.program)
            .args(self.args(workspace))
            .current_dir(&workspace.dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(PassOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ToolchainConfig {
    pub latex_bin: PathBuf,
    pub typst_bin: PathBuf,
    pub latex_passes: usize,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            latex_bin: PathBuf::from("pdflatex"),
            typst_bin: PathBuf::from("typst"),
            latex_passes: 3,
        }
    }
}

/// Toolchain per source kind.
#[derive(Clone)]
pub struct Toolchains {
    latex: Arc<dyn Toolchain>,
    typst: Arc<dyn Toolchain>,
}

impl Toolchains {
    pub fn new(latex: Arc<dyn Toolchain>, typst: Arc<dyn Toolchain>) -> Self {
        Self { latex, typst }
    }

    pub fn from_config(config: &ToolchainConfig) -> Self {
        Self::new(
            Arc::new(ProcessToolchain::latex(&config.latex_bin).with_passes(config.latex_passes)),
            Arc::new(ProcessToolchain::typst(&config.typst_bin)),
        )
    }

    pub fn for_kind(&self, kind: SourceKind) -> &Arc<dyn Toolchain> {
        match kind {
            SourceKind::Latex => &self.latex,
            SourceKind::Typst => &self.typst,
        }
    }
}

pub struct CompileRunner {
    store: Arc<dyn ProjectStore>,
    toolchains: Toolchains,
}

impl CompileRunner {
    pub fn new(store: Arc<dyn ProjectStore>, toolchains: Toolchains) -> Self {
        Self { store, toolchains }
    }

    /// Resolve the owner's directory and write the job's source into it.
    ///
    /// Creates the job's log and removes the compiler's previous PDF, so the
    /// success check only sees output of this run. Earlier jobs keep their
    /// own copies.
    pub async fn prepare(&self, job: &CompileJob) -> Result<Workspace, CompileError> {
        let owner = self.store.resolve_resource_owner(&job.resource_id).await?;
        let dir = self
            .store
            .resolve_resource_directory(&owner, &job.resource_id)
            .await?;
        let workspace = Workspace::new(dir, &job.file_name, job.id)?;

        if let Some(parent) = workspace.source.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&workspace.source, &job.content).await?;
        fs::create_dir_all(&workspace.job_dir).await?;
        fs::write(&workspace.log, "").await?;
        match fs::remove_file(&workspace.artifact).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(workspace)
    }

    /// Run every pass and return the job's copy of the artifact if one was
    /// produced.
    pub async fn run(&self, workspace: &Workspace) -> Result<PathBuf, CompileError> {
        let toolchain = self.toolchains.for_kind(workspace.kind);
        let passes = toolchain.passes();

        for pass in 1..=passes {
            let section = match toolchain.run_pass(workspace, pass).await {
                Ok(output) => {
                    if !output.success {
                        log::warn!(
                            "{} pass {pass}/{passes} for {} exited with {:?}",
                            toolchain.name(),
                            workspace.source.display(),
                            output.code
                        );
                    }
                    format_pass(toolchain.name(), pass, &output)
                }
                Err(e) => {
                    log::error!("Could not start {} pass {pass}: {e}", toolchain.name());
                    format!("=== {} pass {pass} ===\nfailed to start: {e}\n", toolchain.name())
                }
            };
            append_log(&workspace.log, &section).await?;
        }

        if let Err(e) = keep_copy(&workspace.native_log, &workspace.kept_native_log).await {
            log::warn!("Could not keep {}: {e}", workspace.native_log.display());
        }

        if fs::try_exists(&workspace.artifact).await? {
            fs::copy(&workspace.artifact, &workspace.kept_artifact).await?;
            Ok(workspace.kept_artifact.clone())
        } else {
            append_log(&workspace.log, "=== no output produced ===\n").await?;
            Err(CompileError::NoArtifact)
        }
    }

    /// Append a line to the cumulative log, e.g. on timeout.
    pub async fn note(&self, workspace: &Workspace, message: &str) -> Result<(), CompileError> {
        append_log(&workspace.log, &format!("=== {message} ===\n")).await
    }
}

fn format_pass(name: &str, pass: usize, output: &PassOutput) -> String {
    let code = output
        .code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    format!(
        "=== {name} pass {pass} (exit {code}) ===\n{}\n{}\n",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

/// Copy `from` to `to` if `from` exists.
async fn keep_copy(from: &Path, to: &Path) -> io::Result<()> {
    match fs::copy(from, to).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

async fn append_log(path: &Path, text: &str) -> Result<(), CompileError> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(text.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
