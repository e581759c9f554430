// src/compile.rs

//! Boundary to the external compiler.
//!
//! The core only needs to know whether a compile succeeded, where the
//! artifact went and which run options and dependencies it recorded.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use regex::{Captures, Regex};
use tokio::process::Command;
use tracing::{debug, info};

use crate::cache::artifact::prepare_output;
use crate::cache::{CacheRecord, DependencyRef, FingerprintStore, project_members_hash};
use crate::config::ConfigFile;
use crate::errors::{Result, TaskhostError};
use crate::fs::FileSystem;
use crate::types::{RunOptions, SourceUnitId};
use crate::workspace::Workspace;

/// Placeholders accepted in `[config].compile_cmd`.
pub const KNOWN_PLACEHOLDERS: &[&str] = &["source", "output", "unit", "root"];

/// A parsed `[config].compile_cmd` template.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    raw: String,
    placeholder: Regex,
}

impl CommandTemplate {
    pub fn parse(raw: &str) -> Result<Self> {
        let placeholder = Regex::new(r"\{(\w+)\}")
            .map_err(|e| TaskhostError::ConfigError(format!("compile_cmd pattern: {e}")))?;
        Ok(Self {
            raw: raw.to_string(),
            placeholder,
        })
    }

    /// Names of all `{placeholder}`s, in order of appearance.
    pub fn placeholders(&self) -> Vec<&str> {
        self.placeholder
            .captures_iter(&self.raw)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect()
    }

    fn render(&self, job: &CompileJob) -> String {
        self.placeholder
            .replace_all(&self.raw, |caps: &Captures<'_>| match &caps[1] {
                "source" => shell_quote(&job.source),
                "output" => shell_quote(&job.artifact),
                "root" => shell_quote(&job.workspace_root),
                "unit" => job.unit.to_string(),
                other => format!("{{{other}}}"),
            })
            .into_owned()
    }
}

/// What the scheduler needs to start a compiled unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledUnit {
    pub unit: SourceUnitId,
    /// Display name, handed to the task as its artifact name.
    pub name: String,
    pub artifact: PathBuf,
    pub options: RunOptions,
}

/// Input of one compile.
#[derive(Debug, Clone)]
pub struct CompileJob {
    pub unit: SourceUnitId,
    pub name: String,
    pub source: PathBuf,
    pub artifact: PathBuf,
    pub explicit_output: bool,
    pub workspace_root: PathBuf,
    pub options: RunOptions,
    pub dependencies: Vec<DependencyRef>,
    pub project_hash: Option<String>,
}

impl CompileJob {
    /// Build the job for `unit` from its config section.
    pub fn plan(
        cfg: &ConfigFile,
        workspace: &dyn Workspace,
        store: &FingerprintStore,
        unit: SourceUnitId,
    ) -> Result<Self> {
        let unit_cfg = cfg.unit(unit).ok_or(TaskhostError::UnknownUnit(unit))?;
        let options = cfg.run_options(unit).ok_or(TaskhostError::UnknownUnit(unit))?;
        let source = workspace
            .file_path(unit)
            .ok_or(TaskhostError::UnknownUnit(unit))?;
        let root = workspace.root().to_path_buf();

        let (artifact, explicit_output) = match &unit_cfg.output {
            Some(out) if out.is_absolute() => (out.clone(), true),
            Some(out) => (root.join(out), true),
            None => (store.default_artifact_path(unit), false),
        };

        let mut dependencies = Vec::new();
        dependencies.extend(unit_cfg.compile_with.iter().map(|id| DependencyRef::CompiledWith(*id)));
        dependencies.extend(unit_cfg.libraries.iter().map(|id| DependencyRef::Library(*id)));
        dependencies.extend(unit_cfg.resources.iter().map(|id| DependencyRef::Resource(*id)));
        dependencies.extend(unit_cfg.files.iter().map(|id| DependencyRef::File(*id)));
        dependencies.extend(unit_cfg.icon.map(DependencyRef::Icon));
        dependencies.extend(unit_cfg.manifest.map(DependencyRef::Manifest));
        dependencies.extend(unit_cfg.sign_key.map(DependencyRef::SigningKey));
        dependencies.extend(unit_cfg.references.iter().cloned().map(DependencyRef::External));

        let project_hash = workspace
            .project_of(unit)
            .map(|p| project_members_hash(p.all_units()));

        Ok(Self {
            unit,
            name: workspace.display_name(unit),
            source,
            artifact,
            explicit_output,
            workspace_root: root,
            options,
            dependencies,
            project_hash,
        })
    }

    /// The record a successful compile of this job would store.
    pub fn expected_record(&self) -> CacheRecord {
        CacheRecord {
            output: self.explicit_output.then(|| self.artifact.clone()),
            options: self.options,
            project_hash: self.project_hash.clone(),
            dependencies: self.dependencies.clone(),
        }
    }
}

/// Result of a successful compile.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub artifact: PathBuf,
    pub explicit_output: bool,
    pub options: RunOptions,
    pub dependencies: Vec<DependencyRef>,
    pub project_hash: Option<String>,
}

impl CompileOutput {
    /// The cache record describing this build.
    pub fn to_record(&self) -> CacheRecord {
        CacheRecord {
            output: self.explicit_output.then(|| self.artifact.clone()),
            options: self.options,
            project_hash: self.project_hash.clone(),
            dependencies: self.dependencies.clone(),
        }
    }

    pub fn compiled_unit(&self, job: &CompileJob) -> CompiledUnit {
        CompiledUnit {
            unit: job.unit,
            name: job.name.clone(),
            artifact: self.artifact.clone(),
            options: self.options,
        }
    }
}

/// Trait abstracting the compiler.
///
/// Production code uses [`CommandCompileStep`]; tests provide their own.
pub trait CompileStep: Send + Sync {
    fn compile<'a>(
        &'a self,
        job: &'a CompileJob,
    ) -> Pin<Box<dyn Future<Output = Result<CompileOutput>> + Send + 'a>>;
}

/// Runs `[config].compile_cmd` through the platform shell, or copies the
/// source file to the artifact path when no command is configured.
#[derive(Debug)]
pub struct CommandCompileStep {
    template: Option<CommandTemplate>,
    fs: Arc<dyn FileSystem>,
}

impl CommandCompileStep {
    pub fn new(template: Option<&str>, fs: Arc<dyn FileSystem>) -> Result<Self> {
        let template = template.map(CommandTemplate::parse).transpose()?;
        Ok(Self { template, fs })
    }

    async fn run(&self, job: &CompileJob) -> anyhow::Result<()> {
        prepare_output(self.fs.as_ref(), &job.artifact)?;

        let Some(template) = &self.template else {
            self.fs.copy(&job.source, &job.artifact)?;
            debug!(unit = %job.unit, artifact = %job.artifact.display(), "copied source as artifact");
            return Ok(());
        };

        if let Some(parent) = job.artifact.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let command_line = template.render(job);
        info!(unit = %job.unit, cmd = %command_line, "compiling");

        let output = shell_command(&command_line)
            .current_dir(&job.workspace_root)
            .stdin(Stdio::null())
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!(unit = %job.unit, "compiler stdout: {}", stdout.trim_end());
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("compiler exited with {}: {}", output.status, stderr.trim_end());
        }
        if !self.fs.is_file(&job.artifact) {
            anyhow::bail!("compiler did not produce {}", job.artifact.display());
        }
        Ok(())
    }
}

impl CompileStep for CommandCompileStep {
    fn compile<'a>(
        &'a self,
        job: &'a CompileJob,
    ) -> Pin<Box<dyn Future<Output = Result<CompileOutput>> + Send + 'a>> {
        Box::pin(async move {
            self.run(job).await.map_err(|e| TaskhostError::Compile {
                unit: job.unit,
                message: format!("{e:#}"),
            })?;

            Ok(CompileOutput {
                artifact: job.artifact.clone(),
                explicit_output: job.explicit_output,
                options: job.options,
                dependencies: job.dependencies.clone(),
                project_hash: job.project_hash.clone(),
            })
        })
    }
}

#[cfg(unix)]
fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

#[cfg(not(unix))]
fn shell_quote(path: &Path) -> String {
    format!("\"{}\"", path.to_string_lossy())
}

#[cfg(unix)]
fn shell_command(command_line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command_line);
    cmd
}

#[cfg(not(unix))]
fn shell_command(command_line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command_line);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::RealFileSystem;

    fn job(root: &Path) -> CompileJob {
        CompileJob {
            unit: SourceUnitId(7),
            name: "hello".into(),
            source: root.join("hello.sh"),
            artifact: root.join("out/7.bin"),
            explicit_output: false,
            workspace_root: root.to_path_buf(),
            options: RunOptions::default(),
            dependencies: vec![],
            project_hash: None,
        }
    }

    #[test]
    fn lists_placeholders_in_order() {
        let template = CommandTemplate::parse("cc {source} -o {output} -DUNIT={unit} {x}").unwrap();
        assert_eq!(template.placeholders(), vec!["source", "output", "unit", "x"]);
    }

    #[cfg(unix)]
    #[test]
    fn renders_quoted_paths() {
        let job = job(Path::new("/my ws"));
        let template = CommandTemplate::parse("cc {source} -o {output} # {unit}").unwrap();
        assert_eq!(
            template.render(&job),
            "cc '/my ws/hello.sh' -o '/my ws/out/7.bin' # 7"
        );
    }

    #[tokio::test]
    async fn without_template_the_source_is_copied() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.sh"), "echo hi").unwrap();
        let step = CommandCompileStep::new(None, Arc::new(RealFileSystem)).unwrap();

        let job = job(dir.path());
        let out = step.compile(&job).await.unwrap();

        assert_eq!(std::fs::read_to_string(&out.artifact).unwrap(), "echo hi");
        assert_eq!(out.to_record().output, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_is_a_compile_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.sh"), "echo hi").unwrap();
        let step = CommandCompileStep::new(
            Some("echo broken >&2; exit 3"),
            Arc::new(RealFileSystem),
        )
        .unwrap();

        let err = step.compile(&job(dir.path())).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("unit 7"), "{msg}");
        assert!(msg.contains("broken"), "{msg}");
    }
}
