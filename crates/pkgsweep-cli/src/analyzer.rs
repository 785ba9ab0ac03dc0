use std::path::Path;
use std::process::{Command, Stdio};

use pkgsweep::{AnalysisError, AnalysisOutput, Analyzer, PackageRef};
use tracing::debug;

/// Artifact name for the analyzer's captured stdout.
pub const OUTPUT_ARTIFACT: &str = "analysis.out";

/// Runs an external program against each extracted package.
///
/// The package root is appended as the last argument and the package identity
/// is exported as `PKGSWEEP_PACKAGE` and `PKGSWEEP_VERSION`. Stdout becomes the
/// `analysis.out` artifact; a non-zero exit fails the item with stderr attached.
#[derive(Debug, Clone)]
pub struct CommandAnalyzer {
    program: String,
    args: Vec<String>,
}

impl CommandAnalyzer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Analyzer for CommandAnalyzer {
    fn name(&self) -> &str {
        &self.program
    }

    fn analyze(&self, root: &Path, package: &PackageRef) -> Result<AnalysisOutput, AnalysisError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(root)
            .env("PKGSWEEP_PACKAGE", package.name())
            .env("PKGSWEEP_VERSION", package.version())
            .stdin(Stdio::null())
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AnalysisError::Failed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        debug!(program = %self.program, bytes = output.stdout.len(), "analyzer finished");
        Ok(AnalysisOutput::single(OUTPUT_ARTIFACT, output.stdout))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandAnalyzer {
        CommandAnalyzer::new("sh", vec!["-c".into(), script.into()])
    }

    #[test]
    fn stdout_becomes_the_artifact() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mix.exs"), "[]").unwrap();

        // With `sh -c`, the appended root arrives as $0.
        let output = sh(r#"echo "$PKGSWEEP_PACKAGE@$PKGSWEEP_VERSION"; ls "$0""#)
            .analyze(dir.path(), &PackageRef::new("plug", "1.0.0"))
            .unwrap();

        assert_eq!(output, AnalysisOutput::single(OUTPUT_ARTIFACT, "plug@1.0.0\nmix.exs\n"));
    }

    #[test]
    fn non_zero_exit_is_an_analysis_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = sh("echo broken >&2; exit 3")
            .analyze(dir.path(), &PackageRef::new("plug", "1.0.0"))
            .unwrap_err();

        match err {
            AnalysisError::Failed(message) => assert!(message.contains("broken"), "{message}"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn missing_program_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CommandAnalyzer::new("/nonexistent/pkgsweep-analyzer", vec![])
            .analyze(dir.path(), &PackageRef::new("plug", "1.0.0"))
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Io(_)));
    }
}
