//! External capture dissection.

use std::path::Path;

use thiserror::Error;

/// Errors raised by a dissection run. Each one fails only its own file.
#[derive(Error, Debug)]
pub enum DissectError {
    #[error("spawning {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{program} produced non UTF-8 output")]
    Encoding { program: String },
}

/// Produces one text line per packet, fields in the requested order.
pub trait Dissector: Send + Sync + 'static {
    /// Returns the dissector's name for logging.
    fn name(&self) -> &str;

    fn dissect(
        &self,
        capture: &Path,
        fields: &[&str],
        display_filter: &str,
    ) -> impl std::future::Future<Output = Result<Vec<String>, DissectError>> + Send;
}

/// Runs `tshark` in field extraction mode.
#[derive(Debug, Clone)]
pub struct Tshark {
    program: String,
}

impl Tshark {
    /// Creates a new runner for the given executable.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Command line arguments for one capture.
    pub fn args(capture: &Path, fields: &[&str], display_filter: &str) -> Vec<String> {
        let mut args: Vec<String> = ["-n", "-q", "-Tfields"]
            .into_iter()
            .map(String::from)
            .collect();
        for field in fields {
            args.push("-e".to_string());
            args.push((*field).to_string());
        }
        for option in ["header=n", "separator=/s", "occurrence=f"] {
            args.push("-E".to_string());
            args.push(option.to_string());
        }
        args.push("-Y".to_string());
        args.push(display_filter.to_string());
        args.push("-r".to_string());
        args.push(capture.display().to_string());
        args.push("-o".to_string());
        args.push("tcp.relative_sequence_numbers:FALSE".to_string());
        args
    }
}

impl Dissector for Tshark {
    fn name(&self) -> &str {
        &self.program
    }

    async fn dissect(
        &self,
        capture: &Path,
        fields: &[&str],
        display_filter: &str,
    ) -> Result<Vec<String>, DissectError> {
        let output = tokio::process::Command::new(&self.program)
            .args(Self::args(capture, fields, display_filter))
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| DissectError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(DissectError::Exit {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8(output.stdout).map_err(|_| DissectError::Encoding {
            program: self.program.clone(),
        })?;

        Ok(stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tshark_args() {
        let args = Tshark::args(
            Path::new("/data/cap1.cap.gz"),
            &["frame.time_epoch", "ip.proto"],
            "ip.dst ne 255.255.255.255",
        );
        assert_eq!(
            args.join(" "),
            "-n -q -Tfields -e frame.time_epoch -e ip.proto -E header=n -E separator=/s \
             -E occurrence=f -Y ip.dst ne 255.255.255.255 -r /data/cap1.cap.gz \
             -o tcp.relative_sequence_numbers:FALSE"
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let tshark = Tshark::new("/nonexistent/potiron-dissector");
        let err = tshark
            .dissect(Path::new("cap1"), &["ip.proto"], "")
            .await
            .unwrap_err();
        assert!(matches!(err, DissectError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_reported() {
        let tshark = Tshark::new("false");
        let err = tshark
            .dissect(Path::new("cap1"), &["ip.proto"], "")
            .await
            .unwrap_err();
        assert!(matches!(err, DissectError::Exit { .. }));
    }
}
