//! Shell runner for the external media tools.
//!
//! Every binary the bot depends on (`ffmpeg`, `ffprobe`, `sox`, `yt-dlp`) is
//! invoked through [`ShellRunner`], so tests can swap in a recorder and assert
//! which subprocesses a pipeline run actually started.

use async_trait::async_trait;
use std::process::Stdio;
use tracing::{debug, error};

use crate::error::ProcessError;

/// Nombres de los binarios externos.
#[derive(Debug, Clone)]
pub struct Tools {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub sox: String,
    pub ytdlp: String,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            sox: "sox".to_string(),
            ytdlp: "yt-dlp".to_string(),
        }
    }
}

#[async_trait]
pub trait ShellRunner: Send + Sync {
    /// Runs `binary` with `args` and returns its stdout.
    ///
    /// Dropping the returned future kills the child, which is how pipeline
    /// cancellation interrupts a long transcode.
    async fn run(&self, binary: &str, args: &[String]) -> Result<String, ProcessError>;
}

/// Runner real basado en `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct TokioShell;

#[async_trait]
impl ShellRunner for TokioShell {
    async fn run(&self, binary: &str, args: &[String]) -> Result<String, ProcessError> {
        debug!("🔧 {} {}", binary, args.join(" "));

        let output = tokio::process::Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ProcessError::Spawn {
                binary: binary.to_string(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("❌ {} falló: {}", binary, stderr);
            return Err(ProcessError::Exit {
                binary: binary.to_string(),
                code: output.status.code(),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Records every invocation; responses are configured per binary.
    #[derive(Default)]
    pub struct RecordingShell {
        calls: Mutex<Vec<(String, Vec<String>)>>,
        stdout: Mutex<HashMap<String, String>>,
        failures: Mutex<HashMap<String, String>>,
        delays: Mutex<HashMap<String, Duration>>,
    }

    impl RecordingShell {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(self, binary: &str, stdout: &str) -> Self {
            self.stdout.lock().insert(binary.to_string(), stdout.to_string());
            self
        }

        pub fn fail(self, binary: &str, stderr: &str) -> Self {
            self.failures.lock().insert(binary.to_string(), stderr.to_string());
            self
        }

        pub fn slow(self, binary: &str, delay: Duration) -> Self {
            self.delays.lock().insert(binary.to_string(), delay);
            self
        }

        pub fn calls(&self) -> Vec<(String, Vec<String>)> {
            self.calls.lock().clone()
        }

        pub fn calls_to(&self, binary: &str) -> Vec<Vec<String>> {
            self.calls
                .lock()
                .iter()
                .filter(|(b, _)| b == binary)
                .map(|(_, args)| args.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ShellRunner for RecordingShell {
        async fn run(&self, binary: &str, args: &[String]) -> Result<String, ProcessError> {
            self.calls.lock().push((binary.to_string(), args.to_vec()));

            let delay = self.delays.lock().get(binary).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if let Some(stderr) = self.failures.lock().get(binary) {
                return Err(ProcessError::Exit {
                    binary: binary.to_string(),
                    code: Some(1),
                    stderr: stderr.clone(),
                });
            }

            Ok(self.stdout.lock().get(binary).cloned().unwrap_or_default())
        }
    }
}
