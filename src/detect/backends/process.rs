//! Out-of-process detector.
//!
//! The helper speaks line-delimited JSON on stdin/stdout:
//!
//! ```text
//! -> {"cmd":"info"}
//! <- {"class_names":["person", ...]}
//! -> {"cmd":"track","seq":12,"width":640,"height":480,"persist":true,"bytes":921600}
//! -> <921600 bytes of packed RGB24>
//! <- {"boxes":[{"track_id":3,"class_id":0,"confidence":0.91,"bbox":[x1,y1,x2,y2]}]}
//! ```
//!
//! A helper reply of `{"error":"..."}` fails the call. Any transport failure
//! or timeout discards the helper; the next call starts a fresh one. `reset`
//! restarts the helper so its tracker state is dropped.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::detect::backend::Detector;
use crate::detect::result::{DetectionBox, DetectionResult};
use crate::frame::Frame;
use crate::process::{CommandSpec, ProcessHandle};

#[derive(Clone, Debug)]
pub struct ProcessDetectorConfig {
    /// Name reported in status (usually the model name).
    pub name: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub response_timeout: Duration,
}

#[derive(Serialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
enum Request {
    Info,
    Track {
        seq: u64,
        width: u32,
        height: u32,
        persist: bool,
        bytes: usize,
    },
}

#[derive(Debug, Default, Deserialize)]
struct Response {
    #[serde(default)]
    boxes: Vec<DetectionBox>,
    #[serde(default)]
    class_names: Option<Vec<String>>,
    #[serde(default)]
    error: Option<String>,
}

struct Helper {
    handle: ProcessHandle,
    lines: Receiver<String>,
    reader: Option<JoinHandle<()>>,
}

impl Helper {
    fn start(config: &ProcessDetectorConfig) -> Result<Self> {
        let spec = CommandSpec::new(format!("detector:{}", config.name), &config.command)
            .args(config.args.iter().cloned())
            .capture_stdout();
        let mut handle = ProcessHandle::spawn(&spec)?;
        let stdout = handle
            .take_stdout()
            .ok_or_else(|| anyhow!("detector helper stdout not captured"))?;

        let (tx, lines) = mpsc::channel();
        let reader = std::thread::Builder::new()
            .name("detector-reader".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })
            .context("spawn detector reader thread")?;

        log::info!(
            "detector helper '{}' started (pid {})",
            config.name,
            handle.id()
        );
        Ok(Self {
            handle,
            lines,
            reader: Some(reader),
        })
    }

    fn call(&mut self, request: &Request, payload: Option<&[u8]>, timeout: Duration) -> Result<Response> {
        let stdin = self
            .handle
            .stdin_mut()
            .ok_or_else(|| anyhow!("detector helper stdin closed"))?;
        let mut header = serde_json::to_vec(request)?;
        header.push(b'\n');
        stdin.write_all(&header).context("write request header")?;
        if let Some(payload) = payload {
            stdin.write_all(payload).context("write frame payload")?;
        }
        stdin.flush().context("flush detector helper stdin")?;

        let line = match self.lines.recv_timeout(timeout) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => {
                return Err(anyhow!(
                    "detector helper did not answer within {:.1}s",
                    timeout.as_secs_f32()
                ))
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!(
                    "detector helper exited{}",
                    self.handle
                        .last_stderr_line()
                        .map(|l| format!(": {l}"))
                        .unwrap_or_default()
                ))
            }
        };
        let response: Response =
            serde_json::from_str(&line).context("malformed detector helper response")?;
        if let Some(error) = response.error {
            return Err(anyhow!("detector helper error: {error}"));
        }
        Ok(response)
    }

    fn shutdown(mut self) {
        if let Err(e) = self.handle.stop(false, Duration::from_secs(1)) {
            log::warn!("detector helper stop failed: {e:#}");
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

pub struct ProcessDetector {
    config: ProcessDetectorConfig,
    helper: Option<Helper>,
    class_names: Option<Vec<String>>,
}

impl ProcessDetector {
    pub fn new(config: ProcessDetectorConfig) -> Self {
        Self {
            config,
            helper: None,
            class_names: None,
        }
    }

    fn helper(&mut self) -> Result<&mut Helper> {
        if self.helper.is_none() {
            self.helper = Some(Helper::start(&self.config)?);
        }
        self.helper
            .as_mut()
            .ok_or_else(|| anyhow!("detector helper unavailable"))
    }

    fn call(&mut self, request: &Request, payload: Option<&[u8]>) -> Result<Response> {
        let timeout = self.config.response_timeout;
        let result = self.helper()?.call(request, payload, timeout);
        if result.is_err() {
            if let Some(helper) = self.helper.take() {
                helper.shutdown();
            }
        }
        result
    }
}

impl Detector for ProcessDetector {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn track(&mut self, frame: &Frame, persist: bool) -> Result<DetectionResult> {
        let request = Request::Track {
            seq: frame.seq,
            width: frame.width,
            height: frame.height,
            persist,
            bytes: frame.byte_len(),
        };
        let response = self.call(&request, Some(frame.pixels()))?;
        Ok(DetectionResult::new(response.boxes))
    }

    fn reset(&mut self) -> Result<()> {
        if let Some(helper) = self.helper.take() {
            helper.shutdown();
        }
        Ok(())
    }

    fn class_names(&self) -> Option<Vec<String>> {
        self.class_names.clone()
    }

    fn warm_up(&mut self) -> Result<()> {
        let response = self.call(&Request::Info, None)?;
        if let Some(names) = response.class_names {
            log::info!(
                "detector '{}' reports {} classes",
                self.config.name,
                names.len()
            );
            self.class_names = Some(names);
        }
        Ok(())
    }
}

impl Drop for ProcessDetector {
    fn drop(&mut self) {
        if let Some(helper) = self.helper.take() {
            helper.shutdown();
        }
    }
}
