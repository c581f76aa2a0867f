//! Scoped exiftool sessions for metadata reads and copies.
//!
//! exiftool is launched in `-stay_open` batch mode and fed commands over
//! stdin; each command's output ends with a `{ready}` sentinel line. A reader
//! thread collects complete response blocks so every command gets a bounded
//! wait instead of blocking forever on a wedged process. The session closes
//! itself on drop, on every exit path, so a long batch never accumulates
//! orphaned exiftool processes.

use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::ExifToolConfig;
use crate::error::DewarpError;

/// Sentinel exiftool prints after each `-execute`.
const READY: &str = "{ready}";

/// Raw tag values relevant to dewarping, one read per file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DewarpTags {
    /// `DewarpData` payload, if the tag is present.
    pub dewarp_data: Option<String>,
    /// `DewarpFlag` value, if the tag is present.
    pub dewarp_flag: Option<serde_json::Value>,
}

/// stdout block and any stderr lines produced by one command.
struct Response {
    stdout: String,
    stderr: Vec<String>,
}

impl Response {
    fn diagnostic(&self) -> String {
        if !self.stderr.is_empty() {
            return self.stderr.join("; ");
        }
        let stdout = self.stdout.trim();
        if stdout.is_empty() {
            "no response from exiftool".to_string()
        } else {
            stdout.to_string()
        }
    }
}

/// A running `exiftool -stay_open True` process.
pub struct ExifTool {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout_rx: Receiver<String>,
    stderr_rx: Receiver<String>,
    timeout: Duration,
    poisoned: bool,
}

impl ExifTool {
    /// Launch a session using the configured executable.
    pub fn spawn(config: &ExifToolConfig) -> Result<Self, DewarpError> {
        let mut child = Command::new(&config.command)
            .args(["-stay_open", "True", "-@", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| pipe_error("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| pipe_error("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| pipe_error("stderr"))?;

        // Blocks are assembled off-thread so commands can time out.
        let (stdout_tx, stdout_rx) = mpsc::channel();
        thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut block = String::new();
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if line.trim_end() == READY {
                            if stdout_tx.send(std::mem::take(&mut block)).is_err() {
                                break;
                            }
                        } else {
                            block.push_str(&line);
                        }
                    }
                }
            }
        });

        let (stderr_tx, stderr_rx) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => {
                        if stderr_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        debug!("spawned {} session (pid {})", config.command, child.id());

        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout_rx,
            stderr_rx,
            timeout: Duration::from_secs(config.timeout_secs),
            poisoned: false,
        })
    }

    /// Read the dewarp tags of `path` in one `-j` invocation.
    ///
    /// Missing tags are not an error here; the extractor decides what their
    /// absence means.
    pub fn read_dewarp_tags(&mut self, path: &Path) -> Result<DewarpTags, DewarpError> {
        let path = path.to_string_lossy();
        let response = self.execute(&[
            "-j",
            "-G",
            "-XMP:DewarpData",
            "-XMP:DewarpFlag",
            path.as_ref(),
        ])?;
        Ok(parse_dewarp_tags(&response.stdout))
    }

    /// Copy the complete tag set of `src` onto `dst`, replacing whatever the
    /// image encoder wrote there.
    pub fn copy_all_tags(&mut self, src: &Path, dst: &Path) -> Result<(), DewarpError> {
        let src = src.to_string_lossy();
        let dst = dst.to_string_lossy();
        let response = self.execute(&[
            "-TagsFromFile",
            src.as_ref(),
            "-all:all",
            "-overwrite_original",
            dst.as_ref(),
        ])?;

        if copy_confirmed(&response.stdout) {
            Ok(())
        } else {
            Err(DewarpError::MetadataCopyFailed(response.diagnostic()))
        }
    }

    /// Run one command and return its output block.
    ///
    /// Waits at most the configured timeout; on expiry the child is killed
    /// and the session refuses further commands.
    fn execute(&mut self, args: &[&str]) -> Result<Response, DewarpError> {
        if self.poisoned {
            return Err(DewarpError::Session(pipe_error("session")));
        }
        let stdin = match self.stdin.as_mut() {
            Some(stdin) => stdin,
            None => return Err(DewarpError::Session(pipe_error("stdin"))),
        };

        stdin.write_all(command_block(args).as_bytes())?;
        stdin.flush()?;

        match self.stdout_rx.recv_timeout(self.timeout) {
            Ok(stdout) => {
                let stderr: Vec<String> = self.stderr_rx.try_iter().collect();
                Ok(Response { stdout, stderr })
            }
            Err(RecvTimeoutError::Timeout) => {
                let seconds = self.timeout.as_secs();
                self.poison();
                Err(DewarpError::MetadataTimeout { seconds })
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.poison();
                Err(DewarpError::Session(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "exiftool exited before responding",
                )))
            }
        }
    }

    /// Kill a session that can no longer be trusted to answer.
    fn poison(&mut self) {
        self.poisoned = true;
        self.stdin = None;
        if let Err(err) = self.child.kill() {
            warn!("failed to kill exiftool: {}", err);
        }
        let _ = self.child.wait();
    }

    /// Ask the process to exit and reap it, falling back to kill.
    fn shutdown(&mut self) {
        if self.poisoned {
            return;
        }
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.write_all(b"-stay_open\nFalse\n-execute\n");
            // Dropping stdin closes the pipe, which also ends a process that
            // missed the command.
        }
        for _ in 0..20 {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!("exiftool exited: {}", status);
                    return;
                }
                Ok(None) => thread::sleep(Duration::from_millis(50)),
                Err(_) => break,
            }
        }
        warn!("exiftool ignored shutdown, killing it");
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for ExifTool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn pipe_error(what: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("exiftool {} unavailable", what),
    )
}

/// Serialize one command for the `-@ -` argfile protocol: one argument per
/// line, terminated by `-execute`.
fn command_block(args: &[&str]) -> String {
    let mut block = String::new();
    for arg in args {
        block.push_str(arg);
        block.push('\n');
    }
    block.push_str("-execute\n");
    block
}

/// Pull the dewarp tags out of `exiftool -j -G` output.
///
/// Keys are matched by suffix so the group prefix (`XMP:`, `XMP-drone-dji:`)
/// does not matter. Output that is not the expected JSON array yields empty
/// tags, which downstream classifies as missing calibration.
fn parse_dewarp_tags(json: &str) -> DewarpTags {
    let mut tags = DewarpTags::default();

    let entries: Vec<serde_json::Map<String, serde_json::Value>> =
        match serde_json::from_str(json.trim()) {
            Ok(entries) => entries,
            Err(err) => {
                debug!("unparseable exiftool output: {}", err);
                return tags;
            }
        };

    if let Some(entry) = entries.into_iter().next() {
        for (key, value) in entry {
            if key.ends_with("DewarpData") {
                if let Some(payload) = value.as_str() {
                    tags.dewarp_data = Some(payload.to_string());
                }
            } else if key.ends_with("DewarpFlag") {
                tags.dewarp_flag = Some(value);
            }
        }
    }

    tags
}

/// exiftool confirms a write with an `N image files updated` report.
fn copy_confirmed(stdout: &str) -> bool {
    stdout.lines().any(|line| {
        let line = line.trim();
        line.ends_with("image files updated") && !line.starts_with('0')
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_block_uses_argfile_framing() {
        let block = command_block(&["-j", "-XMP:DewarpData", "photo.JPG"]);
        assert_eq!(block, "-j\n-XMP:DewarpData\nphoto.JPG\n-execute\n");
    }

    #[test]
    fn parses_both_dewarp_tags() {
        let output = r#"[{
            "SourceFile": "DJI_0042.JPG",
            "XMP:DewarpData": "2018-09-04;3678.87,3671.84,10.1,27.29,-0.268652,0.114663,0.0000152688,-0.0000460707,-0.0350261",
            "XMP:DewarpFlag": 0
        }]"#;
        let tags = parse_dewarp_tags(output);
        assert!(tags.dewarp_data.as_deref().unwrap().starts_with("2018-09-04;"));
        assert_eq!(tags.dewarp_flag, Some(json!(0)));
    }

    #[test]
    fn group_prefix_does_not_matter() {
        let output = r#"[{"XMP-drone-dji:DewarpFlag": 1}]"#;
        let tags = parse_dewarp_tags(output);
        assert_eq!(tags.dewarp_flag, Some(json!(1)));
        assert_eq!(tags.dewarp_data, None);
    }

    #[test]
    fn missing_tags_yield_empty_result() {
        let tags = parse_dewarp_tags(r#"[{"SourceFile": "DJI_0042.JPG"}]"#);
        assert_eq!(tags, DewarpTags::default());
    }

    #[test]
    fn garbage_output_yields_empty_result() {
        assert_eq!(parse_dewarp_tags("not json"), DewarpTags::default());
        assert_eq!(parse_dewarp_tags(""), DewarpTags::default());
    }

    #[test]
    fn copy_confirmation_requires_updated_files() {
        assert!(copy_confirmed("    1 image files updated\n"));
        assert!(copy_confirmed("    2 image files updated\n"));
        assert!(!copy_confirmed("    0 image files updated\n"));
        assert!(!copy_confirmed(""));
        assert!(!copy_confirmed("Warning: something else entirely\n"));
    }
}
