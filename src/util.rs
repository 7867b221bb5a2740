use std::io::{self, BufReader, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

pub fn tail_chars(text: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    text.chars().skip(total - max_chars).collect::<String>()
}

/// Bytes kept per output stream; anything beyond is drained and dropped.
pub const DEFAULT_OUTPUT_LIMIT: u64 = 1 << 20;

#[derive(Debug)]
pub struct CommandRunResult {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Either stream went past the output limit
    pub truncated: bool,
}

impl CommandRunResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.map(|s| s.success()).unwrap_or(false)
    }
}

/// Run a command with stdin closed, killing it once `timeout` elapses.
pub fn run_command_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> Result<CommandRunResult, String> {
    run_command_with_input(command, None, timeout, DEFAULT_OUTPUT_LIMIT)
}

/// Like [`run_command_with_timeout`], optionally feeding `input` on stdin
/// and keeping at most `output_limit` bytes of each output stream.
pub fn run_command_with_input(
    command: &mut Command,
    input: Option<&[u8]>,
    timeout: Duration,
    output_limit: u64,
) -> Result<CommandRunResult, String> {
    let stdin = if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    };
    let mut child = command
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("Failed to start command: {}", e))?;

    if let (Some(input), Some(mut pipe)) = (input, child.stdin.take()) {
        // A child that exits without reading gives a broken pipe; its exit
        // status tells the rest.
        let _ = pipe.write_all(input);
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "Failed to capture stdout".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "Failed to capture stderr".to_string())?;

    let stdout_handle = thread::spawn(move || read_capped(stdout, output_limit));
    let stderr_handle = thread::spawn(move || read_capped(stderr, output_limit));

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    timed_out = true;
                    kill_process_group(child.id());
                    let _ = child.kill();
                    match child.wait() {
                        Ok(status) => break Some(status),
                        Err(_) => break None,
                    }
                }
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(format!("Failed to wait for command: {}", e)),
        }
    };

    let (stdout_bytes, stdout_cut) = stdout_handle.join().unwrap_or_default();
    let (stderr_bytes, stderr_cut) = stderr_handle.join().unwrap_or_default();

    Ok(CommandRunResult {
        status,
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        timed_out,
        truncated: stdout_cut || stderr_cut,
    })
}

/// Keep the first `limit` bytes, then drain the rest so the writer never
/// blocks on a full pipe.
fn read_capped<R: Read>(stream: R, limit: u64) -> (Vec<u8>, bool) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let _ = reader.by_ref().take(limit).read_to_end(&mut buf);
    let dropped = io::copy(&mut reader, &mut io::sink()).unwrap_or(0);
    (buf, dropped > 0)
}

/// Best-effort kill of the process group led by `pid`.
///
/// Only effective when the command was spawned with `process_group(0)`;
/// otherwise there is no such group and this is a no-op. Grandchildren that
/// keep the output pipes open would otherwise block the reader threads.
fn kill_process_group(pid: u32) {
    #[cfg(unix)]
    {
        let _ = Command::new("kill")
            .args(["-KILL", "--", &format!("-{}", pid)])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

/// True when `program` resolves to an executable on PATH.
pub fn program_available_on_path(program: &str) -> bool {
    let program = program.trim();
    if program.is_empty() {
        return false;
    }
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(program);
        if !candidate.is_file() {
            continue;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = std::fs::metadata(&candidate) {
                if meta.permissions().mode() & 0o111 != 0 {
                    return true;
                }
            }
        }
        #[cfg(not(unix))]
        {
            return true;
        }
    }
    false
}
