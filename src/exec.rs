use std::{
    io::{self, Read, Write},
    process::{ChildStdin, Command, Output, Stdio},
    thread,
    time::{Duration, Instant},
};

use log::debug;

use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/**
 * @brief Run an external command, optionally feeding stdin, bounded by a timeout.
 * @param program Executable name, resolved through PATH.
 * @param args Arguments.
 * @param stdin Optional bytes written to the child's stdin.
 * @param timeout Upper bound on wall-clock time; the child is killed when it is exceeded.
 * @return Raw output on exit (successful or not), `Error::Timeout` when the bound is hit.
 */
pub fn run(program: &str, args: &[&str], stdin: Option<&[u8]>, timeout: Duration) -> Result<Output> {
    let command = display(program, args);
    debug!("exec: {command}");

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::ExternalTool {
            command: command.clone(),
            detail: e.to_string(),
        })?;

    // Every pipe gets its own thread so neither side can stall the deadline below.
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);
    let feeder = match (stdin, child.stdin.take()) {
        (Some(input), Some(pipe)) => Some(feed(pipe, input.to_vec())),
        _ => None,
    };

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Timeout {
                command,
                after: timeout,
            });
        }
        thread::sleep(POLL_INTERVAL);
    };

    if let Some(Ok(Err(e))) = feeder.map(thread::JoinHandle::join) {
        return Err(Error::ExternalTool {
            command,
            detail: format!("writing stdin: {e}"),
        });
    }

    Ok(Output {
        status,
        stdout: stdout.map(join).unwrap_or_default(),
        stderr: stderr.map(join).unwrap_or_default(),
    })
}

/// Like [`run`], but a non-zero exit becomes `Error::ExternalTool` carrying stderr.
pub fn run_checked(program: &str, args: &[&str], stdin: Option<&[u8]>, timeout: Duration) -> Result<Output> {
    let output = run(program, args, stdin, timeout)?;
    if !output.status.success() {
        return Err(tool_error(&output, &display(program, args)));
    }
    Ok(output)
}

pub fn tool_error(output: &Output, command: &str) -> Error {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let detail = stderr.trim();
    Error::ExternalTool {
        command: command.to_string(),
        detail: if detail.is_empty() {
            match output.status.code() {
                Some(code) => format!("exited with status {code}"),
                None => "terminated by signal".to_string(),
            }
        } else {
            detail.to_string()
        },
    }
}

pub fn stdout_trimmed(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn display(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn feed(mut pipe: ChildStdin, input: Vec<u8>) -> thread::JoinHandle<io::Result<()>> {
    thread::spawn(move || pipe.write_all(&input))
}

fn join(handle: thread::JoinHandle<Vec<u8>>) -> Vec<u8> {
    handle.join().unwrap_or_default()
}
