use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{RuntimeError, RuntimeResult};

const FALLBACK_SHELL: &str = "sh";
const READ_CHUNK_SIZE: usize = 8 * 1024;
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;
const MARKER_PREFIX: &str = "__LURKER_DONE_";

/// Byte written to the pty master to interrupt the foreground command.
pub const INTERRUPT_BYTE: u8 = 0x03;

static COMMAND_COUNTER: AtomicU64 = AtomicU64::new(0);

fn process_error(error: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::Process(error.to_string())
}

/// Scans shell output for a command-completion marker while splitting
/// it into lines for streaming consumers.
///
/// The marker appears twice: first inside the echoed command text with
/// a literal `$?` (no digits), which must be skipped, and then in the
/// shell's own output followed by the decimal exit status.
struct MarkerScanner {
    marker: String,
    line_buf: Vec<u8>,
}

impl MarkerScanner {
    fn new(marker: String) -> Self {
        Self {
            marker,
            line_buf: Vec::new(),
        }
    }

    /// Feeds a chunk of pty output. Returns the completed output lines
    /// (marker lines excluded) and the exit code once the marker with
    /// digits has been seen.
    fn feed(&mut self, chunk: &[u8]) -> (Vec<String>, Option<i32>) {
        let mut lines = Vec::new();
        let mut exit_code = None;

        for &byte in chunk {
            if byte != b'\n' {
                self.line_buf.push(byte);
                continue;
            }

            let mut line = std::mem::take(&mut self.line_buf);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let text = String::from_utf8_lossy(&line).into_owned();

            match self.classify(&text) {
                LineKind::Output => lines.push(text),
                LineKind::Echo => {}
                LineKind::Result(code) => {
                    exit_code = Some(code);
                    break;
                }
            }
        }

        (lines, exit_code)
    }

    fn classify(&self, line: &str) -> LineKind {
        let Some(index) = line.find(&self.marker) else {
            return LineKind::Output;
        };
        let rest = &line[index + self.marker.len()..];
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        if digits.is_empty() {
            // The command echo carries the literal `$?`.
            return LineKind::Echo;
        }
        digits
            .parse()
            .map(LineKind::Result)
            .unwrap_or(LineKind::Echo)
    }
}

enum LineKind {
    Output,
    Echo,
    Result(i32),
}

struct PendingCommand {
    scanner: MarkerScanner,
    lines_tx: mpsc::UnboundedSender<String>,
    exit_tx: Option<oneshot::Sender<i32>>,
}

enum Sink {
    Discard,
    Attached(Box<dyn Write + Send>),
}

impl Sink {
    fn write_chunk(&mut self, chunk: &[u8]) {
        if let Self::Attached(writer) = self {
            if writer.write_all(chunk).is_err() || writer.flush().is_err() {
                *self = Self::Discard;
            }
        }
    }
}

struct SessionShared {
    sink: Mutex<Sink>,
    pending: Mutex<Option<PendingCommand>>,
}

/// A background command started inside a [`ShellSession`].
///
/// `lines` streams the command's output lines; `exit` resolves with the
/// shell-reported exit status once the completion marker is observed.
#[derive(Debug)]
pub struct CommandHandle {
    pub lines: mpsc::UnboundedReceiver<String>,
    pub exit: oneshot::Receiver<i32>,
}

/// A persistent pseudo-terminal hosting an interactive shell.
///
/// Every command for an issue runs inside this one shell, so cwd,
/// history, and environment are preserved between the automated
/// pipeline and interactive operator attaches.
pub struct ShellSession {
    workdir: PathBuf,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    shared: Arc<SessionShared>,
}

impl ShellSession {
    /// Opens a pty pair and forks the login shell (`$SHELL`, fallback
    /// `sh`) with its streams bound to the slave side, cwd `workdir`.
    pub fn spawn(workdir: &Path) -> RuntimeResult<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(process_error)?;

        let shell = std::env::var("SHELL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| FALLBACK_SHELL.to_owned());
        tracing::debug!(workdir = %workdir.display(), shell, "spawning shell session");
        let mut command = CommandBuilder::new(shell);
        command.cwd(workdir);

        let child = pair.slave.spawn_command(command).map_err(process_error)?;
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().map_err(process_error)?;
        let writer = pair.master.take_writer().map_err(process_error)?;

        let shared = Arc::new(SessionShared {
            sink: Mutex::new(Sink::Discard),
            pending: Mutex::new(None),
        });
        spawn_drain_loop(reader, Arc::clone(&shared));

        Ok(Self {
            workdir: workdir.to_owned(),
            master: Mutex::new(Some(pair.master)),
            writer: Mutex::new(Some(writer)),
            child: Mutex::new(child),
            shared,
        })
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Starts a background command. The shell writes
    /// `<cmd>; echo "<marker>$?"` and the drain loop resolves the
    /// returned handle when the marker comes back with digits.
    ///
    /// At most one command may be in flight per session.
    pub fn run(&self, command: &str) -> RuntimeResult<CommandHandle> {
        let marker = format!(
            "{MARKER_PREFIX}{}_{}_",
            std::process::id(),
            COMMAND_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        {
            let mut pending = self.shared.pending.lock().unwrap_or_else(|e| e.into_inner());
            if pending.is_some() {
                return Err(RuntimeError::CommandInFlight);
            }
            *pending = Some(PendingCommand {
                scanner: MarkerScanner::new(marker.clone()),
                lines_tx,
                exit_tx: Some(exit_tx),
            });
        }

        let full = format!("{command}; echo \"{marker}$?\"\n");
        if let Err(error) = self.write_input(full.as_bytes()) {
            self.clear_pending();
            return Err(error);
        }

        Ok(CommandHandle {
            lines: lines_rx,
            exit: exit_rx,
        })
    }

    /// Runs a command to completion, discarding its output. Returns
    /// `None` when the token is cancelled; the foreground command is
    /// interrupted and the shell survives.
    pub async fn run_to_completion(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> RuntimeResult<Option<i32>> {
        let mut handle = self.run(command)?;
        let mut lines_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.cancel_command();
                    return Ok(None);
                }
                exit = &mut handle.exit => {
                    return exit
                        .map(Some)
                        .map_err(|_| RuntimeError::Process("shell exited mid-command".to_owned()));
                }
                line = handle.lines.recv(), if lines_open => {
                    if line.is_none() {
                        lines_open = false;
                    }
                }
            }
        }
    }

    /// Interrupts the foreground command (0x03) and abandons the
    /// pending marker. The shell itself keeps running.
    pub fn cancel_command(&self) {
        let _ = self.write_input(&[INTERRUPT_BYTE]);
        self.clear_pending();
    }

    pub fn write_input(&self, bytes: &[u8]) -> RuntimeResult<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let writer = writer.as_mut().ok_or(RuntimeError::Closed)?;
        writer.write_all(bytes).map_err(process_error)?;
        writer.flush().map_err(process_error)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> RuntimeResult<()> {
        if cols == 0 || rows == 0 {
            return Err(RuntimeError::Configuration(
                "pty size must have non-zero rows and columns".to_owned(),
            ));
        }
        let master = self.master.lock().unwrap_or_else(|e| e.into_inner());
        let master = master.as_ref().ok_or(RuntimeError::Closed)?;
        master
            .resize(PtySize {
                cols,
                rows,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(process_error)
    }

    /// Swaps the drain sink to `sink`; every byte the shell produces is
    /// forwarded there until [`Self::detach_sink`].
    pub fn attach_sink(&self, sink: Box<dyn Write + Send>) {
        let mut guard = self.shared.sink.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Sink::Attached(sink);
    }

    pub fn detach_sink(&self) {
        let mut guard = self.shared.sink.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Sink::Discard;
    }

    pub fn is_running(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        matches!(child.try_wait(), Ok(None))
    }

    /// Releases the session: closing the pty delivers the hangup to the
    /// shell's process group, and the child is reaped.
    pub fn dispose(&self) {
        self.detach_sink();
        self.clear_pending();
        {
            let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
            writer.take();
        }
        {
            let mut master = self.master.lock().unwrap_or_else(|e| e.into_inner());
            master.take();
        }
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        let _ = child.kill();
        let _ = child.wait();
    }

    fn clear_pending(&self) {
        let mut pending = self.shared.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.take();
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn spawn_drain_loop(mut reader: Box<dyn Read + Send>, shared: Arc<SessionShared>) {
    std::thread::spawn(move || {
        let mut buf = [0_u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(read) => {
                    let chunk = &buf[..read];
                    {
                        let mut sink = shared.sink.lock().unwrap_or_else(|e| e.into_inner());
                        sink.write_chunk(chunk);
                    }
                    let mut pending = shared.pending.lock().unwrap_or_else(|e| e.into_inner());
                    let mut finished = false;
                    if let Some(command) = pending.as_mut() {
                        let (lines, exit_code) = command.scanner.feed(chunk);
                        for line in lines {
                            let _ = command.lines_tx.send(line);
                        }
                        if let Some(code) = exit_code {
                            if let Some(tx) = command.exit_tx.take() {
                                let _ = tx.send(code);
                            }
                            finished = true;
                        }
                    }
                    if finished {
                        pending.take();
                    }
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    fn scanner(marker: &str) -> MarkerScanner {
        MarkerScanner::new(marker.to_owned())
    }

    #[test]
    fn marker_scanner_skips_the_echo_and_reads_the_real_exit_code() {
        let mut scanner = scanner("__LURKER_DONE_1_1_");
        let echoed = b"false; echo \"__LURKER_DONE_1_1_$?\"\r\n";
        let (lines, code) = scanner.feed(echoed);
        assert!(lines.is_empty());
        assert_eq!(code, None);

        let (lines, code) = scanner.feed(b"__LURKER_DONE_1_1_1\r\n");
        assert!(lines.is_empty());
        assert_eq!(code, Some(1));
    }

    #[test]
    fn marker_scanner_handles_arbitrary_chunk_splits() {
        let output =
            b"cmd; echo \"__LURKER_DONE_9_9_$?\"\r\nsome output\r\n__LURKER_DONE_9_9_42\r\n";
        for split in 1..output.len() {
            let mut scanner = scanner("__LURKER_DONE_9_9_");
            let (mut lines, mut code) = scanner.feed(&output[..split]);
            let (more_lines, more_code) = scanner.feed(&output[split..]);
            lines.extend(more_lines);
            code = code.or(more_code);
            assert_eq!(lines, vec!["some output".to_owned()], "split at {split}");
            assert_eq!(code, Some(42), "split at {split}");
        }
    }

    #[test]
    fn marker_scanner_forwards_output_lines_without_marker_lines() {
        let mut scanner = scanner("__LURKER_DONE_2_2_");
        let (lines, code) =
            scanner.feed(b"one\r\ntwo\r\ncmd; echo \"__LURKER_DONE_2_2_$?\"\r\nthree\r\n");
        assert_eq!(lines, vec!["one", "two", "three"]);
        assert_eq!(code, None);
    }

    #[test]
    fn marker_scanner_accepts_a_prompt_prefix_before_the_marker() {
        let mut scanner = scanner("__LURKER_DONE_3_3_");
        let (_, code) = scanner.feed(b"$ __LURKER_DONE_3_3_0\n");
        assert_eq!(code, Some(0));
    }

    #[cfg(unix)]
    mod with_real_shell {
        use super::*;

        fn session() -> (tempfile::TempDir, ShellSession) {
            let dir = tempfile::tempdir().expect("temp dir");
            let session = ShellSession::spawn(dir.path()).expect("spawn shell session");
            (dir, session)
        }

        async fn wait_exit(handle: CommandHandle) -> i32 {
            let mut handle = handle;
            timeout(TEST_TIMEOUT, async {
                loop {
                    tokio::select! {
                        exit = &mut handle.exit => return exit.expect("exit code delivered"),
                        _ = handle.lines.recv() => {}
                    }
                }
            })
            .await
            .expect("command should complete in time")
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn true_reports_zero_and_false_reports_one() {
            let (_dir, session) = session();

            let handle = session.run("true").expect("run true");
            assert_eq!(wait_exit(handle).await, 0);

            let handle = session.run("false").expect("run false");
            assert_eq!(wait_exit(handle).await, 1);
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn command_output_lines_are_streamed() {
            let (_dir, session) = session();
            let mut handle = session
                .run("printf 'alpha\\nbeta\\n'")
                .expect("run printf");

            let mut seen = Vec::new();
            timeout(TEST_TIMEOUT, async {
                loop {
                    tokio::select! {
                        exit = &mut handle.exit => {
                            exit.expect("exit code delivered");
                            break;
                        }
                        line = handle.lines.recv() => {
                            if let Some(line) = line {
                                seen.push(line);
                            }
                        }
                    }
                }
            })
            .await
            .expect("command should complete in time");

            assert!(seen.iter().any(|line| line.contains("alpha")));
            assert!(seen.iter().any(|line| line.contains("beta")));
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn second_command_is_rejected_while_one_is_pending() {
            let (_dir, session) = session();
            let first = session.run("sleep 5").expect("run sleep");
            let error = session.run("true").expect_err("second command must be rejected");
            assert!(matches!(error, RuntimeError::CommandInFlight));

            session.cancel_command();
            drop(first);
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn cancellation_interrupts_and_preserves_the_shell() {
            let (_dir, session) = session();
            let cancel = CancellationToken::new();
            cancel.cancel();

            let outcome = session
                .run_to_completion("sleep 2", &cancel)
                .await
                .expect("run with cancelled token");
            assert_eq!(outcome, None);
            assert!(session.is_running());

            let fresh = CancellationToken::new();
            let outcome = session
                .run_to_completion("true", &fresh)
                .await
                .expect("shell accepts commands after cancellation");
            assert_eq!(outcome, Some(0));
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn shell_cwd_matches_the_issue_workdir() {
            let (dir, session) = session();
            let mut handle = session.run("pwd").expect("run pwd");

            let expected = dir
                .path()
                .canonicalize()
                .expect("canonical workdir")
                .to_string_lossy()
                .into_owned();
            let found = timeout(TEST_TIMEOUT, async {
                loop {
                    tokio::select! {
                        exit = &mut handle.exit => {
                            exit.expect("exit code delivered");
                            return false;
                        }
                        line = handle.lines.recv() => {
                            if line.is_some_and(|line| line.contains(&expected)) {
                                return true;
                            }
                        }
                    }
                }
            })
            .await
            .expect("pwd should complete in time");
            assert!(found, "pwd output should contain {expected}");
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn attached_sink_receives_shell_output() {
            use std::sync::{Arc, Mutex};

            #[derive(Clone, Default)]
            struct Capture(Arc<Mutex<Vec<u8>>>);
            impl std::io::Write for Capture {
                fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                    self.0.lock().expect("capture lock").extend_from_slice(buf);
                    Ok(buf.len())
                }
                fn flush(&mut self) -> std::io::Result<()> {
                    Ok(())
                }
            }

            let (_dir, session) = session();
            let capture = Capture::default();
            session.attach_sink(Box::new(capture.clone()));

            let handle = session.run("echo sink-check").expect("run echo");
            wait_exit(handle).await;
            session.detach_sink();

            let seen = capture.0.lock().expect("capture lock");
            let text = String::from_utf8_lossy(&seen);
            assert!(text.contains("sink-check"));
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn dispose_hangs_up_the_shell() {
            let (_dir, session) = session();
            assert!(session.is_running());
            session.dispose();
            assert!(!session.is_running());
            assert!(matches!(
                session.write_input(b"echo hi\n"),
                Err(RuntimeError::Closed)
            ));
        }
    }
}
