use std::io::Write;
use std::sync::Arc;

use crate::shell_session::ShellSession;
use crate::RuntimeResult;

/// Ctrl-]: ends an interactive attach without killing the shell.
pub const DETACH_BYTE: u8 = 0x1d;

/// Splits an input chunk at the detach byte. Returns the prefix that
/// should still be forwarded to the pty and whether detach was seen.
pub fn scan_detach(bytes: &[u8]) -> (&[u8], bool) {
    match bytes.iter().position(|&byte| byte == DETACH_BYTE) {
        Some(index) => (&bytes[..index], true),
        None => (bytes, false),
    }
}

/// An interactive handover of the operator's terminal to a shell
/// session. The presentation layer owns raw mode and the input source;
/// this type owns the sink swap, winsize forwarding, and the detach
/// scan. Dropping it restores the discard sink.
pub struct Attachment {
    session: Arc<ShellSession>,
}

impl Attachment {
    /// Swaps the session sink to `sink`, sizes the pty to the
    /// operator's terminal, and prints the attach banner.
    pub fn begin(
        session: Arc<ShellSession>,
        mut sink: Box<dyn Write + Send>,
        label: &str,
        cols: u16,
        rows: u16,
    ) -> RuntimeResult<Self> {
        session.resize(cols, rows)?;
        if !label.is_empty() {
            let _ = write!(sink, "\r\n── attached: {label} (Ctrl+] to detach) ──\r\n");
            let _ = sink.flush();
        }
        session.attach_sink(sink);
        Ok(Self { session })
    }

    /// Forwards operator input to the shell. Returns `true` when the
    /// detach byte was encountered; bytes before it are still
    /// delivered, the detach byte itself and anything after it are not.
    pub fn forward(&self, bytes: &[u8]) -> RuntimeResult<bool> {
        let (prefix, detached) = scan_detach(bytes);
        if !prefix.is_empty() {
            self.session.write_input(prefix)?;
        }
        Ok(detached)
    }

    /// Forwards a terminal winsize change to the pty.
    pub fn resize(&self, cols: u16, rows: u16) -> RuntimeResult<()> {
        self.session.resize(cols, rows)
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.session.detach_sink();
    }
}
