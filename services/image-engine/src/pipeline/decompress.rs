//! External decompressor processes and byte-stream adapters.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, warn};
use vmimg_manifest::Compression;

use crate::error::ImgError;
use crate::storage::ByteStream;

const READ_CHUNK: usize = 64 * 1024;

/// bzip2 exits 2 on a corrupt or truncated input.
const BZIP2_CORRUPT_EXIT: i32 = 2;

/// A running `<program> -cdfq` with all three pipes taken.
pub struct Decompressor {
    pub program: String,
    pub compression: Compression,
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

impl Decompressor {
    pub fn spawn(program: &Path, compression: Compression) -> Result<Self, ImgError> {
        let name = program.display().to_string();
        debug!(program = %name, compression = %compression, "Spawning decompressor");

        let mut child = Command::new(program)
            .arg("-cdfq")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| ImgError::internal_with(format!("could not run \"{name}\""), err))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(ImgError::internal(format!("\"{name}\" was spawned without pipes")));
        };

        Ok(Self {
            program: name,
            compression,
            child,
            stdin,
            stdout,
            stderr,
        })
    }
}

/// Wait for a decompressor whose stdin is already closed.
///
/// A non-zero exit is an `UncompressionError`; not exiting within `limit`
/// kills the process and is a `DownloadError`.
pub async fn wait_exit(
    child: &mut Child,
    program: &str,
    compression: Compression,
    limit: Duration,
    stderr: &str,
) -> Result<(), ImgError> {
    let status = match timeout(limit, child.wait()).await {
        Ok(status) => status.map_err(|err| {
            ImgError::internal_with(format!("could not wait for \"{program}\""), err)
        })?,
        Err(_) => {
            warn!(program = %program, "Decompressor did not exit, killing it");
            child.kill().await.ok();
            return Err(ImgError::download(format!(
                "timed out after {}s waiting for \"{program}\" to finish",
                limit.as_secs()
            )));
        }
    };

    if status.success() {
        return Ok(());
    }

    let mut message = format!("\"{program}\" failed ({status})");
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        message.push_str(": ");
        message.push_str(stderr);
    }
    if compression == Compression::Bzip2 && status.code() == Some(BZIP2_CORRUPT_EXIT) {
        message.push_str(" (the download is likely corrupt or truncated; try again)");
    }
    Err(ImgError::Uncompression { message })
}

/// Drain a child's stderr. Read failures yield whatever was read.
pub async fn read_stderr(mut stderr: ChildStderr) -> String {
    let mut out = String::new();
    stderr.read_to_string(&mut out).await.ok();
    out
}

/// Adapt any reader into a [`ByteStream`]. The stream ends after the first
/// read error.
pub fn reader_stream<R>(reader: R) -> ByteStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    Box::pin(stream::unfold(Some(reader), |state| async move {
        let mut reader = state?;
        let mut buf = vec![0u8; READ_CHUNK];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some(reader)))
            }
            Err(err) => Some((Err(err), None)),
        }
    }))
}
