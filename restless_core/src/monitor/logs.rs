use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LogSourceError {
    #[error("Failed to read log source {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Out-of-band access to the target service's log output.
pub trait LogSource: Send {
    fn name(&self) -> &str;

    /// Returns complete lines appended since the previous call.
    fn read_new_lines(&mut self) -> Result<Vec<String>, LogSourceError>;
}

/// Tails a local log file by byte offset.
///
/// A trailing line without a newline is held back until it is completed. If the file
/// shrinks (truncation or rotation in place) reading restarts from the beginning.
#[derive(Debug)]
pub struct FileLogSource {
    path: PathBuf,
    display_name: String,
    offset: u64,
    /// Bytes after the last newline; decoded only once the line is complete.
    partial: Vec<u8>,
}

impl FileLogSource {
    /// Reads the file from its first byte.
    pub fn from_start(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            display_name: path.display().to_string(),
            offset: 0,
            partial: Vec::new(),
        }
    }

    /// Skips content that exists now; only lines written later are reported.
    pub fn tail(path: &Path) -> Result<Self, LogSourceError> {
        let mut source = Self::from_start(path);
        source.offset = std::fs::metadata(path)
            .map_err(|source_err| source.io_error(source_err))?
            .len();
        Ok(source)
    }

    fn io_error(&self, source: std::io::Error) -> LogSourceError {
        LogSourceError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl LogSource for FileLogSource {
    fn name(&self) -> &str {
        &self.display_name
    }

    fn read_new_lines(&mut self) -> Result<Vec<String>, LogSourceError> {
        let mut file = File::open(&self.path).map_err(|e| self.io_error(e))?;
        let len = file.metadata().map_err(|e| self.io_error(e))?.len();
        if len < self.offset {
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset))
            .map_err(|e| self.io_error(e))?;
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        file.read_to_end(&mut buf).map_err(|e| self.io_error(e))?;
        self.offset += buf.len() as u64;

        let mut bytes = std::mem::take(&mut self.partial);
        bytes.extend_from_slice(&buf);

        // The chunk after the last newline is incomplete (empty when the data ends in '\n').
        let mut chunks: Vec<&[u8]> = bytes.split(|&b| b == b'\n').collect();
        self.partial = chunks.pop().map(<[u8]>::to_vec).unwrap_or_default();
        let lines = chunks
            .into_iter()
            .map(|chunk| {
                let chunk = chunk.strip_suffix(b"\r").unwrap_or(chunk);
                String::from_utf8_lossy(chunk).into_owned()
            })
            .collect();
        Ok(lines)
    }
}
