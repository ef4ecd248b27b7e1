use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Linux `perf` map writer. Each line is `<host-addr> <size-hex> <name>`.
///
/// Write failures disable the map for the rest of the process instead of
/// surfacing to the installer.
#[derive(Debug)]
pub struct JitSymbols {
    path: PathBuf,
    file: Option<File>,
}

impl JitSymbols {
    pub fn default_path() -> PathBuf {
        PathBuf::from(format!("/tmp/perf-{}.map", std::process::id()))
    }

    pub fn open_default() -> std::io::Result<Self> {
        Self::open(Self::default_path())
    }

    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_active(&self) -> bool {
        self.file.is_some()
    }

    pub fn register_fragment(&mut self, host_address: u64, size: usize, guest_entry: u64) {
        self.write_line(&format!(
            "{host_address:#x} {size:x} JIT_{guest_entry:#x}_{host_address:#x}\n"
        ));
    }

    pub fn register_named_region(&mut self, host_address: u64, size: usize, name: &str) {
        self.write_line(&format!("{host_address:#x} {size:x} {name}\n"));
    }

    pub fn register_code_buffer(&mut self, host_address: u64, size: usize) {
        self.register_named_region(host_address, size, "OCJIT");
    }

    fn write_line(&mut self, line: &str) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(err) = file.write_all(line.as_bytes()) {
            debug!("perf map disabled path={} reason={err}", self.path.display());
            self.file = None;
        }
    }
}
