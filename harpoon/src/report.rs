// Copyright (c) Harpoon developers, 2024, licensed under the EUPL-1.2-or-later.
//
// See LICENSE at the root of this repository (or a legal translation in LICENSE-translations).

//! Captured syscall lists on disk: one name per line, one file per function.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use thiserror::Error;

use crate::syscalls::{name_of, SyscallError};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error(transparent)]
    Syscall(#[from] SyscallError),

    #[error("could not access {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not write syscall names")]
    Write(#[source] io::Error),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ReportError + '_ {
    move |source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// File name a function's list is saved under: path and package separators
/// become underscores.
pub fn file_name_for(symbol: &str) -> String {
    symbol.replace(['/', '.'], "_")
}

/// Writes the name of each id on its own line, in capture order. Nothing is
/// written unless every id is known.
pub fn write_names<W: Write>(out: &mut W, ids: &[u32]) -> Result<(), ReportError> {
    let names = ids
        .iter()
        .map(|&id| name_of(id))
        .collect::<Result<Vec<_>, _>>()?;
    for name in names {
        writeln!(out, "{name}").map_err(ReportError::Write)?;
    }
    out.flush().map_err(ReportError::Write)
}

/// A list being written for one function. Lines go to a hidden partial file
/// next to the destination; [`SavedList::commit`] moves it into place.
/// Dropping an uncommitted list removes the partial file and leaves any
/// earlier list untouched.
pub struct SavedList {
    path: PathBuf,
    partial: PathBuf,
    file: Option<BufWriter<File>>,
}

impl SavedList {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn commit(mut self) -> Result<PathBuf, ReportError> {
        let Some(file) = self.file.take() else {
            return Ok(self.path.clone());
        };
        let renamed = file
            .into_inner()
            .map_err(|e| e.into_error())
            .and_then(|file| file.sync_all())
            .and_then(|()| fs::rename(&self.partial, &self.path));
        if let Err(source) = renamed {
            let _ = fs::remove_file(&self.partial);
            return Err(ReportError::Io {
                path: self.path.clone(),
                source,
            });
        }
        debug!("saved {}", self.path.display());
        Ok(self.path.clone())
    }

    fn file(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("saved list already committed"))
    }
}

impl Write for SavedList {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file()?.flush()
    }
}

impl Drop for SavedList {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            if let Err(e) = fs::remove_file(&self.partial) {
                warn!("could not remove {}: {e}", self.partial.display());
            }
        }
    }
}

/// Starts the list for `symbol` inside `directory`. An existing list is only
/// replaced once the new one is committed.
pub fn create_saved(directory: &Path, symbol: &str) -> Result<SavedList, ReportError> {
    fs::create_dir_all(directory).map_err(io_error(directory))?;
    let name = file_name_for(symbol);
    let path = directory.join(&name);
    let partial = directory.join(format!(".{name}.partial"));
    let file = File::create(&partial).map_err(io_error(&partial))?;
    debug!("saving syscalls of {symbol} to {}", path.display());
    Ok(SavedList {
        path,
        partial,
        file: Some(BufWriter::new(file)),
    })
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}

/// Every name from every list saved in `directory`, file by file in name
/// order. Blank lines and hidden files are skipped.
pub fn read_saved(directory: &Path) -> Result<Vec<String>, ReportError> {
    let mut paths = fs::read_dir(directory)
        .map_err(io_error(directory))?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error(directory))?;
    paths.retain(|path| path.is_file() && !is_hidden(path));
    paths.sort();

    let mut names = Vec::new();
    for path in paths {
        let file = File::open(&path).map_err(io_error(&path))?;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(io_error(&path))?;
            let name = line.trim();
            if !name.is_empty() {
                names.push(name.to_owned());
            }
        }
    }
    Ok(names)
}
