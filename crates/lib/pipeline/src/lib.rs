// Copyright (C) 2023 gigablaster

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::{
    io,
    path::{Path, PathBuf},
    time::SystemTime,
};

use quarry_assetdb::DbError;

mod compilers;
mod db_locator;
mod hasher;
mod pipeline;
mod platform;
mod sidecar;
mod watcher;

pub use compilers::*;
pub use db_locator::*;
pub use hasher::*;
pub use pipeline::*;
pub use platform::*;
pub use sidecar::*;
pub use watcher::*;

#[derive(Debug)]
pub enum Error {
    NotFound,
    InvalidInput(String),
    SourceUnavailable(PathBuf),
    CompileFailed(CompilerStatus),
    InvalidSidecar { path: PathBuf, reason: String },
    Db(DbError),
    Io(io::Error),
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Io(value)
    }
}

impl From<DbError> for Error {
    fn from(value: DbError) -> Self {
        Error::Db(value)
    }
}

/// Path with generic separators, the only form URIs are stored in.
pub(crate) fn generic_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Millisecond mtime used for change detection.
pub(crate) fn file_mtime(path: &Path) -> io::Result<u64> {
    let modified = path.metadata()?.modified()?;

    Ok(modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64)
}
