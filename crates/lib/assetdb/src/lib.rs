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

use std::io;

mod database;
mod kv;
mod records;

pub use database::*;
pub use kv::{ReadTxn, Store, TableId, Txn, WriteTxn};
pub use records::*;

#[derive(Debug)]
pub enum DbError {
    Io(io::Error),
    InvalidFormat,
    InvalidVersion,
    NotFound,
    Corrupted,
}

impl From<io::Error> for DbError {
    fn from(value: io::Error) -> Self {
        DbError::Io(value)
    }
}
