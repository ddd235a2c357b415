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
    fmt::{self, Display},
    ops::{BitOr, BitOrAssign},
};

/// Bit-flag set describing what a compile targets: an OS plus a graphics
/// backend. Stored on the pipeline at init and passed to every compiler.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssetPlatform(u32);

impl AssetPlatform {
    pub const UNKNOWN: AssetPlatform = AssetPlatform(0);
    pub const WINDOWS: AssetPlatform = AssetPlatform(1 << 0);
    pub const MACOS: AssetPlatform = AssetPlatform(1 << 1);
    pub const LINUX: AssetPlatform = AssetPlatform(1 << 2);
    pub const METAL: AssetPlatform = AssetPlatform(1 << 3);
    pub const VULKAN: AssetPlatform = AssetPlatform(1 << 4);

    /// The platform this build compiles assets for by default.
    pub fn current() -> AssetPlatform {
        let os = if cfg!(target_os = "windows") {
            Self::WINDOWS
        } else if cfg!(target_os = "macos") {
            Self::MACOS
        } else {
            Self::LINUX
        };
        let backend = if cfg!(target_os = "macos") {
            Self::METAL
        } else {
            Self::VULKAN
        };

        os | backend
    }

    pub fn is_unknown(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: AssetPlatform) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for AssetPlatform {
    type Output = AssetPlatform;

    fn bitor(self, rhs: Self) -> Self::Output {
        AssetPlatform(self.0 | rhs.0)
    }
}

impl BitOrAssign for AssetPlatform {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Display for AssetPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            return write!(f, "unknown");
        }
        let mut first = true;
        for (flag, name) in [
            (Self::WINDOWS, "windows"),
            (Self::MACOS, "macos"),
            (Self::LINUX, "linux"),
            (Self::METAL, "metal"),
            (Self::VULKAN, "vulkan"),
        ] {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }

        Ok(())
    }
}
