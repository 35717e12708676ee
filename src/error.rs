// Copyright (C) 2025, 2026 Sv2 Template Provider Developers (see AUTHORS)
//
// This file is part of sv2-template-provider
//
// sv2-template-provider is free software: you can redistribute it and/or
// modify it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// sv2-template-provider is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General
// Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with sv2-template-provider. If not, see <https://www.gnu.org/licenses/>.

use std::fmt;

/// Error types for the template provider. Binding the listener is the only
/// fatal startup condition; everything else is per-connection and results in
/// that client being dropped.
#[derive(Debug)]
pub enum Error {
    Bind(std::io::Error),
    Io(std::io::Error),
    Handshake(String),
    Codec(String),
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind(err) => write!(f, "Failed to bind listener: {}", err),
            Self::Io(err) => write!(f, "IO error: {}", err),
            Self::Handshake(reason) => write!(f, "Handshake failed: {}", reason),
            Self::Codec(reason) => write!(f, "Framing error: {}", reason),
            Self::Config(reason) => write!(f, "Invalid configuration: {}", reason),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
