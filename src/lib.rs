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

//! Template-provider side of the Stratum v2 Template Distribution protocol.
//!
//! The crate is an embeddable engine: a node process supplies a block
//! assembly backend implementing [`mining::Mining`] and a handshake/framing
//! layer implementing [`connman::Sv2Transport`], and the
//! [`provider::TemplateProvider`] streams `NewTemplate`, `SetNewPrevHash` and
//! `RequestTransactionData.Success/Error` messages to every connected client.

pub mod config;
pub mod connman;
pub mod error;
pub mod messages;
pub mod mining;
pub mod provider;
pub mod template_store;
mod worker;

pub use error::Error;
pub use provider::TemplateProvider;
