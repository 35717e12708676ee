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

//! Typed Template Distribution messages. Byte-level encoding and decoding is
//! the job of the framing layer behind [`crate::connman::Sv2Transport`]; the
//! engine only ever sees these structs.

use bitcoin::block::Header;
use bitcoin::{Transaction, TxMerkleNode};
use serde::{Deserialize, Serialize};

pub const MSG_COINBASE_OUTPUT_CONSTRAINTS: u8 = 0x70;
pub const MSG_NEW_TEMPLATE: u8 = 0x71;
pub const MSG_SET_NEW_PREV_HASH: u8 = 0x72;
pub const MSG_REQUEST_TRANSACTION_DATA: u8 = 0x73;
pub const MSG_REQUEST_TRANSACTION_DATA_SUCCESS: u8 = 0x74;
pub const MSG_REQUEST_TRANSACTION_DATA_ERROR: u8 = 0x75;
pub const MSG_SUBMIT_SOLUTION: u8 = 0x76;

/// Error code sent when a requested template id was never issued or has been
/// pruned from the cache.
pub const ERROR_TEMPLATE_ID_NOT_FOUND: &str = "template-id-not-found";
/// Error code sent when the requested template no longer builds on the best
/// prev hash.
pub const ERROR_STALE_TEMPLATE_ID: &str = "stale-template-id";

/// 0x71 NewTemplate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTemplate {
    pub header: Header,
    pub coinbase_tx: Transaction,
    pub coinbase_merkle_path: Vec<TxMerkleNode>,
    pub witness_commitment_output_index: u32,
    pub template_id: u64,
    /// Set when the template builds on a prev hash the client has not been
    /// activated on yet; a SetNewPrevHash with the same id follows.
    pub future_template: bool,
}

/// 0x72 SetNewPrevHash, activates an earlier future template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetNewPrevHash {
    pub header: Header,
    pub template_id: u64,
}

/// 0x74 RequestTransactionData.Success
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTransactionDataSuccess {
    pub template_id: u64,
    /// First stack item of the coinbase input witness, empty when the
    /// witness is null.
    pub witness_reserve_value: Vec<u8>,
    /// Every transaction of the template block except the coinbase.
    pub transactions: Vec<Transaction>,
}

/// 0x75 RequestTransactionData.Error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTransactionDataError {
    pub template_id: u64,
    pub error_code: String,
}

/// Messages the provider sends to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateDistributionMessage {
    NewTemplate(NewTemplate),
    SetNewPrevHash(SetNewPrevHash),
    RequestTransactionDataSuccess(RequestTransactionDataSuccess),
    RequestTransactionDataError(RequestTransactionDataError),
}

impl TemplateDistributionMessage {
    pub fn message_type(&self) -> u8 {
        match self {
            Self::NewTemplate(_) => MSG_NEW_TEMPLATE,
            Self::SetNewPrevHash(_) => MSG_SET_NEW_PREV_HASH,
            Self::RequestTransactionDataSuccess(_) => MSG_REQUEST_TRANSACTION_DATA_SUCCESS,
            Self::RequestTransactionDataError(_) => MSG_REQUEST_TRANSACTION_DATA_ERROR,
        }
    }
}

/// 0x70 CoinbaseOutputConstraints, sent once by a client after connection
/// setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinbaseOutputConstraints {
    pub coinbase_output_max_additional_size: u32,
    pub coinbase_output_max_additional_sigops: u16,
}

/// 0x73 RequestTransactionData
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTransactionData {
    pub template_id: u64,
}

/// 0x76 SubmitSolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitSolution {
    pub template_id: u64,
    pub version: i32,
    pub header_timestamp: u32,
    pub header_nonce: u32,
    pub coinbase_tx: Transaction,
}

/// Messages a client sends to the provider after connection setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceivedMessage {
    CoinbaseOutputConstraints(CoinbaseOutputConstraints),
    RequestTransactionData(RequestTransactionData),
    SubmitSolution(SubmitSolution),
}

impl ReceivedMessage {
    pub fn message_type(&self) -> u8 {
        match self {
            Self::CoinbaseOutputConstraints(_) => MSG_COINBASE_OUTPUT_CONSTRAINTS,
            Self::RequestTransactionData(_) => MSG_REQUEST_TRANSACTION_DATA,
            Self::SubmitSolution(_) => MSG_SUBMIT_SOLUTION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::block::Version;
    use bitcoin::hashes::Hash;
    use bitcoin::{BlockHash, CompactTarget};

    fn header() -> Header {
        Header {
            version: Version::TWO,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_700_000_000,
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce: 0,
        }
    }

    #[test]
    fn test_message_type_codes() {
        let msg = TemplateDistributionMessage::SetNewPrevHash(SetNewPrevHash {
            header: header(),
            template_id: 7,
        });
        assert_eq!(msg.message_type(), 0x72);

        let msg =
            TemplateDistributionMessage::RequestTransactionDataError(RequestTransactionDataError {
                template_id: 7,
                error_code: ERROR_STALE_TEMPLATE_ID.to_string(),
            });
        assert_eq!(msg.message_type(), 0x75);

        let msg = ReceivedMessage::RequestTransactionData(RequestTransactionData { template_id: 7 });
        assert_eq!(msg.message_type(), 0x73);
    }
}
