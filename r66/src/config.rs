//! Protocol configuration of R66 servers, partners and clients.
//!
//! Each object is the `protoConfig` of an agent, partner or client. Unknown
//! fields are refused so that typos do not silently fall back to defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::hash::{HashAlgo, UnknownAlgo};
use crate::protocol::framing::MAX_BLOCK_SIZE;

/// Block size used when neither the partner nor the client sets one.
pub const DEFAULT_BLOCK_SIZE: u32 = 65536;

/// A configured block size that cannot fit in one frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("block size {0} exceeds the limit of {MAX_BLOCK_SIZE} bytes")]
pub struct BlockTooLarge(pub u32);

fn check_block_size(size: u32) -> Result<(), BlockTooLarge> {
    if size > MAX_BLOCK_SIZE {
        return Err(BlockTooLarge(size));
    }
    Ok(())
}

/// Configuration of a local R66 server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct R66ServerConfig {
    /// Login sent to requesters; defaults to the agent name.
    pub server_login: String,
    /// Password sent to requesters, plain or `$ENC$` encrypted. The agent's
    /// `password` credential is used when empty.
    pub server_password: String,
    /// Overrides the block size asked by requesters; `0` keeps theirs.
    pub block_size: u32,
    pub no_final_hash: bool,
    pub check_block_hash: bool,
    /// Digests requesters may ask for; empty allows every supported one.
    pub final_hash_algos: Vec<String>,
}

/// Configuration of a remote R66 partner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct R66PartnerConfig {
    /// Login the partner is expected to answer with; defaults to the partner name.
    pub server_login: String,
    pub block_size: Option<u32>,
    pub no_final_hash: Option<bool>,
    pub check_block_hash: Option<bool>,
    pub final_hash_algo: Option<String>,
}

/// Configuration of a local R66 client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct R66ClientConfig {
    pub block_size: Option<u32>,
    pub no_final_hash: bool,
    pub check_block_hash: bool,
    pub final_hash_algo: Option<String>,
    /// Connection timeout, in seconds.
    pub dial_timeout: Option<u64>,
}

/// Parameters of one client transfer, after partner and client settings are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferParams {
    pub block_size: u32,
    pub final_hash: bool,
    pub digest: HashAlgo,
    pub check_block_hash: bool,
}

impl Default for TransferParams {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            final_hash: true,
            digest: HashAlgo::default(),
            check_block_hash: false,
        }
    }
}

impl R66PartnerConfig {
    pub fn check(&self) -> Result<(), BlockTooLarge> {
        self.block_size.map_or(Ok(()), check_block_size)
    }
}

impl R66ClientConfig {
    pub fn check(&self) -> Result<(), BlockTooLarge> {
        self.block_size.map_or(Ok(()), check_block_size)
    }

    pub fn dial_timeout(&self) -> Option<Duration> {
        self.dial_timeout.map(Duration::from_secs)
    }

    /// Merges this client's defaults with the `partner` overrides.
    pub fn params(&self, partner: &R66PartnerConfig) -> Result<TransferParams, UnknownAlgo> {
        let block_size = partner
            .block_size
            .or(self.block_size)
            .filter(|size| *size != 0)
            .unwrap_or(DEFAULT_BLOCK_SIZE);
        let no_final_hash = partner.no_final_hash.unwrap_or(self.no_final_hash);
        let digest = match partner.final_hash_algo.as_ref().or(self.final_hash_algo.as_ref()) {
            Some(name) if !name.is_empty() => name.parse()?,
            _ => HashAlgo::default(),
        };
        Ok(TransferParams {
            block_size,
            final_hash: !no_final_hash,
            digest,
            check_block_hash: partner.check_block_hash.unwrap_or(self.check_block_hash),
        })
    }
}

impl R66ServerConfig {
    pub fn check(&self) -> Result<(), BlockTooLarge> {
        check_block_size(self.block_size)
    }

    /// Whether a requester may ask for `digest`.
    pub fn allows_digest(&self, digest: HashAlgo) -> bool {
        self.final_hash_algos.is_empty()
            || self
                .final_hash_algos
                .iter()
                .any(|name| name.parse::<HashAlgo>().is_ok_and(|algo| algo == digest))
    }
}
