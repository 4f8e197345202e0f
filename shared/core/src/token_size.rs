use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Width of one token id in a shard file.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TokenSize {
    #[default]
    TwoBytes,
    FourBytes,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("unsupported token size of {0} bytes, expected 2 or 4")]
pub struct UnsupportedTokenSize(pub usize);

impl From<TokenSize> for usize {
    fn from(value: TokenSize) -> Self {
        match value {
            TokenSize::TwoBytes => 2,
            TokenSize::FourBytes => 4,
        }
    }
}

impl TryFrom<usize> for TokenSize {
    type Error = UnsupportedTokenSize;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(TokenSize::TwoBytes),
            4 => Ok(TokenSize::FourBytes),
            other => Err(UnsupportedTokenSize(other)),
        }
    }
}

impl TokenSize {
    /// Decodes one little-endian token. `bytes` must be exactly one token wide.
    pub fn decode(&self, bytes: &[u8]) -> u32 {
        match self {
            TokenSize::TwoBytes => u16::from_le_bytes([bytes[0], bytes[1]]) as u32,
            TokenSize::FourBytes => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }

    pub fn encode(&self, token: u32, out: &mut Vec<u8>) {
        match self {
            TokenSize::TwoBytes => out.extend_from_slice(&(token as u16).to_le_bytes()),
            TokenSize::FourBytes => out.extend_from_slice(&token.to_le_bytes()),
        }
    }

    pub fn max_token(&self) -> u32 {
        match self {
            TokenSize::TwoBytes => u16::MAX as u32,
            TokenSize::FourBytes => u32::MAX,
        }
    }
}
