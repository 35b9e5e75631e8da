use serde::{Deserialize, Serialize};

/// Tagged variant carrying each supported chain's capability record, per the
/// "ad-hoc polymorphism over chains" design note: no subclassing, just a plain enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chain {
    Kusama,
}

impl Chain {
    pub fn from_id(id: u64) -> Option<Self> {
        match id {
            1 => Some(Chain::Kusama),
            _ => None,
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            Chain::Kusama => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Chain::Kusama => "Kusama",
        }
    }

    pub fn type_registry_preset(&self) -> &'static str {
        match self {
            Chain::Kusama => "kusama",
        }
    }

    /// Maximum acceptable lag, in blocks, between a node's reported head and the
    /// explorer's reference height before [`crate::node_pool::NodePool`] warns.
    pub fn block_lag_threshold(&self) -> u64 {
        match self {
            Chain::Kusama => 10,
        }
    }

    pub fn explorer_base(&self) -> &'static str {
        match self {
            Chain::Kusama => "https://kusama.subscan.io/api",
        }
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Chain properties obtained from the node on first successful connect; never
/// hard-coded (native token decimals vary per runtime upgrade).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainProperties {
    pub ss58_format: u16,
    pub token_symbol: String,
    pub token_decimals: u8,
}
