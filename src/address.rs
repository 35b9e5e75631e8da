use crate::chain::Chain;
use crate::errors::SessionError;
use sp_core::crypto::{AccountId32, Ss58AddressFormat, Ss58Codec};

/// The 32-byte account id underlying an SS58 address.
pub type PublicKey = [u8; 32];

/// A chain-scoped, SS58-validated address. Construction is the only way to
/// obtain one, so every live `Address` is known-valid for its chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    raw: String,
    public_key: PublicKey,
}

impl Address {
    /// Validates `raw` against `chain`'s ss58 format and derives its public key.
    pub fn parse(chain: Chain, raw: &str) -> Result<Self, SessionError> {
        let expected_format = Ss58AddressFormat::custom(ss58_format_for(chain));
        let account = AccountId32::from_ss58check_with_version(raw)
            .map_err(|_| SessionError::InvalidAddress(raw.to_owned()))?;
        let (account, format) = account;
        if format != expected_format {
            return Err(SessionError::InvalidAddress(raw.to_owned()));
        }
        let public_key: PublicKey = *account.as_ref();
        Ok(Address {
            raw: raw.to_owned(),
            public_key,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

fn ss58_format_for(chain: Chain) -> u16 {
    match chain {
        Chain::Kusama => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_address() {
        assert!(Address::parse(Chain::Kusama, "not-an-address").is_err());
    }

    #[test]
    fn rejects_wrong_chain_prefix() {
        // A well-formed polkadot (prefix 0) address should not validate as Kusama (prefix 2).
        let polkadot_like = "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY";
        assert!(Address::parse(Chain::Kusama, polkadot_like).is_err());
    }
}
