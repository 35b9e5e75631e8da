use async_trait::async_trait;
use chrono::{NaiveDateTime, SecondsFormat};
use subxt::backend::legacy::LegacyRpcMethods;
use subxt::ext::scale_value::{Composite, Primitive, Value, ValueDef};
use subxt::{OnlineClient, PolkadotConfig};
use tokio::sync::OnceCell;

use crate::chain::ChainProperties;
use crate::errors::RpcError;
use crate::params::Param;

use super::{BlockExtrinsics, Extrinsic, Receipt, SubstrateRpcApi};

/// Production [`SubstrateRpcApi`] backed by `subxt`. One instance owns exactly
/// one network endpoint.
pub struct SubxtRpcClient {
    endpoint: String,
    client: OnlineClient<PolkadotConfig>,
    chain_id: u64,
    properties: OnceCell<ChainProperties>,
}

impl SubxtRpcClient {
    /// Connects to `endpoint` and builds a codec context for `chain_id`'s type
    /// registry preset. Fails with `RemoteUnavailable` on a connect/handshake
    /// failure.
    pub async fn connect(endpoint: &str, chain_id: u64) -> Result<Self, RpcError> {
        let client = OnlineClient::<PolkadotConfig>::from_url(endpoint)
            .await
            .map_err(|e| RpcError::RemoteUnavailable(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.to_owned(),
            client,
            chain_id,
            properties: OnceCell::new(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn rpc(&self) -> LegacyRpcMethods<PolkadotConfig> {
        LegacyRpcMethods::new(self.client.backend().clone().into())
    }
}

#[async_trait]
impl SubstrateRpcApi for SubxtRpcClient {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        // The configured endpoint is dedicated to one chain, so this never
        // makes a round trip.
        Ok(self.chain_id)
    }

    async fn chain_properties(&self) -> Result<ChainProperties, RpcError> {
        if let Some(props) = self.properties.get() {
            return Ok(props.clone());
        }
        let props = self
            .rpc()
            .system_properties()
            .await
            .map_err(classify_rpc_error)?;
        let ss58_format = props
            .get("ss58Format")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| RpcError::MalformedResponse("missing ss58Format".into()))?
            as u16;
        let token_symbol = props
            .get("tokenSymbol")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|v| v.as_str())
            .ok_or_else(|| RpcError::MalformedResponse("missing tokenSymbol".into()))?
            .to_owned();
        let token_decimals = props
            .get("tokenDecimals")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|v| v.as_u64())
            .ok_or_else(|| RpcError::MalformedResponse("missing tokenDecimals".into()))?
            as u8;
        let properties = ChainProperties {
            ss58_format,
            token_symbol,
            token_decimals,
        };
        let _ = self.properties.set(properties.clone());
        Ok(properties)
    }

    async fn head_block_number(&self) -> Result<u64, RpcError> {
        let block = self
            .client
            .blocks()
            .at_latest()
            .await
            .map_err(classify_rpc_error)?;
        Ok(block.number() as u64)
    }

    async fn block_extrinsics(&self, block_number: u64) -> Result<BlockExtrinsics, RpcError> {
        let hash = self
            .rpc()
            .chain_get_block_hash(Some(block_number.into()))
            .await
            .map_err(classify_rpc_error)?
            .ok_or_else(|| RpcError::MalformedResponse(format!("no block at {block_number}")))?;

        let block = self
            .client
            .blocks()
            .at(hash)
            .await
            .map_err(classify_rpc_error)?;

        let body = block
            .extrinsics()
            .await
            .map_err(|e| RpcError::MalformedResponse(e.to_string()))?;

        let mut extrinsics = Vec::new();
        for details in body.iter() {
            let details = details.map_err(|e| RpcError::MalformedResponse(e.to_string()))?;
            extrinsics.push(decode_extrinsic(&details)?);
        }

        let hash_hex = format!("0x{}", hex::encode(hash.as_bytes()));

        Ok(BlockExtrinsics {
            block_hash: hash_hex,
            extrinsics,
        })
    }

    async fn extrinsic_receipt(
        &self,
        block_hash: &str,
        extrinsic_hash: &str,
    ) -> Result<Receipt, RpcError> {
        let hash = parse_hash(block_hash)?;
        let block = self
            .client
            .blocks()
            .at(hash)
            .await
            .map_err(classify_rpc_error)?;

        let body = block
            .extrinsics()
            .await
            .map_err(|e| RpcError::MalformedResponse(e.to_string()))?;

        let extrinsic_index = body
            .iter()
            .enumerate()
            .find_map(|(idx, details)| {
                let details = details.ok()?;
                let hex_hash = format!("0x{}", hex::encode(details.hash().as_bytes()));
                (hex_hash == extrinsic_hash).then_some(idx as u32)
            })
            .ok_or_else(|| {
                RpcError::MalformedResponse(format!("extrinsic {extrinsic_hash} not in block"))
            })?;

        let events = block
            .events()
            .await
            .map_err(|e| RpcError::MalformedResponse(e.to_string()))?;

        for event in events.iter() {
            let event = event.map_err(|e| RpcError::MalformedResponse(e.to_string()))?;
            let in_scope = matches!(
                event.phase(),
                subxt::events::Phase::ApplyExtrinsic(i) if i == extrinsic_index
            );
            if !in_scope {
                continue;
            }
            if event.pallet_name() != "TransactionPayment" || event.variant_name() != "TransactionFeePaid" {
                continue;
            }
            let fields = event
                .field_values()
                .map_err(|e| RpcError::MalformedResponse(e.to_string()))?;
            let fee_minor = extract_u128_field(&fields, "actual_fee").ok_or_else(|| {
                RpcError::MalformedResponse("TransactionFeePaid missing actual_fee".into())
            })?;
            return Ok(Receipt {
                extrinsic_index,
                fee_minor,
            });
        }

        Err(RpcError::MalformedResponse(format!(
            "no TransactionFeePaid event for extrinsic index {extrinsic_index}"
        )))
    }
}

/// Classifies a `subxt` RPC failure as a genuine server-side rejection versus
/// a transport-level failure (connection drop, request timeout). `subxt`
/// wraps the underlying `jsonrpsee` client error opaquely, so this inspects
/// the rendered message for the shape `jsonrpsee` uses when the server
/// actually answered with a JSON-RPC error object, rather than when the
/// request never reached or returned from the server at all.
fn classify_rpc_error<E: std::fmt::Display>(e: E) -> RpcError {
    let msg = e.to_string();
    if is_server_rejection(&msg) {
        RpcError::RemoteRejected(msg)
    } else {
        RpcError::RemoteUnavailable(msg)
    }
}

fn is_server_rejection(msg: &str) -> bool {
    msg.contains("Server returned an error object")
        || msg.contains("Method not found")
        || msg.contains("Invalid params")
        || msg.contains("error code")
}

fn parse_hash(hex_str: &str) -> Result<subxt::utils::H256, RpcError> {
    let stripped = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    let bytes = hex::decode(stripped)
        .map_err(|e| RpcError::MalformedResponse(format!("invalid block hash: {e}")))?;
    if bytes.len() != 32 {
        return Err(RpcError::MalformedResponse("block hash must be 32 bytes".into()));
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(subxt::utils::H256::from(arr))
}

fn decode_extrinsic(
    details: &subxt::blocks::ExtrinsicDetails<PolkadotConfig, OnlineClient<PolkadotConfig>>,
) -> Result<Extrinsic, RpcError> {
    let call_module = details.pallet_name().to_owned();
    let call_function = details.variant_name().to_owned();
    let contains_transaction = details.is_signed();

    let signer_public_key = details.address_bytes().and_then(|bytes| {
        // A `MultiAddress::Id(AccountId32)` SCALE-encodes as a `0x00` tag
        // followed by the 32-byte account id.
        if bytes.len() == 33 && bytes[0] == 0 {
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes[1..33]);
            Some(key)
        } else {
            None
        }
    });

    let nonce = None; // not exposed by `ExtrinsicDetails` without decoding signed extras.

    let field_values = details
        .field_values()
        .map_err(|e| RpcError::MalformedResponse(e.to_string()))?;
    let mut params = composite_to_param(&field_values);

    if call_module == "Timestamp" && call_function == "set" {
        if let Some(millis) = extract_u128_field(&field_values, "now") {
            let secs = (millis / 1000) as i64;
            if let Some(dt) = NaiveDateTime::from_timestamp_opt(secs, 0) {
                params = Param::String(dt.format("%Y-%m-%dT%H:%M:%S").to_string());
            }
        }
    }

    let extrinsic_hash = Some(format!("0x{}", hex::encode(details.hash().as_bytes())));

    Ok(Extrinsic {
        extrinsic_hash,
        signer_public_key,
        nonce,
        call_module,
        call_function,
        params,
        contains_transaction,
    })
}

fn extract_u128_field(fields: &Composite<u32>, name: &str) -> Option<u128> {
    match fields {
        Composite::Named(entries) => entries
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| value_to_u128(v)),
        Composite::Unnamed(_) => None,
    }
}

fn value_to_u128(value: &Value<u32>) -> Option<u128> {
    match &value.value {
        ValueDef::Primitive(Primitive::U128(n)) => Some(*n),
        ValueDef::Primitive(Primitive::U256(n)) => Some(u128::from_le_bytes(
            n[..16].try_into().unwrap_or([0u8; 16]),
        )),
        _ => None,
    }
}

fn composite_to_param(fields: &Composite<u32>) -> Param {
    match fields {
        Composite::Named(entries) => {
            let mut map = std::collections::BTreeMap::new();
            for (name, value) in entries {
                map.insert(name.clone(), value_to_param(value));
            }
            Param::Object(map)
        }
        Composite::Unnamed(values) => Param::Array(values.iter().map(value_to_param).collect()),
    }
}

fn value_to_param(value: &Value<u32>) -> Param {
    match &value.value {
        ValueDef::Composite(composite) => composite_to_param(composite),
        ValueDef::Variant(variant) => {
            let mut map = std::collections::BTreeMap::new();
            map.insert(variant.name.clone(), composite_to_param(&variant.values));
            Param::Object(map)
        }
        ValueDef::BitSequence(bits) => {
            Param::Array(bits.iter().map(|b| Param::Bool(b)).collect())
        }
        ValueDef::Primitive(p) => match p {
            Primitive::Bool(b) => Param::Bool(*b),
            Primitive::Char(c) => Param::String(c.to_string()),
            Primitive::String(s) => Param::String(s.clone()),
            Primitive::U128(n) => Param::Int(*n as i128),
            Primitive::I128(n) => Param::Int(*n),
            Primitive::U256(bytes) => Param::Bytes(bytes.to_vec()),
            Primitive::I256(bytes) => Param::Bytes(bytes.to_vec()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_seconds_format_is_consistent() {
        let dt = NaiveDateTime::from_timestamp_opt(1_700_000_000, 0).unwrap();
        let rendered = dt.format("%Y-%m-%dT%H:%M:%S").to_string();
        assert_eq!(rendered.len(), "YYYY-MM-DDTHH:MM:SS".len());
        // Sanity: round trips through chrono's own RFC3339 truncated form too.
        assert!(dt.to_string().starts_with(&rendered[..10]));
        let _ = SecondsFormat::Secs; // referenced to keep the import meaningful
    }

    #[test]
    fn classifies_a_server_error_object_as_rejected() {
        assert!(matches!(
            classify_rpc_error("Server returned an error object: method error"),
            RpcError::RemoteRejected(_)
        ));
        assert!(matches!(
            classify_rpc_error("Invalid params: bad hash"),
            RpcError::RemoteRejected(_)
        ));
    }

    #[test]
    fn classifies_a_connection_failure_as_unavailable() {
        assert!(matches!(
            classify_rpc_error("io error: connection refused"),
            RpcError::RemoteUnavailable(_)
        ));
    }
}
