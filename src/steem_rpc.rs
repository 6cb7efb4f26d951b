// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Simple async JSON-RPC client for Steem condenser API
//!
//! Covers the three ledger capabilities the relay needs: head height,
//! block fetch, and broadcast of a signed native transfer. Transfer
//! transactions are assembled and signed here: TaPoS fields from the head
//! block id, graphene binary serialization, sha256(chain-id || tx) digest,
//! canonical secp256k1 recoverable signature.

use crate::error::{RelayError, RelayResult};
use crate::types::{Asset, ASSET_PRECISION};
use fastcrypto::encoding::{Base58, Encoding};
use fastcrypto::hash::{HashFunction, Sha256};
use fastcrypto::secp256k1::{Secp256k1KeyPair, Secp256k1PrivateKey};
use fastcrypto::traits::{RecoverableSigner, ToFromBytes};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Steem mainnet chain id (all zeroes), prefixed to the serialized
/// transaction before signing.
const STEEM_CHAIN_ID: [u8; 32] = [0; 32];

/// Operation id of `transfer` in the Steem protocol
const TRANSFER_OPERATION_ID: u64 = 2;

const TX_EXPIRATION_SECS: i64 = 60;

const MAX_CANONICAL_ATTEMPTS: usize = 16;

#[derive(Clone, Debug)]
pub struct SteemRpcClient {
    http_client: reqwest::Client,
    rpc_url: String,
    request_id: Arc<AtomicU64>,
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    method: String,
    params: Vec<Value>,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DynamicGlobalProperties {
    pub head_block_number: u64,
    pub head_block_id: String,
    /// Chain time, `%Y-%m-%dT%H:%M:%S`
    pub time: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignedBlock {
    pub timestamp: String,
    #[serde(default)]
    pub transaction_ids: Vec<String>,
    #[serde(default)]
    pub transactions: Vec<BlockTransaction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockTransaction {
    /// Operations as `[name, payload]` pairs
    #[serde(default)]
    pub operations: Vec<(String, Value)>,
}

/// Active key used to sign outbound transfers
pub struct SteemKey {
    keypair: Secp256k1KeyPair,
}

impl SteemKey {
    /// Decode a WIF-encoded (base58check) secret key.
    pub fn from_wif(wif: &str) -> RelayResult<Self> {
        let bytes = Base58::decode(wif)
            .map_err(|e| RelayError::Config(format!("invalid WIF encoding: {e}")))?;
        if bytes.len() != 37 || bytes[0] != 0x80 {
            return Err(RelayError::Config("invalid WIF payload".to_string()));
        }
        let (payload, checksum) = bytes.split_at(33);
        let digest = Sha256::digest(Sha256::digest(payload).digest).digest;
        if digest[..4] != checksum[..] {
            return Err(RelayError::Config("WIF checksum mismatch".to_string()));
        }
        let private = Secp256k1PrivateKey::from_bytes(&payload[1..33])
            .map_err(|e| RelayError::Config(format!("invalid secp256k1 secret: {e}")))?;
        Ok(Self {
            keypair: Secp256k1KeyPair::from(private),
        })
    }

    /// Sign `message` (sha256-hashed internally) and return the 65-byte
    /// graphene signature: recovery prefix followed by r || s.
    fn sign_message(&self, message: &[u8]) -> [u8; 65] {
        let signature = self.keypair.sign_recoverable_with_hash::<Sha256>(message);
        let bytes = signature.as_bytes(); // r || s || recovery id
        let mut out = [0u8; 65];
        out[0] = 31 + bytes[64]; // 27 + 4 (compressed public key)
        out[1..].copy_from_slice(&bytes[..64]);
        out
    }
}

impl SteemRpcClient {
    pub fn new(rpc_url: impl Into<String>) -> Self {
        fn shared_http_client() -> reqwest::Client {
            static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
            CLIENT
                .get_or_init(|| {
                    reqwest::Client::builder()
                        .pool_max_idle_per_host(64)
                        .tcp_keepalive(Some(Duration::from_secs(30)))
                        .connect_timeout(Duration::from_secs(2))
                        .timeout(Duration::from_secs(30))
                        .build()
                        .expect("Failed to build reqwest client")
                })
                .clone()
        }

        Self {
            http_client: shared_http_client(),
            rpc_url: rpc_url.into(),
            request_id: Arc::new(AtomicU64::new(1)),
        }
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> RelayResult<Value> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);

        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id,
        };

        fn is_transient_transport_error(err: &reqwest::Error) -> bool {
            if err.is_connect() || err.is_timeout() {
                return true;
            }
            let msg = err.to_string().to_lowercase();
            msg.contains("connection closed")
                || msg.contains("connection reset")
                || msg.contains("broken pipe")
                || msg.contains("unexpected eof")
                || msg.contains("incomplete")
        }

        let max_attempts: usize = 3;
        let mut last_transport_err = None;

        for attempt in 0..max_attempts {
            let response = match self
                .http_client
                .post(&self.rpc_url)
                .json(&request)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) if is_transient_transport_error(&e) && attempt + 1 < max_attempts => {
                    tracing::debug!("[steem-rpc] transient transport error on {method}: {e}");
                    last_transport_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(200 * (attempt as u64 + 1))).await;
                    continue;
                }
                Err(e) => return Err(RelayError::Rpc(format!("{method}: {e}"))),
            };

            let parsed: JsonRpcResponse = response
                .json()
                .await
                .map_err(|e| RelayError::InvalidResponse(format!("{method}: {e}")))?;

            if let Some(error) = parsed.error {
                return Err(RelayError::Rpc(format!(
                    "{method}: server error {}: {}",
                    error.code, error.message
                )));
            }
            return parsed
                .result
                .ok_or_else(|| RelayError::InvalidResponse(format!("{method}: empty result")));
        }

        Err(RelayError::Rpc(format!(
            "{method}: transport failed after {max_attempts} attempts: {}",
            last_transport_err
                .map(|e| e.to_string())
                .unwrap_or_default()
        )))
    }

    pub async fn dynamic_global_properties(&self) -> RelayResult<DynamicGlobalProperties> {
        let value = self
            .call("condenser_api.get_dynamic_global_properties", Vec::new())
            .await?;
        serde_json::from_value(value)
            .map_err(|e| RelayError::InvalidResponse(format!("dynamic global properties: {e}")))
    }

    /// Fetch a block by height. Heights past the head yield `None`.
    pub async fn block(&self, height: u64) -> RelayResult<Option<SignedBlock>> {
        let value = self
            .call("condenser_api.get_block", vec![json!(height)])
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| RelayError::InvalidResponse(format!("block {height}: {e}")))
    }

    /// Broadcast a signed `transfer` operation and wait for inclusion.
    /// Returns the transaction id reported by the node.
    pub async fn broadcast_transfer(
        &self,
        key: &SteemKey,
        from: &str,
        to: &str,
        amount: &str,
        memo: &str,
    ) -> RelayResult<String> {
        let props = self.dynamic_global_properties().await?;
        let (ref_block_num, ref_block_prefix) =
            ref_block_fields(props.head_block_number, &props.head_block_id)?;
        let base_expiration = parse_chain_time(&props.time)? + TX_EXPIRATION_SECS;

        let op = TransferOperation {
            from,
            to,
            amount,
            memo,
        };

        // The chain rejects non-canonical signatures; the deterministic
        // nonce is perturbed by bumping the expiration until the produced
        // signature is canonical.
        let mut signed = None;
        for bump in 0..MAX_CANONICAL_ATTEMPTS as i64 {
            let expiration = base_expiration + bump;
            let tx_bytes =
                serialize_transaction(ref_block_num, ref_block_prefix, expiration as u32, &op)?;
            let mut message = Vec::with_capacity(STEEM_CHAIN_ID.len() + tx_bytes.len());
            message.extend_from_slice(&STEEM_CHAIN_ID);
            message.extend_from_slice(&tx_bytes);
            let signature = key.sign_message(&message);
            if is_canonical(&signature[1..]) {
                signed = Some((expiration, signature));
                break;
            }
        }
        let Some((expiration, signature)) = signed else {
            return Err(RelayError::Broadcast(
                "could not produce a canonical signature".to_string(),
            ));
        };

        let transaction = json!({
            "ref_block_num": ref_block_num,
            "ref_block_prefix": ref_block_prefix,
            "expiration": format_chain_time(expiration),
            "operations": [["transfer", {
                "from": from,
                "to": to,
                "amount": amount,
                "memo": memo,
            }]],
            "extensions": [],
            "signatures": [hex::encode(signature)],
        });

        let result = self
            .call(
                "condenser_api.broadcast_transaction_synchronous",
                vec![transaction],
            )
            .await?;
        result
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                RelayError::InvalidResponse("broadcast response missing transaction id".to_string())
            })
    }
}

struct TransferOperation<'a> {
    from: &'a str,
    to: &'a str,
    amount: &'a str,
    memo: &'a str,
}

/// TaPoS fields derived from the head block
fn ref_block_fields(head_block_number: u64, head_block_id: &str) -> RelayResult<(u16, u32)> {
    let id_bytes = hex::decode(head_block_id)
        .map_err(|e| RelayError::InvalidResponse(format!("head block id: {e}")))?;
    if id_bytes.len() < 8 {
        return Err(RelayError::InvalidResponse(
            "head block id too short".to_string(),
        ));
    }
    let ref_block_num = (head_block_number & 0xffff) as u16;
    let ref_block_prefix = u32::from_le_bytes([id_bytes[4], id_bytes[5], id_bytes[6], id_bytes[7]]);
    Ok((ref_block_num, ref_block_prefix))
}

fn serialize_transaction(
    ref_block_num: u16,
    ref_block_prefix: u32,
    expiration: u32,
    op: &TransferOperation<'_>,
) -> RelayResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(128);
    buf.extend_from_slice(&ref_block_num.to_le_bytes());
    buf.extend_from_slice(&ref_block_prefix.to_le_bytes());
    buf.extend_from_slice(&expiration.to_le_bytes());
    push_varint(&mut buf, 1); // operation count
    push_varint(&mut buf, TRANSFER_OPERATION_ID);
    push_string(&mut buf, op.from);
    push_string(&mut buf, op.to);
    push_asset(&mut buf, op.amount)?;
    push_string(&mut buf, op.memo);
    push_varint(&mut buf, 0); // extensions
    Ok(buf)
}

fn push_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn push_string(buf: &mut Vec<u8>, s: &str) {
    push_varint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

/// Graphene asset encoding: int64 amount, precision byte, 7-byte symbol
fn push_asset(buf: &mut Vec<u8>, amount: &str) -> RelayResult<()> {
    let asset = Asset::parse(amount)?;
    if asset.symbol.len() > 7 {
        return Err(RelayError::Amount(format!(
            "symbol {:?} too long for asset encoding",
            asset.symbol
        )));
    }
    buf.extend_from_slice(&asset.units.to_le_bytes());
    buf.push(ASSET_PRECISION as u8);
    let mut symbol = [0u8; 7];
    symbol[..asset.symbol.len()].copy_from_slice(asset.symbol.as_bytes());
    buf.extend_from_slice(&symbol);
    Ok(())
}

/// Canonical-signature predicate over the 64-byte r || s body
fn is_canonical(sig: &[u8]) -> bool {
    sig[0] & 0x80 == 0
        && !(sig[0] == 0 && sig[1] & 0x80 == 0)
        && sig[32] & 0x80 == 0
        && !(sig[32] == 0 && sig[33] & 0x80 == 0)
}

/// Block timestamp in unix milliseconds; malformed timestamps yield 0
pub fn parse_block_timestamp_ms(timestamp: &str) -> i64 {
    parse_chain_time(timestamp)
        .map(|secs| secs * 1000)
        .unwrap_or_else(|e| {
            tracing::debug!("unparseable block timestamp: {e}");
            0
        })
}

fn parse_chain_time(time: &str) -> RelayResult<i64> {
    chrono::NaiveDateTime::parse_from_str(time, "%Y-%m-%dT%H:%M:%S")
        .map(|dt| dt.and_utc().timestamp())
        .map_err(|e| RelayError::InvalidResponse(format!("bad chain timestamp {time:?}: {e}")))
}

fn format_chain_time(secs: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_default()
}
