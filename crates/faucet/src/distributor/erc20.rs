//! ERC-20 distributor
//!
//! Reads the faucet balance with `balanceOf` and pays out with `transfer`,
//! signing legacy EIP-155 transactions locally. Submissions are serialized
//! through a local nonce so concurrent claims for different addresses do not
//! collide.

use super::rpc::{BlockchainRpcClient, RpcError};
use super::{Distributor, TransferReceipt};
use crate::error::DistributorError;
use crate::identity::{checksum_address, Identity};
use async_trait::async_trait;
use ethabi::{ParamType, Token};
use k256::ecdsa::SigningKey;
use rlp::RlpStream;
use std::collections::HashMap;
use std::sync::{Mutex as SyncMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

/// Settings for [`Erc20Distributor`].
#[derive(Debug, Clone)]
pub struct Erc20Settings {
    pub rpc_url: String,
    pub private_key: String,
    pub token_address: String,
    pub gas_limit: u64,
    pub gas_price: Option<u128>,
    pub chain_id: Option<u64>,
    pub request_timeout: Duration,
}

/// Unsigned legacy transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LegacyTx {
    nonce: u64,
    gas_price: u128,
    gas_limit: u64,
    to: [u8; 20],
    value: u128,
    data: Vec<u8>,
}

impl LegacyTx {
    fn append_body(&self, stream: &mut RlpStream) {
        stream.append(&self.nonce);
        stream.append(&self.gas_price);
        stream.append(&self.gas_limit);
        stream.append(&self.to.to_vec());
        stream.append(&self.value);
        stream.append(&self.data);
    }

    /// EIP-155 signing payload.
    fn signing_hash(&self, chain_id: u64) -> [u8; 32] {
        let mut stream = RlpStream::new_list(9);
        self.append_body(&mut stream);
        stream.append(&chain_id);
        stream.append(&0u8);
        stream.append(&0u8);
        keccak_hash::keccak(stream.out()).0
    }

    /// Sign and encode. Returns the raw transaction and its hash.
    fn sign(&self, key: &SigningKey, chain_id: u64) -> Result<(Vec<u8>, String), DistributorError> {
        let sighash = self.signing_hash(chain_id);
        let (signature, recovery_id) = key
            .sign_prehash_recoverable(&sighash)
            .map_err(|e| DistributorError::Rejected(format!("Signing failed: {}", e)))?;

        let v = chain_id * 2 + 35 + recovery_id.to_byte() as u64;
        let sig_bytes = signature.to_bytes();
        let (r, s) = sig_bytes.split_at(32);

        let mut stream = RlpStream::new_list(9);
        self.append_body(&mut stream);
        stream.append(&v);
        stream.append(&trim_leading_zeros(r).to_vec());
        stream.append(&trim_leading_zeros(s).to_vec());

        let raw = stream.out().to_vec();
        let tx_hash = format!("0x{}", hex::encode(keccak_hash::keccak(&raw).0));
        Ok((raw, tx_hash))
    }
}

fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

fn parse_address(raw: &str) -> Result<[u8; 20], DistributorError> {
    Identity::parse(raw)
        .and_then(|id| id.to_bytes())
        .ok_or_else(|| DistributorError::Rejected(format!("Invalid address: {}", raw)))
}

/// Ethereum address of a signing key.
pub fn address_of(key: &SigningKey) -> [u8; 20] {
    let public_key = key.verifying_key().to_encoded_point(false);
    let hash = keccak_hash::keccak(&public_key.as_bytes()[1..]); // Skip the 0x04 tag
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash.0[12..]);
    address
}

fn balance_of_call(owner: &[u8; 20]) -> Vec<u8> {
    let mut data = ethabi::short_signature("balanceOf", &[ParamType::Address]).to_vec();
    data.extend(ethabi::encode(&[Token::Address(ethabi::Address::from(*owner))]));
    data
}

fn transfer_call(to: &[u8; 20], amount: u128) -> Vec<u8> {
    let mut data =
        ethabi::short_signature("transfer", &[ParamType::Address, ParamType::Uint(256)]).to_vec();
    data.extend(ethabi::encode(&[
        Token::Address(ethabi::Address::from(*to)),
        Token::Uint(ethabi::Uint::from(amount)),
    ]));
    data
}

fn decode_balance(output: &[u8]) -> Result<u128, DistributorError> {
    let tokens = ethabi::decode(&[ParamType::Uint(256)], output)
        .map_err(|e| DistributorError::Unavailable(format!("Bad balanceOf output: {}", e)))?;
    let value = tokens
        .into_iter()
        .next()
        .and_then(Token::into_uint)
        .ok_or_else(|| DistributorError::Unavailable("Empty balanceOf output".to_string()))?;

    if value > ethabi::Uint::from(u128::MAX) {
        Ok(u128::MAX)
    } else {
        Ok(value.low_u128())
    }
}

fn unavailable(e: RpcError) -> DistributorError {
    DistributorError::Unavailable(e.to_string())
}

pub struct Erc20Distributor {
    rpc: BlockchainRpcClient,
    signing_key: SigningKey,
    faucet_address: [u8; 20],
    token_address: [u8; 20],
    gas_limit: u64,
    gas_price: Option<u128>,
    chain_id: OnceCell<u64>,
    /// Next nonce to use; `None` means ask the node.
    nonce: Mutex<Option<u64>>,
    /// Signed transfers awaiting the node's answer, by recipient.
    in_flight: SyncMutex<HashMap<Identity, String>>,
}

impl Erc20Distributor {
    pub fn new(settings: Erc20Settings) -> Result<Self, DistributorError> {
        let key_hex = settings
            .private_key
            .strip_prefix("0x")
            .unwrap_or(&settings.private_key);
        let key_bytes = hex::decode(key_hex)
            .map_err(|e| DistributorError::Rejected(format!("Invalid private key: {}", e)))?;
        let signing_key = SigningKey::from_slice(&key_bytes)
            .map_err(|e| DistributorError::Rejected(format!("Invalid signing key: {}", e)))?;

        let faucet_address = address_of(&signing_key);
        let token_address = parse_address(&settings.token_address)?;
        info!(
            faucet = %checksum_address(&faucet_address),
            token = %checksum_address(&token_address),
            "ERC-20 distributor ready"
        );

        let rpc = BlockchainRpcClient::new(settings.rpc_url, settings.request_timeout)
            .map_err(unavailable)?;

        let chain_id = match settings.chain_id {
            Some(id) => OnceCell::new_with(Some(id)),
            None => OnceCell::new(),
        };

        Ok(Self {
            rpc,
            signing_key,
            faucet_address,
            token_address,
            gas_limit: settings.gas_limit,
            gas_price: settings.gas_price,
            chain_id,
            nonce: Mutex::new(None),
            in_flight: SyncMutex::new(HashMap::new()),
        })
    }

    pub fn faucet_address(&self) -> [u8; 20] {
        self.faucet_address
    }

    async fn chain_id(&self) -> Result<u64, DistributorError> {
        self.chain_id
            .get_or_try_init(|| async { self.rpc.chain_id().await.map_err(unavailable) })
            .await
            .copied()
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<Identity, String>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn gas_price(&self) -> Result<u128, DistributorError> {
        match self.gas_price {
            Some(price) => Ok(price),
            None => self.rpc.gas_price().await.map_err(unavailable),
        }
    }
}

#[async_trait]
impl Distributor for Erc20Distributor {
    async fn balance(&self) -> Result<u128, DistributorError> {
        let output = self
            .rpc
            .eth_call(&self.token_address, &balance_of_call(&self.faucet_address))
            .await
            .map_err(unavailable)?;
        decode_balance(&output)
    }

    async fn submit(
        &self,
        recipient: &Identity,
        amount: u128,
    ) -> Result<TransferReceipt, DistributorError> {
        let to = recipient
            .to_bytes()
            .ok_or_else(|| DistributorError::Rejected(format!("Invalid recipient: {}", recipient)))?;

        let chain_id = self.chain_id().await?;
        let gas_price = self.gas_price().await?;

        let mut next_nonce = self.nonce.lock().await;
        let nonce = match *next_nonce {
            Some(n) => n,
            None => self
                .rpc
                .pending_nonce(&self.faucet_address)
                .await
                .map_err(unavailable)?,
        };

        let tx = LegacyTx {
            nonce,
            gas_price,
            gas_limit: self.gas_limit,
            to: self.token_address,
            value: 0,
            data: transfer_call(&to, amount),
        };
        let (raw, local_hash) = tx.sign(&self.signing_key, chain_id)?;
        debug!(nonce, tx_hash = %local_hash, "Sending transfer");

        // If this future is dropped mid-send the node may already hold the
        // nonce; the next submit asks again.
        *next_nonce = None;
        self.in_flight().insert(recipient.clone(), local_hash.clone());
        let sent = self.rpc.send_raw_transaction(&raw).await;
        self.in_flight().remove(recipient);

        match sent {
            Ok(tx_hash) => {
                *next_nonce = Some(nonce + 1);
                if !tx_hash.eq_ignore_ascii_case(&local_hash) {
                    warn!(node = %tx_hash, local = %local_hash, "Node reported a different transaction hash");
                }
                info!(%recipient, %tx_hash, "Transaction sent");
                Ok(TransferReceipt { tx_hash })
            }
            Err(e) => Err(match e {
                RpcError::Connect(msg) => DistributorError::Unavailable(msg),
                RpcError::Node(msg) => DistributorError::Rejected(msg),
                RpcError::NoResponse(msg) | RpcError::InvalidResponse(msg) => {
                    DistributorError::Ambiguous {
                        tx_hash: Some(local_hash),
                        reason: msg,
                    }
                }
            }),
        }
    }

    fn take_abandoned(&self, recipient: &Identity) -> Option<String> {
        self.in_flight().remove(recipient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    const KEY_ONE: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";
    const TOKEN: &str = "0x1111111111111111111111111111111111111111";

    #[test]
    fn test_address_of_known_key() {
        let key = SigningKey::from_slice(&hex::decode(&KEY_ONE[2..]).unwrap()).unwrap();
        assert_eq!(
            checksum_address(&address_of(&key)),
            "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf"
        );
    }

    #[test]
    fn test_call_encoding() {
        let to = [0x22u8; 20];
        let data = transfer_call(&to, 5);
        assert_eq!(hex::encode(&data[..4]), "a9059cbb");
        assert_eq!(data.len(), 4 + 64);
        assert_eq!(&data[16..36], &to);
        assert_eq!(data[67], 5);

        let data = balance_of_call(&to);
        assert_eq!(hex::encode(&data[..4]), "70a08231");
    }

    #[test]
    fn test_decode_balance_saturates() {
        let mut word = [0u8; 32];
        word[31] = 7;
        assert_eq!(decode_balance(&word).unwrap(), 7);

        let word = [0xffu8; 32];
        assert_eq!(decode_balance(&word).unwrap(), u128::MAX);
    }

    #[test]
    fn test_signature_recovers_sender() {
        let key = SigningKey::from_slice(&hex::decode(&KEY_ONE[2..]).unwrap()).unwrap();
        let tx = LegacyTx {
            nonce: 3,
            gas_price: 1_000_000_000,
            gas_limit: 100_000,
            to: [0x11; 20],
            value: 0,
            data: transfer_call(&[0x22; 20], 5),
        };
        let chain_id = 421614;
        let (raw, tx_hash) = tx.sign(&key, chain_id).unwrap();
        assert_eq!(tx_hash.len(), 66);

        let decoded = rlp::Rlp::new(&raw);
        assert_eq!(decoded.item_count().unwrap(), 9);
        let v: u64 = decoded.val_at(6).unwrap();
        let r: Vec<u8> = decoded.val_at(7).unwrap();
        let s: Vec<u8> = decoded.val_at(8).unwrap();

        let mut sig_bytes = [0u8; 64];
        sig_bytes[32 - r.len()..32].copy_from_slice(&r);
        sig_bytes[64 - s.len()..].copy_from_slice(&s);
        let signature = Signature::from_slice(&sig_bytes).unwrap();
        let recovery_id = RecoveryId::from_byte((v - 35 - chain_id * 2) as u8).unwrap();

        let recovered =
            VerifyingKey::recover_from_prehash(&tx.signing_hash(chain_id), &signature, recovery_id)
                .unwrap();
        assert_eq!(&recovered, key.verifying_key());
    }

    /// Minimal ledger node answering the calls the distributor makes.
    async fn mock_node(
        balance: u128,
        send_error: Option<&'static str>,
        send_delay: Duration,
    ) -> (String, Arc<AtomicU64>) {
        let sent = Arc::new(AtomicU64::new(0));
        let counter = sent.clone();

        let app = Router::new().route(
            "/",
            post(move |Json(request): Json<Value>| {
                let counter = counter.clone();
                async move {
                    let result = match request["method"].as_str().unwrap_or_default() {
                        "eth_chainId" => json!("0x66eee"),
                        "eth_gasPrice" => json!("0x3b9aca00"),
                        "eth_getTransactionCount" => json!("0x7"),
                        "eth_call" => json!(format!("0x{:064x}", balance)),
                        "eth_sendRawTransaction" => {
                            tokio::time::sleep(send_delay).await;
                            if let Some(message) = send_error {
                                return Json(json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32000, "message": message}}));
                            }
                            counter.fetch_add(1, Ordering::SeqCst);
                            json!(format!("0x{:064x}", counter.load(Ordering::SeqCst)))
                        }
                        _ => Value::Null,
                    };
                    Json(json!({"jsonrpc": "2.0", "id": 1, "result": result}))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), sent)
    }

    fn distributor(rpc_url: String) -> Erc20Distributor {
        Erc20Distributor::new(Erc20Settings {
            rpc_url,
            private_key: KEY_ONE.to_string(),
            token_address: TOKEN.to_string(),
            gas_limit: 100_000,
            gas_price: None,
            chain_id: None,
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_balance_and_submit_against_mock_node() {
        let (url, sent) = mock_node(5_000_000_000_000_000_000, None, Duration::ZERO).await;
        let distributor = distributor(url);

        assert_eq!(distributor.balance().await.unwrap(), 5_000_000_000_000_000_000);

        let recipient = Identity::normalize("0x2222222222222222222222222222222222222222");
        let receipt = distributor.submit(&recipient, 1).await.unwrap();
        assert!(receipt.tx_hash.starts_with("0x"));
        distributor.submit(&recipient, 1).await.unwrap();

        assert_eq!(sent.load(Ordering::SeqCst), 2);
        // Second transfer reused the locally tracked nonce
        assert_eq!(*distributor.nonce.lock().await, Some(9));
    }

    #[tokio::test]
    async fn test_node_rejection_is_not_ambiguous() {
        let (url, _) = mock_node(1, Some("nonce too low"), Duration::ZERO).await;
        let distributor = distributor(url);

        let recipient = Identity::normalize("0x2222222222222222222222222222222222222222");
        let err = distributor.submit(&recipient, 1).await.unwrap_err();
        assert!(matches!(err, DistributorError::Rejected(ref m) if m == "nonce too low"));
        assert_eq!(*distributor.nonce.lock().await, None);
    }

    #[tokio::test]
    async fn test_dropped_send_keeps_hash_and_forgets_nonce() {
        let (url, _) = mock_node(1, None, Duration::from_millis(500)).await;
        let distributor = distributor(url);
        *distributor.nonce.lock().await = Some(7);

        let recipient = Identity::normalize("0x2222222222222222222222222222222222222222");
        let result =
            tokio::time::timeout(Duration::from_millis(100), distributor.submit(&recipient, 1)).await;
        assert!(result.is_err());

        assert_eq!(*distributor.nonce.lock().await, None);
        let tx_hash = distributor.take_abandoned(&recipient).unwrap();
        assert!(tx_hash.starts_with("0x"));
        assert_eq!(tx_hash.len(), 66);
        assert!(distributor.take_abandoned(&recipient).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_node_is_unavailable() {
        let distributor = distributor("http://127.0.0.1:1".to_string());
        assert!(matches!(
            distributor.balance().await,
            Err(DistributorError::Unavailable(_))
        ));
    }
}
