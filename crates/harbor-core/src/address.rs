//! Address encodings and scripthash computation
//!
//! Produces the four standard single-key address encodings (P2PKH,
//! P2SH-P2WPKH, P2WPKH, P2TR) from public keys, and maps any encoded address
//! back to its locking script and Electrum-style scripthash.

use crate::{Error, Result};
use bech32::{segwit, Fe32, Hrp};
use harbor_params::{Network, NetworkType};
use ripemd::Ripemd160;
use secp256k1::{PublicKey, Scalar, Secp256k1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;
const OP_EQUAL: u8 = 0x87;
const OP_PUSHBYTES_20: u8 = 0x14;
const OP_1: u8 = 0x51;

/// Single-key address representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AddressType {
    /// Pay-to-pubkey-hash (legacy)
    #[serde(rename = "p2pkh")]
    P2pkh,
    /// P2WPKH nested in P2SH (wrapped segwit)
    #[serde(rename = "p2sh-p2wpkh")]
    P2shP2wpkh,
    /// Pay-to-witness-pubkey-hash (native segwit)
    #[serde(rename = "p2wpkh")]
    P2wpkh,
    /// Pay-to-taproot, BIP-86 key-path only
    #[serde(rename = "p2tr")]
    P2tr,
}

impl AddressType {
    /// Every address type, in storage-key order
    pub const ALL: [AddressType; 4] = [
        AddressType::P2pkh,
        AddressType::P2shP2wpkh,
        AddressType::P2wpkh,
        AddressType::P2tr,
    ];

    /// Stable identifier used in storage keys
    pub const fn as_str(&self) -> &'static str {
        match self {
            AddressType::P2pkh => "p2pkh",
            AddressType::P2shP2wpkh => "p2sh-p2wpkh",
            AddressType::P2wpkh => "p2wpkh",
            AddressType::P2tr => "p2tr",
        }
    }

    /// Whether the encoding requires a compressed public key
    pub const fn requires_compressed_key(&self) -> bool {
        !matches!(self, AddressType::P2pkh)
    }

    /// Encode the address of `public_key` for this type.
    ///
    /// `public_key` is SEC1-encoded, 33 bytes (compressed) or 65 bytes
    /// (uncompressed, P2PKH only).
    pub fn encode(&self, public_key: &[u8], network: &Network) -> Result<String> {
        if self.requires_compressed_key() && public_key.len() != 33 {
            return Err(Error::UnsupportedAddressType(format!(
                "{} requires a compressed public key",
                self
            )));
        }
        let key = PublicKey::from_slice(public_key)
            .map_err(|e| Error::InvalidKey(format!("Invalid public key: {e}")))?;

        match self {
            AddressType::P2pkh => {
                Ok(base58_address(network.p2pkh_version, &hash160(public_key)))
            }
            AddressType::P2shP2wpkh => {
                let redeem_script = witness_v0_keyhash_script(&hash160(&key.serialize()));
                Ok(base58_address(network.p2sh_version, &hash160(&redeem_script)))
            }
            AddressType::P2wpkh => {
                segwit_address(network, segwit::VERSION_0, &hash160(&key.serialize()))
            }
            AddressType::P2tr => {
                let output_key = taproot_output_key(&key)?;
                segwit_address(network, segwit::VERSION_1, &output_key)
            }
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddressType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        AddressType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::UnsupportedAddressType(s.to_string()))
    }
}

/// A decoded address together with its locking script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAddress {
    /// The address string as given
    pub address: String,
    /// Network the encoding belongs to
    pub network: NetworkType,
    /// Single-key address type, if the script is one of the supported forms
    pub address_type: Option<AddressType>,
    /// Locking script (scriptPubKey)
    pub script_pubkey: Vec<u8>,
}

impl EncodedAddress {
    /// Decode a base58check or bech32/bech32m address
    pub fn parse(address: &str) -> Result<Self> {
        let lower = address.to_ascii_lowercase();
        let is_segwit = ["bc1", "tb1", "bcrt1"]
            .iter()
            .any(|prefix| lower.starts_with(prefix));

        if is_segwit {
            Self::parse_segwit(address)
        } else {
            Self::parse_base58(address)
        }
    }

    fn parse_segwit(address: &str) -> Result<Self> {
        let (hrp, version, program) = segwit::decode(address)
            .map_err(|e| Error::InvalidAddress(format!("{address}: {e}")))?;

        let network = match hrp.as_str().to_ascii_lowercase().as_str() {
            "bc" => NetworkType::Mainnet,
            "tb" => NetworkType::Testnet,
            "bcrt" => NetworkType::Regtest,
            other => {
                return Err(Error::InvalidAddress(format!(
                    "{address}: unknown human-readable part {other}"
                )))
            }
        };

        let version = version.to_u8();
        let address_type = match (version, program.len()) {
            (0, 20) => Some(AddressType::P2wpkh),
            (1, 32) => Some(AddressType::P2tr),
            _ => None,
        };

        let mut script_pubkey = Vec::with_capacity(program.len() + 2);
        script_pubkey.push(if version == 0 { 0 } else { OP_1 + version - 1 });
        script_pubkey.push(program.len() as u8);
        script_pubkey.extend_from_slice(&program);

        Ok(Self {
            address: address.to_string(),
            network,
            address_type,
            script_pubkey,
        })
    }

    fn parse_base58(address: &str) -> Result<Self> {
        let payload = bs58::decode(address)
            .with_check(None)
            .into_vec()
            .map_err(|e| Error::InvalidAddress(format!("{address}: {e}")))?;

        if payload.len() != 21 {
            return Err(Error::InvalidAddress(format!(
                "{address}: unexpected payload length {}",
                payload.len()
            )));
        }

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&payload[1..]);
        let mainnet = Network::mainnet();
        let testnet = Network::testnet();

        let (network, address_type, script_pubkey) = match payload[0] {
            v if v == mainnet.p2pkh_version => {
                (NetworkType::Mainnet, AddressType::P2pkh, p2pkh_script(&hash))
            }
            v if v == testnet.p2pkh_version => {
                (NetworkType::Testnet, AddressType::P2pkh, p2pkh_script(&hash))
            }
            // P2SH is only ever produced here as wrapped P2WPKH.
            v if v == mainnet.p2sh_version => {
                (NetworkType::Mainnet, AddressType::P2shP2wpkh, p2sh_script(&hash))
            }
            v if v == testnet.p2sh_version => {
                (NetworkType::Testnet, AddressType::P2shP2wpkh, p2sh_script(&hash))
            }
            other => {
                return Err(Error::InvalidAddress(format!(
                    "{address}: unknown version byte 0x{other:02x}"
                )))
            }
        };

        Ok(Self {
            address: address.to_string(),
            network,
            address_type: Some(address_type),
            script_pubkey,
        })
    }

    /// Electrum-protocol scripthash of this address
    pub fn scripthash(&self) -> String {
        scripthash_for_script(&self.script_pubkey)
    }
}

/// Electrum-protocol scripthash for an encoded address: SHA-256 of the
/// locking script, byte-reversed, hex-encoded.
pub fn address_to_scripthash(address: &str) -> Result<String> {
    Ok(EncodedAddress::parse(address)?.scripthash())
}

/// Electrum-protocol scripthash of a raw locking script
pub fn scripthash_for_script(script: &[u8]) -> String {
    let mut digest: [u8; 32] = Sha256::digest(script).into();
    digest.reverse();
    hex::encode(digest)
}

/// RIPEMD160(SHA256(data))
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    Ripemd160::digest(sha).into()
}

fn tagged_hash(tag: &[u8], msg: &[u8]) -> [u8; 32] {
    let tag_hash = Sha256::digest(tag);
    let mut hasher = Sha256::new();
    hasher.update(tag_hash);
    hasher.update(tag_hash);
    hasher.update(msg);
    hasher.finalize().into()
}

/// BIP-86 output key: internal key tweaked with an empty script tree
fn taproot_output_key(internal: &PublicKey) -> Result<[u8; 32]> {
    let secp = Secp256k1::verification_only();
    let (x_only, _parity) = internal.x_only_public_key();
    let tweak = tagged_hash(b"TapTweak", &x_only.serialize());
    let scalar = Scalar::from_be_bytes(tweak)
        .map_err(|_| Error::KeyDerivation("Taproot tweak out of range".to_string()))?;
    let (output_key, _parity) = x_only
        .add_tweak(&secp, &scalar)
        .map_err(|e| Error::KeyDerivation(format!("Taproot tweak failed: {e}")))?;
    Ok(output_key.serialize())
}

fn base58_address(version: u8, hash: &[u8; 20]) -> String {
    let mut payload = Vec::with_capacity(21);
    payload.push(version);
    payload.extend_from_slice(hash);
    bs58::encode(payload).with_check().into_string()
}

fn segwit_address(network: &Network, version: Fe32, program: &[u8]) -> Result<String> {
    let hrp = Hrp::parse(network.bech32_hrp)
        .map_err(|e| Error::Other(format!("Invalid bech32 hrp {}: {e}", network.bech32_hrp)))?;
    segwit::encode(hrp, version, program)
        .map_err(|e| Error::InvalidAddress(format!("Segwit encoding failed: {e}")))
}

fn p2pkh_script(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[OP_DUP, OP_HASH160, OP_PUSHBYTES_20]);
    script.extend_from_slice(hash);
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

fn p2sh_script(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.extend_from_slice(&[OP_HASH160, OP_PUSHBYTES_20]);
    script.extend_from_slice(hash);
    script.push(OP_EQUAL);
    script
}

fn witness_v0_keyhash_script(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(22);
    script.extend_from_slice(&[0x00, OP_PUSHBYTES_20]);
    script.extend_from_slice(hash);
    script
}
