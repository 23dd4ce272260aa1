//! Derivation schemes and the address derivation primitive
//!
//! Each scheme pairs a BIP purpose with one address encoding. HD keys are
//! derived along `m/purpose'/coin'/0'/chain/index`, starting from whatever
//! depth the supplied key already sits at.

use crate::address::AddressType;
use crate::keys::{ExtendedKey, ParsedKey};
use crate::{Error, Result};
use harbor_params::{Network, NetworkType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Order in which discovery scans the schemes
pub const SCAN_ORDER: [DerivationScheme; 4] = [
    DerivationScheme::NativeSegwit,
    DerivationScheme::WrappedSegwit,
    DerivationScheme::Legacy,
    DerivationScheme::Taproot,
];

/// Standardized derivation convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DerivationScheme {
    /// BIP-44, P2PKH
    Legacy,
    /// BIP-49, P2SH-P2WPKH
    WrappedSegwit,
    /// BIP-84, P2WPKH
    NativeSegwit,
    /// BIP-86, P2TR
    Taproot,
}

impl DerivationScheme {
    /// BIP purpose number
    pub const fn purpose(&self) -> u32 {
        match self {
            DerivationScheme::Legacy => 44,
            DerivationScheme::WrappedSegwit => 49,
            DerivationScheme::NativeSegwit => 84,
            DerivationScheme::Taproot => 86,
        }
    }

    /// Address encoding produced by this scheme
    pub const fn address_type(&self) -> AddressType {
        match self {
            DerivationScheme::Legacy => AddressType::P2pkh,
            DerivationScheme::WrappedSegwit => AddressType::P2shP2wpkh,
            DerivationScheme::NativeSegwit => AddressType::P2wpkh,
            DerivationScheme::Taproot => AddressType::P2tr,
        }
    }

    /// Scheme that produces `address_type`
    pub const fn for_address_type(address_type: AddressType) -> Self {
        match address_type {
            AddressType::P2pkh => DerivationScheme::Legacy,
            AddressType::P2shP2wpkh => DerivationScheme::WrappedSegwit,
            AddressType::P2wpkh => DerivationScheme::NativeSegwit,
            AddressType::P2tr => DerivationScheme::Taproot,
        }
    }

    /// Display-only prefix label for the scheme's addresses
    pub const fn prefix_label(&self, network: NetworkType) -> &'static str {
        match (self, network) {
            (DerivationScheme::Legacy, NetworkType::Mainnet) => "1...",
            (DerivationScheme::Legacy, _) => "m/n...",
            (DerivationScheme::WrappedSegwit, NetworkType::Mainnet) => "3...",
            (DerivationScheme::WrappedSegwit, _) => "2...",
            (DerivationScheme::NativeSegwit, NetworkType::Mainnet) => "bc1q...",
            (DerivationScheme::NativeSegwit, NetworkType::Regtest) => "bcrt1q...",
            (DerivationScheme::NativeSegwit, _) => "tb1q...",
            (DerivationScheme::Taproot, NetworkType::Mainnet) => "bc1p...",
            (DerivationScheme::Taproot, NetworkType::Regtest) => "bcrt1p...",
            (DerivationScheme::Taproot, _) => "tb1p...",
        }
    }

    /// Human-readable name
    pub const fn name(&self) -> &'static str {
        match self {
            DerivationScheme::Legacy => "Legacy",
            DerivationScheme::WrappedSegwit => "Wrapped SegWit",
            DerivationScheme::NativeSegwit => "Native SegWit",
            DerivationScheme::Taproot => "Taproot",
        }
    }

    /// Full path string for one address of this scheme
    pub fn path(&self, coin_type: u32, chain: Chain, index: u32) -> String {
        format!(
            "m/{}'/{}'/0'/{}/{}",
            self.purpose(),
            coin_type,
            chain.as_u32(),
            index
        )
    }
}

impl fmt::Display for DerivationScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Receiving or change branch of one account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    /// Receiving addresses (`/0/`)
    External,
    /// Change addresses (`/1/`)
    Internal,
}

impl Chain {
    /// Both chains, receiving first
    pub const BOTH: [Chain; 2] = [Chain::External, Chain::Internal];

    /// BIP-44 chain index
    pub const fn as_u32(&self) -> u32 {
        match self {
            Chain::External => 0,
            Chain::Internal => 1,
        }
    }

    /// Whether this is the change chain
    pub const fn is_change(&self) -> bool {
        matches!(self, Chain::Internal)
    }

    /// Chain for an `is_change` flag
    pub const fn from_is_change(is_change: bool) -> Self {
        if is_change {
            Chain::Internal
        } else {
            Chain::External
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::External => write!(f, "external"),
            Chain::Internal => write!(f, "internal"),
        }
    }
}

/// One derived address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedAddress {
    /// Encoded address
    pub address: String,
    /// Derivation path, or `"single-key"` for non-HD keys
    pub path: String,
    /// Child index within its chain
    pub index: u32,
    /// Whether the address is on the change chain
    pub is_change: bool,
    /// Encoding
    #[serde(rename = "type")]
    pub address_type: AddressType,
}

/// What the derivation primitive should produce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationRequest {
    /// Address encodings to derive
    pub address_types: Vec<AddressType>,
    /// Receiving indices
    pub receiving: Range<u32>,
    /// Change indices
    pub change: Range<u32>,
}

impl DerivationRequest {
    /// First `receiving_count` receiving and `change_count` change addresses
    pub fn counts(address_types: Vec<AddressType>, receiving_count: u32, change_count: u32) -> Self {
        Self {
            address_types,
            receiving: 0..receiving_count,
            change: 0..change_count,
        }
    }

    /// Inclusive index range on one chain of one address type
    pub fn chain_range(address_type: AddressType, chain: Chain, start: u32, end_inclusive: u32) -> Self {
        let range = start..end_inclusive.saturating_add(1);
        match chain {
            Chain::External => Self {
                address_types: vec![address_type],
                receiving: range,
                change: 0..0,
            },
            Chain::Internal => Self {
                address_types: vec![address_type],
                receiving: 0..0,
                change: range,
            },
        }
    }

    fn range_for(&self, chain: Chain) -> Range<u32> {
        match chain {
            Chain::External => self.receiving.clone(),
            Chain::Internal => self.change.clone(),
        }
    }
}

/// Turns key material into addresses
pub trait AddressDeriver: Send + Sync {
    /// Derive the requested addresses, receiving before change, ascending index
    fn derive(&self, key: &ParsedKey, request: &DerivationRequest) -> Result<Vec<DerivedAddress>>;
}

/// BIP-32 derivation over `bip32`/`secp256k1`
#[derive(Debug, Clone)]
pub struct Bip32Deriver {
    network: Network,
}

impl Bip32Deriver {
    /// Create a deriver for `network`
    pub fn new(network: NetworkType) -> Self {
        Self {
            network: Network::from_type(network),
        }
    }

    /// Network this deriver encodes for
    pub fn network(&self) -> NetworkType {
        self.network.network_type
    }

    /// Key at the chain level for `scheme`, or `None` when the key already
    /// sits below the account and `chain` is not reachable from it.
    ///
    /// Levels the key's depth already covers are skipped. Hardened levels a
    /// public key cannot derive are skipped as well, continuing with the next
    /// non-hardened level.
    pub fn chain_key(
        &self,
        key: &ExtendedKey,
        scheme: DerivationScheme,
        chain: Chain,
    ) -> Result<Option<ExtendedKey>> {
        let depth = usize::from(key.depth());
        if depth >= 4 {
            // Already a chain-level key; it only stands in for the receiving chain.
            return Ok(match chain {
                Chain::External => Some(key.clone()),
                Chain::Internal => None,
            });
        }

        let steps = [
            (scheme.purpose(), true),
            (self.network.coin_type, true),
            (0, true),
            (chain.as_u32(), false),
        ];

        let mut current = key.clone();
        for &(index, hardened) in &steps[depth..] {
            if hardened && !current.can_derive_hardened() {
                tracing::debug!(
                    scheme = %scheme,
                    depth = current.depth(),
                    "Hardened derivation unavailable, skipping level"
                );
                continue;
            }
            current = current.derive_child(index, hardened)?;
        }
        Ok(Some(current))
    }

    fn derive_hd(
        &self,
        key: &ExtendedKey,
        request: &DerivationRequest,
    ) -> Result<Vec<DerivedAddress>> {
        let mut out = Vec::new();
        for &address_type in &request.address_types {
            let scheme = DerivationScheme::for_address_type(address_type);
            for chain in Chain::BOTH {
                let range = request.range_for(chain);
                if range.is_empty() {
                    continue;
                }
                let Some(chain_key) = self.chain_key(key, scheme, chain)? else {
                    continue;
                };
                for index in range {
                    let child = chain_key.derive_child(index, false)?;
                    let address = address_type.encode(&child.public_key_bytes(), &self.network)?;
                    out.push(DerivedAddress {
                        address,
                        path: scheme.path(self.network.coin_type, chain, index),
                        index,
                        is_change: chain.is_change(),
                        address_type,
                    });
                }
            }
        }
        Ok(out)
    }
}

impl AddressDeriver for Bip32Deriver {
    fn derive(&self, key: &ParsedKey, request: &DerivationRequest) -> Result<Vec<DerivedAddress>> {
        match key {
            ParsedKey::Hd(extended) => self.derive_hd(extended, request),
            ParsedKey::Single(single) => {
                let mut out = Vec::new();
                if !request.receiving.contains(&0) {
                    return Ok(out);
                }
                let public_key = single.public_key_bytes();
                for &address_type in &request.address_types {
                    if !single.applicable_address_types().contains(&address_type) {
                        return Err(Error::UnsupportedAddressType(format!(
                            "{address_type} is not available for this single key"
                        )));
                    }
                    out.push(DerivedAddress {
                        address: address_type.encode(&public_key, &self.network)?,
                        path: "single-key".to_string(),
                        index: 0,
                        is_change: false,
                        address_type,
                    });
                }
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::test_vectors::*;
    use crate::keys::KeyMaterial;

    fn abandon_key() -> ParsedKey {
        KeyMaterial::mnemonic(ABANDON_MNEMONIC, "")
            .parse(NetworkType::Mainnet)
            .unwrap()
    }

    fn first_address(deriver: &Bip32Deriver, key: &ParsedKey, address_type: AddressType) -> String {
        let request = DerivationRequest::counts(vec![address_type], 1, 0);
        deriver.derive(key, &request).unwrap().remove(0).address
    }

    #[test]
    fn test_reference_vectors_per_scheme() {
        let deriver = Bip32Deriver::new(NetworkType::Mainnet);
        let key = abandon_key();

        assert_eq!(first_address(&deriver, &key, AddressType::P2pkh), ABANDON_BIP44_FIRST);
        assert_eq!(first_address(&deriver, &key, AddressType::P2shP2wpkh), ABANDON_BIP49_FIRST);
        assert_eq!(first_address(&deriver, &key, AddressType::P2wpkh), ABANDON_BIP84_FIRST);
        assert_eq!(first_address(&deriver, &key, AddressType::P2tr), ABANDON_BIP86_FIRST);
    }

    #[test]
    fn test_receiving_and_change_ranges() {
        let deriver = Bip32Deriver::new(NetworkType::Mainnet);
        let key = abandon_key();
        let request = DerivationRequest::counts(vec![AddressType::P2wpkh], 2, 1);
        let addresses = deriver.derive(&key, &request).unwrap();

        assert_eq!(addresses.len(), 3);
        assert_eq!(addresses[0].address, ABANDON_BIP84_FIRST);
        assert_eq!(addresses[0].path, "m/84'/0'/0'/0/0");
        assert_eq!(addresses[1].address, ABANDON_BIP84_SECOND);
        assert_eq!(addresses[1].index, 1);
        assert!(addresses[2].is_change);
        assert_eq!(addresses[2].address, ABANDON_BIP84_FIRST_CHANGE);
        assert_eq!(addresses[2].path, "m/84'/0'/0'/1/0");
    }

    #[test]
    fn test_chain_range_request() {
        let deriver = Bip32Deriver::new(NetworkType::Mainnet);
        let key = abandon_key();
        let request = DerivationRequest::chain_range(AddressType::P2wpkh, Chain::External, 1, 1);
        let addresses = deriver.derive(&key, &request).unwrap();
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].address, ABANDON_BIP84_SECOND);
    }

    #[test]
    fn test_account_level_key_derives_suffix_only() {
        let deriver = Bip32Deriver::new(NetworkType::Mainnet);
        let ParsedKey::Hd(root) = abandon_key() else {
            panic!("expected HD key");
        };
        let account = root
            .derive_child(84, true)
            .and_then(|k| k.derive_child(0, true))
            .and_then(|k| k.derive_child(0, true))
            .unwrap();
        assert_eq!(account.depth(), 3);

        let key = ParsedKey::Hd(account);
        assert_eq!(first_address(&deriver, &key, AddressType::P2wpkh), ABANDON_BIP84_FIRST);
    }

    #[test]
    fn test_serialized_root_zprv() {
        let deriver = Bip32Deriver::new(NetworkType::Mainnet);
        let key = KeyMaterial::extended_private_key(ABANDON_BIP84_ROOT_ZPRV)
            .parse(NetworkType::Mainnet)
            .unwrap();

        assert_eq!(first_address(&deriver, &key, AddressType::P2wpkh), ABANDON_BIP84_FIRST);
        assert_eq!(first_address(&deriver, &key, AddressType::P2pkh), ABANDON_BIP44_FIRST);
    }

    #[test]
    fn test_serialized_account_zpub() {
        let deriver = Bip32Deriver::new(NetworkType::Mainnet);
        let key = KeyMaterial::extended_private_key(ABANDON_BIP84_ACCOUNT_ZPUB)
            .parse(NetworkType::Mainnet)
            .unwrap();

        let request = DerivationRequest::counts(vec![AddressType::P2wpkh], 2, 1);
        let addresses = deriver.derive(&key, &request).unwrap();
        assert_eq!(addresses[0].address, ABANDON_BIP84_FIRST);
        assert_eq!(addresses[1].address, ABANDON_BIP84_SECOND);
        assert_eq!(addresses[2].address, ABANDON_BIP84_FIRST_CHANGE);
    }

    #[test]
    fn test_public_root_skips_hardened_levels() {
        let deriver = Bip32Deriver::new(NetworkType::Mainnet);
        let ParsedKey::Hd(ExtendedKey::Private(root)) = abandon_key() else {
            panic!("expected private HD key");
        };
        let public_root = ExtendedKey::Public(root.public_key());

        let chain_key = deriver
            .chain_key(&public_root, DerivationScheme::NativeSegwit, Chain::External)
            .unwrap()
            .unwrap();
        assert_eq!(chain_key.depth(), 1);

        let expected = ExtendedKey::Private(root).derive_child(0, false).unwrap();
        assert_eq!(chain_key.public_key_bytes(), expected.public_key_bytes());

        let request = DerivationRequest::counts(vec![AddressType::P2wpkh], 3, 0);
        let addresses = deriver.derive(&ParsedKey::Hd(public_root), &request).unwrap();
        assert_eq!(addresses.len(), 3);
    }

    #[test]
    fn test_chain_level_key_only_serves_receiving() {
        let deriver = Bip32Deriver::new(NetworkType::Mainnet);
        let ParsedKey::Hd(root) = abandon_key() else {
            panic!("expected HD key");
        };
        let chain_key = deriver
            .chain_key(&root, DerivationScheme::NativeSegwit, Chain::External)
            .unwrap()
            .unwrap();
        assert_eq!(chain_key.depth(), 4);

        let key = ParsedKey::Hd(chain_key);
        let request = DerivationRequest::counts(vec![AddressType::P2wpkh], 1, 5);
        let addresses = deriver.derive(&key, &request).unwrap();
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].address, ABANDON_BIP84_FIRST);
    }

    #[test]
    fn test_single_key_derivation() {
        let deriver = Bip32Deriver::new(NetworkType::Mainnet);
        let key = KeyMaterial::wif(UNCOMPRESSED_WIF)
            .parse(NetworkType::Mainnet)
            .unwrap();

        let request = DerivationRequest::counts(vec![AddressType::P2pkh], 20, 0);
        let addresses = deriver.derive(&key, &request).unwrap();
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].address, UNCOMPRESSED_WIF_ADDRESS);

        let request = DerivationRequest::counts(vec![AddressType::P2wpkh], 20, 0);
        assert!(deriver.derive(&key, &request).is_err());
    }

    #[test]
    fn test_scheme_metadata() {
        assert_eq!(SCAN_ORDER[0], DerivationScheme::NativeSegwit);
        assert_eq!(SCAN_ORDER[3], DerivationScheme::Taproot);
        for scheme in SCAN_ORDER {
            assert_eq!(DerivationScheme::for_address_type(scheme.address_type()), scheme);
        }
        assert_eq!(DerivationScheme::Taproot.purpose(), 86);
        assert_eq!(
            DerivationScheme::NativeSegwit.prefix_label(NetworkType::Mainnet),
            "bc1q..."
        );
    }
}
