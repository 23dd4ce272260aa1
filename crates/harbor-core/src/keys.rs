//! Key material accepted at import time
//!
//! `KeyMaterial` is the closed set of secret kinds the importer hands over;
//! `ParsedKey` is the validated form every derivation works from. Parsing is
//! the only step that can reject the input, so a malformed secret fails before
//! any network activity starts.

use crate::address::AddressType;
use crate::{Error, Result};
use bip32::{ChildNumber, ExtendedKey as Bip32ExtendedKey, XPrv, XPub};
use bip39::{Language, Mnemonic};
use harbor_params::{Network, NetworkType};
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

/// Default gap limit for address scanning
pub const DEFAULT_GAP_LIMIT: u32 = 20;

const MIN_SEED_LEN: usize = 16;
const MAX_SEED_LEN: usize = 64;

/// Secret handed over by the importer.
///
/// Detecting which kind a pasted string is happens upstream; each variant
/// here is already labelled.
#[derive(Clone)]
pub enum KeyMaterial {
    /// Raw BIP-32 seed bytes
    Seed(Zeroizing<Vec<u8>>),
    /// BIP-39 mnemonic with optional passphrase
    Mnemonic {
        /// Space separated words
        phrase: Zeroizing<String>,
        /// BIP-39 passphrase ("" when unused)
        passphrase: Zeroizing<String>,
    },
    /// Serialized extended private key (xprv/yprv/zprv/tprv/...)
    ExtendedPrivateKey(Zeroizing<String>),
    /// WIF-encoded single private key
    PrivateKey(Zeroizing<String>),
}

impl KeyMaterial {
    /// Build from seed bytes
    pub fn seed(bytes: impl Into<Vec<u8>>) -> Self {
        KeyMaterial::Seed(Zeroizing::new(bytes.into()))
    }

    /// Build from a mnemonic phrase and passphrase
    pub fn mnemonic(phrase: impl Into<String>, passphrase: impl Into<String>) -> Self {
        KeyMaterial::Mnemonic {
            phrase: Zeroizing::new(phrase.into()),
            passphrase: Zeroizing::new(passphrase.into()),
        }
    }

    /// Build from a serialized extended private key
    pub fn extended_private_key(encoded: impl Into<String>) -> Self {
        KeyMaterial::ExtendedPrivateKey(Zeroizing::new(encoded.into()))
    }

    /// Build from a WIF private key
    pub fn wif(encoded: impl Into<String>) -> Self {
        KeyMaterial::PrivateKey(Zeroizing::new(encoded.into()))
    }

    /// Short label for logs; never includes secret content
    pub const fn kind(&self) -> &'static str {
        match self {
            KeyMaterial::Seed(_) => "seed",
            KeyMaterial::Mnemonic { .. } => "mnemonic",
            KeyMaterial::ExtendedPrivateKey(_) => "extended-private-key",
            KeyMaterial::PrivateKey(_) => "private-key",
        }
    }

    /// Validate and decode the material for `network`
    pub fn parse(&self, network: NetworkType) -> Result<ParsedKey> {
        match self {
            KeyMaterial::Seed(bytes) => {
                if bytes.len() < MIN_SEED_LEN || bytes.len() > MAX_SEED_LEN {
                    return Err(Error::InvalidSeed(format!(
                        "seed must be {MIN_SEED_LEN}-{MAX_SEED_LEN} bytes, got {}",
                        bytes.len()
                    )));
                }
                let root = XPrv::new(bytes.as_slice())
                    .map_err(|e| Error::InvalidSeed(e.to_string()))?;
                Ok(ParsedKey::Hd(ExtendedKey::Private(root)))
            }
            KeyMaterial::Mnemonic { phrase, passphrase } => {
                let mnemonic = Mnemonic::parse_in_normalized(Language::English, phrase)
                    .map_err(|e| Error::InvalidMnemonic(e.to_string()))?;
                let seed = Zeroizing::new(mnemonic.to_seed(passphrase.as_str()));
                let root = XPrv::new(&seed[..]).map_err(|e| Error::InvalidSeed(e.to_string()))?;
                Ok(ParsedKey::Hd(ExtendedKey::Private(root)))
            }
            KeyMaterial::ExtendedPrivateKey(encoded) => {
                ExtendedKey::decode(encoded.trim(), network).map(ParsedKey::Hd)
            }
            KeyMaterial::PrivateKey(encoded) => {
                SingleKey::from_wif(encoded.trim(), network).map(ParsedKey::Single)
            }
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial::{}(<redacted>)", self.kind())
    }
}

/// Validated key material
#[derive(Clone)]
pub enum ParsedKey {
    /// Hierarchical key at any depth
    Hd(ExtendedKey),
    /// Non-HD single key
    Single(SingleKey),
}

impl fmt::Debug for ParsedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParsedKey::Hd(key) => write!(f, "ParsedKey::Hd(depth={})", key.depth()),
            ParsedKey::Single(key) => {
                write!(f, "ParsedKey::Single(compressed={})", key.is_compressed())
            }
        }
    }
}

/// BIP-32 extended key.
///
/// Normally private; a public (neutered) key is accepted so that a watch key
/// which slipped through format detection still derives its non-hardened
/// levels.
#[derive(Clone)]
pub enum ExtendedKey {
    /// Extended private key
    Private(XPrv),
    /// Extended public key
    Public(XPub),
}

impl ExtendedKey {
    /// Decode a serialized extended key and check its network
    pub fn decode(encoded: &str, network: NetworkType) -> Result<Self> {
        let extended = Bip32ExtendedKey::from_str(encoded)
            .map_err(|e| Error::InvalidKey(format!("Invalid extended key: {e}")))?;
        let prefix = extended.prefix.as_str();

        let is_testnet_prefix = matches!(prefix.chars().next(), Some('t' | 'u' | 'v'));
        let wants_testnet = network != NetworkType::Mainnet;
        if is_testnet_prefix != wants_testnet {
            return Err(Error::NetworkMismatch(format!(
                "{prefix} key used on {network}"
            )));
        }

        if extended.prefix.is_private() {
            let xprv = XPrv::try_from(extended)
                .map_err(|e| Error::InvalidKey(format!("Invalid extended private key: {e}")))?;
            Ok(ExtendedKey::Private(xprv))
        } else {
            tracing::warn!("Extended public key supplied where a private key was expected");
            let xpub = XPub::try_from(extended)
                .map_err(|e| Error::InvalidKey(format!("Invalid extended public key: {e}")))?;
            Ok(ExtendedKey::Public(xpub))
        }
    }

    /// Depth in the BIP-32 tree (0 = master)
    pub fn depth(&self) -> u8 {
        match self {
            ExtendedKey::Private(key) => key.attrs().depth,
            ExtendedKey::Public(key) => key.attrs().depth,
        }
    }

    /// Whether hardened children can be derived
    pub fn can_derive_hardened(&self) -> bool {
        matches!(self, ExtendedKey::Private(_))
    }

    /// Derive one child level
    pub fn derive_child(&self, index: u32, hardened: bool) -> Result<Self> {
        let child = ChildNumber::new(index, hardened)
            .map_err(|e| Error::KeyDerivation(format!("Invalid child index {index}: {e}")))?;
        match self {
            ExtendedKey::Private(key) => key
                .derive_child(child)
                .map(ExtendedKey::Private)
                .map_err(|e| Error::KeyDerivation(e.to_string())),
            ExtendedKey::Public(_) if hardened => Err(Error::KeyDerivation(
                "hardened derivation requires a private key".to_string(),
            )),
            ExtendedKey::Public(key) => key
                .derive_child(child)
                .map(ExtendedKey::Public)
                .map_err(|e| Error::KeyDerivation(e.to_string())),
        }
    }

    /// Compressed SEC1 public key
    pub fn public_key_bytes(&self) -> [u8; 33] {
        match self {
            ExtendedKey::Private(key) => key.public_key().to_bytes(),
            ExtendedKey::Public(key) => key.to_bytes(),
        }
    }
}

impl fmt::Debug for ExtendedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtendedKey::Private(_) => write!(f, "ExtendedKey::Private(depth={})", self.depth()),
            ExtendedKey::Public(_) => write!(f, "ExtendedKey::Public(depth={})", self.depth()),
        }
    }
}

/// Single non-HD key decoded from WIF.
///
/// Only the public half is kept, nothing here signs.
#[derive(Clone, Debug)]
pub struct SingleKey {
    public_key: PublicKey,
    compressed: bool,
}

impl SingleKey {
    /// Decode a WIF private key for `network`
    pub fn from_wif(encoded: &str, network: NetworkType) -> Result<Self> {
        let payload = Zeroizing::new(
            bs58::decode(encoded)
                .with_check(None)
                .into_vec()
                .map_err(|e| Error::InvalidKey(format!("Invalid WIF encoding: {e}")))?,
        );

        let compressed = match payload.len() {
            33 => false,
            34 if payload[33] == 0x01 => true,
            len => {
                return Err(Error::InvalidKey(format!(
                    "Invalid WIF payload length {len}"
                )))
            }
        };

        if !Network::from_type(network).accepts_wif_version(payload[0]) {
            return Err(Error::NetworkMismatch(format!(
                "WIF version 0x{:02x} is not valid on {network}",
                payload[0]
            )));
        }

        let secret = SecretKey::from_slice(&payload[1..33])
            .map_err(|e| Error::InvalidKey(format!("Invalid private key: {e}")))?;
        let secp = Secp256k1::signing_only();
        let public_key = PublicKey::from_secret_key(&secp, &secret);

        Ok(Self {
            public_key,
            compressed,
        })
    }

    /// Whether the key uses the compressed public key encoding
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// SEC1 public key in the encoding the WIF selected
    pub fn public_key_bytes(&self) -> Vec<u8> {
        if self.compressed {
            self.public_key.serialize().to_vec()
        } else {
            self.public_key.serialize_uncompressed().to_vec()
        }
    }

    /// Address types this key has outputs for.
    ///
    /// Taproot is never offered for a single key.
    pub fn applicable_address_types(&self) -> &'static [AddressType] {
        if self.compressed {
            &[AddressType::P2wpkh, AddressType::P2shP2wpkh, AddressType::P2pkh]
        } else {
            &[AddressType::P2pkh]
        }
    }
}

/// Published test vectors shared by the workspace tests
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_vectors {
    /// BIP-84/86 reference mnemonic
    pub const ABANDON_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon \
        abandon abandon abandon abandon abandon about";

    /// First receive address at m/44'/0'/0'/0/0
    pub const ABANDON_BIP44_FIRST: &str = "1LqBGSKuX5yYUonjxT5qGfpUsXKYYWeabA";
    /// First receive address at m/49'/0'/0'/0/0
    pub const ABANDON_BIP49_FIRST: &str = "37VucYSaXLCAsxYyAPfbSi9eh4iEcbShgf";
    /// First receive address at m/84'/0'/0'/0/0
    pub const ABANDON_BIP84_FIRST: &str = "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu";
    /// Second receive address at m/84'/0'/0'/0/1
    pub const ABANDON_BIP84_SECOND: &str = "bc1qnjg0jd8228aq7egyzacy8cys3knf9xvrerkf9g";
    /// First change address at m/84'/0'/0'/1/0
    pub const ABANDON_BIP84_FIRST_CHANGE: &str = "bc1q8c6fshw2dlwun7ekn9qwf37cu2rn755upcp6el";
    /// First receive address at m/86'/0'/0'/0/0
    pub const ABANDON_BIP86_FIRST: &str =
        "bc1p5cyxnuxmeuwuvkwfem96lqzszd02n6xdcjrs20cac6yqjjwudpxqkedrcr";

    /// BIP-84 root private key of [`ABANDON_MNEMONIC`]
    pub const ABANDON_BIP84_ROOT_ZPRV: &str = "zprvAWgYBBk7JR8Gjrh4UJQ2uJdG1r3WNRRfURiABBE3RvMXYSrRJL62XuezvGdPvG6GFBZduosCc1YP5wixPox7zhZLfiUm8aunE96BBa4Kei5";
    /// BIP-84 account public key at m/84'/0'/0'
    pub const ABANDON_BIP84_ACCOUNT_ZPUB: &str = "zpub6rFR7y4Q2AijBEqTUquhVz398htDFrtymD9xYYfG1m4wAcvPhXNfE3EfH1r1ADqtfSdVCToUG868RvUUkgDKf31mGDtKsAYz2oz2AGutZYs";

    /// Uncompressed mainnet WIF (Bitcoin wiki example)
    pub const UNCOMPRESSED_WIF: &str = "5HueCGU8rMjxEXxiPuD5BDku4MkFqeZyd4dZ1jvhTVqvbTLvyTJ";
    /// Legacy address of [`UNCOMPRESSED_WIF`]
    pub const UNCOMPRESSED_WIF_ADDRESS: &str = "1GAehh7TsJAHuUAeKZcXf5CnwuGuGgyX2S";
    /// Compressed WIF for the same secret
    pub const COMPRESSED_WIF: &str = "KwdMAjGmerYanjeui5SHS7JkmpZvVipYvB2LJGU1ZxJwYvP98617";
}

#[cfg(test)]
mod tests {
    use super::test_vectors::*;
    use super::*;

    #[test]
    fn test_mnemonic_parses_to_master_key() {
        let parsed = KeyMaterial::mnemonic(ABANDON_MNEMONIC, "")
            .parse(NetworkType::Mainnet)
            .unwrap();
        match parsed {
            ParsedKey::Hd(key) => {
                assert_eq!(key.depth(), 0);
                assert!(key.can_derive_hardened());
            }
            ParsedKey::Single(_) => panic!("mnemonic must parse to an HD key"),
        }
    }

    #[test]
    fn test_invalid_mnemonic_rejected() {
        let err = KeyMaterial::mnemonic("abandon abandon", "")
            .parse(NetworkType::Mainnet)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidMnemonic(_)));
    }

    #[test]
    fn test_seed_length_validation() {
        assert!(KeyMaterial::seed(vec![7u8; 8]).parse(NetworkType::Mainnet).is_err());
        assert!(KeyMaterial::seed(vec![7u8; 65]).parse(NetworkType::Mainnet).is_err());
        assert!(KeyMaterial::seed(vec![7u8; 32]).parse(NetworkType::Mainnet).is_ok());
    }

    #[test]
    fn test_wif_compression_flag() {
        let uncompressed = SingleKey::from_wif(UNCOMPRESSED_WIF, NetworkType::Mainnet).unwrap();
        assert!(!uncompressed.is_compressed());
        assert_eq!(uncompressed.public_key_bytes().len(), 65);
        assert_eq!(uncompressed.applicable_address_types(), &[AddressType::P2pkh]);

        let compressed = SingleKey::from_wif(COMPRESSED_WIF, NetworkType::Mainnet).unwrap();
        assert!(compressed.is_compressed());
        assert_eq!(compressed.public_key_bytes().len(), 33);
        assert_eq!(compressed.applicable_address_types().len(), 3);
        assert!(!compressed.applicable_address_types().contains(&AddressType::P2tr));
    }

    #[test]
    fn test_wif_network_mismatch() {
        let err = SingleKey::from_wif(COMPRESSED_WIF, NetworkType::Testnet).unwrap_err();
        assert!(matches!(err, Error::NetworkMismatch(_)));
    }

    #[test]
    fn test_extended_key_prefixes() {
        let root = ExtendedKey::decode(ABANDON_BIP84_ROOT_ZPRV, NetworkType::Mainnet).unwrap();
        assert_eq!(root.depth(), 0);
        assert!(root.can_derive_hardened());

        let account = ExtendedKey::decode(ABANDON_BIP84_ACCOUNT_ZPUB, NetworkType::Mainnet).unwrap();
        assert_eq!(account.depth(), 3);
        assert!(!account.can_derive_hardened());

        let err = ExtendedKey::decode(ABANDON_BIP84_ROOT_ZPRV, NetworkType::Regtest).unwrap_err();
        assert!(matches!(err, Error::NetworkMismatch(_)));
    }

    #[test]
    fn test_tprv_rejected_on_mainnet() {
        let mut extended = Bip32ExtendedKey::from_str(ABANDON_BIP84_ROOT_ZPRV).unwrap();
        extended.prefix = bip32::Prefix::TPRV;
        let tprv = extended.to_string();
        assert!(tprv.starts_with("tprv"));

        let err = KeyMaterial::extended_private_key(tprv.as_str())
            .parse(NetworkType::Mainnet)
            .unwrap_err();
        assert!(matches!(err, Error::NetworkMismatch(_)));
        assert!(err.is_user_error());

        let parsed = KeyMaterial::extended_private_key(tprv)
            .parse(NetworkType::Testnet)
            .unwrap();
        assert!(matches!(parsed, ParsedKey::Hd(_)));
    }

    #[test]
    fn test_garbage_key_material_rejected() {
        assert!(KeyMaterial::wif("not a key").parse(NetworkType::Mainnet).is_err());
        assert!(KeyMaterial::extended_private_key("xprv-garbage")
            .parse(NetworkType::Mainnet)
            .is_err());
    }

    #[test]
    fn test_debug_output_is_redacted() {
        let material = KeyMaterial::mnemonic(ABANDON_MNEMONIC, "secret");
        let debug = format!("{material:?}");
        assert!(!debug.contains("abandon"));
        assert!(!debug.contains("secret"));
        assert!(debug.contains("mnemonic"));
    }
}
