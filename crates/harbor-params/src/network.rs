//! Bitcoin-style network definitions

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Network type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Mainnet
    Mainnet,
    /// Testnet
    Testnet,
    /// Signet
    Signet,
    /// Regtest (local development)
    Regtest,
}

impl NetworkType {
    /// All supported networks
    pub const ALL: [NetworkType; 4] = [
        NetworkType::Mainnet,
        NetworkType::Testnet,
        NetworkType::Signet,
        NetworkType::Regtest,
    ];

    /// Lowercase identifier used in storage records and config files
    pub const fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Mainnet => "mainnet",
            NetworkType::Testnet => "testnet",
            NetworkType::Signet => "signet",
            NetworkType::Regtest => "regtest",
        }
    }

    /// Infer the network from an encoded address.
    ///
    /// Only the prefix is inspected, the address is not validated. Testnet and
    /// signet share encodings, so signet addresses infer as testnet.
    pub fn infer_from_address(address: &str) -> Option<NetworkType> {
        let lower = address.to_ascii_lowercase();
        if lower.starts_with("bcrt1") {
            return Some(NetworkType::Regtest);
        }
        if lower.starts_with("bc1") {
            return Some(NetworkType::Mainnet);
        }
        if lower.starts_with("tb1") {
            return Some(NetworkType::Testnet);
        }
        match address.chars().next()? {
            '1' | '3' => Some(NetworkType::Mainnet),
            'm' | 'n' | '2' => Some(NetworkType::Testnet),
            _ => None,
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "bitcoin" | "main" => Ok(NetworkType::Mainnet),
            "testnet" | "test" => Ok(NetworkType::Testnet),
            "signet" => Ok(NetworkType::Signet),
            "regtest" => Ok(NetworkType::Regtest),
            other => Err(Error::InvalidNetwork(other.to_string())),
        }
    }
}

/// Network configuration
#[derive(Debug, Clone)]
pub struct Network {
    /// Network type
    pub network_type: NetworkType,
    /// Human-readable name
    pub name: &'static str,
    /// Coin type (BIP-44)
    pub coin_type: u32,
    /// Human-readable part of segwit addresses
    pub bech32_hrp: &'static str,
    /// Base58 version byte for P2PKH addresses
    pub p2pkh_version: u8,
    /// Base58 version byte for P2SH addresses
    pub p2sh_version: u8,
    /// WIF private key version byte
    pub wif_version: u8,
}

impl Network {
    /// Get mainnet parameters
    pub const fn mainnet() -> Self {
        Self {
            network_type: NetworkType::Mainnet,
            name: "mainnet",
            coin_type: 0,
            bech32_hrp: "bc",
            p2pkh_version: 0x00,
            p2sh_version: 0x05,
            wif_version: 0x80,
        }
    }

    /// Get testnet parameters
    pub const fn testnet() -> Self {
        Self {
            network_type: NetworkType::Testnet,
            name: "testnet",
            coin_type: 1,
            bech32_hrp: "tb",
            p2pkh_version: 0x6f,
            p2sh_version: 0xc4,
            wif_version: 0xef,
        }
    }

    /// Get signet parameters (testnet encodings)
    pub const fn signet() -> Self {
        Self {
            network_type: NetworkType::Signet,
            name: "signet",
            coin_type: 1,
            bech32_hrp: "tb",
            p2pkh_version: 0x6f,
            p2sh_version: 0xc4,
            wif_version: 0xef,
        }
    }

    /// Get regtest parameters
    pub const fn regtest() -> Self {
        Self {
            network_type: NetworkType::Regtest,
            name: "regtest",
            coin_type: 1,
            bech32_hrp: "bcrt",
            p2pkh_version: 0x6f,
            p2sh_version: 0xc4,
            wif_version: 0xef,
        }
    }

    /// Get network by type
    pub const fn from_type(network_type: NetworkType) -> Self {
        match network_type {
            NetworkType::Mainnet => Self::mainnet(),
            NetworkType::Testnet => Self::testnet(),
            NetworkType::Signet => Self::signet(),
            NetworkType::Regtest => Self::regtest(),
        }
    }

    /// Check whether a WIF version byte belongs to this network
    pub const fn accepts_wif_version(&self, version: u8) -> bool {
        self.wif_version == version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mainnet_params() {
        let net = Network::mainnet();
        assert_eq!(net.network_type, NetworkType::Mainnet);
        assert_eq!(net.coin_type, 0);
        assert_eq!(net.bech32_hrp, "bc");
        assert!(net.accepts_wif_version(0x80));
        assert!(!net.accepts_wif_version(0xef));
    }

    #[test]
    fn test_network_from_type() {
        let net = Network::from_type(NetworkType::Testnet);
        assert_eq!(net.network_type, NetworkType::Testnet);
        assert_eq!(net.coin_type, 1);
    }

    #[test]
    fn test_infer_from_address() {
        assert_eq!(
            NetworkType::infer_from_address("bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu"),
            Some(NetworkType::Mainnet)
        );
        assert_eq!(
            NetworkType::infer_from_address("bcrt1qxyz"),
            Some(NetworkType::Regtest)
        );
        assert_eq!(
            NetworkType::infer_from_address("tb1qxyz"),
            Some(NetworkType::Testnet)
        );
        assert_eq!(
            NetworkType::infer_from_address("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"),
            Some(NetworkType::Mainnet)
        );
        assert_eq!(
            NetworkType::infer_from_address("37VucYSaXLCAsxYyAPfbSi9eh4iEcbShgf"),
            Some(NetworkType::Mainnet)
        );
        assert_eq!(
            NetworkType::infer_from_address("mipcBbFg9gMiCh81Kj8tqqdgoZub1ZJRfn"),
            Some(NetworkType::Testnet)
        );
        assert_eq!(NetworkType::infer_from_address("zzz"), None);
        assert_eq!(NetworkType::infer_from_address(""), None);
    }

    #[test]
    fn test_network_type_parse_and_serde() {
        assert_eq!("Mainnet".parse::<NetworkType>().unwrap(), NetworkType::Mainnet);
        assert!("litecoin".parse::<NetworkType>().is_err());

        let json = serde_json::to_string(&NetworkType::Signet).unwrap();
        assert_eq!(json, "\"signet\"");
        let back: NetworkType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, NetworkType::Signet);
    }
}
