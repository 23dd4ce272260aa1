//! Fuzz test for key material parsing
//!
//! Every secret kind must reject arbitrary input without panicking

#![no_main]

use harbor_core::KeyMaterial;
use harbor_params::NetworkType;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = KeyMaterial::seed(data.to_vec()).parse(NetworkType::Mainnet);

    if let Ok(s) = std::str::from_utf8(data) {
        let _ = KeyMaterial::mnemonic(s, "").parse(NetworkType::Mainnet);
        let _ = KeyMaterial::extended_private_key(s).parse(NetworkType::Mainnet);
        let _ = KeyMaterial::wif(s).parse(NetworkType::Testnet);

        if data.len() > 10 {
            if let Ok(pass) = std::str::from_utf8(&data[..10]) {
                let _ = KeyMaterial::mnemonic(s, pass).parse(NetworkType::Mainnet);
            }
        }
    }
});
