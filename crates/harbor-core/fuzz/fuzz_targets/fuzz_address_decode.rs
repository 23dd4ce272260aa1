//! Fuzz test for address decoding
//!
//! Ensures the address and scripthash paths handle malformed input gracefully

#![no_main]

use harbor_core::address::EncodedAddress;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        // Should never panic, only return Err for invalid input
        if let Ok(address) = EncodedAddress::parse(s) {
            let _ = address.scripthash();
        }
    }
});
