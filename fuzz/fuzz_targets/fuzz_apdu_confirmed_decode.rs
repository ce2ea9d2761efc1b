#![no_main]

use libfuzzer_sys::fuzz_target;
use rustbac_app::ssm::decode_incoming_apdu;

fuzz_target!(|data: &[u8]| {
    let _ = decode_incoming_apdu(data);
});
