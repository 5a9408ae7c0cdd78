#![no_main]

use libfuzzer_sys::fuzz_target;
use tapwire::proxy::ConnectTarget;

fuzz_target!(|data: &[u8]| {
    let input = match std::str::from_utf8(data) {
        Ok(s) => s,
        Err(_) => return,
    };

    if let Ok(target) = ConnectTarget::parse(input) {
        let _ = target.host_header();
        let _ = target.to_string();
    }
});
