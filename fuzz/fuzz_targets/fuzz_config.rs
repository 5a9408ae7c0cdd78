#![no_main]

use libfuzzer_sys::fuzz_target;
use tapwire::Config;

fuzz_target!(|data: &[u8]| {
    let input = match std::str::from_utf8(data) {
        Ok(s) => s,
        Err(_) => return,
    };

    // Parsing validates targets too; errors are fine
    if let Ok(config) = Config::parse(input) {
        let _ = config.rule_set();
        let _ = config.bind_address();
    }
});
