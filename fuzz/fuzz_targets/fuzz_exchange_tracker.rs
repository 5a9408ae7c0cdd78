#![no_main]

use libfuzzer_sys::fuzz_target;
use tapwire::http::ExchangeTracker;

fuzz_target!(|data: &[u8]| {
    // Split input into client and upstream traffic at the first null byte
    let split = data.iter().position(|&b| b == 0);
    let (requests, responses) = match split {
        Some(pos) => (&data[..pos], &data[pos + 1..]),
        None => (data, &[] as &[u8]),
    };

    let mut tracker = ExchangeTracker::new(4096).with_default_host("fuzz.example");
    for chunk in requests.chunks(17) {
        tracker.observe_request(chunk);
    }
    for chunk in responses.chunks(13) {
        for exchange in tracker.observe_response(chunk) {
            let _ = exchange.request_path();
            let _ = exchange.response_json();
        }
    }
    let _ = tracker.observe_response_eof();
});
