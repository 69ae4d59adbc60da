#![no_main]

use calltrace::decode_stream;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must decode or fail cleanly, never panic
    if let Ok(frames) = decode_stream(data) {
        for frame in frames {
            for event in frame.events() {
                let _ = event.encode_to_vec();
            }
        }
    }
});
