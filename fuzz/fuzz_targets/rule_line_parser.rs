#![no_main]

use calltrace::classifier::Classifier;
use calltrace::rules_file::parse_line;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        let _ = parse_line(input);

        // Whole-file path, then classify something against the result
        let classifier = Classifier::default();
        let _ = classifier.load_rules(input.as_bytes());
        let _ = classifier.classify("Foo::Bar", "baz");
    }
});
