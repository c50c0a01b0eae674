#![no_main]

use cuantizar::config::QuantizationConfig;
use libfuzzer_sys::fuzz_target;

// Arbitrary JSON never panics the config parser, and whatever it accepts
// maps back to itself.
fuzz_target!(|data: &[u8]| {
    let Ok(raw) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    let Ok(config) = QuantizationConfig::from_dict(&raw) else {
        return;
    };
    let dict = config.to_dict().expect("accepted config serializes");
    let back = QuantizationConfig::from_dict(&dict).expect("serialized config parses");
    assert_eq!(back, config);
});
