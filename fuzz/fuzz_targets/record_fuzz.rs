#![no_main]
use libfuzzer_sys::fuzz_target;
use shepherd::modules::anonmap::MapKey;
use shepherd::modules::proto::{classify, parse_hello, Inbound};

fuzz_target!(|data: &[u8]| {
    if let Ok(line) = std::str::from_utf8(data) {
        // The first record of a connection
        let _ = parse_hello(line);

        // Every later record
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
            if let Inbound::FileOp(op, _) = classify(value) {
                if let Some(module) = op.module_kind() {
                    if let Some(key) = MapKey::derive(module, "001002", &op.path) {
                        assert_eq!(key.user(), "001002");
                    }
                }
                let _ = op.is_top_level();
            }
        }
    }
});
