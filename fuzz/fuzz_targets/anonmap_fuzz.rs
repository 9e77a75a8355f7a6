#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use shepherd::modules::anonmap::{sanitize_leaf, AnonMap};
use shepherd::modules::proto::ModuleKind;

#[derive(Arbitrary, Debug)]
struct Input {
    map_file: String,
    public: bool,
    user: String,
    path: String,
}

fuzz_target!(|input: Input| {
    let map = AnonMap::parse("a_", &input.map_file);

    // Whatever survived parsing must survive a second round unchanged.
    let rendered = map.render();
    let reparsed = AnonMap::parse("a_", &rendered);
    assert_eq!(reparsed.len(), map.len());
    assert_eq!(reparsed.render(), rendered);

    let module = if input.public {
        ModuleKind::Public
    } else {
        ModuleKind::Anonym
    };
    let _ = map.translate(module, &input.user, &input.path);

    let sanitized = sanitize_leaf(&input.path);
    assert!(!sanitized.contains('/'));
    assert!(!sanitized.contains(':'));
});
