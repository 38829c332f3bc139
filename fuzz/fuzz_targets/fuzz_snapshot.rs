#![no_main]

use handle_ipc::Directory;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Whatever parses must serialize back to an equivalent directory
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(directory) = Directory::parse(text) {
            let reparsed = Directory::parse(&directory.to_snapshot());
            assert_eq!(reparsed.ok(), Some(directory));
        }
    }
});
