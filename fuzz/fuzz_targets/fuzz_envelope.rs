#![no_main]

use handle_ipc::core::envelope::Envelope;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let rt = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(rt) => rt,
        Err(_) => return,
    };
    rt.block_on(async {
        let mut reader = data;
        let _ = Envelope::read_from(&mut reader, "fuzz").await;
    });
});
