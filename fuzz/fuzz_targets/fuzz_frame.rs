#![no_main]

use bytes::BytesMut;
use handle_ipc::core::frame::FrameCodec;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Decode frames until the buffer runs dry or an error is hit
    let mut buf = BytesMut::from(data);
    let mut codec = FrameCodec;
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
    let _ = codec.decode_eof(&mut buf);
});
