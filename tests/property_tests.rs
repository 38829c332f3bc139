//! Property-based tests using proptest
//!
//! These tests validate the snapshot grammar, wire framing and envelopes across a wide
//! range of randomly generated inputs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Bytes, BytesMut};
use handle_ipc::core::envelope::{Envelope, Payload, PayloadKind};
use handle_ipc::core::frame::FrameCodec;
use handle_ipc::core::snapshot::{validate_handle, RESERVED_CHARS};
use handle_ipc::Directory;
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

fn handle_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_. /:]{0,12}[a-zA-Z0-9_]"
}

fn endpoint_strategy() -> impl Strategy<Value = SocketAddr> {
    let ip = prop_oneof![
        any::<[u8; 4]>().prop_map(|o| IpAddr::V4(Ipv4Addr::from(o))),
        any::<[u16; 8]>().prop_map(|s| IpAddr::V6(Ipv6Addr::from(s))),
    ];
    (ip, 1u16..).prop_map(|(ip, port)| SocketAddr::new(ip, port))
}

fn directory_strategy() -> impl Strategy<Value = Directory> {
    prop::collection::vec((handle_strategy(), endpoint_strategy()), 0..20).prop_map(|pairs| {
        let mut directory = Directory::new();
        for (handle, endpoint) in pairs {
            directory.insert(&handle, endpoint);
        }
        directory
    })
}

// Property: a snapshot parses back into the directory it was written from
proptest! {
    #[test]
    fn prop_snapshot_roundtrip(directory in directory_strategy()) {
        let text = directory.to_snapshot();
        prop_assert_eq!(Directory::parse(&text).unwrap(), directory);
    }
}

// Property: parsing arbitrary text never panics
proptest! {
    #[test]
    fn prop_parse_never_panics(text in ".{0,200}") {
        let _ = Directory::parse(&text);
    }
}

// Property: a handle containing any reserved character is rejected
proptest! {
    #[test]
    fn prop_reserved_characters_rejected(
        prefix in "[a-z]{0,5}",
        reserved in prop::sample::select(RESERVED_CHARS.to_vec()),
        suffix in "[a-z]{0,5}",
    ) {
        let handle = format!("{prefix}{reserved}{suffix}");
        prop_assert!(validate_handle(&handle).is_err());
    }
}

// Property: the codec yields the same frames however the stream is chunked
proptest! {
    #[test]
    fn prop_frame_decoding_is_chunking_independent(
        frames in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..512), 1..8),
        chunk in 1usize..64,
    ) {
        let mut codec = FrameCodec;
        let mut wire = BytesMut::new();
        for frame in &frames {
            codec.encode(Bytes::from(frame.clone()), &mut wire).unwrap();
        }

        let mut decoded = Vec::new();
        let mut buf = BytesMut::new();
        for piece in wire.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                decoded.push(frame.to_vec());
            }
        }

        prop_assert_eq!(decoded, frames);
        prop_assert!(buf.is_empty());
    }
}

// Property: an envelope is two length-prefixed frames around a kind byte
proptest! {
    #[test]
    fn prop_envelope_length_layout(handle in handle_strategy(), body in prop::collection::vec(any::<u8>(), 0..256)) {
        let bytes = Envelope::new(handle.clone(), Payload::raw(body.clone())).to_bytes();
        prop_assert_eq!(bytes.len(), 8 + handle.len() + 1 + 8 + body.len());
        prop_assert_eq!(&bytes[..8], &(handle.len() as i64).to_le_bytes()[..]);
    }
}

// Property: an envelope reads back as written, consuming exactly its bytes
proptest! {
    #[test]
    fn prop_envelope_roundtrip(
        handle in handle_strategy(),
        raw in any::<bool>(),
        body in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let kind = if raw { PayloadKind::Raw } else { PayloadKind::Encoded };
        let envelope = Envelope::new(handle.clone(), Payload::from_parts(kind, Bytes::from(body)));
        let bytes = envelope.to_bytes();

        let mut reader = &bytes[..];
        let read = futures::executor::block_on(Envelope::read_from(&mut reader, &handle)).unwrap();
        prop_assert_eq!(read, envelope);
        prop_assert!(reader.is_empty());
    }
}
