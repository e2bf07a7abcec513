use mtnet_crypto::Keystream;
use mtnet_transport::errors::FrameError;
use mtnet_transport::framing::{FrameCodec, Inbound, ProtocolVariant};

const KEY_A: [u8; 32] = [0xa1; 32];
const IV_A: [u8; 16] = [0x0a; 16];
const KEY_B: [u8; 32] = [0xb2; 32];
const IV_B: [u8; 16] = [0x0b; 16];

/// A codec pair whose streams mirror each other: what `left` sends, `right`
/// receives, and vice versa — the loopback form of the round-trip law.
fn codec_pair(variant: ProtocolVariant) -> (FrameCodec, FrameCodec) {
    let left = FrameCodec::new(
        variant,
        Keystream::new(&KEY_A, &IV_A),
        Keystream::new(&KEY_B, &IV_B),
    );
    let right = FrameCodec::new(
        variant,
        Keystream::new(&KEY_B, &IV_B),
        Keystream::new(&KEY_A, &IV_A),
    );
    (left, right)
}

fn frames(units: Vec<Inbound>) -> Vec<Vec<u8>> {
    units
        .into_iter()
        .map(|u| match u {
            Inbound::Frame(f) => f,
            other => panic!("expected frame, got {other:?}"),
        })
        .collect()
}

#[test]
fn intermediate_round_trip() {
    let (mut left, mut right) = codec_pair(ProtocolVariant::Intermediate);
    let payload = b"round trip payload!!".to_vec(); // 20 bytes, word-aligned

    let wire = left.encode(&payload, false);
    assert_ne!(&wire[4..], &payload[..], "payload must not appear in the clear");

    let got = frames(right.decode(&wire).unwrap());
    assert_eq!(got, vec![payload]);
}

#[test]
fn abridged_round_trip_short_and_long() {
    let (mut left, mut right) = codec_pair(ProtocolVariant::Abridged);

    let short = vec![0x55u8; 64];
    let long = vec![0x66u8; 0x7f * 4 + 8]; // forces the 0x7f long form
    let wire_short = left.encode(&short, false);
    let wire_long = left.encode(&long, false);

    let mut stream = wire_short;
    stream.extend_from_slice(&wire_long);
    let got = frames(right.decode(&stream).unwrap());
    assert_eq!(got, vec![short, long]);
}

#[test]
fn padded_intermediate_preserves_payload_prefix() {
    let (mut left, mut right) = codec_pair(ProtocolVariant::PaddedIntermediate);
    let payload = b"padded frame body".to_vec();

    let wire = left.encode(&payload, false);
    let got = frames(right.decode(&wire).unwrap());
    assert_eq!(got.len(), 1);
    // Padding rides behind the payload inside the frame.
    assert!(got[0].len() >= payload.len());
    assert!(got[0].len() < payload.len() + 16);
    assert_eq!(&got[0][..payload.len()], &payload[..]);
}

#[test]
fn tls_variant_wraps_application_data_records() {
    let (mut left, mut right) = codec_pair(ProtocolVariant::Tls);
    let payload = b"disguised as https".to_vec();

    let wire = left.encode(&payload, false);
    assert_eq!(&wire[..3], &[0x17, 0x03, 0x03], "record header must be plaintext");
    let body_len = u16::from_be_bytes([wire[3], wire[4]]) as usize;
    assert_eq!(wire.len(), 5 + body_len);

    let got = frames(right.decode(&wire).unwrap());
    assert_eq!(&got[0][..payload.len()], &payload[..]);
}

#[test]
fn partial_frames_reassemble_across_reads() {
    let (mut left, mut right) = codec_pair(ProtocolVariant::Intermediate);
    let payload: Vec<u8> = (0..=255).cycle().take(1000).map(|b: u16| b as u8).collect();
    let wire = left.encode(&payload, false);

    // Deliver in awkward chunk sizes, including a split length prefix.
    let mut got = Vec::new();
    for chunk in [&wire[..2], &wire[2..7], &wire[7..500], &wire[500..]] {
        got.extend(frames(right.decode(chunk).unwrap()));
    }
    assert_eq!(got, vec![payload]);
}

#[test]
fn quick_ack_request_sets_high_bit() {
    let (mut left, _) = codec_pair(ProtocolVariant::Intermediate);
    let mut mirror = Keystream::new(&KEY_A, &IV_A);

    let payload = vec![0u8; 16];
    let mut wire = left.encode(&payload, true);
    mirror.apply(&mut wire);
    let word = u32::from_le_bytes(wire[..4].try_into().unwrap());
    assert_eq!(word & 0x8000_0000, 0x8000_0000);
    assert_eq!(word & 0x7fff_ffff, 16);
}

#[test]
fn inbound_quick_ack_token_is_recognized() {
    let (_, mut right) = codec_pair(ProtocolVariant::Intermediate);
    // The server-side token: bit 31 set, no frame follows.
    let mut token = (0x8000_0000u32 | 0x1234_5678 & 0x7fff_ffff).to_le_bytes().to_vec();
    let mut mirror = Keystream::new(&KEY_A, &IV_A);
    mirror.apply(&mut token);

    let got = right.decode(&token).unwrap();
    assert_eq!(got, vec![Inbound::QuickAck(0x1234_5678)]);
}

#[test]
fn abridged_quick_ack_token_is_recognized() {
    let (_, mut right) = codec_pair(ProtocolVariant::Abridged);
    let mut token = vec![0x80 | 0x11, 0x22, 0x33, 0x44];
    let mut mirror = Keystream::new(&KEY_A, &IV_A);
    mirror.apply(&mut token);

    let got = right.decode(&token).unwrap();
    assert_eq!(
        got,
        vec![Inbound::QuickAck(u32::from_le_bytes([0x11, 0x22, 0x33, 0x44]))]
    );
}

#[test]
fn oversized_length_is_fatal() {
    let (_, mut right) = codec_pair(ProtocolVariant::Intermediate);
    let mut wire = 0x7f00_0000u32.to_le_bytes().to_vec(); // ~2 GB claim
    let mut mirror = Keystream::new(&KEY_A, &IV_A);
    mirror.apply(&mut wire);

    assert!(matches!(right.decode(&wire), Err(FrameError::Oversized(_))));
}

#[test]
fn zero_length_is_fatal() {
    let (_, mut right) = codec_pair(ProtocolVariant::Intermediate);
    let mut wire = 0u32.to_le_bytes().to_vec();
    let mut mirror = Keystream::new(&KEY_A, &IV_A);
    mirror.apply(&mut wire);

    assert!(matches!(right.decode(&wire), Err(FrameError::BadLength(0))));
}

#[test]
fn garbage_tls_record_is_fatal() {
    let (_, mut right) = codec_pair(ProtocolVariant::Tls);
    // Not an application-data record header.
    assert!(matches!(
        right.decode(&[0x16, 0x03, 0x01, 0x00, 0x10]),
        Err(FrameError::BadRecordHeader)
    ));
}

#[test]
fn keystream_desync_shows_up_as_frame_error() {
    let (mut left, mut right) = codec_pair(ProtocolVariant::Intermediate);
    // Drop the first wire byte: every later byte decrypts at the wrong
    // keystream offset and the length prefix turns to garbage.
    let wire = left.encode(&vec![7u8; 512], false);
    let result = right.decode(&wire[1..]);
    // Either an immediately impossible length or a stream stuck waiting on
    // a garbage length; a well-formed frame must not sneak through.
    if let Ok(units) = result {
        assert!(
            units.iter().all(|u| !matches!(u, Inbound::Frame(_))),
            "desynced stream must not yield frames"
        );
    }
}
