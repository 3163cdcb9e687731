use proptest::collection::vec;
use proptest::prelude::*;

use vspc::telnet::{encode_payload, TelnetEvent, TelnetParser};

/// Flatten decoded events into (payload bytes, non-data events).
fn flatten(events: Vec<TelnetEvent>) -> (Vec<u8>, Vec<TelnetEvent>) {
    let mut data = Vec::new();
    let mut other = Vec::new();
    for event in events {
        match event {
            TelnetEvent::Data(mut d) => data.append(&mut d),
            event => other.push(event),
        }
    }
    (data, other)
}

proptest! {
    /// Encoding a payload and decoding it back reproduces the original,
    /// whatever 0xFF bytes it contains.
    #[test]
    fn encode_decode_round_trips(payload in vec(any::<u8>(), 0..512)) {
        let mut parser = TelnetParser::new();
        let events = parser.feed(&encode_payload(&payload)).unwrap();
        let (data, other) = flatten(events);
        prop_assert!(other.is_empty(), "payload decoded to non-data events: {other:?}");
        prop_assert_eq!(data, payload);
    }
}

proptest! {
    /// Read-boundary placement never changes what is decoded.
    #[test]
    fn segmentation_is_invisible(
        payload in vec(any::<u8>(), 0..256),
        cuts in vec(any::<proptest::sample::Index>(), 0..8),
    ) {
        let wire = encode_payload(&payload);

        let mut whole = TelnetParser::new();
        let whole_out = flatten(whole.feed(&wire).unwrap());

        let mut positions: Vec<usize> = cuts.iter().map(|i| i.index(wire.len() + 1)).collect();
        positions.sort_unstable();
        let mut chunked = TelnetParser::new();
        let mut events = Vec::new();
        let mut start = 0;
        for pos in positions {
            events.extend(chunked.feed(&wire[start..pos]).unwrap());
            start = pos;
        }
        events.extend(chunked.feed(&wire[start..]).unwrap());

        prop_assert_eq!(flatten(events), whole_out);
    }
}

proptest! {
    /// Arbitrary garbage either decodes or errors; the parser never panics.
    #[test]
    fn parser_never_panics(bytes in vec(any::<u8>(), 0..512)) {
        let mut parser = TelnetParser::new();
        let _ = parser.feed(&bytes);
    }
}
