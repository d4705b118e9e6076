#![no_main]

use libfuzzer_sys::fuzz_target;
use quizcast_client::normalize::{decode_viewer_event, normalize, FeedKind};
use quizcast_client::RawMessage;

// Arbitrary service payloads must never panic the viewer-event decoder.
fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    let _ = normalize(&value);

    for name in [None, Some("publish-comment"), Some("quiz_selected_option")] {
        let message = RawMessage::new(name.map(str::to_owned), value.clone()).into_inbound("fuzz");
        let _ = decode_viewer_event(&message, FeedKind::GoldenHour);
        let _ = decode_viewer_event(&message, FeedKind::HustleTvShow);
    }
});
