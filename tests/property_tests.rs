//! Property-based tests for the relay.
//!
//! These tests use proptest to verify properties that should hold
//! for all inputs: frame framing, sequence monotonicity, stats math and
//! pagination bounds.

use std::sync::Arc;

use llm_relay::api::relay::{MemorySink, RelayOutcome, StreamRelay};
use llm_relay::core::config::StatsConfig;
use llm_relay::core::{ConnectionAccountant, InMemoryRequestLogStore, RequestLogEntry};
use llm_relay::services::stats::{parse_duration, trimmed_mean, LogQuery, StatsService};
use llm_relay::services::EventStream;
use llm_relay::transformer::sse::parse_frames;
use llm_relay::transformer::{
    transcoder_for, FinishReason, InternalEvent, RequestType, Transcoder,
};
use proptest::prelude::*;

fn request_type_strategy() -> impl Strategy<Value = RequestType> {
    prop_oneof![
        Just(RequestType::ChatCompletions),
        Just(RequestType::Responses),
        Just(RequestType::Messages),
    ]
}

/// Text chunks, including empty and multi-line ones
fn chunks_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-zA-Z0-9 \\n\"{}]{0,12}", 0..20)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn relay_text(request_type: RequestType, chunks: &[String]) -> (RelayOutcome, String) {
    let mut events: Vec<InternalEvent> = chunks
        .iter()
        .map(|c| InternalEvent::text("id", "model", c.clone()))
        .collect();
    events.push(InternalEvent::finish("id", "model", FinishReason::Stop));

    runtime().block_on(async {
        let stream = EventStream::from_events(events);
        let mut relay = StreamRelay::new(transcoder_for(request_type), stream.cancel_handle());
        let mut sink = MemorySink::new();
        let outcome = relay.run(stream, &mut sink).await;
        (outcome, sink.text())
    })
}

proptest! {
    /// Property: every frame is a single data line of valid JSON (or the
    /// sentinel), terminated by a blank line
    #[test]
    fn prop_frames_are_well_formed(rt in request_type_strategy(), chunks in chunks_strategy()) {
        let (outcome, text) = relay_text(rt, &chunks);
        prop_assert_eq!(outcome, RelayOutcome::Completed);
        prop_assert!(text.ends_with("\n\n"));

        for frame in parse_frames(&text) {
            prop_assert!(!frame.data.contains('\n'));
            if !frame.is_done() {
                prop_assert!(serde_json::from_str::<serde_json::Value>(&frame.data).is_ok());
            }
        }
    }

    /// Property: the sentinel appears exactly once, last, only where the protocol uses it
    #[test]
    fn prop_done_sentinel_placement(rt in request_type_strategy(), chunks in chunks_strategy()) {
        let (_, text) = relay_text(rt, &chunks);
        let frames = parse_frames(&text);
        let done = frames.iter().filter(|f| f.is_done()).count();
        if rt.uses_done_sentinel() {
            prop_assert_eq!(done, 1);
            prop_assert!(frames.last().unwrap().is_done());
        } else {
            prop_assert_eq!(done, 0);
        }
    }

    /// Property: concatenated text deltas reproduce the backend text
    #[test]
    fn prop_text_is_preserved(rt in request_type_strategy(), chunks in chunks_strategy()) {
        let (_, text) = relay_text(rt, &chunks);
        let mut rebuilt = String::new();
        for frame in parse_frames(&text).iter().filter(|f| !f.is_done()) {
            let v: serde_json::Value = serde_json::from_str(&frame.data).unwrap();
            let piece = match rt {
                RequestType::ChatCompletions => v["choices"][0]["delta"]["content"].as_str(),
                RequestType::Responses if v["type"] == "response.output_text.delta" => v["delta"].as_str(),
                RequestType::Messages if v["type"] == "content_block_delta" => v["delta"]["text"].as_str(),
                _ => None,
            };
            if let Some(piece) = piece {
                rebuilt.push_str(piece);
            }
        }
        prop_assert_eq!(rebuilt, chunks.concat());
    }

    /// Property: responses sequence numbers start at 0 and increase by one
    #[test]
    fn prop_sequence_numbers_are_dense(chunks in chunks_strategy()) {
        let (_, text) = relay_text(RequestType::Responses, &chunks);
        let sequence: Vec<u64> = parse_frames(&text)
            .iter()
            .filter(|f| !f.is_done())
            .map(|f| {
                let v: serde_json::Value = serde_json::from_str(&f.data).unwrap();
                v["sequence_number"].as_u64().unwrap()
            })
            .collect();
        let expected: Vec<u64> = (0..sequence.len() as u64).collect();
        prop_assert_eq!(sequence, expected);
    }

    /// Property: the chat transcoder is one-to-one for non-empty events
    #[test]
    fn prop_chat_one_frame_per_event(chunks in prop::collection::vec("[a-z]{1,8}", 1..30)) {
        let mut transcoder = transcoder_for(RequestType::ChatCompletions);
        for chunk in &chunks {
            let frames = transcoder.transcode(&InternalEvent::text("id", "m", chunk.clone())).unwrap();
            prop_assert_eq!(frames.len(), 1);
        }
    }

    /// Property: the trimmed mean lies within the sample range
    #[test]
    fn prop_trimmed_mean_within_bounds(
        samples in prop::collection::vec(0.0f64..100_000.0, 1..200),
        low in 0.0f64..0.45,
        high in 0.0f64..0.45,
    ) {
        let mean = trimmed_mean(&samples, low, high);
        let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        prop_assert!(mean >= min - 1e-6 && mean <= max + 1e-6);
    }

    /// Property: positive durations with a known unit always parse
    #[test]
    fn prop_parse_duration_units(value in 1i64..10_000, unit in prop_oneof![Just("s"), Just("m"), Just("h"), Just("d")]) {
        let parsed = parse_duration(&format!("{}{}", value, unit)).unwrap();
        let seconds = match unit {
            "s" => value,
            "m" => value * 60,
            "h" => value * 3600,
            _ => value * 86_400,
        };
        prop_assert_eq!(parsed.num_seconds(), seconds);
    }

    /// Property: pages never overlap and together cover every matching entry
    #[test]
    fn prop_pagination_partitions_entries(count in 0usize..60, page_size in 1u32..15) {
        let store = Arc::new(InMemoryRequestLogStore::new(100));
        for i in 0..count {
            store.push(RequestLogEntry {
                request_id: format!("r{}", i),
                ..Default::default()
            });
        }
        let stats = StatsService::new(store, Arc::new(ConnectionAccountant::new()), &StatsConfig::default());

        let seen = runtime().block_on(async {
            let mut seen = Vec::new();
            let mut page = 1;
            loop {
                let result = stats
                    .logs(&LogQuery { page: Some(page), page_size: Some(page_size), ..Default::default() })
                    .await
                    .unwrap();
                if result.items.is_empty() {
                    break;
                }
                seen.extend(result.items.into_iter().map(|e| e.id));
                page += 1;
            }
            seen
        });

        prop_assert_eq!(seen.len(), count);
        let mut unique = seen.clone();
        unique.sort_unstable();
        unique.dedup();
        prop_assert_eq!(unique.len(), count);
    }
}
