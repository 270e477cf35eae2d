// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Remote answers are untrusted text; parsing must never panic and must
//! only ever produce a label from the set or "Uncategorized".

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tidyfold::classifier::remote::parse_answer;
use tidyfold::model::{LabelSet, UNCATEGORIZED};

#[derive(Debug, Arbitrary)]
struct Input {
    answer: String,
    labels: Vec<String>,
}

fuzz_target!(|input: Input| {
    let Ok(labels) = LabelSet::new(input.labels) else {
        return;
    };
    if let Ok(verdict) = parse_answer(&input.answer, &labels) {
        assert!(verdict.label == UNCATEGORIZED || labels.labels().contains(&verdict.label));
        assert!((0.0..=1.0).contains(&verdict.confidence));
    }
});
