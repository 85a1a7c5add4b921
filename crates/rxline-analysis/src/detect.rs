/*
 * RxLine - Prescription analysis dispatch service
 * Copyright (C) 2025–2026 RxLine Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Marker-based detection of prescription-like chat messages. A detected
//! user message triggers a background analysis job without blocking the
//! request that carried it.

/// Substrings that mark a message as a prescription, Persian and English.
/// Trailing spaces and colons distinguish the drug-form words from ordinary
/// conversation about them.
const PRESCRIPTION_MARKERS: &[&str] = &[
    "نسخه:",
    "نسخه :",
    "نسخه ",
    "prescription:",
    "prescription ",
    "rx:",
    "rx ",
    "دارو:",
    "دارو ",
    "داروی ",
    "قرص ",
    "کپسول ",
    "شربت ",
    "آمپول ",
];

/// Returns `true` when `content` looks like a prescription that should be
/// analyzed automatically. Matching is case-insensitive for the Latin
/// markers.
#[must_use]
pub fn is_prescription_message(content: &str) -> bool {
    let lowered = content.to_lowercase();
    PRESCRIPTION_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}
