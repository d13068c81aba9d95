//! System prompts for vision-model field extraction.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth** — changing the extraction behaviour (e.g.
//!    adding a new required key) requires editing exactly one place.
//!
//! 2. **Testability** — unit tests can inspect prompts directly without
//!    calling a real model, making prompt regressions easy to catch.

/// Default system prompt for extracting structured field data from one
/// scanned page image.
///
/// The model is asked for a strict JSON object so the reply can be validated
/// at the aggregation boundary; the `questions` array is the contract the
/// aggregator depends on.
pub const DEFAULT_EXTRACTION_PROMPT: &str = r#"You are a precise document extraction expert specialising in form analysis.
Your task is to extract all fields, labels, and values from the page image.

Follow these rules precisely:

1. Extract ALL text visible on the page, both printed and handwritten.
2. Identify form fields, labels, values, and their relationships.
3. Pair every label or question with its answer value.
4. Format dates and numbers as written on the page.
5. If a value is unreadable, use the exact marker [ILLEGIBLE].
6. Include a confidence score between 0.0 and 1.0 for every extracted pair.
7. Include an overall confidence score for the page.

Return ONLY a JSON object with this shape, no commentary:

{
  "questions": [
    {"question": "<label or question text>", "answer": "<value>", "confidence": <0.0-1.0>}
  ],
  "overall_confidence": <0.0-1.0>
}

Do NOT wrap the JSON in markdown fences. Do NOT add explanations."#;

/// User-turn text accompanying the page image.
pub fn page_user_message(page_number: u32) -> String {
    format!(
        "Extract all fields and question/answer pairs from this document page \
         (page {page_number}). Include printed and handwritten content."
    )
}
