//! Aggregation: fold per-page extraction results into one combined result.
//!
//! Runs exactly once per job, after the last page completes and only when
//! every page succeeded. The page contents are validated here rather than at
//! extraction time — the extraction client only guarantees "a JSON object",
//! and a shape problem on page 7 should fail the job with a message naming
//! page 7, not poison the retry loop.
//!
//! Aggregation is deterministic and idempotent: entries are ordered by page
//! number, anomaly ids are UUIDv5 values derived from the job id, so running
//! it twice over the same pages produces byte-identical output.

use crate::config::ConfidencePolicy;
use crate::error::DocFieldsError;
use crate::model::{Anomaly, CombinedResult, FieldEntry, Job, PageResult};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

/// Answers the extraction prompt uses to flag unreadable regions.
pub const ILLEGIBLE_MARKER: &str = "[ILLEGIBLE]";

// ── Entry parsing ─────────────────────────────────────────────────────────

/// Validate one page's content tree into field entries.
///
/// `questions` may be absent (a blank page extracts to nothing), but when
/// present it must be an array of objects with a string `question`, a scalar
/// `answer`, and an optional numeric `confidence`.
pub fn parse_entries(page: &PageResult) -> Result<Vec<FieldEntry>, String> {
    let obj = page
        .content
        .as_object()
        .ok_or_else(|| "content is not an object".to_string())?;

    let questions = match obj.get("questions") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(format!(
                "'questions' must be an array, got {}",
                json_kind(other)
            ))
        }
    };

    let mut entries = Vec::with_capacity(questions.len());
    for (i, item) in questions.iter().enumerate() {
        let entry = item
            .as_object()
            .ok_or_else(|| format!("entry {i} is not an object"))?;

        let question = entry
            .get("question")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("entry {i}: missing string 'question'"))?
            .to_string();

        let answer = match entry.get("answer") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            Some(other) => {
                return Err(format!(
                    "entry {i}: 'answer' must be a scalar, got {}",
                    json_kind(other)
                ))
            }
        };

        let confidence = match entry.get("confidence") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_f64().ok_or_else(|| {
                format!("entry {i}: 'confidence' must be a number")
            })?),
        };

        entries.push(FieldEntry {
            question,
            answer,
            confidence,
            page: page.page_number,
        });
    }

    Ok(entries)
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ── Anomaly detection ─────────────────────────────────────────────────────

/// Inspects one field entry in the context of the whole document;
/// `None` means unremarkable.
///
/// Entry-local detectors (low confidence, illegible marker) ignore the
/// document slice; the statistical detectors compare the entry's numeric
/// answer against every other numeric answer in the document. One entry may
/// be flagged by several detectors, each producing its own [`Anomaly`] row.
pub trait AnomalyDetector: Send + Sync {
    /// Stable detector name, part of the anomaly's identity.
    fn name(&self) -> &'static str;

    /// Anomaly score in `0.0..=1.0`, higher is more suspicious. `document`
    /// holds every entry of the combined result in page order, including
    /// `entry` itself.
    fn inspect(&self, entry: &FieldEntry, document: &[FieldEntry]) -> Option<f64>;
}

/// Flags entries whose extraction confidence falls below a threshold.
pub struct LowConfidenceDetector {
    threshold: f64,
}

impl LowConfidenceDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl AnomalyDetector for LowConfidenceDetector {
    fn name(&self) -> &'static str {
        "low_confidence"
    }

    fn inspect(&self, entry: &FieldEntry, _document: &[FieldEntry]) -> Option<f64> {
        let confidence = entry.confidence?;
        if confidence < self.threshold {
            Some(1.0 - confidence)
        } else {
            None
        }
    }
}

/// Flags entries whose answer contains the illegibility marker.
pub struct IllegibleDetector;

impl AnomalyDetector for IllegibleDetector {
    fn name(&self) -> &'static str {
        "illegible"
    }

    fn inspect(&self, entry: &FieldEntry, _document: &[FieldEntry]) -> Option<f64> {
        if entry.answer.contains(ILLEGIBLE_MARKER) {
            Some(1.0)
        } else {
            None
        }
    }
}

// ── Statistical outlier detection ─────────────────────────────────────────
//
// Cross-entry detectors over the numeric answers of a document. A scanned
// invoice where one line-item amount is wildly out of range is usually a
// misread digit, so an answer far outside the document's own distribution is
// flagged. Each method is boolean in nature; a flagged entry scores 1.0.

const Z_SCORE_THRESHOLD: f64 = 3.0;
const MODIFIED_Z_THRESHOLD: f64 = 3.5;
const IQR_FACTOR: f64 = 1.5;
/// Scales the median absolute deviation to the standard deviation of a
/// normal distribution.
const MAD_CONSISTENCY: f64 = 0.6745;

fn numeric_answer(entry: &FieldEntry) -> Option<f64> {
    entry
        .answer
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

fn numeric_answers(document: &[FieldEntry]) -> Vec<f64> {
    document.iter().filter_map(numeric_answer).collect()
}

/// Linearly interpolated quantile of a series, `q` in `0.0..=1.0`.
fn quantile(series: &[f64], q: f64) -> Option<f64> {
    if series.is_empty() {
        return None;
    }
    let mut sorted = series.to_vec();
    sorted.sort_by(f64::total_cmp);
    let position = (sorted.len() - 1) as f64 * q;
    let low = position.floor() as usize;
    let high = position.ceil() as usize;
    let fraction = position - low as f64;
    Some(sorted[low] + (sorted[high] - sorted[low]) * fraction)
}

fn median(series: &[f64]) -> Option<f64> {
    quantile(series, 0.5)
}

/// Flags numeric answers more than three standard deviations from the
/// mean of the document's numeric answers.
pub struct ZScoreDetector;

impl AnomalyDetector for ZScoreDetector {
    fn name(&self) -> &'static str {
        "z"
    }

    fn inspect(&self, entry: &FieldEntry, document: &[FieldEntry]) -> Option<f64> {
        let value = numeric_answer(entry)?;
        let series = numeric_answers(document);
        let mean = series.iter().sum::<f64>() / series.len() as f64;
        // Population variance: the document is the whole population here.
        let variance =
            series.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / series.len() as f64;
        let std_dev = variance.sqrt();
        if std_dev == 0.0 {
            return None;
        }
        (((value - mean) / std_dev).abs() > Z_SCORE_THRESHOLD).then_some(1.0)
    }
}

/// Median-based variant of the z-score, robust to the outliers it hunts.
/// Useful on short series where a single extreme value inflates the plain
/// standard deviation enough to hide itself.
pub struct ModifiedZScoreDetector;

impl AnomalyDetector for ModifiedZScoreDetector {
    fn name(&self) -> &'static str {
        "modified_z"
    }

    fn inspect(&self, entry: &FieldEntry, document: &[FieldEntry]) -> Option<f64> {
        let value = numeric_answer(entry)?;
        let series = numeric_answers(document);
        let med = median(&series)?;
        let deviations: Vec<f64> = series.iter().map(|v| (v - med).abs()).collect();
        let mad = median(&deviations)?;
        if mad == 0.0 {
            return None;
        }
        let modified_z = MAD_CONSISTENCY * (value - med).abs() / mad;
        (modified_z > MODIFIED_Z_THRESHOLD).then_some(1.0)
    }
}

/// Flags numeric answers outside `[Q1 - 1.5·IQR, Q3 + 1.5·IQR]` of the
/// document's numeric answers.
pub struct IqrDetector;

impl AnomalyDetector for IqrDetector {
    fn name(&self) -> &'static str {
        "iqr"
    }

    fn inspect(&self, entry: &FieldEntry, document: &[FieldEntry]) -> Option<f64> {
        let value = numeric_answer(entry)?;
        let series = numeric_answers(document);
        let q1 = quantile(&series, 0.25)?;
        let q3 = quantile(&series, 0.75)?;
        let iqr = q3 - q1;
        let lower = q1 - IQR_FACTOR * iqr;
        let upper = q3 + IQR_FACTOR * iqr;
        (value < lower || value > upper).then_some(1.0)
    }
}

/// The detector set applied to every job: the two entry-local detectors plus
/// the three statistical outlier methods over numeric answers.
pub fn default_detectors(confidence_threshold: f64) -> Vec<Box<dyn AnomalyDetector>> {
    vec![
        Box::new(LowConfidenceDetector::new(confidence_threshold)),
        Box::new(IllegibleDetector),
        Box::new(ZScoreDetector),
        Box::new(ModifiedZScoreDetector),
        Box::new(IqrDetector),
    ]
}

// ── Aggregation ───────────────────────────────────────────────────────────

/// Merge successful page results into one [`CombinedResult`].
///
/// `pages` must already be ordered by page number; the store guarantees
/// this. Fails with [`DocFieldsError::Aggregation`] naming the offending
/// page when a content tree does not validate.
pub fn aggregate(
    job: &Job,
    pages: &[PageResult],
    detectors: &[Box<dyn AnomalyDetector>],
    policy: ConfidencePolicy,
) -> Result<CombinedResult, DocFieldsError> {
    let mut entries = Vec::new();
    for page in pages {
        let page_entries = parse_entries(page).map_err(|detail| DocFieldsError::Aggregation {
            job: job.id,
            detail: format!("page {}: {}", page.page_number, detail),
        })?;
        entries.extend(page_entries);
    }

    let overall_confidence = combine_confidence(&entries, policy);

    let mut anomalies = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        for detector in detectors {
            if let Some(score) = detector.inspect(entry, &entries) {
                debug!(
                    "Job {}: entry {} flagged by {} (score {:.2})",
                    job.id,
                    index,
                    detector.name(),
                    score
                );
                anomalies.push(Anomaly {
                    // Deterministic id: re-running aggregation over the same
                    // pages must reproduce the same anomalies byte-for-byte.
                    id: Uuid::new_v5(
                        &job.id,
                        format!("{}:{}", detector.name(), index).as_bytes(),
                    ),
                    job_id: job.id,
                    entry_index: index,
                    detector: detector.name().to_string(),
                    score,
                    dismissed: false,
                });
            }
        }
    }

    info!(
        "Job {}: aggregated {} entries from {} pages, {} anomalies, confidence {:.2}",
        job.id,
        entries.len(),
        pages.len(),
        anomalies.len(),
        overall_confidence
    );

    Ok(CombinedResult {
        job_id: job.id,
        page_number: 0,
        entries,
        overall_confidence,
        anomalies,
    })
}

/// Combine entry-level confidences under the configured policy. Entries
/// without a confidence are excluded; if none carries one, the result is 0.0.
fn combine_confidence(entries: &[FieldEntry], policy: ConfidencePolicy) -> f64 {
    let values: Vec<f64> = entries.iter().filter_map(|e| e.confidence).collect();
    if values.is_empty() {
        return 0.0;
    }
    match policy {
        ConfidencePolicy::Mean => values.iter().sum::<f64>() / values.len() as f64,
        ConfidencePolicy::Minimum => values.iter().copied().fold(f64::INFINITY, f64::min),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PageOutcome, PageResult};
    use chrono::Utc;
    use serde_json::json;

    fn page(n: u32, content: Value, confidence: Option<f64>) -> PageResult {
        PageResult {
            job_id: Uuid::new_v4(),
            page_number: n,
            content,
            confidence,
            duration_ms: 10,
            retries: 0,
            outcome: PageOutcome::Ok,
            error: None,
        }
    }

    fn job() -> Job {
        Job {
            id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            status: crate::model::JobStatus::Processing,
            pages_processed: 1,
            total_pages: 1,
            started_at: Utc::now(),
            completed_at: None,
            model: "test".into(),
            message: None,
        }
    }

    #[test]
    fn parses_entries_with_scalar_coercion() {
        let p = page(
            2,
            json!({"questions": [
                {"question": "Age", "answer": 42, "confidence": 0.95},
                {"question": "Member", "answer": true},
                {"question": "Notes", "answer": null},
            ]}),
            Some(0.9),
        );
        let entries = parse_entries(&p).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].answer, "42");
        assert_eq!(entries[1].answer, "true");
        assert_eq!(entries[2].answer, "");
        assert!(entries.iter().all(|e| e.page == 2));
    }

    #[test]
    fn missing_questions_is_empty_page() {
        let p = page(1, json!({"overall_confidence": 0.8}), Some(0.8));
        assert!(parse_entries(&p).unwrap().is_empty());
    }

    #[test]
    fn malformed_entry_is_rejected() {
        let p = page(1, json!({"questions": [{"answer": "no question"}]}), None);
        let err = parse_entries(&p).unwrap_err();
        assert!(err.contains("entry 0"));
    }

    #[test]
    fn low_confidence_detector_respects_threshold() {
        let d = LowConfidenceDetector::new(0.8);
        let mut entry = FieldEntry {
            question: "Name".into(),
            answer: "Smith".into(),
            confidence: Some(0.5),
            page: 1,
        };
        assert!(d.inspect(&entry, &[]).is_some());
        entry.confidence = Some(0.9);
        assert!(d.inspect(&entry, &[]).is_none());
        entry.confidence = None;
        assert!(d.inspect(&entry, &[]).is_none());
    }

    #[test]
    fn illegible_detector_matches_marker() {
        let d = IllegibleDetector;
        let entry = FieldEntry {
            question: "Signature".into(),
            answer: format!("{ILLEGIBLE_MARKER} (smudged)"),
            confidence: Some(0.95),
            page: 3,
        };
        assert_eq!(d.inspect(&entry, &[]), Some(1.0));
    }

    fn numeric_entries(values: &[&str]) -> Vec<FieldEntry> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| FieldEntry {
                question: format!("Amount {i}"),
                answer: (*v).to_string(),
                confidence: Some(0.95),
                page: 1,
            })
            .collect()
    }

    #[test]
    fn z_score_flags_far_outlier_in_long_series() {
        let mut values = vec!["10"; 12];
        values.push("1000");
        let document = numeric_entries(&values);
        let d = ZScoreDetector;
        assert_eq!(d.inspect(&document[12], &document), Some(1.0));
        assert!(d.inspect(&document[0], &document).is_none());
    }

    #[test]
    fn modified_z_catches_outlier_the_plain_z_misses() {
        // Six values: the extreme one inflates the standard deviation enough
        // to stay under the plain z threshold, but not the median-based one.
        let document = numeric_entries(&["10", "11", "12", "10", "11", "1000"]);
        assert!(ZScoreDetector.inspect(&document[5], &document).is_none());
        assert_eq!(
            ModifiedZScoreDetector.inspect(&document[5], &document),
            Some(1.0)
        );
        assert_eq!(IqrDetector.inspect(&document[5], &document), Some(1.0));
        for entry in &document[..5] {
            assert!(ModifiedZScoreDetector.inspect(entry, &document).is_none());
            assert!(IqrDetector.inspect(entry, &document).is_none());
        }
    }

    #[test]
    fn constant_series_is_never_flagged() {
        let document = numeric_entries(&["5", "5", "5", "5"]);
        for entry in &document {
            assert!(ZScoreDetector.inspect(entry, &document).is_none());
            assert!(ModifiedZScoreDetector.inspect(entry, &document).is_none());
            assert!(IqrDetector.inspect(entry, &document).is_none());
        }
    }

    #[test]
    fn non_numeric_answers_are_ignored_by_statistical_detectors() {
        let mut document = numeric_entries(&["10", "11", "1000"]);
        document.push(FieldEntry {
            question: "Name".into(),
            answer: "Smith".into(),
            confidence: Some(0.95),
            page: 1,
        });
        assert!(ZScoreDetector.inspect(&document[3], &document).is_none());
        assert!(ModifiedZScoreDetector
            .inspect(&document[3], &document)
            .is_none());
        assert!(IqrDetector.inspect(&document[3], &document).is_none());
    }

    #[test]
    fn quantile_interpolates_between_values() {
        let series = [10.0, 10.0, 11.0, 11.0, 12.0, 1000.0];
        assert_eq!(quantile(&series, 0.25), Some(10.25));
        assert_eq!(quantile(&series, 0.75), Some(11.75));
        assert_eq!(median(&series), Some(11.0));
        assert_eq!(quantile(&[], 0.5), None);
    }

    #[test]
    fn aggregate_is_deterministic() {
        let j = job();
        let pages = vec![page(
            1,
            json!({"questions": [{"question": "Name", "answer": "[ILLEGIBLE]", "confidence": 0.3}],
                   "overall_confidence": 0.3}),
            Some(0.3),
        )];
        let detectors = default_detectors(0.8);
        let a = aggregate(&j, &pages, &detectors, ConfidencePolicy::Mean).unwrap();
        let b = aggregate(&j, &pages, &detectors, ConfidencePolicy::Mean).unwrap();
        assert_eq!(a.anomalies.len(), 2); // low_confidence + illegible
        assert_eq!(a.anomalies[0].id, b.anomalies[0].id);
        assert_eq!(a.anomalies[1].id, b.anomalies[1].id);
    }

    #[test]
    fn mean_confidence_excludes_missing() {
        let entry = |confidence: Option<f64>| FieldEntry {
            question: "Q".into(),
            answer: "A".into(),
            confidence,
            page: 1,
        };
        let entries = vec![entry(Some(0.6)), entry(None), entry(Some(1.0))];
        let mean = combine_confidence(&entries, ConfidencePolicy::Mean);
        assert!((mean - 0.8).abs() < 1e-9);
        let min = combine_confidence(&entries, ConfidencePolicy::Minimum);
        assert!((min - 0.6).abs() < 1e-9);
    }

    #[test]
    fn all_missing_confidence_is_zero() {
        let entries = vec![FieldEntry {
            question: "Q".into(),
            answer: "A".into(),
            confidence: None,
            page: 1,
        }];
        assert_eq!(combine_confidence(&entries, ConfidencePolicy::Mean), 0.0);
    }

    #[test]
    fn aggregation_error_names_the_page() {
        let j = job();
        let pages = vec![
            page(1, json!({"questions": []}), Some(0.9)),
            page(2, json!({"questions": "oops"}), Some(0.9)),
        ];
        let err = aggregate(&j, &pages, &default_detectors(0.8), ConfidencePolicy::Mean)
            .unwrap_err();
        assert!(err.to_string().contains("page 2"));
    }
}
