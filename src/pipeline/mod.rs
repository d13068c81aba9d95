//! Pipeline stages for document-to-fields extraction.
//!
//! Each submodule implements exactly one transformation step. Keeping stages
//! separate makes each independently testable and lets us swap
//! implementations (e.g. a different rasterisation backend, a scripted
//! extraction client in tests) without touching other stages.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ split ──▶ encode ──▶ worker/extract
//! (URL/path) (pdfium)  (base64)  (bounded concurrency + retries)
//! ```
//!
//! 1. [`input`]   — canonicalise a user-supplied path or URL to raw bytes
//! 2. [`split`]   — rasterise pages; runs in `spawn_blocking` because pdfium
//!    is not async-safe
//! 3. [`encode`]  — PNG-encode each page for the multimodal request body
//! 4. [`extract`] — the narrow client trait over the external vision service;
//!    the only stage with network I/O
//! 5. [`worker`]  — the shared bounded-concurrency pool that runs extraction
//!    tasks and owns the retry/backoff policy

pub mod encode;
pub mod extract;
pub mod input;
pub mod split;
pub mod worker;
