//! Benchmark-only crate; the interesting code lives under `benches/`.
