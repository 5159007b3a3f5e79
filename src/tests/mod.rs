//! Crate-level end-to-end scenarios over real caches and processes.
