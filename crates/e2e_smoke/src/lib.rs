//! End-to-end smoke tests for the urgent gateway live under `tests/`.
