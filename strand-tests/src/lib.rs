//! Integration scenarios for the strand workspace live in `tests/`.
