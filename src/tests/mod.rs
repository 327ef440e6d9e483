//! Cross-component tests running against a real listener.

mod scenarios;
