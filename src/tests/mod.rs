//! Cross-module tests: real drivers and protocol code wired through the
//! scheduler against scripted ports and a fake broker.
